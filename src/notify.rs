//! Alerting with a per-second message budget.
//!
//! Components report anomalies through the narrow [`Notifier`] interface. The
//! production implementation, [`RateLimitedNotifier`], logs every message locally via
//! `tracing`, then forwards it to an [`AlertSink`] unless the severity class has
//! already used its budget for the current wall-clock second. Suppressed messages are
//! counted and reported once, at the next second boundary.
//!
//! Delivery never blocks the record loop: [`HttpAlertSink`] hands alerts to a bounded
//! queue drained by a tokio task, and a full queue just drops the alert with a local
//! warning.

use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Alert severity classes, with the level codes understood by the monitoring server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum Severity {
    /// Routine information (new epoch, connection established).
    Info,
    /// Positive status (end-of-run summary).
    Success,
    /// Recoverable anomaly.
    Warning,
    /// Confirmed discontinuity or a fatal resource problem.
    Error,
}

impl Severity {
    /// Numeric level used on the wire.
    pub fn level(self) -> u8 {
        match self {
            Severity::Info => 20,
            Severity::Success => 21,
            Severity::Warning => 30,
            Severity::Error => 40,
        }
    }

    fn slot(self) -> usize {
        match self {
            Severity::Info => 0,
            Severity::Success => 1,
            Severity::Warning => 2,
            Severity::Error => 3,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Info => write!(f, "INFO"),
            Severity::Success => write!(f, "SUCCESS"),
            Severity::Warning => write!(f, "WARNING"),
            Severity::Error => write!(f, "ERROR"),
        }
    }
}

/// Sink for anomaly reports. Implementations must not block.
pub trait Notifier: Send + Sync {
    /// Report a message.
    fn notify(&self, severity: Severity, message: &str);

    /// Called once per wall-clock second by the record loop.
    fn tick(&self) {}
}

/// Shared handle injected into the processing components.
pub type SharedNotifier = Arc<dyn Notifier>;

/// One outbound alert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Alert {
    /// Severity class.
    pub severity: Severity,
    /// Free-text message.
    pub message: String,
}

/// Best-effort alert transport.
pub trait AlertSink: Send {
    /// Hand off an alert. Errors are reported locally by the caller and never retried.
    fn deliver(&mut self, alert: Alert) -> Result<(), String>;
}

/// Transport that only relies on the local log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogOnlySink;

impl AlertSink for LogOnlySink {
    fn deliver(&mut self, alert: Alert) -> Result<(), String> {
        debug!(level = alert.severity.level(), "alert not forwarded: no alert endpoint configured");
        Ok(())
    }
}

/// Per-class message budget for one wall-clock second.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    budget: u32,
    second: u64,
    sent: [u32; 4],
    overflow: u64,
}

/// Outcome of asking the limiter for permission to send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Within budget.
    Send,
    /// Budget exhausted; the message was counted as overflow.
    Suppressed,
}

impl RateLimiter {
    /// Allow `budget` messages per class per second.
    pub fn new(budget: u32) -> Self {
        Self {
            budget,
            second: 0,
            sent: [0; 4],
            overflow: 0,
        }
    }

    /// Move to wall second `now`. Returns the overflow count of the second being left, if any.
    pub fn roll(&mut self, now: u64) -> Option<u64> {
        if now == self.second {
            return None;
        }
        self.second = now;
        self.sent = [0; 4];
        let skipped = std::mem::take(&mut self.overflow);
        (skipped > 0).then_some(skipped)
    }

    /// Ask to send one message of `severity` during the current second.
    pub fn admit(&mut self, severity: Severity) -> Admission {
        let sent = &mut self.sent[severity.slot()];
        if *sent >= self.budget {
            self.overflow += 1;
            Admission::Suppressed
        } else {
            *sent += 1;
            Admission::Send
        }
    }

    /// Messages suppressed so far in the current second.
    pub fn pending_overflow(&self) -> u64 {
        self.overflow
    }
}

/// Wall clock used for budgeting, in whole seconds.
pub type WallClock = Arc<dyn Fn() -> u64 + Send + Sync>;

/// Current UNIX time in seconds.
pub fn unix_seconds() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp()).unwrap_or(0)
}

struct LimiterState<S> {
    limiter: RateLimiter,
    sink: S,
}

/// [`Notifier`] that logs locally and forwards within a per-second budget.
pub struct RateLimitedNotifier<S: AlertSink> {
    state: Mutex<LimiterState<S>>,
    clock: WallClock,
}

impl<S: AlertSink> RateLimitedNotifier<S> {
    /// Build with the system wall clock.
    pub fn new(sink: S, budget_per_second: u32) -> Self {
        Self::with_clock(sink, budget_per_second, Arc::new(unix_seconds))
    }

    /// Build with an explicit wall clock.
    pub fn with_clock(sink: S, budget_per_second: u32, clock: WallClock) -> Self {
        Self {
            state: Mutex::new(LimiterState {
                limiter: RateLimiter::new(budget_per_second),
                sink,
            }),
            clock,
        }
    }

    fn flush_overflow(state: &mut LimiterState<S>, now: u64) {
        if let Some(skipped) = state.limiter.roll(now) {
            let alert = Alert {
                severity: Severity::Warning,
                message: format!("ERROR OVERFLOW: {} messages skipped", skipped),
            };
            warn!(skipped, "alert budget exceeded during previous second");
            if let Err(e) = state.sink.deliver(alert) {
                warn!(error = %e, "alert delivery failed");
            }
        }
    }
}

impl<S: AlertSink> Notifier for RateLimitedNotifier<S> {
    fn notify(&self, severity: Severity, message: &str) {
        match severity {
            Severity::Info | Severity::Success => info!(level = severity.level(), "{}", message),
            Severity::Warning => warn!(level = severity.level(), "{}", message),
            Severity::Error => error!(level = severity.level(), "{}", message),
        }

        let now = (self.clock)();
        let mut state = self.state.lock();
        Self::flush_overflow(&mut state, now);
        if state.limiter.admit(severity) == Admission::Send {
            let alert = Alert {
                severity,
                message: message.to_string(),
            };
            if let Err(e) = state.sink.deliver(alert) {
                warn!(error = %e, "alert delivery failed");
            }
        }
    }

    fn tick(&self) {
        let now = (self.clock)();
        let mut state = self.state.lock();
        Self::flush_overflow(&mut state, now);
    }
}

/// Where alerts are posted and as whom.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlertEndpoint {
    /// Monitoring log URL.
    pub url: String,
    /// Client name reported with each alert.
    pub client_name: String,
    /// Basic-auth user.
    pub user: Option<String>,
    /// Basic-auth password.
    pub password: Option<String>,
}

/// Forwards alerts to the monitoring server over HTTP from a background task.
pub struct HttpAlertSink {
    tx: mpsc::Sender<Alert>,
}

impl HttpAlertSink {
    /// Spawn the delivery task on the current tokio runtime.
    ///
    /// The returned handle completes once every `HttpAlertSink` clone has been dropped
    /// and the queue is drained.
    pub fn spawn(endpoint: AlertEndpoint, queue_depth: usize) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<Alert>(queue_depth.max(1));
        let handle = tokio::spawn(async move {
            let client = reqwest::Client::new();
            while let Some(alert) = rx.recv().await {
                let level = alert.severity.level().to_string();
                let mut request = client.post(&endpoint.url).form(&[
                    ("name", endpoint.client_name.as_str()),
                    ("level", level.as_str()),
                    ("message", alert.message.as_str()),
                ]);
                if let Some(user) = &endpoint.user {
                    request = request.basic_auth(user, endpoint.password.as_deref());
                }
                let result = request.send().await.and_then(|resp| resp.error_for_status());
                if let Err(e) = result {
                    warn!(error = %e, "Logging failed");
                }
            }
            debug!("alert delivery task finished");
        });
        (Self { tx }, handle)
    }
}

impl AlertSink for HttpAlertSink {
    fn deliver(&mut self, alert: Alert) -> Result<(), String> {
        self.tx.try_send(alert).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => "alert queue full".to_string(),
            mpsc::error::TrySendError::Closed(_) => "alert delivery task stopped".to_string(),
        })
    }
}
