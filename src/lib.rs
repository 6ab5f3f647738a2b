//! # ZDAB L2 Processor Library
//!
//! Online processing of a detector's ZDAB record stream in a single pass: rebuilding a
//! monotonic clock from two wrapping hardware counters, cutting the stream into
//! overlapping time chunks, applying the L2 event selection, and archiving high-rate
//! burst episodes to their own files. The binary (`main.rs`) is a thin CLI over
//! [`pipeline::Processor`].
//!
//! ## Crate Structure
//!
//! - **`error`**: The `L2Error` enum and `AppResult` alias.
//! - **`config`**: Filter configuration file and Figment-loaded run settings.
//! - **`logging`**: `tracing` subscriber setup.
//! - **`zdab`**: Records, bank names and indices, trigger card decoding, and the framed
//!   reader/writer behind the `RecordSource` / `SinkFactory` seams.
//! - **`header`**: Cache of the latest run, trigger and pedestal headers.
//! - **`clock`**: `ClockModel`, rollover tracking and two-strikes anomaly recovery.
//! - **`ring_buffer`**: `BurstBuffer`, the fixed-capacity candidate buffer and its
//!   checkpoint files.
//! - **`burst`**: `BurstDetector`, the IDLE/ACTIVE episode state machine.
//! - **`chunk`**: `ChunkRouter` and the `Archiver` for closed chunks.
//! - **`filter`**: `L2Filter` with its dynamic hit-count cut and retrigger latch.
//! - **`notify`**: Severity classes, per-second alert budgets, HTTP delivery.
//! - **`stats`**: Run totals and the per-second multi-granularity statistics store.
//! - **`pipeline`**: The record loop tying it all together.

pub mod burst;
pub mod chunk;
pub mod clock;
pub mod config;
pub mod error;
pub mod filter;
pub mod header;
pub mod logging;
pub mod notify;
pub mod pipeline;
pub mod ring_buffer;
pub mod stats;
pub mod zdab;

#[cfg(test)]
pub(crate) mod testing;
