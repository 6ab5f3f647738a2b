//! Cache of the most recent header records.
//!
//! Every output stream (chunk or burst file) starts with a replay of these so that
//! each file is self-describing.

use crate::error::AppResult;
use crate::zdab::{BankIndex, BankName, BankSink, Record};
use bytes::Bytes;

/// Header record types that are tracked and replayed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HeaderKind {
    /// Run header (RHDR).
    Run,
    /// Trigger settings (TRIG).
    Trigger,
    /// Pedestal settings (EPED).
    Pedestal,
}

impl HeaderKind {
    /// Replay order.
    pub const ALL: [HeaderKind; 3] = [HeaderKind::Run, HeaderKind::Trigger, HeaderKind::Pedestal];

    /// Classify a bank name.
    pub fn from_name(name: BankName) -> Option<Self> {
        match name {
            BankName::RHDR => Some(HeaderKind::Run),
            BankName::TRIG => Some(HeaderKind::Trigger),
            BankName::EPED => Some(HeaderKind::Pedestal),
            _ => None,
        }
    }

    /// Writer slot used when the bank name itself is not in the table.
    pub fn fallback_index(self) -> BankIndex {
        match self {
            HeaderKind::Run => BankIndex(2),
            HeaderKind::Trigger => BankIndex(4),
            HeaderKind::Pedestal => BankIndex(3),
        }
    }

    fn slot(self) -> usize {
        match self {
            HeaderKind::Run => 0,
            HeaderKind::Trigger => 1,
            HeaderKind::Pedestal => 2,
        }
    }
}

#[derive(Debug, Clone)]
struct CachedHeader {
    index: BankIndex,
    payload: Bytes,
}

/// Latest raw bytes seen for each tracked header kind.
#[derive(Debug, Clone, Default)]
pub struct HeaderCache {
    slots: [Option<CachedHeader>; 3],
}

impl HeaderCache {
    /// Empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember `record` if it is a tracked header. Returns the kind it was stored as.
    pub fn observe(&mut self, record: &Record) -> Option<HeaderKind> {
        let kind = HeaderKind::from_name(record.name)?;
        let index = record.bank_index().unwrap_or_else(|| kind.fallback_index());
        self.slots[kind.slot()] = Some(CachedHeader {
            index,
            payload: record.payload.clone(),
        });
        Some(kind)
    }

    /// Number of kinds currently cached.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Whether nothing has been cached yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Write every cached header into a freshly opened stream.
    pub fn replay<S: BankSink>(&self, sink: &mut S) -> AppResult<usize> {
        let mut written = 0;
        for kind in HeaderKind::ALL {
            if let Some(header) = &self.slots[kind.slot()] {
                sink.write_bank(&header.payload, header.index)?;
                written += 1;
            }
        }
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemorySink;

    #[test]
    fn latest_header_wins() {
        let mut cache = HeaderCache::new();
        assert!(cache.is_empty());
        cache.observe(&Record::new(BankName::RHDR, vec![1u8; 8]));
        cache.observe(&Record::new(BankName::RHDR, vec![2u8; 8]));
        assert_eq!(cache.len(), 1);
        let mut sink = MemorySink::new("chunk");
        cache.replay(&mut sink).unwrap();
        assert_eq!(sink.banks(), vec![(BankIndex(2), Bytes::from(vec![2u8; 8]))]);
    }

    #[test]
    fn ignores_non_header_banks() {
        let mut cache = HeaderCache::new();
        assert_eq!(cache.observe(&Record::new(BankName::CAST, vec![0u8; 4])), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn replays_in_fixed_order() {
        let mut cache = HeaderCache::new();
        cache.observe(&Record::new(BankName::EPED, vec![3u8; 4]));
        cache.observe(&Record::new(BankName::RHDR, vec![1u8; 4]));
        cache.observe(&Record::new(BankName::TRIG, vec![2u8; 4]));

        let mut sink = MemorySink::new("chunk");
        assert_eq!(cache.replay(&mut sink).unwrap(), 3);
        let indices: Vec<u32> = sink.banks().iter().map(|(i, _)| i.0).collect();
        assert_eq!(indices, vec![2, 4, 3]);
    }
}
