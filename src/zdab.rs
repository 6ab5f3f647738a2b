//! Bank container codec for ZDAB record streams.
//!
//! The detector's private wire format is owned by the upstream parser; this module
//! provides the narrow interface the processor consumes (`RecordSource`, `SinkFactory`,
//! `BankSink`) together with a framed on-disk implementation so the binary can run
//! end to end.
//!
//! # Layout
//! ```text
//! [name: 4 bytes ASCII] [len: u32 LE, payload bytes] [payload: len bytes]
//!
//! ZDAB (event) payload, little-endian u32 words:
//!   word 0       NPmtHit
//!   words 1..=6  MTC trigger card data
//!   words 7..    hit data
//! ```

use crate::error::{AppResult, L2Error};
use bytes::Bytes;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

/// Number of 32-bit words in the MTC trigger card block.
pub const TRIGGER_CARD_WORDS: usize = 6;

/// Trigger word bit flagging an EXTASY (PCA calibration) trigger.
pub const EXTASY_BIT: u32 = 0x8000;

/// Largest bank payload the reader will allocate for. A declared length above this
/// means the stream is corrupt.
pub const MAX_BANK_BYTES: usize = 64 << 20;

const EVENT_HEADER_BYTES: usize = 4 * (1 + TRIGGER_CARD_WORDS);

/// Four-character bank identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct BankName(pub [u8; 4]);

impl BankName {
    /// Event data.
    pub const ZDAB: BankName = BankName(*b"ZDAB");
    /// Run record.
    pub const RUN: BankName = BankName(*b"RUN ");
    /// Run header.
    pub const RHDR: BankName = BankName(*b"RHDR");
    /// Pedestal / GT delay header.
    pub const EPED: BankName = BankName(*b"EPED");
    /// Trigger settings header.
    pub const TRIG: BankName = BankName(*b"TRIG");
    /// Manipulator source status.
    pub const CAST: BankName = BankName(*b"CAST");
    /// AV status.
    pub const CAAC: BankName = BankName(*b"CAAC");
    /// Source orientation.
    pub const SOSL: BankName = BankName(*b"SOSL");
    /// Master record.
    pub const MAST: BankName = BankName(*b"MAST");
}

impl fmt::Debug for BankName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BankName({})", self)
    }
}

impl fmt::Display for BankName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for &b in &self.0 {
            let c = if b.is_ascii_graphic() || b == b' ' { b as char } else { '.' };
            write!(f, "{}", c)?;
        }
        Ok(())
    }
}

/// Integer bank slot expected by the output writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BankIndex(pub u32);

const BANK_TABLE: [(BankName, BankIndex); 9] = [
    (BankName::ZDAB, BankIndex(0)),
    (BankName::RUN, BankIndex(1)),
    (BankName::RHDR, BankIndex(2)),
    (BankName::EPED, BankIndex(3)),
    (BankName::TRIG, BankIndex(4)),
    (BankName::CAST, BankIndex(5)),
    (BankName::CAAC, BankIndex(6)),
    (BankName::SOSL, BankIndex(7)),
    (BankName::MAST, BankIndex(8)),
];

impl BankIndex {
    /// Slot used for event data.
    pub const EVENT: BankIndex = BankIndex(0);

    /// Look up the writer slot for a bank name.
    pub fn for_name(name: BankName) -> Option<BankIndex> {
        BANK_TABLE
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, index)| *index)
    }

    /// Bank name written for this slot.
    pub fn name(self) -> Option<BankName> {
        BANK_TABLE
            .iter()
            .find(|(_, i)| *i == self)
            .map(|(name, _)| *name)
    }
}

/// One bank from the input stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Bank identifier.
    pub name: BankName,
    /// Raw payload bytes, shared cheaply between output streams and the burst buffer.
    pub payload: Bytes,
}

impl Record {
    /// Build a record from a name and payload.
    pub fn new(name: BankName, payload: impl Into<Bytes>) -> Self {
        Self {
            name,
            payload: payload.into(),
        }
    }

    /// Build a synthetic event record.
    pub fn event(nhit: u32, trigger: TriggerCard, hit_words: &[u32]) -> Self {
        let mut payload = Vec::with_capacity(EVENT_HEADER_BYTES + 4 * hit_words.len());
        payload.extend_from_slice(&nhit.to_le_bytes());
        for word in trigger.words {
            payload.extend_from_slice(&word.to_le_bytes());
        }
        for word in hit_words {
            payload.extend_from_slice(&word.to_le_bytes());
        }
        Self::new(BankName::ZDAB, payload)
    }

    /// Decode the hit-bearing view of an event record, if this is one.
    pub fn as_event(&self) -> Option<EventView> {
        if self.name != BankName::ZDAB || self.payload.len() < EVENT_HEADER_BYTES {
            return None;
        }
        let word = |i: usize| {
            let at = 4 * i;
            u32::from_le_bytes([
                self.payload[at],
                self.payload[at + 1],
                self.payload[at + 2],
                self.payload[at + 3],
            ])
        };
        let mut words = [0u32; TRIGGER_CARD_WORDS];
        for (i, w) in words.iter_mut().enumerate() {
            *w = word(1 + i);
        }
        Some(EventView {
            nhit: word(0),
            trigger: TriggerCard { words },
            payload_words: self.payload.len() / 4,
        })
    }

    /// Bank slot for this record, if the name is known.
    pub fn bank_index(&self) -> Option<BankIndex> {
        BankIndex::for_name(self.name)
    }
}

/// Fields of an event record needed by the processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventView {
    /// Number of PMT hits.
    pub nhit: u32,
    /// Trigger card block.
    pub trigger: TriggerCard,
    /// Payload length in 32-bit words.
    pub payload_words: usize,
}

/// The six-word MTC trigger card block carried by every event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TriggerCard {
    /// Raw words as stored in the record.
    pub words: [u32; TRIGGER_CARD_WORDS],
}

impl TriggerCard {
    /// Pack the two counters and a trigger word into the card layout.
    pub fn from_parts(counter50: u64, counter10: u64, trigger_word: u32) -> Self {
        let bc50_1 = (counter50 & 0x7ff) as u32;
        let bc50_2 = ((counter50 >> 11) & 0xffff_ffff) as u32;
        let bc10_1 = (counter10 & 0xffff_ffff) as u32;
        let bc10_2 = ((counter10 >> 32) & 0x1f_ffff) as u32;
        let mut words = [0u32; TRIGGER_CARD_WORDS];
        words[0] = bc10_1;
        words[1] = bc10_2 | (bc50_1 << 21);
        words[2] = bc50_2;
        words[3] = (trigger_word & 0xff) << 24;
        words[4] = (trigger_word >> 8) & 0x3ffff;
        Self { words }
    }

    /// 43-bit value of the 50 MHz counter.
    pub fn counter50(&self) -> u64 {
        let bc50_1 = u64::from((self.words[1] >> 21) & 0x7ff);
        let bc50_2 = u64::from(self.words[2]);
        (bc50_2 << 11) + bc50_1
    }

    /// Value of the independent 10 MHz counter.
    pub fn counter10(&self) -> u64 {
        let bc10_1 = u64::from(self.words[0]);
        let bc10_2 = u64::from(self.words[1] & 0x1f_ffff);
        (bc10_2 << 32) + bc10_1
    }

    /// Trigger classification word.
    pub fn trigger_word(&self) -> u32 {
        ((self.words[3] & 0xff00_0000) >> 24) | ((self.words[4] & 0x3ffff) << 8)
    }
}

/// Sequential supplier of records.
pub trait RecordSource {
    /// Next record, or `None` at end of stream.
    fn next_record(&mut self) -> AppResult<Option<Record>>;
}

/// Reader for the framed bank container.
pub struct ZdabReader<R: Read> {
    inner: R,
    offset: u64,
}

impl ZdabReader<BufReader<File>> {
    /// Open an input file.
    pub fn open(path: &Path) -> AppResult<Self> {
        let file = File::open(path).map_err(|source| L2Error::OpenInput {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self::new(BufReader::new(file)))
    }
}

impl<R: Read> ZdabReader<R> {
    /// Wrap an arbitrary byte source.
    pub fn new(inner: R) -> Self {
        Self { inner, offset: 0 }
    }

    /// Fill `buf` completely. Returns `Ok(false)` on a clean end of stream before any byte.
    fn fill(&mut self, buf: &mut [u8], start: u64) -> AppResult<bool> {
        let mut read = 0;
        while read < buf.len() {
            match self.inner.read(&mut buf[read..]) {
                Ok(0) if read == 0 => return Ok(false),
                Ok(0) => return Err(L2Error::TruncatedRecord { offset: start }),
                Ok(n) => read += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(true)
    }
}

impl<R: Read> RecordSource for ZdabReader<R> {
    fn next_record(&mut self) -> AppResult<Option<Record>> {
        let start = self.offset;
        let mut head = [0u8; 8];
        if !self.fill(&mut head, start)? {
            return Ok(None);
        }
        let name = BankName([head[0], head[1], head[2], head[3]]);
        let len = u32::from_le_bytes([head[4], head[5], head[6], head[7]]) as usize;
        if len > MAX_BANK_BYTES {
            return Err(L2Error::OversizedBank {
                offset: start,
                len,
                limit: MAX_BANK_BYTES,
            });
        }
        let mut payload = vec![0u8; len];
        if len > 0 && !self.fill(&mut payload, start)? {
            return Err(L2Error::TruncatedRecord { offset: start });
        }
        self.offset += 8 + len as u64;
        Ok(Some(Record::new(name, payload)))
    }
}

impl<R: Read> Iterator for ZdabReader<R> {
    type Item = AppResult<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_record().transpose()
    }
}

/// An open output stream accepting banks.
pub trait BankSink {
    /// Write one bank into the given slot.
    fn write_bank(&mut self, payload: &[u8], index: BankIndex) -> AppResult<()>;

    /// Flush and close the stream, returning where it was written.
    fn close(self) -> AppResult<PathBuf>;

    /// Location of the stream.
    fn path(&self) -> &Path;
}

/// Creates output streams.
pub trait SinkFactory {
    /// Stream type produced by this factory.
    type Sink: BankSink;

    /// Create a new stream at `path`.
    fn create(&self, path: &Path) -> AppResult<Self::Sink>;
}

/// Framed-bank file writer.
pub struct ZdabWriter {
    path: PathBuf,
    out: BufWriter<File>,
}

impl ZdabWriter {
    /// Create `path`, honouring the overwrite policy.
    pub fn create(path: &Path, clobber: bool) -> AppResult<Self> {
        match std::fs::metadata(path) {
            Ok(meta) => {
                if !clobber {
                    return Err(L2Error::OutputExists(path.to_path_buf()));
                }
                if meta.permissions().readonly() {
                    return Err(L2Error::OutputNotWritable(path.to_path_buf()));
                }
                std::fs::remove_file(path).map_err(|_| L2Error::OutputNotWritable(path.to_path_buf()))?;
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(source) => {
                return Err(L2Error::OpenOutput {
                    path: path.to_path_buf(),
                    source,
                })
            }
        }
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|source| L2Error::OpenOutput {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(Self {
            path: path.to_path_buf(),
            out: BufWriter::new(file),
        })
    }
}

impl BankSink for ZdabWriter {
    fn write_bank(&mut self, payload: &[u8], index: BankIndex) -> AppResult<()> {
        let name = index.name().ok_or_else(|| {
            std::io::Error::new(ErrorKind::InvalidInput, format!("no bank for index {}", index.0))
        })?;
        let len = u32::try_from(payload.len())
            .map_err(|_| std::io::Error::new(ErrorKind::InvalidInput, "bank larger than 4 GiB"))?;
        self.out.write_all(&name.0)?;
        self.out.write_all(&len.to_le_bytes())?;
        self.out.write_all(payload)?;
        Ok(())
    }

    fn close(mut self) -> AppResult<PathBuf> {
        self.out.flush()?;
        self.out.get_ref().sync_data()?;
        Ok(self.path)
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

/// Factory for `ZdabWriter` streams.
#[derive(Debug, Clone, Copy)]
pub struct ZdabFileFactory {
    /// Replace existing outputs instead of refusing to start.
    pub clobber: bool,
}

impl SinkFactory for ZdabFileFactory {
    type Sink = ZdabWriter;

    fn create(&self, path: &Path) -> AppResult<ZdabWriter> {
        ZdabWriter::create(path, self.clobber)
    }
}

/// Render bytes as a classic 16-bytes-per-line hex + ASCII dump.
pub fn hexdump(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 4);
    for line in bytes.chunks(16) {
        for b in line {
            out.push_str(&format!("{:02x}", b));
        }
        for _ in line.len()..16 {
            out.push_str("  ");
        }
        out.push(' ');
        for &b in line {
            out.push(if b.is_ascii_graphic() || b == b' ' { b as char } else { '.' });
        }
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn trigger_card_round_trips_counters() {
        let counter50 = (1u64 << 43) - 5;
        let counter10 = 0x1a_2b3c_4d5e;
        let card = TriggerCard::from_parts(counter50, counter10, 0x8123);
        assert_eq!(card.counter50(), counter50);
        assert_eq!(card.counter10(), counter10);
        assert_eq!(card.trigger_word(), 0x8123);
    }

    #[test]
    fn event_view_requires_full_header() {
        let short = Record::new(BankName::ZDAB, vec![0u8; 12]);
        assert!(short.as_event().is_none());

        let rhdr = Record::new(BankName::RHDR, vec![0u8; 64]);
        assert!(rhdr.as_event().is_none());

        let ev = Record::event(42, TriggerCard::from_parts(1000, 200, 0), &[7, 8]);
        let view = ev.as_event().unwrap();
        assert_eq!(view.nhit, 42);
        assert_eq!(view.trigger.counter50(), 1000);
        assert_eq!(view.payload_words, 9);
    }

    #[test]
    fn bank_table_lookup() {
        assert_eq!(BankIndex::for_name(BankName::ZDAB), Some(BankIndex::EVENT));
        assert_eq!(BankIndex::for_name(BankName::TRIG), Some(BankIndex(4)));
        assert_eq!(BankIndex::for_name(BankName(*b"XXXX")), None);
        assert_eq!(BankIndex(3).name(), Some(BankName::EPED));
    }

    #[test]
    fn reader_reports_truncation() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(b"RHDR");
        bytes.extend_from_slice(&4u32.to_le_bytes());
        bytes.extend_from_slice(&[1, 2, 3, 4]);
        bytes.extend_from_slice(b"TRIG");
        bytes.extend_from_slice(&10u32.to_le_bytes());
        bytes.extend_from_slice(&[0; 3]);

        let mut reader = ZdabReader::new(Cursor::new(bytes));
        let first = reader.next_record().unwrap().unwrap();
        assert_eq!(first.name, BankName::RHDR);
        assert_eq!(&first.payload[..], &[1, 2, 3, 4]);
        match reader.next_record() {
            Err(L2Error::TruncatedRecord { offset }) => assert_eq!(offset, 12),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn reader_rejects_impossible_length() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(b"ZDAB");
        bytes.extend_from_slice(&u32::MAX.to_le_bytes());
        bytes.extend_from_slice(&[0; 16]);

        let mut reader = ZdabReader::new(Cursor::new(bytes));
        let err = reader.next_record().unwrap_err();
        assert!(matches!(
            err,
            L2Error::OversizedBank { offset: 0, len, limit: MAX_BANK_BYTES } if len == u32::MAX as usize
        ));
        assert!(!err.is_fatal());
    }

    #[test]
    fn writer_refuses_existing_without_clobber() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.zdab");
        std::fs::write(&path, b"old").unwrap();

        assert!(matches!(
            ZdabWriter::create(&path, false),
            Err(L2Error::OutputExists(_))
        ));

        let mut w = ZdabWriter::create(&path, true).unwrap();
        w.write_bank(b"abcd", BankIndex(2)).unwrap();
        let written = w.close().unwrap();

        let mut reader = ZdabReader::open(&written).unwrap();
        let rec = reader.next_record().unwrap().unwrap();
        assert_eq!(rec.name, BankName::RHDR);
        assert!(reader.next_record().unwrap().is_none());
    }

    #[test]
    fn hexdump_pads_short_lines() {
        let dump = hexdump(b"ZDAB\x00\x01");
        assert!(dump.starts_with("5a444142"));
        assert!(dump.trim_end().ends_with("ZDAB.."));
    }
}
