use bytes::BytesMut;
use log::{debug, trace};
use parking_lot::Mutex;

use super::{Decodeable, Encodeable, LogRecord};
use crate::types::{Lsn, SmallResult};

/// The write-ahead log collaborator.
///
/// A low-level transaction hands over all of its records in one call at
/// commit, the returned LSN is stamped into the pages it modified.
pub trait LogSink: Send + Sync {
    fn append(&self, records: &[LogRecord]) -> SmallResult<Lsn>;
}

struct MemoryLog {
    stream: BytesMut,
    last_lsn: Lsn,
    records_count: usize,
}

/// A log kept in memory as one encoded byte stream.
pub struct MemoryLogSink {
    log: Mutex<MemoryLog>,
}

impl MemoryLogSink {
    pub fn new() -> Self {
        Self {
            log: Mutex::new(MemoryLog {
                stream: BytesMut::new(),
                last_lsn: 0,
                records_count: 0,
            }),
        }
    }

    pub fn last_lsn(&self) -> Lsn {
        self.log.lock().last_lsn
    }

    pub fn records_count(&self) -> usize {
        self.log.lock().records_count
    }

    pub fn size(&self) -> usize {
        self.log.lock().stream.len()
    }

    /// Decode the whole stream back into records.
    pub fn records(&self) -> SmallResult<Vec<LogRecord>> {
        let log = self.log.lock();
        let mut buf = &log.stream[..];
        let mut records = Vec::with_capacity(log.records_count);
        while !buf.is_empty() {
            records.push(LogRecord::decode_from(&mut buf)?);
        }
        Ok(records)
    }
}

impl Default for MemoryLogSink {
    fn default() -> Self {
        Self::new()
    }
}

impl LogSink for MemoryLogSink {
    fn append(&self, records: &[LogRecord]) -> SmallResult<Lsn> {
        let mut log = self.log.lock();
        for record in records {
            trace!("{}", record);
            record.encode(&mut log.stream);
        }
        log.records_count += records.len();
        log.last_lsn += 1;
        debug!("append {} log records, lsn: {}", records.len(), log.last_lsn);
        Ok(log.last_lsn)
    }
}
