//! The metadata journal
//!
//! An in-order record of journal events with byte offsets. The physical
//! store (batching, fsync, segment rotation) lives behind this interface;
//! what the event core needs is offset assignment, the capped flag, the
//! most recent import-map checkpoint, and the length-delimited record
//! codec.
//!
//! Record format:
//! ```text
//! +--------+--------+---------+--------+
//! | Magic  | Length | Payload | CRC32C |
//! | 4B     | 4B     | var     | 4B     |
//! +--------+--------+---------+--------+
//! ```

use crate::completion::Completion;
use crate::journal::{JournalEvent, LogEntry};
use quillfs_common::{Error, LogOffset, Result};
use std::collections::VecDeque;
use tracing::{debug, info};

/// Journal record magic number
const LOG_MAGIC: u32 = 0x514A_524C; // "QJRL"

/// Space reserved at the head of the log for the physical store's
/// header. Keeps every entry offset nonzero, since a zero
/// `last_open_journaled` means "never journaled".
const LOG_HEADER_SIZE: u64 = 64;

/// Record header size (magic + length)
const RECORD_HEADER_SIZE: usize = 8;

/// Serialize an event to a length-delimited record.
pub fn encode_record(event: &JournalEvent) -> Result<Vec<u8>> {
    let payload = bincode::serialize(event).map_err(|e| Error::Encode(e.to_string()))?;
    let mut buf = Vec::with_capacity(RECORD_HEADER_SIZE + payload.len() + 4);
    buf.extend_from_slice(&LOG_MAGIC.to_le_bytes());
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(&payload);
    let crc = crc32c::crc32c(&buf);
    buf.extend_from_slice(&crc.to_le_bytes());
    Ok(buf)
}

/// Parse one record from `data`, returning the event and the record's
/// total size.
pub fn decode_record(data: &[u8]) -> Result<(JournalEvent, usize)> {
    if data.len() < RECORD_HEADER_SIZE + 4 {
        return Err(Error::Decode("journal record too small".into()));
    }
    let magic = u32::from_le_bytes(data[0..4].try_into().unwrap());
    if magic != LOG_MAGIC {
        return Err(Error::Decode("invalid journal record magic".into()));
    }
    let payload_len = u32::from_le_bytes(data[4..8].try_into().unwrap()) as usize;
    let total = RECORD_HEADER_SIZE + payload_len + 4;
    if data.len() < total {
        return Err(Error::Decode("journal record truncated".into()));
    }
    let stored_crc =
        u32::from_le_bytes(data[total - 4..total].try_into().unwrap());
    let computed_crc = crc32c::crc32c(&data[..total - 4]);
    if computed_crc != stored_crc {
        return Err(Error::Decode("journal record CRC mismatch".into()));
    }
    let event = bincode::deserialize(&data[RECORD_HEADER_SIZE..total - 4])
        .map_err(|e| Error::Decode(e.to_string()))?;
    Ok((event, total))
}

/// The metadata journal.
pub struct MdsLog {
    entries: VecDeque<LogEntry>,
    write_pos: LogOffset,
    /// Offset of the log tail; entries before this were trimmed.
    trimmed_pos: LogOffset,
    capped: bool,
    /// End offset of the most recent import-map checkpoint.
    last_import_map: LogOffset,
    import_map_expire_waiters: Vec<Completion>,
}

impl Default for MdsLog {
    fn default() -> Self {
        Self::new()
    }
}

impl MdsLog {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: VecDeque::new(),
            write_pos: LOG_HEADER_SIZE,
            trimmed_pos: LOG_HEADER_SIZE,
            capped: false,
            last_import_map: 0,
            import_map_expire_waiters: Vec::new(),
        }
    }

    #[must_use]
    pub fn write_pos(&self) -> LogOffset {
        self.write_pos
    }

    #[must_use]
    pub fn is_capped(&self) -> bool {
        self.capped
    }

    #[must_use]
    pub fn last_import_map(&self) -> LogOffset {
        self.last_import_map
    }

    #[must_use]
    pub fn num_entries(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn front(&self) -> Option<&LogEntry> {
        self.entries.front()
    }

    pub fn entries(&self) -> impl Iterator<Item = &LogEntry> {
        self.entries.iter()
    }

    /// Append an event, assigning its offsets. A new import map becomes
    /// the live checkpoint and wakes entries waiting to expire behind it.
    pub fn submit(&mut self, event: JournalEvent) -> Result<LogOffset> {
        let record = encode_record(&event)?;
        let start = self.write_pos;
        let end = start + record.len() as LogOffset;
        debug!("journal submit {} at [{}, {})", event.kind(), start, end);

        let is_import_map = matches!(event, JournalEvent::ImportMap(_));
        self.entries.push_back(LogEntry { start, end, event });
        self.write_pos = end;

        if is_import_map {
            self.last_import_map = end;
            for cb in self.import_map_expire_waiters.drain(..) {
                cb();
            }
        }
        Ok(end)
    }

    /// Park a completion until the next import map is written (or the
    /// log is capped).
    pub fn add_import_map_expire_waiter(&mut self, cb: Completion) {
        self.import_map_expire_waiters.push(cb);
    }

    /// Seal the log at shutdown. No further writes; checkpoint waiters
    /// are released since no newer map can arrive.
    pub fn cap(&mut self) {
        info!("journal capped at {}", self.write_pos);
        self.capped = true;
        for cb in self.import_map_expire_waiters.drain(..) {
            cb();
        }
    }

    /// Drop the oldest entry, advancing the tail.
    pub(crate) fn pop_front(&mut self) -> Option<LogEntry> {
        let entry = self.entries.pop_front();
        if let Some(e) = &entry {
            self.trimmed_pos = e.end;
        }
        entry
    }

    #[must_use]
    pub fn trimmed_pos(&self) -> LogOffset {
        self.trimmed_pos
    }
}
