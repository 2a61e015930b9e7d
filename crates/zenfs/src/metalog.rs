//! Append-only, CRC-framed record stream inside one meta zone.
//!
//! Each record is an 8-byte header (CRC32, payload length) followed by the
//! payload, padded to the device block size. The CRC covers the length
//! field and the payload.

use tracing::{debug, warn};

use crate::error::{ZenFsError, ZenFsResult};
use crate::zbd::{Zone, ZoneLease};

/// Size of the record header in bytes.
pub const HEADER_SIZE: usize = 8;

/// Outcome of reading one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogRead {
    /// A well-formed record payload.
    Record(Vec<u8>),
    /// No more valid records.
    EndOfLog,
}

/// Metadata log over a leased meta zone. Dropping the log releases the lease.
#[derive(Debug)]
pub struct ZenMetaLog {
    lease: ZoneLease,
    read_pos: u64,
    block_size: u64,
}

fn record_crc(len: u32, payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&len.to_le_bytes());
    hasher.update(payload);
    hasher.finalize()
}

impl ZenMetaLog {
    /// Creates a log positioned at the start of the leased zone.
    pub fn new(lease: ZoneLease, block_size: u32) -> Self {
        Self {
            lease,
            read_pos: 0,
            block_size: block_size as u64,
        }
    }

    /// The zone hosting this log.
    pub fn zone(&self) -> &Zone {
        &self.lease
    }

    /// Releases the log, handing back the zone lease.
    pub fn into_lease(self) -> ZoneLease {
        self.lease
    }

    /// Read cursor relative to the zone start.
    pub fn read_pos(&self) -> u64 {
        self.read_pos
    }

    fn padded(&self, len: u64) -> u64 {
        len.div_ceil(self.block_size) * self.block_size
    }

    /// Appends one record.
    ///
    /// Fails with [`ZenFsError::NoSpace`] without writing anything if the
    /// padded record does not fit in the zone.
    pub fn add_record(&mut self, payload: &[u8]) -> ZenFsResult<()> {
        let len = u32::try_from(payload.len()).map_err(|_| {
            ZenFsError::InvalidArgument(format!("record of {} bytes is too large", payload.len()))
        })?;
        let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());
        buf.extend_from_slice(&record_crc(len, payload).to_le_bytes());
        buf.extend_from_slice(&len.to_le_bytes());
        buf.extend_from_slice(payload);

        let offset = self.lease.append(&buf)?;
        debug!(
            zone = self.lease.nr(),
            offset,
            len,
            "appended metadata record"
        );
        Ok(())
    }

    /// Reads the record at the cursor and advances past it.
    ///
    /// Zeroed headers and records extending past the write pointer end the
    /// log. A CRC mismatch on the last record before the write pointer is a
    /// torn append and also ends the log; a mismatch with written data after
    /// it is corruption.
    pub fn read_record(&mut self) -> ZenFsResult<LogRead> {
        let zone = self.zone();
        let wp = zone.write_pointer();
        let pos = zone.start() + self.read_pos;

        if pos + HEADER_SIZE as u64 > wp {
            return Ok(LogRead::EndOfLog);
        }

        let mut header = [0u8; HEADER_SIZE];
        zone.read(pos, &mut header)?;
        let crc = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        let len = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);

        if len == 0 {
            debug!(zone = zone.nr(), pos, "zero-length header, end of log");
            return Ok(LogRead::EndOfLog);
        }
        let data_end = pos + HEADER_SIZE as u64 + len as u64;
        if data_end > wp {
            warn!(
                zone = zone.nr(),
                pos,
                len,
                wp,
                "record extends past write pointer, treating as end of log"
            );
            return Ok(LogRead::EndOfLog);
        }

        let mut payload = vec![0u8; len as usize];
        zone.read(pos + HEADER_SIZE as u64, &mut payload)?;
        let record_len = self.padded(HEADER_SIZE as u64 + len as u64);

        if record_crc(len, &payload) != crc {
            if pos + record_len >= wp {
                warn!(zone = zone.nr(), pos, "torn record at log tail, treating as end of log");
                return Ok(LogRead::EndOfLog);
            }
            return Err(ZenFsError::corruption(
                "ZenMetaLog",
                format!("CRC mismatch at offset {} in zone {}", pos, zone.nr()),
            ));
        }

        self.read_pos += record_len;
        Ok(LogRead::Record(payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::zbd::{MemoryBackend, ZonedBlockDevice};
    use std::sync::Arc;

    const BS: u32 = 512;

    fn device() -> ZonedBlockDevice {
        ZonedBlockDevice::open(Arc::new(MemoryBackend::new(BS, 8, 5))).unwrap()
    }

    fn log(dev: &ZonedBlockDevice) -> ZenMetaLog {
        ZenMetaLog::new(dev.allocate_meta_zone().unwrap(), BS)
    }

    fn rewind(log: ZenMetaLog) -> ZenMetaLog {
        ZenMetaLog::new(log.into_lease(), BS)
    }

    #[test]
    fn test_records_roundtrip_in_order() {
        let dev = device();
        let mut log = log(&dev);
        log.add_record(b"first").unwrap();
        log.add_record(&[9u8; 700]).unwrap();
        // Each record is padded to whole blocks.
        assert_eq!(log.zone().written(), 512 + 1024);

        let mut log = rewind(log);
        assert_eq!(log.read_record().unwrap(), LogRead::Record(b"first".to_vec()));
        assert_eq!(log.read_record().unwrap(), LogRead::Record(vec![9u8; 700]));
        assert_eq!(log.read_record().unwrap(), LogRead::EndOfLog);
        assert_eq!(log.read_pos(), 1536);
    }

    #[test]
    fn test_empty_zone_is_end_of_log() {
        let dev = device();
        let mut log = log(&dev);
        assert_eq!(log.read_record().unwrap(), LogRead::EndOfLog);
    }

    #[test]
    fn test_zeroed_tail_is_end_of_log() {
        let dev = device();
        let mut log = log(&dev);
        log.add_record(b"ok").unwrap();
        log.lease.append(&[0u8; 512]).unwrap();

        let mut log = rewind(log);
        assert!(matches!(log.read_record().unwrap(), LogRead::Record(_)));
        assert_eq!(log.read_record().unwrap(), LogRead::EndOfLog);
    }

    #[test]
    fn test_length_past_write_pointer_is_end_of_log() {
        let dev = device();
        let mut log = log(&dev);
        log.add_record(b"ok").unwrap();
        let mut torn = vec![0u8; 512];
        torn[4..8].copy_from_slice(&4000u32.to_le_bytes());
        log.lease.append(&torn).unwrap();

        let mut log = rewind(log);
        assert!(matches!(log.read_record().unwrap(), LogRead::Record(_)));
        assert_eq!(log.read_record().unwrap(), LogRead::EndOfLog);
    }

    #[test]
    fn test_crc_mismatch_at_tail_is_end_of_log() {
        let dev = device();
        let mut log = log(&dev);
        log.add_record(b"ok").unwrap();
        let mut bad = vec![0u8; 512];
        bad[0..4].copy_from_slice(&0xdeadbeefu32.to_le_bytes());
        bad[4..8].copy_from_slice(&10u32.to_le_bytes());
        log.lease.append(&bad).unwrap();

        let mut log = rewind(log);
        assert!(matches!(log.read_record().unwrap(), LogRead::Record(_)));
        assert_eq!(log.read_record().unwrap(), LogRead::EndOfLog);
    }

    #[test]
    fn test_crc_mismatch_mid_stream_is_corruption() {
        let dev = device();
        let mut log = log(&dev);
        let mut bad = vec![0u8; 512];
        bad[0..4].copy_from_slice(&0xdeadbeefu32.to_le_bytes());
        bad[4..8].copy_from_slice(&10u32.to_le_bytes());
        log.lease.append(&bad).unwrap();
        log.add_record(b"after").unwrap();

        let mut log = rewind(log);
        assert!(log.read_record().unwrap_err().is_corruption());
    }

    #[test]
    fn test_add_record_no_space() {
        let dev = device();
        let mut log = log(&dev);
        for _ in 0..8 {
            log.add_record(b"x").unwrap();
        }
        let err = log.add_record(b"y").unwrap_err();
        assert!(err.is_no_space());
        assert!(log.zone().is_full());
    }

    #[test]
    fn test_drop_releases_lease() {
        let dev = device();
        let zone = dev.meta_zones()[0].clone();
        let log = log(&dev);
        assert!(zone.is_busy());
        drop(log);
        assert!(!zone.is_busy());
    }
}
