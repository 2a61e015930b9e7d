//! Metadata record codecs and replay of the metadata log into a file table.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{ZenFsError, ZenFsResult};
use crate::file::{WriteLifetimeHint, ZoneExtent, ZoneFile};
use crate::files::FileTable;
use crate::metalog::{LogRead, ZenMetaLog};

/// Tag identifying the type of a metadata record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum RecordTag {
    /// Full file table
    CompleteFilesSnapshot = 1,
    /// Incremental update of one file
    FileUpdate = 2,
    /// Removal of one name
    FileDeletion = 3,
    /// End of a rolled meta zone
    EndRecord = 4,
    /// Full replacement of one file's metadata
    FileReplace = 5,
}

impl RecordTag {
    /// Parses a raw tag value.
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            1 => Some(Self::CompleteFilesSnapshot),
            2 => Some(Self::FileUpdate),
            3 => Some(Self::FileDeletion),
            4 => Some(Self::EndRecord),
            5 => Some(Self::FileReplace),
            _ => None,
        }
    }
}

/// Persisted metadata of one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    /// File identifier.
    pub id: u64,
    /// Logical size in bytes.
    pub size: u64,
    /// Write lifetime hint.
    pub lifetime: WriteLifetimeHint,
    /// Modification time in seconds since the epoch.
    pub mtime: u64,
    /// Extents in file order; only the new ones in an incremental update.
    pub extents: Vec<ZoneExtent>,
    /// Every name linking to the file.
    pub links: Vec<String>,
}

/// Every live file at the time of a snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    /// One record per file; hard-linked files appear once.
    pub files: Vec<FileRecord>,
}

/// Removal of one name from a file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletionRecord {
    /// File identifier the name refers to.
    pub id: u64,
    /// The removed name.
    pub name: String,
}

/// A decoded metadata log record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetaRecord {
    /// Full snapshot of the file table.
    Snapshot(SnapshotRecord),
    /// Incremental update: extents are appended to the existing ones.
    Update(FileRecord),
    /// Full replacement of a file's extent list.
    Replace(FileRecord),
    /// Removal of one name.
    Deletion(DeletionRecord),
    /// Marks the end of a rolled meta zone.
    End,
}

fn encode_body<T: Serialize>(tag: RecordTag, body: &T) -> ZenFsResult<Vec<u8>> {
    let mut out = (tag as u32).to_le_bytes().to_vec();
    bincode::serialize_into(&mut out, body).map_err(|e| ZenFsError::Serialization {
        reason: e.to_string(),
    })?;
    Ok(out)
}

fn decode_body<'a, T: Deserialize<'a>>(tag: RecordTag, body: &'a [u8]) -> ZenFsResult<T> {
    bincode::deserialize(body)
        .map_err(|e| ZenFsError::corruption("metadata record", format!("{:?}: {}", tag, e)))
}

impl MetaRecord {
    /// Tag written for this record.
    pub fn tag(&self) -> RecordTag {
        match self {
            Self::Snapshot(_) => RecordTag::CompleteFilesSnapshot,
            Self::Update(_) => RecordTag::FileUpdate,
            Self::Replace(_) => RecordTag::FileReplace,
            Self::Deletion(_) => RecordTag::FileDeletion,
            Self::End => RecordTag::EndRecord,
        }
    }

    /// Encodes the record as a log payload: a u32 LE tag and a bincode body.
    pub fn encode(&self) -> ZenFsResult<Vec<u8>> {
        let tag = self.tag();
        match self {
            Self::Snapshot(s) => encode_body(tag, s),
            Self::Update(f) | Self::Replace(f) => encode_body(tag, f),
            Self::Deletion(d) => encode_body(tag, d),
            Self::End => Ok((tag as u32).to_le_bytes().to_vec()),
        }
    }

    /// Decodes a log payload.
    pub fn decode(payload: &[u8]) -> ZenFsResult<Self> {
        if payload.len() < 4 {
            return Err(ZenFsError::corruption(
                "metadata record",
                format!("payload of {} bytes has no tag", payload.len()),
            ));
        }
        let raw = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
        let tag = RecordTag::from_u32(raw).ok_or_else(|| {
            ZenFsError::corruption("metadata record", format!("unknown tag {}", raw))
        })?;
        let body = &payload[4..];
        Ok(match tag {
            RecordTag::CompleteFilesSnapshot => Self::Snapshot(decode_body(tag, body)?),
            RecordTag::FileUpdate => Self::Update(decode_body(tag, body)?),
            RecordTag::FileReplace => Self::Replace(decode_body(tag, body)?),
            RecordTag::FileDeletion => Self::Deletion(decode_body(tag, body)?),
            RecordTag::EndRecord => Self::End,
        })
    }
}

/// Counters from one replay of a metadata log.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryStats {
    /// Records applied.
    pub records: u64,
    /// Snapshots applied.
    pub snapshots: u64,
    /// Incremental updates applied.
    pub updates: u64,
    /// Replace records applied.
    pub replaces: u64,
    /// Deletions applied.
    pub deletions: u64,
    /// Whether replay stopped at an end record.
    pub end_record: bool,
}

impl FileTable {
    /// Replaces the whole table with the contents of a snapshot.
    pub fn apply_snapshot(&mut self, snapshot: SnapshotRecord) -> ZenFsResult<()> {
        self.clear();
        for rec in snapshot.files {
            let id = rec.id;
            let links = rec.links.clone();
            let file = Arc::new(ZoneFile::from_record(rec));
            for name in links {
                if self.insert(name.clone(), Arc::clone(&file)).is_some() {
                    return Err(ZenFsError::corruption(
                        "snapshot",
                        format!("name {} appears twice", name),
                    ));
                }
            }
            self.observe_id(id);
        }
        Ok(())
    }

    /// Applies a file update. With `replace` the file's extents are
    /// superseded instead of extended.
    pub fn apply_update(&mut self, rec: FileRecord, replace: bool) -> ZenFsResult<()> {
        let id = rec.id;
        let links = rec.links.clone();
        let file = match self.find_by_id(id) {
            Some(file) => {
                for name in file.links() {
                    self.remove_name(&name);
                }
                file.merge_update(rec, replace);
                file
            }
            None => Arc::new(ZoneFile::from_record(rec)),
        };
        for name in links {
            if let Some(other) = self.insert(name.clone(), Arc::clone(&file)) {
                if other.id() != id {
                    return Err(ZenFsError::corruption(
                        "file update",
                        format!("name {} already maps to file {}", name, other.id()),
                    ));
                }
            }
        }
        self.observe_id(id);
        Ok(())
    }

    /// Removes one name. The file goes away with its last name.
    pub fn apply_deletion(&mut self, rec: DeletionRecord) -> ZenFsResult<()> {
        let file = self
            .get(&rec.name)
            .cloned()
            .ok_or_else(|| ZenFsError::corruption("file deletion", format!("{} not found", rec.name)))?;
        if file.id() != rec.id {
            return Err(ZenFsError::corruption(
                "file deletion",
                format!("{} is file {}, record names {}", rec.name, file.id(), rec.id),
            ));
        }
        file.remove_link(&rec.name);
        self.remove_name(&rec.name);
        Ok(())
    }
}

/// Replays records from the log cursor until end of log or an end record.
/// The first record applied must be a snapshot.
pub fn recover_from(log: &mut ZenMetaLog, table: &mut FileTable) -> ZenFsResult<RecoveryStats> {
    let mut stats = RecoveryStats::default();
    loop {
        let payload = match log.read_record()? {
            LogRead::Record(payload) => payload,
            LogRead::EndOfLog => break,
        };
        let record = MetaRecord::decode(&payload)?;
        if stats.snapshots == 0 && !matches!(record, MetaRecord::Snapshot(_)) {
            return Err(ZenFsError::corruption(
                "recovery",
                format!("{:?} record before the first snapshot", record.tag()),
            ));
        }
        stats.records += 1;
        match record {
            MetaRecord::Snapshot(snapshot) => {
                table.apply_snapshot(snapshot)?;
                stats.snapshots += 1;
            }
            MetaRecord::Update(rec) => {
                table.apply_update(rec, false)?;
                stats.updates += 1;
            }
            MetaRecord::Replace(rec) => {
                table.apply_update(rec, true)?;
                stats.replaces += 1;
            }
            MetaRecord::Deletion(rec) => {
                table.apply_deletion(rec)?;
                stats.deletions += 1;
            }
            MetaRecord::End => {
                stats.end_record = true;
                debug!(zone = log.zone().nr(), "end record reached");
                break;
            }
        }
    }

    if stats.snapshots == 0 {
        return Err(ZenFsError::corruption("recovery", "no snapshot found"));
    }
    info!(
        zone = log.zone().nr(),
        records = stats.records,
        files = table.unique_files().len(),
        "recovered metadata log"
    );
    Ok(stats)
}
