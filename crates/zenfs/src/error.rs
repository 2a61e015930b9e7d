//! Error types for the zoned filesystem core.

use thiserror::Error;

/// Result type alias for filesystem operations.
pub type ZenFsResult<T> = Result<T, ZenFsError>;

/// Error variants for filesystem operations.
#[derive(Debug, Error)]
pub enum ZenFsError {
    /// Wraps standard I/O errors from the auxiliary filesystem.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// On-disk data failed validation.
    #[error("Corruption in {context}: {reason}")]
    Corruption {
        /// The structure being decoded.
        context: &'static str,
        /// Description of the corruption.
        reason: String,
    },

    /// The superblock was written by an incompatible format version.
    #[error("Unsupported superblock version: expected {expected}, found {found}")]
    UnsupportedVersion {
        /// Version this build understands.
        expected: u32,
        /// Version found on disk.
        found: u32,
    },

    /// An append does not fit in the remaining capacity of a zone.
    #[error("No space in zone {zone}: requested {requested} bytes, {available} available")]
    NoSpace {
        /// Zone number.
        zone: u64,
        /// Bytes the append needed.
        requested: u64,
        /// Bytes left in the zone.
        available: u64,
    },

    /// No zone could be leased.
    #[error("No free zone available for {purpose}")]
    NoFreeZone {
        /// What the zone was needed for.
        purpose: &'static str,
    },

    /// The superblock geometry does not match the device.
    #[error("Geometry mismatch on {field}: superblock has {recorded}, device reports {device}")]
    GeometryMismatch {
        /// Name of the mismatching field.
        field: &'static str,
        /// Value recorded at format time.
        recorded: u64,
        /// Value reported by the device.
        device: u64,
    },

    /// The operation is deliberately unsupported.
    #[error("{0} is not implemented in ZenFS")]
    NotSupported(&'static str),

    /// The path does not name a file or directory.
    #[error("Not found: {path}")]
    NotFound {
        /// The missing path.
        path: String,
    },

    /// The target of a create or link already exists.
    #[error("Already exists: {path}")]
    AlreadyExists {
        /// The existing path.
        path: String,
    },

    /// The file is locked by a writer or a migration.
    #[error("Busy: {path}")]
    Busy {
        /// The busy path.
        path: String,
    },

    /// A caller supplied an unusable argument.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A mutating operation was issued against a read-only mount.
    #[error("Filesystem is mounted read-only")]
    ReadOnly,

    /// Encoding of a metadata payload failed.
    #[error("Serialization error: {reason}")]
    Serialization {
        /// Description of the error.
        reason: String,
    },
}

impl ZenFsError {
    /// Builds a corruption error for the given context.
    pub fn corruption(context: &'static str, reason: impl Into<String>) -> Self {
        Self::Corruption {
            context,
            reason: reason.into(),
        }
    }

    /// Builds a not-found error for a path.
    pub fn not_found(path: impl Into<String>) -> Self {
        Self::NotFound { path: path.into() }
    }

    /// True when the error means "roll to a new zone and retry".
    pub fn is_no_space(&self) -> bool {
        matches!(self, Self::NoSpace { .. })
    }

    /// True for on-disk format and decode failures.
    pub fn is_corruption(&self) -> bool {
        matches!(self, Self::Corruption { .. })
    }

    /// True when the path does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}
