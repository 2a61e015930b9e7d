//! Format and mount configuration.

use serde::{Deserialize, Serialize};

use crate::error::{ZenFsError, ZenFsResult};
use crate::gc::GcConfig;

/// Options recorded in the superblock at format time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MkfsOptions {
    /// Auxiliary filesystem directory for directories, locks and logs.
    pub aux_fs_path: String,
    /// Finish open zones with less than this percentage of capacity left.
    pub finish_threshold: u32,
    /// Run background garbage collection on read-write mounts.
    pub enable_gc: bool,
    /// Place WAL files on the auxiliary filesystem.
    pub wal_on_aux: bool,
}

impl MkfsOptions {
    /// Parses options from JSON; missing fields take their defaults.
    pub fn from_json(json: &str) -> ZenFsResult<Self> {
        serde_json::from_str(json).map_err(|e| ZenFsError::InvalidArgument(e.to_string()))
    }
}

/// Mount-time options.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ZenFsOptions {
    /// Mount without touching the device.
    pub readonly: bool,
    /// Garbage collection tuning.
    pub gc: GcConfig,
}

impl ZenFsOptions {
    /// Parses options from JSON; missing fields take their defaults.
    pub fn from_json(json: &str) -> ZenFsResult<Self> {
        serde_json::from_str(json).map_err(|e| ZenFsError::InvalidArgument(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let opts = ZenFsOptions::default();
        assert!(!opts.readonly);
        assert_eq!(opts.gc.start_level_pct, 20);
        assert_eq!(opts.gc.slope, 3);

        let mkfs = MkfsOptions::default();
        assert!(mkfs.aux_fs_path.is_empty());
        assert!(!mkfs.enable_gc);
    }

    #[test]
    fn test_from_json_partial() {
        let opts = ZenFsOptions::from_json(r#"{"readonly": true, "gc": {"slope": 5}}"#).unwrap();
        assert!(opts.readonly);
        assert_eq!(opts.gc.slope, 5);
        assert_eq!(opts.gc.start_level_pct, 20);

        let mkfs = MkfsOptions::from_json(r#"{"aux_fs_path": "/tmp/aux", "enable_gc": true}"#).unwrap();
        assert_eq!(mkfs.aux_fs_path, "/tmp/aux");
        assert!(mkfs.enable_gc);
        assert_eq!(mkfs.finish_threshold, 0);
    }

    #[test]
    fn test_from_json_rejects_garbage() {
        assert!(matches!(
            ZenFsOptions::from_json("not json"),
            Err(ZenFsError::InvalidArgument(_))
        ));
    }
}
