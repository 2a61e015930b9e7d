//! Shared harness for the integration tests: an in-memory zoned device
//! with a temporary aux directory that survives remounts.

#![allow(dead_code)]

use std::sync::{Arc, Once};

use zenfs::{
    LocalAuxFs, MemoryBackend, MkfsOptions, NoZenFsMetrics, WriteLifetimeHint, ZenFs,
    ZenFsOptions, ZenFsResult, ZonedBackend, ZonedBlockDevice,
};

pub const BLOCK_SIZE: u32 = 4096;

static TRACING: Once = Once::new();

pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

pub struct TestFs {
    _tmp: tempfile::TempDir,
    pub backend: Arc<MemoryBackend>,
    pub aux: Arc<LocalAuxFs>,
}

impl TestFs {
    pub fn format(zone_blocks: u64, nr_zones: u32) -> Self {
        Self::format_with(zone_blocks, nr_zones, MkfsOptions::default())
    }

    pub fn format_with(zone_blocks: u64, nr_zones: u32, mut options: MkfsOptions) -> Self {
        init_tracing();
        let tmp = tempfile::tempdir().unwrap();
        options.aux_fs_path = format!("{}/aux", tmp.path().display());
        let t = Self {
            _tmp: tmp,
            backend: Arc::new(MemoryBackend::new(BLOCK_SIZE, zone_blocks, nr_zones)),
            aux: Arc::new(LocalAuxFs::new()),
        };
        ZenFs::mkfs(&t.device(), t.aux.as_ref(), &options).unwrap();
        t
    }

    /// Opens a fresh device view over the backend, as after a power cycle.
    pub fn device(&self) -> Arc<ZonedBlockDevice> {
        let backend: Arc<dyn ZonedBackend> = self.backend.clone();
        Arc::new(ZonedBlockDevice::open(backend).unwrap())
    }

    pub fn try_mount(&self, options: ZenFsOptions) -> ZenFsResult<ZenFs> {
        ZenFs::mount(
            self.device(),
            self.aux.clone(),
            options,
            Arc::new(NoZenFsMetrics),
        )
    }

    pub fn mount(&self) -> ZenFs {
        self.try_mount(ZenFsOptions::default()).unwrap()
    }
}

/// Deterministic test data.
pub fn pattern(seed: u64, len: usize) -> Vec<u8> {
    let mut state = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
    (0..len)
        .map(|_| {
            state = state
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            (state >> 33) as u8
        })
        .collect()
}

pub fn write_file(fs: &ZenFs, name: &str, data: &[u8], hint: WriteLifetimeHint) {
    let mut w = fs.new_writable_file(name, hint).unwrap();
    w.append(data).unwrap();
    w.close().unwrap();
}

pub fn read_all(fs: &ZenFs, name: &str) -> Vec<u8> {
    let size = fs.get_file_size(name).unwrap() as usize;
    let r = fs.new_random_access_file(name).unwrap();
    let mut buf = vec![0u8; size];
    assert_eq!(r.read_at(0, &mut buf).unwrap(), size);
    buf
}
