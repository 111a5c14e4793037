//! Non-volatile storage for backup RAM and cartridge NV data.
//!
//! Saves are not written the moment data changes. A dirty buffer waits three
//! seconds of emulated time so that a burst of writes produces one file
//! update; a failed save is retried after a minute of emulated time.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::PathBuf;

/// File extension of the backup RAM image.
pub const BACKUP_RAM_EXT: &str = "bkr";
/// File extension of the cartridge NV image.
pub const CART_NV_EXT: &str = "bcr";

/// Seconds between the last change and the save.
const SAVE_DELAY_SECS: i64 = 3;
/// Seconds before a failed save is retried.
const RETRY_DELAY_SECS: i64 = 60;

/// Where NV images are kept, keyed by file extension.
pub trait NvStore {
    /// `Ok(None)` when there is nothing saved yet.
    fn load(&mut self, ext: &str) -> io::Result<Option<Vec<u8>>>;

    fn save(&mut self, ext: &str, data: &[u8]) -> io::Result<()>;
}

/// `<dir>/<base>.<ext>` files.
pub struct FileStore {
    dir: PathBuf,
    base: String,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>, base: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            base: base.into(),
        }
    }

    pub fn path(&self, ext: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", self.base, ext))
    }
}

impl NvStore for FileStore {
    fn load(&mut self, ext: &str) -> io::Result<Option<Vec<u8>>> {
        match fs::read(self.path(ext)) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn save(&mut self, ext: &str, data: &[u8]) -> io::Result<()> {
        fs::create_dir_all(&self.dir)?;
        fs::write(self.path(ext), data)
    }
}

/// In-memory store, for tests and hosts that persist NV data themselves.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    pub files: HashMap<String, Vec<u8>>,
    /// Make every save fail.
    pub fail_saves: bool,
    pub save_count: usize,
}

impl NvStore for MemoryStore {
    fn load(&mut self, ext: &str) -> io::Result<Option<Vec<u8>>> {
        Ok(self.files.get(ext).cloned())
    }

    fn save(&mut self, ext: &str, data: &[u8]) -> io::Result<()> {
        if self.fail_saves {
            return Err(io::Error::new(io::ErrorKind::PermissionDenied, "saves disabled"));
        }
        self.save_count += 1;
        self.files.insert(ext.to_string(), data.to_vec());
        Ok(())
    }
}

/// Save countdown for one NV buffer, in master-clock cycles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NvFlusher {
    delay: i64,
    master_clock: i64,
}

impl NvFlusher {
    pub fn new(master_clock: i64) -> Self {
        Self {
            delay: i64::MAX,
            master_clock,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.delay != i64::MAX
    }

    /// Advance by one frame. Returns whether the buffer should be saved now.
    pub fn tick(&mut self, dirty: bool, master_cycles: i64) -> bool {
        if dirty {
            self.delay = SAVE_DELAY_SECS * self.master_clock;
            return false;
        }
        if !self.is_pending() {
            return false;
        }
        self.delay -= master_cycles;
        if self.delay <= 0 {
            self.delay = i64::MAX;
            return true;
        }
        false
    }

    /// The save failed; try again later.
    pub fn retry_later(&mut self) {
        self.delay = RETRY_DELAY_SECS * self.master_clock;
    }

    /// Forget any pending save.
    pub fn clear(&mut self) {
        self.delay = i64::MAX;
    }
}
