//! Monotonic version counters.
//!
//! Every log entry carries a version issued by a [`VersionController`]. The
//! data file records the highest flushed version, and recovery uses it to
//! decide which log entries still have to be replayed.

use crate::error::{Result, TsFileError};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tracing::{debug, warn};

/// File name prefix used by [`FileVersionController`].
pub const VERSION_FILE_PREFIX: &str = "Version-";

/// Default number of versions issued between two persisted checkpoints.
pub const DEFAULT_SAVE_INTERVAL: u64 = 100;

/// Source of strictly increasing versions.
pub trait VersionController: Send + Sync {
    /// Advances the counter and returns the new version.
    fn next_version(&self) -> Result<u64>;

    /// Returns the last issued version.
    fn curr_version(&self) -> u64;

    /// Moves the counter forward to at least `version`.
    ///
    /// Never moves it backwards. Recovery calls this with the highest
    /// replayed version so no replayed version is issued again.
    fn advance_to(&self, version: u64) -> Result<()> {
        while self.curr_version() < version {
            self.next_version()?;
        }
        Ok(())
    }
}

/// In-memory version counter.
#[derive(Debug, Default)]
pub struct SimpleVersionController {
    current: AtomicU64,
}

impl SimpleVersionController {
    /// Creates a counter whose last issued version is `initial`.
    pub fn new(initial: u64) -> Self {
        Self {
            current: AtomicU64::new(initial),
        }
    }
}

impl VersionController for SimpleVersionController {
    fn next_version(&self) -> Result<u64> {
        Ok(self.current.fetch_add(1, Ordering::SeqCst) + 1)
    }

    fn curr_version(&self) -> u64 {
        self.current.load(Ordering::SeqCst)
    }

    fn advance_to(&self, version: u64) -> Result<()> {
        self.current.fetch_max(version, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Debug)]
struct FileVersionState {
    current: u64,
    persisted: u64,
}

/// Version counter checkpointed to a `Version-{n}` file.
///
/// The counter is saved every `save_interval` versions. After a restart it
/// resumes from the saved value plus the interval, which is above every
/// version issued before the crash.
#[derive(Debug)]
pub struct FileVersionController {
    dir: PathBuf,
    save_interval: u64,
    state: Mutex<FileVersionState>,
}

impl FileVersionController {
    /// Opens (or initializes) the counter stored in `dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be read or the resumed value
    /// cannot be persisted.
    pub fn open(dir: impl AsRef<Path>, save_interval: u64) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        let save_interval = save_interval.max(1);
        fs::create_dir_all(&dir)?;

        let saved = Self::scan_saved(&dir)?;
        let current = match saved {
            Some(value) => value.saturating_add(save_interval),
            None => 0,
        };

        let controller = Self {
            dir,
            save_interval,
            state: Mutex::new(FileVersionState {
                current,
                persisted: saved.unwrap_or(0),
            }),
        };

        {
            let mut state = controller
                .state
                .lock()
                .unwrap_or_else(|err| err.into_inner());
            controller.persist(&mut state, current)?;
        }

        debug!(
            "Opened version controller in {} at version {}",
            controller.dir.display(),
            current
        );
        Ok(controller)
    }

    /// Returns the highest value among the `Version-{n}` files in `dir`.
    fn scan_saved(dir: &Path) -> Result<Option<u64>> {
        let mut max: Option<u64> = None;
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(value) = name
                .to_str()
                .and_then(|s| s.strip_prefix(VERSION_FILE_PREFIX))
                .and_then(|s| s.parse::<u64>().ok())
            else {
                continue;
            };
            max = Some(max.map_or(value, |m| m.max(value)));
        }
        Ok(max)
    }

    fn version_path(&self, value: u64) -> PathBuf {
        self.dir.join(format!("{}{}", VERSION_FILE_PREFIX, value))
    }

    /// Writes `Version-{value}`, then removes the previous checkpoint.
    fn persist(&self, state: &mut FileVersionState, value: u64) -> Result<()> {
        let new_path = self.version_path(value);
        File::create(&new_path)
            .and_then(|file| file.sync_all())
            .map_err(|e| {
                TsFileError::VersionPersist(format!("{}: {}", new_path.display(), e))
            })?;

        if state.persisted != value {
            let old_path = self.version_path(state.persisted);
            if old_path.exists() {
                if let Err(e) = fs::remove_file(&old_path) {
                    warn!(
                        "Failed to remove old version file {}: {:?}",
                        old_path.display(),
                        e
                    );
                }
            }
        }
        state.persisted = value;
        Ok(())
    }

    /// Returns the directory holding the checkpoint file.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Returns the last persisted checkpoint.
    pub fn persisted_version(&self) -> u64 {
        self.state
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .persisted
    }
}

impl VersionController for FileVersionController {
    fn next_version(&self) -> Result<u64> {
        let mut state = self.state.lock().unwrap_or_else(|err| err.into_inner());
        let next = state.current + 1;
        if next >= state.persisted + self.save_interval {
            self.persist(&mut state, next)?;
        }
        state.current = next;
        Ok(next)
    }

    fn curr_version(&self) -> u64 {
        self.state
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .current
    }

    fn advance_to(&self, version: u64) -> Result<()> {
        let mut state = self.state.lock().unwrap_or_else(|err| err.into_inner());
        if version <= state.current {
            return Ok(());
        }
        if version >= state.persisted + self.save_interval {
            self.persist(&mut state, version)?;
        }
        state.current = version;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn version_files(dir: &Path) -> Vec<String> {
        let mut names: Vec<_> = fs::read_dir(dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter_map(|e| e.file_name().to_str().map(str::to_string))
            .filter(|n| n.starts_with(VERSION_FILE_PREFIX))
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_simple_controller() {
        let controller = SimpleVersionController::new(5);
        assert_eq!(controller.curr_version(), 5);
        assert_eq!(controller.next_version().unwrap(), 6);
        assert_eq!(controller.curr_version(), 6);

        controller.advance_to(20).unwrap();
        assert_eq!(controller.next_version().unwrap(), 21);

        controller.advance_to(3).unwrap();
        assert_eq!(controller.curr_version(), 21);
    }

    #[test]
    fn test_file_controller_fresh_start() {
        let temp_dir = TempDir::new().unwrap();
        let controller = FileVersionController::open(temp_dir.path(), 10).unwrap();
        assert_eq!(controller.curr_version(), 0);
        assert_eq!(version_files(temp_dir.path()), vec!["Version-0"]);
    }

    #[test]
    fn test_file_controller_checkpoints_every_interval() {
        let temp_dir = TempDir::new().unwrap();
        let controller = FileVersionController::open(temp_dir.path(), 10).unwrap();
        for _ in 0..25 {
            controller.next_version().unwrap();
        }
        assert_eq!(controller.curr_version(), 25);
        assert_eq!(controller.persisted_version(), 20);
        assert_eq!(version_files(temp_dir.path()), vec!["Version-20"]);
    }

    #[test]
    fn test_file_controller_never_reissues_after_restart() {
        let temp_dir = TempDir::new().unwrap();
        let last_issued = {
            let controller = FileVersionController::open(temp_dir.path(), 10).unwrap();
            let mut last = 0;
            for _ in 0..37 {
                last = controller.next_version().unwrap();
            }
            last
        };

        let controller = FileVersionController::open(temp_dir.path(), 10).unwrap();
        assert!(controller.curr_version() >= last_issued);
        assert!(controller.next_version().unwrap() > last_issued);
    }

    #[test]
    fn test_file_controller_advance_to() {
        let temp_dir = TempDir::new().unwrap();
        let controller = FileVersionController::open(temp_dir.path(), 10).unwrap();
        controller.advance_to(55).unwrap();
        assert_eq!(controller.curr_version(), 55);
        assert_eq!(controller.persisted_version(), 55);

        controller.advance_to(12).unwrap();
        assert_eq!(controller.curr_version(), 55);
    }

    #[test]
    fn test_default_advance_to_steps_forward() {
        struct Counting(AtomicU64);
        impl VersionController for Counting {
            fn next_version(&self) -> Result<u64> {
                Ok(self.0.fetch_add(1, Ordering::SeqCst) + 1)
            }
            fn curr_version(&self) -> u64 {
                self.0.load(Ordering::SeqCst)
            }
        }

        let controller = Counting(AtomicU64::new(0));
        controller.advance_to(4).unwrap();
        assert_eq!(controller.curr_version(), 4);
    }
}
