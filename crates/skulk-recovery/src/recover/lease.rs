//! Scoped ownership of caller-provided scratch buffers.

use crate::error::Result;
use crate::wal::BufferSet;
use tracing::{debug, warn};

type ReleaseFn<'r> = Box<dyn FnOnce(BufferSet) -> Result<()> + 'r>;

/// Buffers obtained from an acquire callback, returned through the paired
/// release callback exactly once.
///
/// Release happens on drop, so every exit path of the holder returns the
/// buffers. A failing release is logged and otherwise ignored.
pub struct BufferLease<'r> {
    buffers: Option<BufferSet>,
    release: Option<ReleaseFn<'r>>,
}

impl<'r> BufferLease<'r> {
    /// Calls `acquire` and keeps its buffers until the lease ends.
    pub fn acquire<A, R>(acquire: A, release: R) -> Self
    where
        A: FnOnce() -> BufferSet,
        R: FnOnce(BufferSet) -> Result<()> + 'r,
    {
        let buffers = acquire();
        debug!(
            "Acquired {} scratch buffers ({} bytes)",
            buffers.len(),
            buffers.capacity_bytes()
        );
        Self {
            buffers: Some(buffers),
            release: Some(Box::new(release)),
        }
    }

    /// Returns the leased buffers.
    pub fn buffers_mut(&mut self) -> &mut BufferSet {
        self.buffers.get_or_insert_with(BufferSet::default)
    }

    /// Ends the lease now, returning the release callback's result.
    pub fn release(mut self) -> Result<()> {
        self.release_inner()
    }

    fn release_inner(&mut self) -> Result<()> {
        match (self.buffers.take(), self.release.take()) {
            (Some(buffers), Some(release)) => release(buffers),
            _ => Ok(()),
        }
    }
}

impl Drop for BufferLease<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.release_inner() {
            warn!("Failed to release scratch buffers: {:?}", e);
        }
    }
}

impl std::fmt::Debug for BufferLease<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferLease")
            .field("buffers", &self.buffers)
            .field("released", &self.release.is_none())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TsFileError;
    use std::cell::Cell;

    #[test]
    fn test_released_on_drop() {
        let released = Cell::new(0);
        {
            let mut lease = BufferLease::acquire(
                || BufferSet::with_capacity(2, 8),
                |buffers| {
                    assert_eq!(buffers.len(), 2);
                    released.set(released.get() + 1);
                    Ok(())
                },
            );
            lease.buffers_mut().primary().push(1);
        }
        assert_eq!(released.get(), 1);
    }

    #[test]
    fn test_explicit_release_runs_once() {
        let released = Cell::new(0);
        let lease = BufferLease::acquire(BufferSet::default, |_| {
            released.set(released.get() + 1);
            Ok(())
        });
        lease.release().unwrap();
        assert_eq!(released.get(), 1);
    }

    #[test]
    fn test_release_failure_is_swallowed_on_drop() {
        let released = Cell::new(0);
        {
            let _lease = BufferLease::acquire(BufferSet::default, |_| {
                released.set(released.get() + 1);
                Err(TsFileError::Corrupted("unmap failed".to_string()))
            });
        }
        assert_eq!(released.get(), 1);
    }

    #[test]
    fn test_released_when_unwinding_through_error() {
        fn fallible(released: &Cell<usize>) -> Result<()> {
            let _lease = BufferLease::acquire(BufferSet::default, |_| {
                released.set(released.get() + 1);
                Ok(())
            });
            Err(TsFileError::Corrupted("replay failed".to_string()))
        }

        let released = Cell::new(0);
        assert!(fallible(&released).is_err());
        assert_eq!(released.get(), 1);
    }
}
