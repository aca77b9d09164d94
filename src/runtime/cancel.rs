//! Cooperative cancellation flags

use crate::error::{ForgeResult, GraphForgeError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, Default)]
struct FlagInner {
    cancelled: AtomicBool,
    parent: Option<CancellationFlag>,
}

/// Shared cancellation flag.
///
/// Work checks the flag at its suspension points and never mid-write, so a
/// cancelled sibling always leaves its blocks in a consistent state. A child
/// flag reports cancellation when either it or any ancestor was cancelled;
/// cancelling a child does not affect the parent.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag {
    inner: Arc<FlagInner>,
}

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// A flag that is also cancelled by `self`
    pub fn child(&self) -> Self {
        CancellationFlag {
            inner: Arc::new(FlagInner {
                cancelled: AtomicBool::new(false),
                parent: Some(self.clone()),
            }),
        }
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        if self.inner.cancelled.load(Ordering::Acquire) {
            return true;
        }
        match &self.inner.parent {
            Some(parent) => parent.is_cancelled(),
            None => false,
        }
    }

    /// Guard that raises the flag when dropped, unless disarmed first
    pub fn drop_guard(&self) -> CancelOnDrop {
        CancelOnDrop {
            flag: Some(self.clone()),
        }
    }

    /// `Err(Cancelled)` once the flag is raised
    pub fn check(&self) -> ForgeResult<()> {
        if self.is_cancelled() {
            Err(GraphForgeError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Cancels its flag when dropped.
///
/// Held across an await so that a caller dropping the future stops every
/// sub-task still polling the flag.
#[derive(Debug)]
pub struct CancelOnDrop {
    flag: Option<CancellationFlag>,
}

impl CancelOnDrop {
    pub fn disarm(mut self) {
        self.flag = None;
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if let Some(flag) = self.flag.take() {
            flag.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_is_shared_between_clones() {
        let flag = CancellationFlag::new();
        let clone = flag.clone();
        assert!(flag.check().is_ok());
        clone.cancel();
        assert!(flag.is_cancelled());
        assert!(matches!(flag.check(), Err(GraphForgeError::Cancelled)));
    }

    #[test]
    fn test_parent_cancels_children() {
        let root = CancellationFlag::new();
        let child = root.child();
        let grandchild = child.child();
        root.cancel();
        assert!(child.is_cancelled());
        assert!(grandchild.is_cancelled());
    }

    #[test]
    fn test_child_does_not_cancel_parent() {
        let root = CancellationFlag::new();
        let child = root.child();
        let sibling = root.child();
        child.cancel();
        assert!(child.is_cancelled());
        assert!(!root.is_cancelled());
        assert!(!sibling.is_cancelled());
    }

    #[test]
    fn test_drop_guard_cancels_unless_disarmed() {
        let flag = CancellationFlag::new();
        flag.drop_guard().disarm();
        assert!(!flag.is_cancelled());

        let child = flag.child();
        {
            let _guard = flag.drop_guard();
            assert!(child.check().is_ok());
        }
        assert!(child.is_cancelled());
    }
}
