use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

/// Index paths that became multikey while a worker applied its ops. The
/// driver collects these per worker and flushes them to the catalog after
/// the batch, outside the workers' write paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultikeyPathInfo {
    pub ns: String,
    pub index_name: String,
    /// Per index field, the path components that went multikey.
    pub paths: Vec<Vec<u32>>,
}

/// Per-context collector. The storage engine reports multikey transitions
/// here while tracking is on; the worker drains the set on completion.
#[derive(Debug, Default)]
pub struct MultikeyPathTracker {
    tracking: AtomicBool,
    collected: Mutex<Vec<MultikeyPathInfo>>,
}

impl MultikeyPathTracker {
    pub fn is_tracking(&self) -> bool {
        self.tracking.load(Ordering::Acquire)
    }

    pub fn start_tracking(&self) -> MultikeyTrackingGuard<'_> {
        self.tracking.store(true, Ordering::Release);
        MultikeyTrackingGuard { tracker: self }
    }

    fn stop_tracking(&self) {
        self.tracking.store(false, Ordering::Release);
    }

    /// Dropped silently unless tracking is on, mirroring apply paths that
    /// run outside batch application.
    pub fn add_path_info(&self, info: MultikeyPathInfo) {
        if self.is_tracking() {
            self.collected.lock().push(info);
        }
    }

    pub fn take_collected(&self) -> Vec<MultikeyPathInfo> {
        std::mem::take(&mut *self.collected.lock())
    }
}

/// Stops tracking when dropped, on every exit path.
pub struct MultikeyTrackingGuard<'a> {
    tracker: &'a MultikeyPathTracker,
}

impl Drop for MultikeyTrackingGuard<'_> {
    fn drop(&mut self) {
        self.tracker.stop_tracking();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(ns: &str) -> MultikeyPathInfo {
        MultikeyPathInfo {
            ns: ns.into(),
            index_name: "a_1".into(),
            paths: vec![vec![0]],
        }
    }

    #[test]
    fn untracked_paths_are_dropped() {
        let tracker = MultikeyPathTracker::default();
        tracker.add_path_info(info("test.c"));
        assert!(tracker.take_collected().is_empty());
    }

    #[test]
    fn guard_scopes_tracking() {
        let tracker = MultikeyPathTracker::default();
        {
            let _guard = tracker.start_tracking();
            assert!(tracker.is_tracking());
            tracker.add_path_info(info("test.c"));
        }
        assert!(!tracker.is_tracking());
        let collected = tracker.take_collected();
        assert_eq!(collected.len(), 1);
        assert_eq!(collected[0].ns, "test.c");
        assert!(tracker.take_collected().is_empty(), "drain empties the set");
    }
}
