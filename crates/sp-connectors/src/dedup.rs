//! Deduplication against the previous fetch window.
//!
//! A collector stores the newest timestamp it delivered together with the ids
//! that carry that timestamp. The next cycle asks the vendor for everything from
//! that timestamp onwards (inclusive), so records at the boundary come back and
//! must be dropped by id.

use std::collections::HashSet;

/// Progress of one event type: the newest timestamp delivered and the ids at it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint<T> {
    pub timestamp: Option<T>,
    pub ids: Vec<String>,
}

impl<T> Default for Checkpoint<T> {
    fn default() -> Self {
        Self {
            timestamp: None,
            ids: Vec::new(),
        }
    }
}

impl<T> Checkpoint<T> {
    pub fn new(timestamp: Option<T>, ids: Vec<String>) -> Self {
        Self { timestamp, ids }
    }
}

impl<T: Ord> Checkpoint<T> {
    /// Moves to `newest` unless it is older; equal timestamps merge their ids.
    pub fn advance(self, newest: Checkpoint<T>) -> Checkpoint<T> {
        let Some(max) = newest.timestamp else {
            return self;
        };
        match &self.timestamp {
            Some(prev) if max < *prev => self,
            Some(prev) if max == *prev => {
                let mut ids = self.ids;
                for id in newest.ids {
                    if !ids.contains(&id) {
                        ids.push(id);
                    }
                }
                Checkpoint::new(Some(max), ids)
            }
            _ => Checkpoint::new(Some(max), newest.ids),
        }
    }
}

/// Filter for records returned by an inclusive re-fetch.
#[derive(Debug, Clone)]
pub struct DedupWindow<T> {
    pub seen_ids: HashSet<String>,
    pub lower_bound: Option<T>,
}

impl<T: Ord> DedupWindow<T> {
    pub fn new(seen_ids: impl IntoIterator<Item = String>, lower_bound: Option<T>) -> Self {
        Self {
            seen_ids: seen_ids.into_iter().collect(),
            lower_bound,
        }
    }

    pub fn from_checkpoint(checkpoint: &Checkpoint<T>) -> Self
    where
        T: Clone,
    {
        Self::new(checkpoint.ids.iter().cloned(), checkpoint.timestamp.clone())
    }

    /// A record is new when its id was not delivered or it is newer than the bound.
    ///
    /// A record without a usable timestamp is judged by id alone.
    pub fn is_new(&self, id: &str, timestamp: Option<&T>) -> bool {
        if !self.seen_ids.contains(id) {
            return true;
        }
        match (timestamp, &self.lower_bound) {
            (Some(ts), Some(bound)) => ts > bound,
            _ => false,
        }
    }

    /// Keeps the new records, in order.
    pub fn filter<R, I, F>(&self, records: Vec<R>, id_fn: I, ts_fn: F) -> Vec<R>
    where
        I: Fn(&R) -> String,
        F: Fn(&R) -> Option<T>,
    {
        records
            .into_iter()
            .filter(|record| self.is_new(&id_fn(record), ts_fn(record).as_ref()))
            .collect()
    }

    /// Records an id as delivered so later pages of the same cycle skip it.
    pub fn mark_seen(&mut self, id: String) {
        self.seen_ids.insert(id);
    }
}

/// Tracks the newest timestamp seen in a cycle and the ids that share it.
#[derive(Debug, Clone)]
pub struct CheckpointTracker<T> {
    max: Option<T>,
    ids: Vec<String>,
}

impl<T> Default for CheckpointTracker<T> {
    fn default() -> Self {
        Self {
            max: None,
            ids: Vec::new(),
        }
    }
}

impl<T: Ord + Clone> CheckpointTracker<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, id: &str, timestamp: T) {
        match &self.max {
            Some(max) if timestamp < *max => {}
            Some(max) if timestamp == *max => {
                if !self.ids.iter().any(|seen| seen == id) {
                    self.ids.push(id.to_string());
                }
            }
            _ => {
                self.max = Some(timestamp);
                self.ids = vec![id.to_string()];
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.max.is_none()
    }

    /// The checkpoint to store after this cycle.
    ///
    /// Keeps `previous` when nothing newer was observed and merges ids when the
    /// newest timestamp equals the previous one.
    pub fn finish(self, previous: Checkpoint<T>) -> Checkpoint<T> {
        previous.advance(Checkpoint::new(self.max, self.ids))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_is_new() {
        let window = DedupWindow::new(ids(&["a", "b"]), Some(10));
        assert!(window.is_new("c", Some(&5)));
        assert!(!window.is_new("a", Some(&10)));
        assert!(!window.is_new("a", Some(&9)));
        assert!(window.is_new("a", Some(&11)));
        assert!(!window.is_new("b", None));
    }

    #[test]
    fn test_filter_preserves_order() {
        let window = DedupWindow::new(ids(&["2"]), Some(100));
        let records = vec![("1", 100), ("2", 100), ("3", 101), ("2", 101)];
        let kept = window.filter(records, |r| r.0.to_string(), |r| Some(r.1));
        assert_eq!(kept, vec![("1", 100), ("3", 101), ("2", 101)]);
    }

    #[test]
    fn test_empty_window_keeps_everything() {
        let window: DedupWindow<i64> = DedupWindow::new(Vec::new(), None);
        assert!(window.is_new("x", Some(&0)));
        assert!(window.is_new("x", None));
    }

    #[test]
    fn test_tracker_advances_to_max() {
        let mut tracker = CheckpointTracker::new();
        tracker.observe("a", 5);
        tracker.observe("b", 7);
        tracker.observe("c", 7);
        tracker.observe("d", 6);
        let next = tracker.finish(Checkpoint::new(Some(3), ids(&["z"])));
        assert_eq!(next, Checkpoint::new(Some(7), ids(&["b", "c"])));
    }

    #[test]
    fn test_tracker_keeps_previous_when_empty() {
        let tracker: CheckpointTracker<i64> = CheckpointTracker::new();
        let previous = Checkpoint::new(Some(3), ids(&["z"]));
        assert_eq!(tracker.finish(previous.clone()), previous);
    }

    #[test]
    fn test_tracker_merges_at_same_bound() {
        let mut tracker = CheckpointTracker::new();
        tracker.observe("b", 3);
        let next = tracker.finish(Checkpoint::new(Some(3), ids(&["a"])));
        assert_eq!(next, Checkpoint::new(Some(3), ids(&["a", "b"])));
    }

    #[test]
    fn test_tracker_never_moves_backwards() {
        let mut tracker = CheckpointTracker::new();
        tracker.observe("old", 1);
        let previous = Checkpoint::new(Some(3), ids(&["a"]));
        assert_eq!(tracker.finish(previous.clone()), previous);
    }
}
