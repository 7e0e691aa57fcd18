//! Audio playback tracking.
//!
//! The playback sink (a browser, a phone leg, a local speaker) renders audio
//! at its own pace, usually well behind what the provider has generated. The
//! tracker keeps, per output item, how many milliseconds were generated and
//! how many the sink reports as actually played, so that an interruption can
//! cut history at the point the user really heard.

use std::collections::HashMap;

use serde::Serialize;

/// Generated versus rendered audio for a single output item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlaybackPosition {
    pub item_id: String,
    pub total_generated_ms: u64,
    pub total_played_ms: u64,
    /// Whether the sink has reported progress for this item at least once.
    #[serde(skip)]
    pub reported: bool,
}

impl PlaybackPosition {
    fn new(item_id: impl Into<String>) -> Self {
        Self {
            item_id: item_id.into(),
            total_generated_ms: 0,
            total_played_ms: 0,
            reported: false,
        }
    }

    /// Milliseconds generated but not yet rendered.
    pub fn unplayed_ms(&self) -> u64 {
        self.total_generated_ms.saturating_sub(self.total_played_ms)
    }
}

/// Tracks playback progress for the output items of one session.
///
/// Only the most recently started item is "current"; positions of earlier
/// items are kept until [`PlaybackTracker::finish_item`] so that a late
/// callback from the sink can still be attributed correctly.
#[derive(Debug, Default)]
pub struct PlaybackTracker {
    positions: HashMap<String, PlaybackPosition>,
    current: Option<String>,
}

impl PlaybackTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a new output item. Any previous position recorded under
    /// the same id is reset.
    pub fn begin_item(&mut self, item_id: &str) {
        self.positions
            .insert(item_id.to_string(), PlaybackPosition::new(item_id));
        self.current = Some(item_id.to_string());
    }

    /// Move a tracked position to a new id (the provider assigned its own id
    /// to an item we opened locally).
    pub fn rename_item(&mut self, old_id: &str, new_id: &str) {
        if let Some(mut position) = self.positions.remove(old_id) {
            position.item_id = new_id.to_string();
            self.positions.insert(new_id.to_string(), position);
        }
        if self.current.as_deref() == Some(old_id) {
            self.current = Some(new_id.to_string());
        }
    }

    /// Record the total amount of audio generated so far for an item.
    pub fn on_generated(&mut self, item_id: &str, total_generated_ms: u64) {
        let position = self
            .positions
            .entry(item_id.to_string())
            .or_insert_with(|| PlaybackPosition::new(item_id));
        // generation only grows
        position.total_generated_ms = position.total_generated_ms.max(total_generated_ms);
    }

    /// Record a playback-progress callback from the sink.
    ///
    /// `ms_played` is the cumulative playback position of the item. Positions
    /// never move backwards and are clamped to what has been generated.
    /// Returns `false` when the item is not tracked.
    pub fn on_played(&mut self, item_id: &str, ms_played: u64) -> bool {
        let Some(position) = self.positions.get_mut(item_id) else {
            tracing::debug!(item_id, ms_played, "Playback report for untracked item");
            return false;
        };

        if ms_played > position.total_generated_ms {
            tracing::trace!(
                item_id,
                ms_played,
                generated = position.total_generated_ms,
                "Clamping playback report to generated audio"
            );
        }
        let clamped = ms_played.min(position.total_generated_ms);
        position.total_played_ms = position.total_played_ms.max(clamped);
        position.reported = true;
        true
    }

    pub fn position(&self, item_id: &str) -> Option<&PlaybackPosition> {
        self.positions.get(item_id)
    }

    pub fn current(&self) -> Option<&PlaybackPosition> {
        self.current
            .as_deref()
            .and_then(|id| self.positions.get(id))
    }

    /// Played milliseconds for an item, zero when untracked.
    pub fn played_ms(&self, item_id: &str) -> u64 {
        self.positions
            .get(item_id)
            .map(|p| p.total_played_ms)
            .unwrap_or(0)
    }

    /// Stop tracking an item and return its final position.
    pub fn finish_item(&mut self, item_id: &str) -> Option<PlaybackPosition> {
        if self.current.as_deref() == Some(item_id) {
            self.current = None;
        }
        self.positions.remove(item_id)
    }

    /// Number of tracked items.
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn clear(&mut self) {
        self.positions.clear();
        self.current = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_played_never_exceeds_generated() {
        let mut tracker = PlaybackTracker::new();
        tracker.begin_item("item_1");
        tracker.on_generated("item_1", 400);
        assert!(tracker.on_played("item_1", 900));

        let position = tracker.position("item_1").unwrap();
        assert_eq!(position.total_played_ms, 400);
        assert_eq!(position.unplayed_ms(), 0);
    }

    #[test]
    fn test_played_is_monotonic() {
        let mut tracker = PlaybackTracker::new();
        tracker.begin_item("item_1");
        tracker.on_generated("item_1", 2000);
        tracker.on_played("item_1", 800);
        tracker.on_played("item_1", 600);

        assert_eq!(tracker.played_ms("item_1"), 800);
    }

    #[test]
    fn test_begin_item_resets_position() {
        let mut tracker = PlaybackTracker::new();
        tracker.begin_item("item_1");
        tracker.on_generated("item_1", 1000);
        tracker.on_played("item_1", 1000);

        tracker.begin_item("item_2");
        let current = tracker.current().unwrap();
        assert_eq!(current.item_id, "item_2");
        assert_eq!(current.total_generated_ms, 0);
        assert_eq!(current.total_played_ms, 0);
        assert!(!current.reported);
    }

    #[test]
    fn test_untracked_item_is_ignored() {
        let mut tracker = PlaybackTracker::new();
        assert!(!tracker.on_played("missing", 100));
        assert_eq!(tracker.played_ms("missing"), 0);
    }

    #[test]
    fn test_rename_keeps_progress() {
        let mut tracker = PlaybackTracker::new();
        tracker.begin_item("local");
        tracker.on_generated("local", 300);
        tracker.on_played("local", 100);
        tracker.rename_item("local", "item_abc");

        assert!(tracker.position("local").is_none());
        assert_eq!(tracker.played_ms("item_abc"), 100);
        assert_eq!(tracker.current().unwrap().item_id, "item_abc");
    }

    #[test]
    fn test_finish_item_clears_current() {
        let mut tracker = PlaybackTracker::new();
        tracker.begin_item("item_1");
        let finished = tracker.finish_item("item_1").unwrap();
        assert_eq!(finished.item_id, "item_1");
        assert!(tracker.current().is_none());
    }

    #[test]
    fn test_unplayed_saturates_when_played_exceeds_generated() {
        let position = PlaybackPosition {
            item_id: "item_1".to_string(),
            total_generated_ms: 300,
            total_played_ms: 500,
            reported: true,
        };
        assert_eq!(position.unplayed_ms(), 0);
    }

    #[test]
    fn test_len_counts_tracked_items() {
        let mut tracker = PlaybackTracker::new();
        assert!(tracker.is_empty());
        tracker.begin_item("item_1");
        tracker.begin_item("item_2");
        assert_eq!(tracker.len(), 2);
        tracker.finish_item("item_1");
        assert_eq!(tracker.len(), 1);
    }
}
