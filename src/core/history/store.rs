use std::collections::HashSet;

use super::item::{ConversationItem, ItemKind, truncate_text_proportionally};
use super::{HistoryError, HistoryResult};

/// Result of a [`HistoryStore::truncate`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TruncateOutcome {
    /// Content was shortened to the cutoff.
    Truncated { previous_ms: u64, audio_end_ms: u64 },
    /// The cutoff was at or past the end of the content.
    Unchanged,
}

/// Ordered, append-mostly log of conversation items.
#[derive(Debug)]
pub struct HistoryStore {
    items: Vec<ConversationItem>,
    max_tokens: usize,
}

impl HistoryStore {
    pub fn new(max_tokens: usize) -> Self {
        Self {
            items: Vec::new(),
            max_tokens,
        }
    }

    /// Append an item, assigning an id when it has none.
    pub fn append(&mut self, mut item: ConversationItem) -> HistoryResult<String> {
        if item.id.is_empty() {
            item.id = format!("item_{}", uuid::Uuid::new_v4().simple());
        } else if self.contains(&item.id) {
            return Err(HistoryError::DuplicateItem(item.id));
        }
        let id = item.id.clone();
        self.items.push(item);
        Ok(id)
    }

    pub fn contains(&self, item_id: &str) -> bool {
        self.position(item_id).is_some()
    }

    pub fn get(&self, item_id: &str) -> Option<&ConversationItem> {
        self.items.iter().find(|item| item.id == item_id)
    }

    pub fn get_mut(&mut self, item_id: &str) -> Option<&mut ConversationItem> {
        self.items.iter_mut().find(|item| item.id == item_id)
    }

    pub fn items(&self) -> &[ConversationItem] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn max_tokens(&self) -> usize {
        self.max_tokens
    }

    /// Shrink an item's audio to `cutoff_ms`, cutting its transcript by the
    /// same proportion. Never grows content.
    pub fn truncate(&mut self, item_id: &str, cutoff_ms: u64) -> HistoryResult<TruncateOutcome> {
        let item = self
            .get_mut(item_id)
            .ok_or_else(|| HistoryError::ItemNotFound(item_id.to_string()))?;

        let Some(audio) = item.content.audio.as_mut() else {
            return Ok(TruncateOutcome::Unchanged);
        };
        let previous_ms = audio.duration_ms;
        if cutoff_ms >= previous_ms {
            return Ok(TruncateOutcome::Unchanged);
        }

        audio.truncate_to(cutoff_ms);
        if let Some(transcript) = item.content.transcript.as_mut() {
            *transcript = truncate_text_proportionally(transcript, cutoff_ms, previous_ms);
        }
        item.audio_end_ms = Some(cutoff_ms);

        Ok(TruncateOutcome::Truncated {
            previous_ms,
            audio_end_ms: cutoff_ms,
        })
    }

    /// Set the truncation marker without touching content.
    pub fn mark_truncated(&mut self, item_id: &str, audio_end_ms: u64) -> HistoryResult<()> {
        let item = self
            .get_mut(item_id)
            .ok_or_else(|| HistoryError::ItemNotFound(item_id.to_string()))?;
        let marker = item.audio_end_ms.map_or(audio_end_ms, |m| m.min(audio_end_ms));
        item.audio_end_ms = Some(marker);
        Ok(())
    }

    pub fn remove(&mut self, item_id: &str) -> HistoryResult<ConversationItem> {
        let index = self
            .position(item_id)
            .ok_or_else(|| HistoryError::ItemNotFound(item_id.to_string()))?;
        Ok(self.items.remove(index))
    }

    /// Give an item a new id, keeping its position.
    pub fn rename(&mut self, item_id: &str, new_id: &str) -> HistoryResult<()> {
        if self.contains(new_id) {
            return Err(HistoryError::DuplicateItem(new_id.to_string()));
        }
        let item = self
            .get_mut(item_id)
            .ok_or_else(|| HistoryError::ItemNotFound(item_id.to_string()))?;
        item.id = new_id.to_string();
        Ok(())
    }

    pub fn estimated_tokens(&self) -> usize {
        self.items.iter().map(ConversationItem::estimated_tokens).sum()
    }

    pub fn over_budget(&self) -> bool {
        self.estimated_tokens() > self.max_tokens
    }

    /// Drop the oldest items until the estimated size is within
    /// `retain_ratio * max_tokens`.
    ///
    /// The most recent function call and its output are never evicted. A
    /// call and its output are always evicted together so the remaining log
    /// never contains an orphaned half of a pair.
    pub fn evict_oldest(&mut self, retain_ratio: f32) -> Vec<ConversationItem> {
        let ratio = retain_ratio.clamp(0.0, 1.0) as f64;
        let target = (self.max_tokens as f64 * ratio).floor() as usize;
        let protected = self.protected_call_id();

        let mut evicted = Vec::new();
        let mut total = self.estimated_tokens();
        let mut index = 0;

        while total > target && index < self.items.len() {
            let item = &self.items[index];
            let call_id = item.call_id().map(str::to_string);
            if call_id.is_some() && call_id == protected {
                index += 1;
                continue;
            }

            let removed = self.items.remove(index);
            total = total.saturating_sub(removed.estimated_tokens());

            if let Some(call_id) = call_id {
                let mut j = index;
                while j < self.items.len() {
                    if self.items[j].call_id() == Some(call_id.as_str()) {
                        let partner = self.items.remove(j);
                        total = total.saturating_sub(partner.estimated_tokens());
                        evicted.push(partner);
                    } else {
                        j += 1;
                    }
                }
            }
            evicted.push(removed);
        }

        if !evicted.is_empty() {
            tracing::debug!(
                evicted = evicted.len(),
                remaining_tokens = total,
                target,
                "Evicted oldest history items"
            );
        }
        evicted
    }

    /// Call id of the most recent function call, if any.
    fn protected_call_id(&self) -> Option<String> {
        self.items.iter().rev().find_map(|item| match &item.kind {
            ItemKind::FunctionCall { call_id, .. } => Some(call_id.clone()),
            _ => None,
        })
    }

    /// Call ids that have a call item but no output yet.
    pub fn unresolved_calls(&self) -> Vec<String> {
        let answered: HashSet<&str> = self
            .items
            .iter()
            .filter_map(|item| match &item.kind {
                ItemKind::FunctionCallOutput { call_id, .. } => Some(call_id.as_str()),
                _ => None,
            })
            .collect();
        self.items
            .iter()
            .filter_map(|item| match &item.kind {
                ItemKind::FunctionCall { call_id, .. } if !answered.contains(call_id.as_str()) => {
                    Some(call_id.clone())
                }
                _ => None,
            })
            .collect()
    }

    fn position(&self, item_id: &str) -> Option<usize> {
        self.items.iter().position(|item| item.id == item_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::history::item::{AudioContent, ItemContent};

    fn audio_item(id: &str, ms: u64, transcript: &str) -> ConversationItem {
        let mut audio = AudioContent::new(24_000);
        audio.append(&vec![0u8; (ms * 48) as usize]);
        let content = ItemContent {
            transcript: Some(transcript.to_string()),
            audio: Some(audio),
            ..Default::default()
        };
        ConversationItem::assistant_message(content).with_id(id)
    }

    fn text_item(text: &str) -> ConversationItem {
        ConversationItem::user_message(ItemContent::text(text))
    }

    #[test]
    fn test_append_assigns_id() {
        let mut store = HistoryStore::new(1000);
        let id = store.append(text_item("hello")).unwrap();
        assert!(id.starts_with("item_"));
        assert_eq!(store.get(&id).unwrap().id, id);
    }

    #[test]
    fn test_append_rejects_duplicate_id() {
        let mut store = HistoryStore::new(1000);
        store.append(text_item("a").with_id("x")).unwrap();
        let err = store.append(text_item("b").with_id("x")).unwrap_err();
        assert!(matches!(err, HistoryError::DuplicateItem(id) if id == "x"));
    }

    #[test]
    fn test_truncate_shrinks_audio_and_transcript() {
        let mut store = HistoryStore::new(1000);
        store
            .append(audio_item("a1", 5000, "one two three four five six seven eight nine ten"))
            .unwrap();

        let outcome = store.truncate("a1", 1200).unwrap();
        assert_eq!(
            outcome,
            TruncateOutcome::Truncated {
                previous_ms: 5000,
                audio_end_ms: 1200
            }
        );

        let item = store.get("a1").unwrap();
        assert_eq!(item.audio_duration_ms(), 1200);
        assert_eq!(item.audio_end_ms, Some(1200));
        assert_eq!(item.content.transcript.as_deref(), Some("one two"));
    }

    #[test]
    fn test_truncate_past_end_is_noop() {
        let mut store = HistoryStore::new(1000);
        store.append(audio_item("a1", 1000, "hello")).unwrap();
        assert_eq!(
            store.truncate("a1", 1000).unwrap(),
            TruncateOutcome::Unchanged
        );
        assert_eq!(store.get("a1").unwrap().audio_end_ms, None);
    }

    #[test]
    fn test_truncate_missing_item() {
        let mut store = HistoryStore::new(1000);
        let err = store.truncate("nope", 10).unwrap_err();
        assert!(matches!(err, HistoryError::ItemNotFound(_)));
    }

    #[test]
    fn test_truncate_never_grows() {
        let mut store = HistoryStore::new(1000);
        store.append(audio_item("a1", 2000, "some words here")).unwrap();
        store.truncate("a1", 500).unwrap();
        assert_eq!(store.truncate("a1", 1500).unwrap(), TruncateOutcome::Unchanged);
        assert_eq!(store.get("a1").unwrap().audio_duration_ms(), 500);
    }

    #[test]
    fn test_evict_oldest_to_ratio() {
        // each item is 100 chars -> 25 tokens
        let mut store = HistoryStore::new(100);
        for _ in 0..6 {
            store.append(text_item(&"x".repeat(100))).unwrap();
        }
        assert_eq!(store.estimated_tokens(), 150);

        let evicted = store.evict_oldest(0.5);
        assert_eq!(evicted.len(), 4);
        assert_eq!(store.len(), 2);
        assert!(store.estimated_tokens() <= 50);
    }

    #[test]
    fn test_evict_protects_latest_call_pair() {
        let mut store = HistoryStore::new(10);
        store.append(text_item(&"x".repeat(40))).unwrap();
        store
            .append(ConversationItem::function_call("call_1", "get_weather", "{}").with_id("fc"))
            .unwrap();

        let evicted = store.evict_oldest(0.0);
        assert_eq!(evicted.len(), 1);
        assert!(store.contains("fc"));
        assert_eq!(store.unresolved_calls(), vec!["call_1".to_string()]);
    }

    #[test]
    fn test_evict_removes_pairs_together() {
        let mut store = HistoryStore::new(10);
        store
            .append(ConversationItem::function_call("call_old", "lookup", "{\"q\":\"a\"}"))
            .unwrap();
        store
            .append(ConversationItem::function_call_output("call_old", "{\"success\":true}"))
            .unwrap();
        store
            .append(ConversationItem::function_call("call_new", "lookup", "{}"))
            .unwrap();

        let evicted = store.evict_oldest(0.0);
        assert_eq!(evicted.len(), 2);
        assert!(evicted.iter().all(|i| i.call_id() == Some("call_old")));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_rename_and_remove() {
        let mut store = HistoryStore::new(100);
        store.append(text_item("a").with_id("local")).unwrap();
        store.rename("local", "item_remote").unwrap();
        assert!(!store.contains("local"));
        let removed = store.remove("item_remote").unwrap();
        assert_eq!(removed.id, "item_remote");
        assert!(store.is_empty());
    }
}
