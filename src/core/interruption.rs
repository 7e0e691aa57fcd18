//! Interruption (barge-in) coordination.
//!
//! Cancelling a response is not enough on its own: the provider's copy of
//! the conversation still holds everything it generated. The coordinator
//! cancels and then cuts the output item down to what the sink actually
//! played, in one step, so that the model never believes it said more than
//! the user heard.

use std::time::Duration;

use crate::core::history::{HistoryError, HistoryStore, TruncateOutcome};
use crate::core::playback::PlaybackTracker;
use crate::core::session::OutboundCommand;

/// Default wait for the transport to acknowledge a cancellation.
pub const DEFAULT_CANCEL_ACK_TIMEOUT: Duration = Duration::from_secs(2);

/// What happened to the interrupted output item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TruncationAction {
    /// Content cut at `audio_end_ms`.
    Truncated { item_id: String, audio_end_ms: u64 },
    /// Nothing was played; the item was removed.
    Discarded { item_id: String },
    /// There was no output item to reconcile.
    None,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterruptionOutcome {
    pub response_id: Option<String>,
    pub played_ms: u64,
    pub generated_ms: u64,
    pub action: TruncationAction,
}

#[derive(Debug, Clone)]
struct PendingAck {
    response_id: String,
    deadline_ms: u64,
}

#[derive(Debug)]
pub struct InterruptionCoordinator {
    ack_timeout_ms: u64,
    pending: Vec<PendingAck>,
}

impl InterruptionCoordinator {
    pub fn new(ack_timeout: Duration) -> Self {
        Self {
            ack_timeout_ms: ack_timeout.as_millis() as u64,
            pending: Vec::new(),
        }
    }

    /// Cancel `response_id` and reconcile `output_item` with playback.
    ///
    /// Commands are pushed to `commands` in wire order: cancel first, then
    /// truncate or delete.
    pub fn interrupt(
        &mut self,
        response_id: Option<&str>,
        output_item: Option<&str>,
        playback: &mut PlaybackTracker,
        history: &mut HistoryStore,
        now_ms: u64,
        commands: &mut Vec<OutboundCommand>,
    ) -> Result<InterruptionOutcome, HistoryError> {
        commands.push(OutboundCommand::CancelResponse {
            response_id: response_id.map(str::to_string),
        });
        if let Some(response_id) = response_id {
            self.pending.push(PendingAck {
                response_id: response_id.to_string(),
                deadline_ms: now_ms + self.ack_timeout_ms,
            });
        }

        let mut outcome = match output_item {
            Some(item_id) => self.reconcile(item_id, playback, history, commands)?,
            None => InterruptionOutcome {
                response_id: None,
                played_ms: 0,
                generated_ms: 0,
                action: TruncationAction::None,
            },
        };
        outcome.response_id = response_id.map(str::to_string);

        tracing::info!(
            response_id = ?outcome.response_id,
            played_ms = outcome.played_ms,
            generated_ms = outcome.generated_ms,
            action = ?outcome.action,
            "Response interrupted"
        );
        Ok(outcome)
    }

    /// Cut an item down to its played position without cancelling anything.
    /// Used when the response already finished but playback is still behind.
    pub fn reconcile(
        &mut self,
        item_id: &str,
        playback: &mut PlaybackTracker,
        history: &mut HistoryStore,
        commands: &mut Vec<OutboundCommand>,
    ) -> Result<InterruptionOutcome, HistoryError> {
        let position = playback.finish_item(item_id);
        let (played_ms, generated_ms) = position
            .map(|p| (p.total_played_ms, p.total_generated_ms))
            .unwrap_or((0, 0));

        let action = if !history.contains(item_id) {
            TruncationAction::None
        } else if played_ms == 0 {
            history.remove(item_id)?;
            commands.push(OutboundCommand::DeleteItem {
                item_id: item_id.to_string(),
            });
            TruncationAction::Discarded {
                item_id: item_id.to_string(),
            }
        } else {
            if history.truncate(item_id, played_ms)? == TruncateOutcome::Unchanged {
                history.mark_truncated(item_id, played_ms)?;
            }
            commands.push(OutboundCommand::TruncateItem {
                item_id: item_id.to_string(),
                content_index: 0,
                audio_end_ms: played_ms,
            });
            TruncationAction::Truncated {
                item_id: item_id.to_string(),
                audio_end_ms: played_ms,
            }
        };

        Ok(InterruptionOutcome {
            response_id: None,
            played_ms,
            generated_ms,
            action,
        })
    }

    /// The transport confirmed a cancelled response ended.
    pub fn acknowledge(&mut self, response_id: &str) -> bool {
        let before = self.pending.len();
        self.pending.retain(|p| p.response_id != response_id);
        before != self.pending.len()
    }

    pub fn is_awaiting_ack(&self, response_id: &str) -> bool {
        self.pending.iter().any(|p| p.response_id == response_id)
    }

    /// Response ids whose acknowledgement deadline passed. Each is reported
    /// once.
    pub fn poll(&mut self, now_ms: u64) -> Vec<String> {
        let mut expired = Vec::new();
        self.pending.retain(|p| {
            if now_ms >= p.deadline_ms {
                expired.push(p.response_id.clone());
                false
            } else {
                true
            }
        });
        for response_id in &expired {
            tracing::warn!(
                response_id = %response_id,
                timeout_ms = self.ack_timeout_ms,
                "CancellationTimeout: response cancellation was not acknowledged"
            );
        }
        expired
    }

    pub fn next_deadline(&self) -> Option<u64> {
        self.pending.iter().map(|p| p.deadline_ms).min()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}
