//! Turn detector state machine.
//!
//! Works on a millisecond session clock supplied by the caller, so it has no
//! timers of its own: callers feed signals and call [`TurnDetector::poll`] at
//! or after [`TurnDetector::next_deadline`].

use serde::{Deserialize, Serialize};

use super::config::TurnDetectionPolicy;

/// Where voice-activity signals come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum VadSource {
    /// Raw energy frames or onset/offset events; the detector applies the
    /// silence window and semantic timeout itself.
    #[default]
    Local,
    /// The provider's own VAD, whose `speech_stopped` already marks the end
    /// of the turn.
    Provider,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnCompleteReason {
    Silence,
    Semantic,
    Timeout,
    Provider,
    Manual,
}

/// Abstract turn events produced by the detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnEvent {
    SpeechStarted { audio_start_ms: u64 },
    SpeechStopped { audio_end_ms: u64 },
    TurnComplete {
        audio_end_ms: u64,
        reason: TurnCompleteReason,
    },
    DetectionLost,
    DetectionRestored,
}

#[derive(Debug)]
pub struct TurnDetector {
    policy: TurnDetectionPolicy,
    source: VadSource,
    detection_lost: bool,
    /// A `SpeechStarted` was emitted and no `TurnComplete` has matched it yet.
    turn_open: bool,
    speaking: bool,
    last_speech_ms: Option<u64>,
}

impl TurnDetector {
    pub fn new(policy: TurnDetectionPolicy, source: VadSource) -> Self {
        Self {
            policy,
            source,
            detection_lost: false,
            turn_open: false,
            speaking: false,
            last_speech_ms: None,
        }
    }

    pub fn policy(&self) -> &TurnDetectionPolicy {
        &self.policy
    }

    /// Replace the policy. Any open turn is dropped.
    pub fn set_policy(&mut self, policy: TurnDetectionPolicy) {
        tracing::debug!(policy = policy.name(), "Turn detection policy changed");
        self.policy = policy;
        self.reset();
    }

    /// Whether automatic detection is active: the policy is not manual and
    /// the signal source is connected.
    pub fn is_automatic(&self) -> bool {
        !self.detection_lost && !self.policy.is_manual()
    }

    pub fn is_detection_lost(&self) -> bool {
        self.detection_lost
    }

    pub fn is_turn_open(&self) -> bool {
        self.turn_open
    }

    /// Feed one frame of speech energy (0.0 - 1.0) ending at `at_ms`.
    /// Only meaningful under the energy policy.
    pub fn on_energy(&mut self, level: f32, at_ms: u64) -> Vec<TurnEvent> {
        let TurnDetectionPolicy::Energy {
            threshold,
            prefix_padding_ms,
            ..
        } = self.policy
        else {
            return Vec::new();
        };
        if self.detection_lost {
            return Vec::new();
        }

        let mut events = Vec::new();
        if level >= threshold {
            self.last_speech_ms = Some(at_ms);
            if !self.speaking {
                self.speaking = true;
                self.turn_open = true;
                events.push(TurnEvent::SpeechStarted {
                    audio_start_ms: at_ms.saturating_sub(prefix_padding_ms as u64),
                });
            }
        } else if self.speaking {
            self.speaking = false;
            events.push(TurnEvent::SpeechStopped {
                audio_end_ms: self.last_speech_ms.unwrap_or(at_ms),
            });
        }

        events.extend(self.poll(at_ms));
        events
    }

    /// Speech onset reported by the signal source. Emitted for every onset,
    /// even when a turn is already open.
    pub fn on_speech_started(&mut self, at_ms: u64) -> Option<TurnEvent> {
        if !self.is_automatic() {
            return None;
        }
        self.speaking = true;
        self.turn_open = true;
        self.last_speech_ms = Some(at_ms);
        Some(TurnEvent::SpeechStarted {
            audio_start_ms: at_ms,
        })
    }

    /// Speech offset reported by the signal source.
    pub fn on_speech_stopped(&mut self, at_ms: u64) -> Vec<TurnEvent> {
        if !self.is_automatic() || !self.turn_open {
            return Vec::new();
        }
        self.speaking = false;
        self.last_speech_ms = Some(at_ms);

        let mut events = vec![TurnEvent::SpeechStopped {
            audio_end_ms: at_ms,
        }];
        if self.source == VadSource::Provider {
            events.push(self.complete(at_ms, TurnCompleteReason::Provider));
        }
        events
    }

    /// Verdict of the semantic end-of-turn classifier.
    pub fn on_semantic_verdict(&mut self, complete: bool, at_ms: u64) -> Option<TurnEvent> {
        if !matches!(self.policy, TurnDetectionPolicy::Semantic { .. })
            || self.detection_lost
            || !self.turn_open
            || self.speaking
            || !complete
        {
            return None;
        }
        let end = self.last_speech_ms.unwrap_or(at_ms);
        Some(self.complete(end, TurnCompleteReason::Semantic))
    }

    /// Application-signalled start of a turn (push-to-talk).
    pub fn begin_manual_turn(&mut self, at_ms: u64) -> TurnEvent {
        self.turn_open = true;
        self.speaking = true;
        self.last_speech_ms = Some(at_ms);
        TurnEvent::SpeechStarted {
            audio_start_ms: at_ms,
        }
    }

    /// Application-signalled end of the open turn.
    pub fn force_complete(&mut self, at_ms: u64) -> Option<TurnEvent> {
        if !self.turn_open {
            return None;
        }
        Some(self.complete(at_ms, TurnCompleteReason::Manual))
    }

    /// Check the silence window or semantic timeout against `now_ms`.
    pub fn poll(&mut self, now_ms: u64) -> Option<TurnEvent> {
        let deadline = self.next_deadline()?;
        if now_ms < deadline {
            return None;
        }
        let end = self.last_speech_ms.unwrap_or(now_ms);
        let reason = match self.policy {
            TurnDetectionPolicy::Semantic { .. } => TurnCompleteReason::Timeout,
            _ => TurnCompleteReason::Silence,
        };
        Some(self.complete(end, reason))
    }

    /// Session time at which [`TurnDetector::poll`] would complete the turn.
    pub fn next_deadline(&self) -> Option<u64> {
        if !self.is_automatic() || !self.turn_open || self.speaking {
            return None;
        }
        let last = self.last_speech_ms?;
        match &self.policy {
            TurnDetectionPolicy::Energy {
                silence_duration_ms,
                ..
            } if self.source == VadSource::Local => Some(last + *silence_duration_ms as u64),
            TurnDetectionPolicy::Semantic { eagerness } => Some(last + eagerness.max_wait_ms()),
            _ => None,
        }
    }

    /// The signal source went away. Detection falls back to manual until
    /// [`TurnDetector::signal_restored`].
    pub fn signal_lost(&mut self) -> Option<TurnEvent> {
        if self.detection_lost {
            return None;
        }
        tracing::warn!(policy = self.policy.name(), "Turn detection signal lost");
        self.detection_lost = true;
        self.reset();
        Some(TurnEvent::DetectionLost)
    }

    pub fn signal_restored(&mut self) -> Option<TurnEvent> {
        if !self.detection_lost {
            return None;
        }
        tracing::info!(policy = self.policy.name(), "Turn detection signal restored");
        self.detection_lost = false;
        Some(TurnEvent::DetectionRestored)
    }

    /// Drop any open turn.
    pub fn reset(&mut self) {
        self.turn_open = false;
        self.speaking = false;
        self.last_speech_ms = None;
    }

    fn complete(&mut self, audio_end_ms: u64, reason: TurnCompleteReason) -> TurnEvent {
        self.reset();
        TurnEvent::TurnComplete {
            audio_end_ms,
            reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::turn_detect::Eagerness;

    fn energy(silence_duration_ms: u32) -> TurnDetector {
        TurnDetector::new(
            TurnDetectionPolicy::Energy {
                threshold: 0.5,
                prefix_padding_ms: 300,
                silence_duration_ms,
            },
            VadSource::Local,
        )
    }

    fn is_complete(event: &TurnEvent) -> bool {
        matches!(event, TurnEvent::TurnComplete { .. })
    }

    #[test]
    fn test_energy_turn_completes_after_silence_window() {
        let mut detector = energy(500);
        let mut started = 0;

        // 1.2s of speech in 20ms frames (timestamps mark frame end)
        for at in (20..=1200).step_by(20) {
            let events = detector.on_energy(0.8, at);
            started += events
                .iter()
                .filter(|e| matches!(e, TurnEvent::SpeechStarted { .. }))
                .count();
        }
        assert_eq!(started, 1);

        let mut completed_at = None;
        for at in (1220..=2000).step_by(20) {
            let events = detector.on_energy(0.1, at);
            if events.iter().any(is_complete) {
                completed_at = Some(at);
                break;
            }
        }
        assert_eq!(completed_at, Some(1700));
    }

    #[test]
    fn test_energy_speech_resumes_within_window() {
        let mut detector = energy(500);
        detector.on_energy(0.9, 100);
        detector.on_energy(0.1, 300);
        assert_eq!(detector.next_deadline(), Some(600));

        let events = detector.on_energy(0.9, 500);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], TurnEvent::SpeechStarted { .. }));
        assert_eq!(detector.poll(700), None);

        detector.on_energy(0.0, 520);
        assert!(detector.poll(999).is_none());
        assert!(matches!(
            detector.poll(1000),
            Some(TurnEvent::TurnComplete {
                audio_end_ms: 500,
                reason: TurnCompleteReason::Silence
            })
        ));
    }

    #[test]
    fn test_speech_started_prefix_padding() {
        let mut detector = energy(500);
        let events = detector.on_energy(0.9, 1000);
        assert_eq!(
            events,
            vec![TurnEvent::SpeechStarted {
                audio_start_ms: 700
            }]
        );
    }

    #[test]
    fn test_no_turn_complete_without_speech_started() {
        let mut detector = energy(500);
        for at in (0..5000).step_by(20) {
            assert!(detector.on_energy(0.0, at).is_empty());
        }
        assert!(detector.force_complete(5000).is_none());
        assert!(detector.on_speech_stopped(5000).is_empty());
    }

    #[test]
    fn test_semantic_timeout_is_hard_cutoff() {
        let mut detector = TurnDetector::new(
            TurnDetectionPolicy::semantic(Eagerness::High),
            VadSource::Local,
        );
        detector.on_speech_started(0);
        detector.on_speech_stopped(1000);
        assert_eq!(detector.next_deadline(), Some(3000));
        assert!(detector.poll(2999).is_none());
        assert!(matches!(
            detector.poll(3000),
            Some(TurnEvent::TurnComplete {
                reason: TurnCompleteReason::Timeout,
                ..
            })
        ));
    }

    #[test]
    fn test_semantic_verdict_completes_early() {
        let mut detector = TurnDetector::new(
            TurnDetectionPolicy::semantic(Eagerness::Low),
            VadSource::Local,
        );
        detector.on_speech_started(0);
        // still speaking: verdict ignored
        assert!(detector.on_semantic_verdict(true, 500).is_none());
        detector.on_speech_stopped(800);
        assert!(detector.on_semantic_verdict(false, 900).is_none());
        assert!(matches!(
            detector.on_semantic_verdict(true, 1000),
            Some(TurnEvent::TurnComplete {
                audio_end_ms: 800,
                reason: TurnCompleteReason::Semantic
            })
        ));
        assert!(!detector.is_turn_open());
    }

    #[test]
    fn test_provider_source_completes_on_speech_stopped() {
        let mut detector = TurnDetector::new(TurnDetectionPolicy::default(), VadSource::Provider);
        detector.on_speech_started(100);
        let events = detector.on_speech_stopped(900);
        assert_eq!(events.len(), 2);
        assert!(is_complete(&events[1]));
        assert_eq!(detector.next_deadline(), None);
    }

    #[test]
    fn test_manual_policy_ignores_automatic_signals() {
        let mut detector = TurnDetector::new(TurnDetectionPolicy::Manual, VadSource::Local);
        assert!(detector.on_energy(1.0, 100).is_empty());
        assert!(detector.on_speech_started(100).is_none());

        detector.begin_manual_turn(200);
        assert!(detector.poll(100_000).is_none());
        assert!(matches!(
            detector.force_complete(1500),
            Some(TurnEvent::TurnComplete {
                reason: TurnCompleteReason::Manual,
                ..
            })
        ));
    }

    #[test]
    fn test_detection_lost_falls_back_to_manual() {
        let mut detector = energy(500);
        detector.on_energy(0.9, 100);
        assert_eq!(detector.signal_lost(), Some(TurnEvent::DetectionLost));
        assert_eq!(detector.signal_lost(), None);
        assert!(!detector.is_turn_open());
        assert!(!detector.is_automatic());
        assert!(detector.on_energy(0.9, 200).is_empty());

        assert_eq!(
            detector.signal_restored(),
            Some(TurnEvent::DetectionRestored)
        );
        assert_eq!(detector.on_energy(0.9, 300).len(), 1);
    }
}
