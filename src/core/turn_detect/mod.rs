//! Turn detection.
//!
//! Normalizes voice-activity signals (local energy frames, provider VAD
//! events, semantic end-of-turn verdicts, push-to-talk) into the abstract
//! events the session state machine consumes: `SpeechStarted`,
//! `SpeechStopped` and `TurnComplete`, plus `DetectionLost` /
//! `DetectionRestored` when the signal source drops.

mod config;
mod detector;

pub use config::{Eagerness, TurnDetectionPolicy};
pub use detector::{TurnCompleteReason, TurnDetector, TurnEvent, VadSource};
