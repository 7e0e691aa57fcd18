//! Turn detection policy types

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// How eagerly semantic detection ends a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Eagerness {
    Low,
    #[default]
    Medium,
    High,
    Auto,
}

impl Eagerness {
    /// Maximum wait after speech stops before the turn is forced complete.
    pub fn max_wait_ms(&self) -> u64 {
        match self {
            Eagerness::Low => 8_000,
            Eagerness::Medium | Eagerness::Auto => 4_000,
            Eagerness::High => 2_000,
        }
    }
}

impl std::fmt::Display for Eagerness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Eagerness::Low => write!(f, "low"),
            Eagerness::Medium => write!(f, "medium"),
            Eagerness::High => write!(f, "high"),
            Eagerness::Auto => write!(f, "auto"),
        }
    }
}

impl FromStr for Eagerness {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "low" => Ok(Eagerness::Low),
            "medium" => Ok(Eagerness::Medium),
            "high" => Ok(Eagerness::High),
            "auto" => Ok(Eagerness::Auto),
            other => Err(format!("unknown eagerness '{other}'")),
        }
    }
}

fn default_threshold() -> f32 {
    0.5
}

fn default_prefix_padding_ms() -> u32 {
    300
}

fn default_silence_duration_ms() -> u32 {
    500
}

/// Turn detection policy of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnDetectionPolicy {
    /// Energy threshold detection.
    #[serde(rename = "server_vad", alias = "energy")]
    Energy {
        /// Speech energy threshold (0.0 - 1.0)
        #[serde(default = "default_threshold")]
        threshold: f32,
        /// Audio retained before the detected onset (ms)
        #[serde(default = "default_prefix_padding_ms")]
        prefix_padding_ms: u32,
        /// Trailing silence required before the turn completes (ms)
        #[serde(default = "default_silence_duration_ms")]
        silence_duration_ms: u32,
    },
    /// Completion judged by a semantic classifier, bounded by an
    /// eagerness-dependent timeout.
    #[serde(rename = "semantic_vad", alias = "semantic")]
    Semantic {
        #[serde(default)]
        eagerness: Eagerness,
    },
    /// The application signals turn boundaries (push-to-talk).
    Manual,
}

impl Default for TurnDetectionPolicy {
    fn default() -> Self {
        TurnDetectionPolicy::Energy {
            threshold: default_threshold(),
            prefix_padding_ms: default_prefix_padding_ms(),
            silence_duration_ms: default_silence_duration_ms(),
        }
    }
}

impl TurnDetectionPolicy {
    pub fn semantic(eagerness: Eagerness) -> Self {
        TurnDetectionPolicy::Semantic { eagerness }
    }

    /// Energy policy tuned for fast turn-taking
    pub fn low_latency() -> Self {
        TurnDetectionPolicy::Energy {
            threshold: 0.5,
            prefix_padding_ms: 200,
            silence_duration_ms: 300,
        }
    }

    /// Energy policy tolerant of long pauses and background noise
    pub fn high_accuracy() -> Self {
        TurnDetectionPolicy::Energy {
            threshold: 0.7,
            prefix_padding_ms: 300,
            silence_duration_ms: 800,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            TurnDetectionPolicy::Energy { .. } => "server_vad",
            TurnDetectionPolicy::Semantic { .. } => "semantic_vad",
            TurnDetectionPolicy::Manual => "manual",
        }
    }

    pub fn is_manual(&self) -> bool {
        matches!(self, TurnDetectionPolicy::Manual)
    }

    /// Validate the policy parameters
    pub fn validate(&self) -> Result<()> {
        if let TurnDetectionPolicy::Energy {
            threshold,
            silence_duration_ms,
            ..
        } = self
        {
            if !(0.0..=1.0).contains(threshold) {
                anyhow::bail!("Turn detection threshold must be between 0.0 and 1.0");
            }
            if *silence_duration_ms == 0 {
                anyhow::bail!("Turn detection silence_duration_ms must be greater than 0");
            }
        }
        Ok(())
    }
}

/// Parses the `TURN_DETECTION` environment form:
/// `server_vad`, `semantic_vad`, `semantic_vad:<eagerness>` or `manual`.
impl FromStr for TurnDetectionPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value = s.trim().to_lowercase();
        let (mode, arg) = match value.split_once(':') {
            Some((mode, arg)) => (mode, Some(arg)),
            None => (value.as_str(), None),
        };
        match mode {
            "server_vad" | "energy" => Ok(TurnDetectionPolicy::default()),
            "semantic_vad" | "semantic" => {
                let eagerness = arg.map(Eagerness::from_str).transpose()?.unwrap_or_default();
                Ok(TurnDetectionPolicy::Semantic { eagerness })
            }
            "manual" | "none" => Ok(TurnDetectionPolicy::Manual),
            other => Err(format!("unknown turn detection mode '{other}'")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_eagerness_timeouts() {
        assert_eq!(Eagerness::Low.max_wait_ms(), 8000);
        assert_eq!(Eagerness::Medium.max_wait_ms(), 4000);
        assert_eq!(Eagerness::Auto.max_wait_ms(), 4000);
        assert_eq!(Eagerness::High.max_wait_ms(), 2000);
    }

    #[test]
    fn test_policy_yaml_defaults() {
        let policy: TurnDetectionPolicy =
            serde_yaml::from_str("type: server_vad\nsilence_duration_ms: 700\n").unwrap();
        assert_eq!(
            policy,
            TurnDetectionPolicy::Energy {
                threshold: 0.5,
                prefix_padding_ms: 300,
                silence_duration_ms: 700
            }
        );

        let policy: TurnDetectionPolicy = serde_yaml::from_str("type: semantic_vad\n").unwrap();
        assert_eq!(policy, TurnDetectionPolicy::semantic(Eagerness::Medium));

        let policy: TurnDetectionPolicy = serde_yaml::from_str("type: manual\n").unwrap();
        assert!(policy.is_manual());
    }

    #[test]
    fn test_policy_from_str() {
        assert_eq!(
            "semantic_vad:high".parse::<TurnDetectionPolicy>().unwrap(),
            TurnDetectionPolicy::semantic(Eagerness::High)
        );
        assert_eq!(
            "server_vad".parse::<TurnDetectionPolicy>().unwrap(),
            TurnDetectionPolicy::default()
        );
        assert!("manual".parse::<TurnDetectionPolicy>().unwrap().is_manual());
        assert!("loud".parse::<TurnDetectionPolicy>().is_err());
        assert!("semantic_vad:eager".parse::<TurnDetectionPolicy>().is_err());
    }

    #[test]
    fn test_validate_threshold() {
        let policy = TurnDetectionPolicy::Energy {
            threshold: 1.5,
            prefix_padding_ms: 300,
            silence_duration_ms: 500,
        };
        assert!(policy.validate().is_err());
        assert!(TurnDetectionPolicy::high_accuracy().validate().is_ok());
        assert!(TurnDetectionPolicy::low_latency().validate().is_ok());
    }
}
