//! # Sync Engine State Machine
//!
//! | From    | To      | Trigger                                  |
//! |---------|---------|------------------------------------------|
//! | idle    | offline | connectivity lost                        |
//! | offline | idle    | connectivity restored                    |
//! | idle    | syncing | start, timer or manual trigger           |
//! | error   | syncing | retry                                    |
//! | syncing | idle    | drain finished without failures          |
//! | syncing | error   | drain finished with unresolved failures  |
//! | syncing | offline | drain stopped by a transient failure while offline |
//! | error   | offline | connectivity lost                        |
//!
//! Exactly one state holds at any instant. Moving to the current state is a
//! no-op, every move not listed above is rejected.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::{Result, SyncError};

/// Externally observed engine state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    #[default]
    Idle,
    Syncing,
    Offline,
    Error,
}

impl SyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncState::Idle => "idle",
            SyncState::Syncing => "syncing",
            SyncState::Offline => "offline",
            SyncState::Error => "error",
        }
    }

    /// Whether a drain may start from this state
    pub fn can_start_drain(&self) -> bool {
        matches!(self, SyncState::Idle | SyncState::Error)
    }

    pub fn can_transition_to(&self, to: SyncState) -> bool {
        matches!(
            (self, to),
            (SyncState::Idle, SyncState::Offline)
                | (SyncState::Idle, SyncState::Syncing)
                | (SyncState::Offline, SyncState::Idle)
                | (SyncState::Syncing, SyncState::Idle)
                | (SyncState::Syncing, SyncState::Error)
                | (SyncState::Syncing, SyncState::Offline)
                | (SyncState::Error, SyncState::Syncing)
                | (SyncState::Error, SyncState::Offline)
        )
    }

    pub fn validate_transition(&self, to: SyncState) -> Result<()> {
        if *self == to || self.can_transition_to(to) {
            return Ok(());
        }

        Err(SyncError::InvalidStateTransition {
            from: self.as_str().to_string(),
            to: to.as_str().to_string(),
            reason: format!("Cannot transition from {} to {}", self.as_str(), to.as_str()),
        })
    }
}

impl FromStr for SyncState {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "idle" => Ok(SyncState::Idle),
            "syncing" => Ok(SyncState::Syncing),
            "offline" => Ok(SyncState::Offline),
            "error" => Ok(SyncState::Error),
            _ => Err(SyncError::InvalidStatus(s.to_string())),
        }
    }
}

impl std::fmt::Display for SyncState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_transitions() {
        assert!(SyncState::Idle.validate_transition(SyncState::Syncing).is_ok());
        assert!(SyncState::Idle.validate_transition(SyncState::Offline).is_ok());
        assert!(SyncState::Offline.validate_transition(SyncState::Idle).is_ok());
        assert!(SyncState::Syncing.validate_transition(SyncState::Idle).is_ok());
        assert!(SyncState::Syncing.validate_transition(SyncState::Error).is_ok());
        assert!(SyncState::Error.validate_transition(SyncState::Syncing).is_ok());
    }

    #[test]
    fn test_same_state_is_noop() {
        assert!(SyncState::Offline.validate_transition(SyncState::Offline).is_ok());
    }

    #[test]
    fn test_invalid_transitions() {
        // Offline must pass through Idle before syncing
        let err = SyncState::Offline
            .validate_transition(SyncState::Syncing)
            .unwrap_err();
        assert!(matches!(err, SyncError::InvalidStateTransition { .. }));

        assert!(SyncState::Error.validate_transition(SyncState::Idle).is_err());
        assert!(SyncState::Idle.validate_transition(SyncState::Error).is_err());
    }

    #[test]
    fn test_drain_start_states() {
        assert!(SyncState::Idle.can_start_drain());
        assert!(SyncState::Error.can_start_drain());
        assert!(!SyncState::Offline.can_start_drain());
        assert!(!SyncState::Syncing.can_start_drain());
    }

    #[test]
    fn test_parse() {
        assert_eq!("error".parse::<SyncState>().unwrap(), SyncState::Error);
        assert!("paused".parse::<SyncState>().is_err());
    }
}
