//! Download status state machine.

use serde::{Deserialize, Serialize};

use crate::Error;

/// Status of a download record.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Default,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DownloadStatus {
    /// Admitted and waiting for dispatch.
    #[default]
    Idle,
    /// The child process is being set up.
    Preparing,
    /// Bytes are flowing.
    Downloading,
    /// The download completed successfully.
    Finished,
    /// The download failed.
    Error,
    /// The download was cancelled by a caller or the staleness reaper.
    #[strum(to_string = "cancelled", serialize = "canceled")]
    Cancelled,
    /// A condition rule or the child decided the item should not be downloaded.
    Skip,
    /// A live stream or premiere that has not started yet.
    NotLive,
}

impl DownloadStatus {
    /// All statuses, in state machine order.
    pub const ALL: [DownloadStatus; 8] = [
        Self::Idle,
        Self::Preparing,
        Self::Downloading,
        Self::Finished,
        Self::Error,
        Self::Cancelled,
        Self::Skip,
        Self::NotLive,
    ];

    /// Storage representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Preparing => "preparing",
            Self::Downloading => "downloading",
            Self::Finished => "finished",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
            Self::Skip => "skip",
            Self::NotLive => "not_live",
        }
    }

    /// Terminal statuses have no further automatic transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Finished | Self::Error | Self::Cancelled | Self::Skip | Self::NotLive
        )
    }

    /// Whether a process is (or may be) attached to a record in this status.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Preparing | Self::Downloading)
    }

    /// Validate a state transition.
    ///
    /// The forward path is `idle -> preparing -> downloading`; any non-terminal status may
    /// end in a terminal one. Re-entering the current status is allowed so repeated progress
    /// messages are not treated as transitions.
    pub fn can_transition_to(&self, target: DownloadStatus) -> bool {
        use DownloadStatus::*;

        if *self == target {
            return !self.is_terminal();
        }

        match self {
            Idle => matches!(target, Preparing) || target.is_terminal(),
            Preparing => matches!(target, Downloading) || target.is_terminal(),
            Downloading => target.is_terminal(),
            Finished | Error | Cancelled | Skip | NotLive => false,
        }
    }

    /// Transition to `target`, failing if the state machine forbids it.
    pub fn transition(&mut self, target: DownloadStatus) -> crate::Result<()> {
        if !self.can_transition_to(target) {
            return Err(Error::InvalidStateTransition {
                from: self.to_string(),
                to: target.to_string(),
            });
        }
        *self = target;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_roundtrip_strings() {
        for status in DownloadStatus::ALL {
            assert_eq!(status.to_string(), status.as_str());
            assert_eq!(DownloadStatus::from_str(status.as_str()).ok(), Some(status));
        }
        assert_eq!(
            DownloadStatus::from_str("canceled").ok(),
            Some(DownloadStatus::Cancelled)
        );
        assert!(DownloadStatus::from_str("bogus").is_err());
    }

    #[test]
    fn test_forward_path() {
        let mut status = DownloadStatus::Idle;
        status.transition(DownloadStatus::Preparing).unwrap();
        status.transition(DownloadStatus::Downloading).unwrap();
        status.transition(DownloadStatus::Downloading).unwrap();
        status.transition(DownloadStatus::Finished).unwrap();
        assert!(status.is_terminal());
    }

    #[test]
    fn test_no_skipping_or_leaving_terminal() {
        assert!(!DownloadStatus::Idle.can_transition_to(DownloadStatus::Downloading));
        assert!(!DownloadStatus::Downloading.can_transition_to(DownloadStatus::Preparing));
        assert!(DownloadStatus::Idle.can_transition_to(DownloadStatus::Cancelled));

        for terminal in DownloadStatus::ALL.iter().filter(|s| s.is_terminal()) {
            for target in DownloadStatus::ALL {
                assert!(!terminal.can_transition_to(target));
            }
        }

        let mut status = DownloadStatus::Finished;
        let err = status.transition(DownloadStatus::Error).unwrap_err();
        assert!(matches!(err, Error::InvalidStateTransition { .. }));
        assert_eq!(status, DownloadStatus::Finished);
    }

    #[test]
    fn test_serde_representation() {
        let json = serde_json::to_string(&DownloadStatus::NotLive).unwrap();
        assert_eq!(json, "\"not_live\"");
        let parsed: DownloadStatus = serde_json::from_str("\"cancelled\"").unwrap();
        assert_eq!(parsed, DownloadStatus::Cancelled);
    }
}
