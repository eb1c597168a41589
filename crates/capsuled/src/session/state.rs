//! Persistent session state record.
//!
//! The state file is the canonical protobuf encoding of [`SessionState`],
//! written with explicit field tags so the schema can evolve by appending
//! fields. Everything an installer or a post-reboot commit needs to know
//! about a staged install lives in this one record.

use prost::Message;

/// Phase of a staged-install session.
///
/// Sessions only move forward:
/// `Unknown → Verified → Staged → Activated`, then into exactly one of the
/// terminal phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum SessionPhase {
    /// Freshly created; nothing is known about the payload yet.
    Unknown = 0,
    /// Payload verified by the installer.
    Verified = 1,
    /// Payload staged, waiting for the next boot to commit.
    Staged = 2,
    /// Payload copied into the active directory this boot.
    Activated = 3,
    /// Terminal: the install is live and accepted.
    Success = 4,
    /// Terminal: activation failed.
    ActivationFailed = 5,
    /// Terminal: the session was rolled back.
    Reverted = 6,
    /// Terminal: the rollback itself failed.
    RevertFailed = 7,
}

impl SessionPhase {
    /// Whether the phase is terminal (the session is only kept around for
    /// reporting until garbage collection).
    #[must_use]
    pub const fn is_final(self) -> bool {
        matches!(
            self,
            Self::Success | Self::ActivationFailed | Self::Reverted | Self::RevertFailed
        )
    }

    /// Whether the session is in flight: past creation, not yet terminal.
    #[must_use]
    pub const fn is_active(self) -> bool {
        !self.is_final() && !matches!(self, Self::Unknown)
    }
}

/// Serialized per-session record.
#[derive(Clone, PartialEq, Message)]
pub struct SessionState {
    /// Session id, assigned by the installer.
    #[prost(int32, tag = "1")]
    pub id: i32,

    /// Current [`SessionPhase`].
    #[prost(enumeration = "SessionPhase", tag = "2")]
    pub state: i32,

    /// Child session ids for multi-package sessions.
    #[prost(int32, repeated, tag = "3")]
    pub child_ids: Vec<i32>,

    /// Names of the capsules staged by this session.
    #[prost(string, repeated, tag = "4")]
    pub capsule_names: Vec<String>,

    /// Build fingerprint the payload was staged against.
    #[prost(string, tag = "5")]
    pub build_fingerprint: String,

    /// Whether the installer enabled rollback for this session.
    #[prost(bool, tag = "6")]
    pub rollback_enabled: bool,

    /// Whether this session itself is a rollback of an earlier one.
    #[prost(bool, tag = "7")]
    pub is_rollback: bool,

    /// Rollback id, when `is_rollback` or `rollback_enabled` is set.
    #[prost(int32, tag = "8")]
    pub rollback_id: i32,

    /// Process whose crash triggered a revert, recorded for bug reports.
    #[prost(string, tag = "9")]
    pub crashing_process: String,

    /// Hex SHA-256 digests of the staged payload files.
    #[prost(string, repeated, tag = "10")]
    pub file_hashes: Vec<String>,
}

impl SessionState {
    /// Current phase, decoded. Unrecognised on-disk values (from a newer
    /// writer) read as [`SessionPhase::Unknown`].
    #[must_use]
    pub fn phase(&self) -> SessionPhase {
        SessionPhase::try_from(self.state).unwrap_or(SessionPhase::Unknown)
    }

    /// Sets the phase.
    pub fn set_phase(&mut self, phase: SessionPhase) {
        self.state = phase as i32;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_round_trips_through_the_wire_format() {
        let mut state = SessionState {
            id: 42,
            ..SessionState::default()
        };
        state.set_phase(SessionPhase::Staged);
        state.capsule_names = vec!["com.example.pkg".to_string()];
        state.child_ids = vec![43, 44];
        state.rollback_enabled = true;
        state.rollback_id = 7;
        state.file_hashes = vec!["ab".repeat(32)];

        let decoded = SessionState::decode(state.encode_to_vec().as_slice()).unwrap();
        assert_eq!(decoded, state);
        assert_eq!(decoded.phase(), SessionPhase::Staged);
    }

    #[test]
    fn default_record_is_unknown() {
        assert_eq!(SessionState::default().phase(), SessionPhase::Unknown);
    }

    #[test]
    fn unrecognised_phase_reads_as_unknown() {
        let state = SessionState {
            state: 999,
            ..SessionState::default()
        };
        let decoded = SessionState::decode(state.encode_to_vec().as_slice()).unwrap();
        assert_eq!(decoded.phase(), SessionPhase::Unknown);
    }

    #[test]
    fn terminal_and_active_phases_partition_correctly() {
        use SessionPhase::{
            ActivationFailed, Activated, RevertFailed, Reverted, Staged, Success, Unknown,
            Verified,
        };

        for phase in [Success, ActivationFailed, Reverted, RevertFailed] {
            assert!(phase.is_final());
            assert!(!phase.is_active());
        }
        for phase in [Verified, Staged, Activated] {
            assert!(!phase.is_final());
            assert!(phase.is_active());
        }
        assert!(!Unknown.is_final());
        assert!(!Unknown.is_active());
    }
}
