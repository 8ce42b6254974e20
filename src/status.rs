//! Status codes shared by clients and enforcers.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Status carried in enforcer replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpyStatus {
    Success,
    UnknownTarget,
    BadGenVec,
    FutureGen,
    LongDead,
    RegisterAck,
    CancelAck,
    CancelError,
    KillAck,
    GenResponse,
}

impl SpyStatus {
    /// Staleness statuses mean the caller's cached generation is wrong.
    pub fn is_stale(self) -> bool {
        matches!(self, SpyStatus::FutureGen | SpyStatus::LongDead)
    }
}

impl fmt::Display for SpyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SpyStatus::Success => "success",
            SpyStatus::UnknownTarget => "unknown target",
            SpyStatus::BadGenVec => "bad generation vector",
            SpyStatus::FutureGen => "future generation",
            SpyStatus::LongDead => "long dead",
            SpyStatus::RegisterAck => "register ack",
            SpyStatus::CancelAck => "cancel ack",
            SpyStatus::CancelError => "cancel error",
            SpyStatus::KillAck => "kill ack",
            SpyStatus::GenResponse => "generation response",
        };
        f.write_str(name)
    }
}

/// Status delivered to client callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FalconStatus {
    DownFromRemote,
    KilledByRemote,
    RemoteWouldKill,
    RemoteError,
    UnknownError,
    E2eTimeout,
    KillLongDead,
    RegistrationError,
    SignOfLife,
}

impl FalconStatus {
    /// Map the flags of a remote Down notification to a client status.
    pub fn from_down(killed: bool, would_kill: bool) -> Self {
        if killed {
            FalconStatus::KilledByRemote
        } else if would_kill {
            FalconStatus::RemoteWouldKill
        } else {
            FalconStatus::DownFromRemote
        }
    }

    /// Liveness is the only non-terminal status.
    pub fn is_terminal(self) -> bool {
        self != FalconStatus::SignOfLife
    }

    pub fn message(self) -> &'static str {
        match self {
            FalconStatus::DownFromRemote => "down, not killed",
            FalconStatus::KilledByRemote => "down, killed",
            FalconStatus::RemoteWouldKill => "down, would kill",
            FalconStatus::RemoteError => "remote error",
            FalconStatus::UnknownError => "unknown error",
            FalconStatus::E2eTimeout => "end-to-end timeout expired",
            FalconStatus::KillLongDead => "down, learned from end-to-end timeout",
            FalconStatus::RegistrationError => "registration error",
            FalconStatus::SignOfLife => "signs of life",
        }
    }
}

impl fmt::Display for FalconStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_down_prefers_killed() {
        assert_eq!(FalconStatus::from_down(true, true), FalconStatus::KilledByRemote);
        assert_eq!(FalconStatus::from_down(true, false), FalconStatus::KilledByRemote);
        assert_eq!(FalconStatus::from_down(false, true), FalconStatus::RemoteWouldKill);
        assert_eq!(FalconStatus::from_down(false, false), FalconStatus::DownFromRemote);
    }

    #[test]
    fn test_only_sign_of_life_is_non_terminal() {
        assert!(!FalconStatus::SignOfLife.is_terminal());
        assert!(FalconStatus::E2eTimeout.is_terminal());
        assert!(FalconStatus::RegistrationError.is_terminal());
    }

    #[test]
    fn test_stale_statuses() {
        assert!(SpyStatus::FutureGen.is_stale());
        assert!(SpyStatus::LongDead.is_stale());
        assert!(!SpyStatus::BadGenVec.is_stale());
    }
}
