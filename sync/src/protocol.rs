//! Sync wire protocol

use manifold_core::{ByteKey, ManifoldResult, VersionStamp};
use manifold_reactor::BincodeCodec;
use manifold_state::WriteOp;
use serde::{Deserialize, Serialize};

use crate::manager::KnownState;

/// Port carrying state requests and responses
pub const STATE_PORT: &str = "sync/state";

/// Port carrying the two-phase commit exchange
pub const COMMIT_PORT: &str = "sync/commit";

/// Messages exchanged between sync services
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncMessage {
    /// Ask a peer for its known state
    StateRequest,

    /// Reply to `StateRequest`
    StateResponse(KnownState),

    /// Stage a commit proposed by the sender
    Prepare { stamp: VersionStamp, writes: Vec<WriteOp> },

    /// The commit is staged and may be accepted
    Prepared { stamp: VersionStamp },

    /// The commit could not be staged
    Rejected { stamp: VersionStamp, reason: String },

    /// Publish a staged commit
    Accept { stamp: VersionStamp },

    /// Discard a staged commit
    Rollback { stamp: VersionStamp },
}

impl SyncMessage {
    pub fn message_type(&self) -> &'static str {
        match self {
            SyncMessage::StateRequest => "state_request",
            SyncMessage::StateResponse(_) => "state_response",
            SyncMessage::Prepare { .. } => "prepare",
            SyncMessage::Prepared { .. } => "prepared",
            SyncMessage::Rejected { .. } => "rejected",
            SyncMessage::Accept { .. } => "accept",
            SyncMessage::Rollback { .. } => "rollback",
        }
    }
}

/// Codec used on both sync ports
pub type SyncCodec = BincodeCodec<SyncMessage>;

/// Port addresses of the sync service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncPorts {
    pub state: ByteKey,
    pub commit: ByteKey,
}

impl SyncPorts {
    pub fn new() -> ManifoldResult<Self> {
        Ok(Self {
            state: ByteKey::from_str_key(STATE_PORT)?,
            commit: ByteKey::from_str_key(COMMIT_PORT)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use manifold_core::NodeHandle;
    use manifold_reactor::Codec;

    #[test]
    fn test_messages_survive_codec() {
        let codec = SyncCodec::new();
        let stamp = VersionStamp::from_parts(4, 2);
        let messages = vec![
            SyncMessage::StateRequest,
            SyncMessage::StateResponse(KnownState::new(NodeHandle(2), stamp, Vec::new())),
            SyncMessage::Prepare {
                stamp,
                writes: vec![WriteOp::Delete {
                    key: ByteKey::from_str_key("k").unwrap(),
                }],
            },
            SyncMessage::Rejected {
                stamp,
                reason: "busy".into(),
            },
        ];
        for message in messages {
            let decoded = codec.decode(&codec.encode(&message).unwrap()).unwrap();
            assert_eq!(decoded.message_type(), message.message_type());
            assert_eq!(decoded, message);
        }
    }

    #[test]
    fn test_ports_are_distinct() {
        let ports = SyncPorts::new().unwrap();
        assert_ne!(ports.state, ports.commit);
        assert_eq!(ports.state.to_string(), STATE_PORT);
    }
}
