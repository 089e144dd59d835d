use crate::message::EffortProof;
use crate::peer_id::PollId;

/// The poller's remaining effort, sent once a voter's acceptance has been
/// verified. Receipt of a valid `PollProof` commits the voter to nominating
/// and hashing.
#[derive(Debug, Clone, Serialize, Deserialize, Message)]
#[rtype(result = "()")]
pub struct PollProof {
    pub key: PollId,
    pub remaining_effort: EffortProof,
}
