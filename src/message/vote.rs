use crate::blocks::VoteBlock;
use crate::peer_id::{Id, PollId};

/// Asks a voter to cast its vote. The voter may hold the request until its
/// local content hash has completed.
#[derive(Debug, Clone, Serialize, Deserialize, Message)]
#[rtype(result = "()")]
pub struct VoteRequest {
    pub key: PollId,
}

/// A voter's ballot: its per-URL digest records in URL order.
#[derive(Debug, Clone, Serialize, Deserialize, Message)]
#[rtype(result = "()")]
pub struct Vote {
    pub key: PollId,
    pub voter: Id,
    pub blocks: Vec<VoteBlock>,
    /// False when the voter truncated its vote (e.g. its hash deadline hit);
    /// an incomplete vote still tallies for the blocks it covers.
    pub complete: bool,
}
