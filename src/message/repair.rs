use crate::blocks::Url;
use crate::peer_id::{Id, PollId};

/// Asks a voter that disagreed (or held a block we lack) for its copy of one
/// URL. The serving peer applies its repair policy before answering.
#[derive(Debug, Clone, Serialize, Deserialize, Message)]
#[rtype(result = "()")]
pub struct RepairRequest {
    pub key: PollId,
    pub url: Url,
}

/// The raw bytes of a repaired block. The poller stores and re-hashes the
/// content before accepting the repair.
#[derive(Debug, Clone, Serialize, Deserialize, Message)]
#[rtype(result = "()")]
pub struct Repair {
    pub key: PollId,
    pub voter: Id,
    pub url: Url,
    pub content: Vec<u8>,
}
