use crate::peer_id::{Id, PollId};

/// Outer-circle nominations: peers this voter suggests the poller also
/// invite. An empty list is legal and simply contributes nothing.
#[derive(Debug, Clone, Serialize, Deserialize, Message)]
#[rtype(result = "()")]
pub struct Nominate {
    pub key: PollId,
    pub voter: Id,
    pub nominees: Vec<Id>,
}
