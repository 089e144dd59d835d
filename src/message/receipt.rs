use crate::peer_id::PollId;

/// How the poll ended from the voter's perspective.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReceiptOutcome {
    Complete,
    NoQuorum,
    Expired,
    Aborted,
}

/// Closes a voter's participation and reports how far its vote agreed with
/// the tally. Voters record the agreement so future repair requests from
/// this poller can be policy-checked.
#[derive(Debug, Clone, Serialize, Deserialize, Message)]
#[rtype(result = "()")]
pub struct Receipt {
    pub key: PollId,
    pub outcome: ReceiptOutcome,
    /// This voter's share of tallied URLs on which it agreed, in percent.
    pub agreement: u32,
}
