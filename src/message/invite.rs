use crate::blocks::Nonce;
use crate::message::EffortProof;
use crate::peer_id::{Id, PollId};

use std::time::SystemTime;

/// Invitation to participate in a poll, sent by the poller to each candidate
/// voter. Carries the poller's nonce so the voter can start hashing as soon
/// as it accepts.
#[derive(Debug, Clone, Serialize, Deserialize, Message)]
#[rtype(result = "()")]
pub struct Poll {
    pub key: PollId,
    pub poller: Id,
    pub au_id: String,
    pub version: u32,
    pub algorithm: String,
    pub intro_effort: EffortProof,
    pub poller_nonce: Nonce,
    pub vote_deadline: SystemTime,
    pub poll_deadline: SystemTime,
}

/// A voter's answer to a [Poll]. On acceptance it carries the voter's own
/// nonce and an effort proof of its own; on decline both are absent.
#[derive(Debug, Clone, Serialize, Deserialize, Message)]
#[rtype(result = "()")]
pub struct PollAck {
    pub key: PollId,
    pub voter: Id,
    pub accept: bool,
    pub ack_effort: Option<EffortProof>,
    pub voter_nonce: Option<Nonce>,
}

impl PollAck {
    pub fn accept(key: PollId, voter: Id, ack_effort: EffortProof, voter_nonce: Nonce) -> Self {
        PollAck { key, voter, accept: true, ack_effort: Some(ack_effort), voter_nonce: Some(voter_nonce) }
    }

    pub fn decline(key: PollId, voter: Id) -> Self {
        PollAck { key, voter, accept: false, ack_effort: None, voter_nonce: None }
    }
}
