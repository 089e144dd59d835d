//! The single wire surface of the poll protocol.
//!
//! The transport layer is an external collaborator: it delivers inbound
//! [PollMessage]s already deserialized and addressed, and accepts outbound
//! messages through a `Recipient<SendMessage>`. The core never touches
//! sockets.

use crate::message::{Nominate, Poll, PollAck, PollProof, Receipt, Repair, RepairRequest, Vote, VoteRequest};
use crate::peer_id::{Id, PollId};

/// Every protocol message, tagged for dispatch.
#[derive(Debug, Clone, Serialize, Deserialize, Message)]
#[rtype(result = "()")]
pub enum PollMessage {
    // Poller -> voter
    Poll(Poll),
    PollProof(PollProof),
    VoteRequest(VoteRequest),
    RepairRequest(RepairRequest),
    Receipt(Receipt),
    // Voter -> poller
    PollAck(PollAck),
    Nominate(Nominate),
    Vote(Vote),
    Repair(Repair),
}

impl PollMessage {
    /// The poll this message belongs to, used for routing.
    pub fn key(&self) -> PollId {
        match self {
            PollMessage::Poll(m) => m.key,
            PollMessage::PollProof(m) => m.key,
            PollMessage::VoteRequest(m) => m.key,
            PollMessage::RepairRequest(m) => m.key,
            PollMessage::Receipt(m) => m.key,
            PollMessage::PollAck(m) => m.key,
            PollMessage::Nominate(m) => m.key,
            PollMessage::Vote(m) => m.key,
            PollMessage::Repair(m) => m.key,
        }
    }
}

/// Outbound send primitive handed to the transport.
#[derive(Debug, Clone, Serialize, Deserialize, Message)]
#[rtype(result = "()")]
pub struct SendMessage {
    pub to: Id,
    pub message: PollMessage,
}

/// Inbound delivery primitive: a message from `from`, already routed to a
/// poll key by the manager.
#[derive(Debug, Clone, Serialize, Deserialize, Message)]
#[rtype(result = "()")]
pub struct Inbound {
    pub from: Id,
    pub message: PollMessage,
}
