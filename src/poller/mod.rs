//! Poller role: session actor, per-participant state machine, peer
//! selection and invitation.
mod invite;
mod participant;
mod psm;
mod session;

pub use invite::{invitation_weight, select_inner_circle, select_outer_circle};
pub use participant::{Participant, PeerStatus};
pub use psm::{step, DropReason, PollerEffect, PollerEvent, PollerState};
pub use session::{
    GetStatus, PollFinished, PollSpec, PollStatus, PollerSession, StartPoll, StatusReport,
    StopPoll,
};

use crate::peer_id::Id;

#[derive(Debug)]
pub enum Error {
    Sled(sled::Error),
    Bincode(bincode::Error),
    Tally(crate::tally::Error),
    Checkpoint(crate::checkpoint::Error),
    Hasher(crate::hasher::Error),
    /// A message arrived for a peer that is not a participant.
    UnknownParticipant(Id),
    /// The poll is no longer active.
    NotActive,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl std::error::Error for Error {}

impl std::convert::From<sled::Error> for Error {
    fn from(error: sled::Error) -> Self {
        Error::Sled(error)
    }
}

impl std::convert::From<bincode::Error> for Error {
    fn from(error: bincode::Error) -> Self {
        Error::Bincode(error)
    }
}

impl std::convert::From<crate::tally::Error> for Error {
    fn from(error: crate::tally::Error) -> Self {
        Error::Tally(error)
    }
}

impl std::convert::From<crate::checkpoint::Error> for Error {
    fn from(error: crate::checkpoint::Error) -> Self {
        Error::Checkpoint(error)
    }
}

impl std::convert::From<crate::hasher::Error> for Error {
    fn from(error: crate::hasher::Error) -> Self {
        Error::Hasher(error)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
