//! Voter role: session actor and the mirror state machine.
mod session;
mod vsm;

pub use session::{VoterFinished, VoterReport, VoterSession, VoterStatus};
pub use vsm::{step, VoterEffect, VoterEvent, VoterState};

#[derive(Debug)]
pub enum Error {
    Sled(sled::Error),
    Bincode(bincode::Error),
    Hasher(crate::hasher::Error),
    /// The invitation names an archival unit this node does not hold.
    WrongAu { expected: String, got: String },
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

impl std::convert::From<crate::hasher::Error> for Error {
    fn from(error: crate::hasher::Error) -> Self {
        Error::Hasher(error)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
