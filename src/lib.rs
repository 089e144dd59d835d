#[macro_use]
extern crate serde_derive;
#[macro_use(Message, MessageResponse)]
extern crate actix_derive;
extern crate colored;

pub mod blocks;
pub mod checkpoint;
pub mod config;
pub mod content;
pub mod hasher;
pub mod integration_test;
pub mod manager;
pub mod message;
pub mod peer_id;
pub mod peers;
pub mod poller;
pub mod protocol;
pub mod repair;
pub mod tally;
pub mod util;
pub mod voter;

#[derive(Debug)]
pub enum Error {
    IO(std::io::Error),
    Sled(sled::Error),
    Bincode(bincode::Error),
    Actix(actix::MailboxError),
    Config(config::ConfigError),

    Hasher(hasher::Error),
    Tally(tally::Error),
    Checkpoint(checkpoint::Error),
    Poller(poller::Error),
    Voter(voter::Error),

    /// Error caused by converting from a `String` to an `Id`.
    TryFromStringError,
    /// The identity keypair could not be decoded.
    Keypair(String),
    /// An inbound message referenced a poll this node does not know about.
    UnknownPoll(peer_id::PollId),
    /// A poll could not be created or resumed (fatal construction error).
    PollConstruction(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl std::error::Error for Error {}

impl std::convert::From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        Error::IO(error)
    }
}

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

impl std::convert::From<actix::MailboxError> for Error {
    fn from(error: actix::MailboxError) -> Self {
        Error::Actix(error)
    }
}

impl std::convert::From<config::ConfigError> for Error {
    fn from(error: config::ConfigError) -> Self {
        Error::Config(error)
    }
}

impl std::convert::From<hasher::Error> for Error {
    fn from(error: hasher::Error) -> Self {
        Error::Hasher(error)
    }
}

impl std::convert::From<tally::Error> for Error {
    fn from(error: tally::Error) -> Self {
        Error::Tally(error)
    }
}

impl std::convert::From<checkpoint::Error> for Error {
    fn from(error: checkpoint::Error) -> Self {
        Error::Checkpoint(error)
    }
}

impl std::convert::From<poller::Error> for Error {
    fn from(error: poller::Error) -> Self {
        Error::Poller(error)
    }
}

impl std::convert::From<voter::Error> for Error {
    fn from(error: voter::Error) -> Self {
        Error::Voter(error)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
