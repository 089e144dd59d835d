//! The block-level tallying engine.
//!
//! Merges the poller's own hash stream with every participant's vote stream
//! in URL order, classifies each participant per URL, and reduces the
//! classification to a verdict.
mod block_tally;
mod merge;
mod voice;

pub use block_tally::{BlockTally, Verdict};
pub use merge::{TalliedUrl, UrlTallier};
pub use voice::{HashBlockSource, SledHashSource, SledVoteSource, VecHashSource, VecVoteSource, Voice, VoteBlockSource};

#[derive(Debug)]
pub enum Error {
    Sled(sled::Error),
    Bincode(bincode::Error),
    /// More spoiled vote streams than the configured tolerance; the poll
    /// must abort (a data-integrity concern, not a single-peer concern).
    TooManyBlockErrors(usize),
    /// The poller's own hash stream failed, which is always fatal.
    PollerStreamError(String),
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

pub type Result<T> = std::result::Result<T, Error>;
