//! Content hashing: digest computation and the time-sliced hash job.
mod digest;
mod service;

pub use digest::{challenge_digest, make_nonce, plain_digest, HashAlgorithm};
pub use service::{hash_url, CancelHash, HashEvent, HashEventKind, HashOutcome, HashService, HashRequest, ScheduleHash};

#[derive(Debug)]
pub enum Error {
    /// The poll named a hash algorithm this node does not support.
    UnsupportedAlgorithm(String),
    Content(crate::content::Error),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl std::error::Error for Error {}

impl std::convert::From<crate::content::Error> for Error {
    fn from(error: crate::content::Error) -> Self {
        Error::Content(error)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
