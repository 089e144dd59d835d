//! Protocol message definitions.
//!
//! One poll exchanges nine message types between the poller and each voter:
//! `Poll`/`PollAck` (invitation), `PollProof` (remaining effort),
//! `Nominate`, `VoteRequest`/`Vote`, `RepairRequest`/`Repair` and `Receipt`.
//! Every message carries the poll key so the manager can route it to the
//! owning session.

mod effort;
mod invite;
mod nominate;
mod proof;
mod receipt;
mod repair;
mod vote;

pub use effort::EffortProof;
pub use invite::{Poll, PollAck};
pub use nominate::Nominate;
pub use proof::PollProof;
pub use receipt::{Receipt, ReceiptOutcome};
pub use repair::{Repair, RepairRequest};
pub use vote::{Vote, VoteRequest};

/// Protocol version spoken by this implementation.
pub const CURRENT_VERSION: u32 = 3;
