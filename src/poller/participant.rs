//! Per-participant bookkeeping on the poller side.

use super::psm::{DropReason, PollerState};
use super::Result;
use crate::blocks::{Nonce, Url, VoteBlock};
use crate::checkpoint::ParticipantCheckpoint;
use crate::message::EffortProof;
use crate::peer_id::{Id, PollId};
use crate::tally::{SledVoteSource, Voice};

/// Where a participant sits in the exchange, for status reporting and for
/// deciding who counts as an active participant when a repair is verified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerStatus {
    Initialized,
    Invited,
    Accepted,
    Nominated,
    Voting,
    Voted,
    Complete,
    Declined,
    Dropped,
    Error,
}

/// One invited voter: machine state, the nonce it supplied, its nominees and
/// the sled tree its vote blocks accumulate in.
pub struct Participant {
    pub id: Id,
    pub state: PollerState,
    pub status: PeerStatus,
    pub outer_circle: bool,
    pub voter_nonce: Option<Nonce>,
    pub ack_effort: Option<EffortProof>,
    pub nominees: Vec<Id>,
    /// `Some` while the vote tree is open; cleared by `release`.
    vote_tree: Option<sled::Tree>,
    vote_complete: bool,
    pub drop_reason: Option<DropReason>,
}

/// Tree name for a participant's received vote blocks.
pub fn vote_tree_name(poll: &PollId, voter: &Id) -> String {
    format!("poll-{}-votes-{}", poll.to_hex(), voter.to_hex())
}

impl Participant {
    pub fn new(db: &sled::Db, poll: &PollId, id: Id, outer_circle: bool) -> Result<Self> {
        let vote_tree = db.open_tree(vote_tree_name(poll, &id))?;
        Ok(Participant {
            id,
            state: PollerState::ProveIntroEffort,
            status: PeerStatus::Initialized,
            outer_circle,
            voter_nonce: None,
            ack_effort: None,
            nominees: vec![],
            vote_tree: Some(vote_tree),
            vote_complete: false,
            drop_reason: None,
        })
    }

    /// Rebuilds a participant from its checkpoint; the vote tree is sled's,
    /// so its contents survived with the database.
    pub fn from_checkpoint(
        db: &sled::Db,
        poll: &PollId,
        checkpoint: &ParticipantCheckpoint,
    ) -> Result<Self> {
        let vote_tree = db.open_tree(vote_tree_name(poll, &checkpoint.id))?;
        Ok(Participant {
            id: checkpoint.id,
            state: checkpoint.state,
            status: checkpoint.status,
            outer_circle: checkpoint.outer_circle,
            voter_nonce: checkpoint.voter_nonce.clone(),
            ack_effort: None,
            nominees: checkpoint.nominees.clone(),
            vote_tree: Some(vote_tree),
            vote_complete: checkpoint.vote_complete,
            drop_reason: checkpoint.drop_reason,
        })
    }

    pub fn to_checkpoint(&self) -> ParticipantCheckpoint {
        ParticipantCheckpoint {
            id: self.id,
            state: self.state,
            status: self.status,
            outer_circle: self.outer_circle,
            voter_nonce: self.voter_nonce.clone(),
            nominees: self.nominees.clone(),
            vote_complete: self.vote_complete,
            drop_reason: self.drop_reason,
        }
    }

    /// Whether this peer is still expected to produce or has produced a
    /// countable vote.
    pub fn is_active(&self) -> bool {
        match self.status {
            PeerStatus::Declined | PeerStatus::Dropped | PeerStatus::Error => false,
            _ => true,
        }
    }

    pub fn has_voted(&self) -> bool {
        self.vote_complete
    }

    /// Stores one of the participant's vote blocks, keyed by URL so the tree
    /// iterator later replays them in URL order.
    pub fn record_vote_block(&mut self, block: &VoteBlock) -> Result<()> {
        let tree = self.vote_tree.as_ref().ok_or(super::Error::NotActive)?;
        let bytes = bincode::serialize(block)?;
        tree.insert(block.url.as_bytes(), bytes)?;
        Ok(())
    }

    pub fn record_vote(&mut self, blocks: &[VoteBlock], complete: bool) -> Result<()> {
        for block in blocks {
            self.record_vote_block(block)?;
        }
        if complete {
            self.vote_complete = true;
            self.status = PeerStatus::Voted;
        } else {
            self.status = PeerStatus::Voting;
        }
        Ok(())
    }

    /// This participant's stored vote for one URL, used when a repair is
    /// re-checked.
    pub fn vote_block(&self, url: &Url) -> Result<Option<VoteBlock>> {
        let tree = self.vote_tree.as_ref().ok_or(super::Error::NotActive)?;
        match tree.get(url.as_bytes())? {
            Some(value) => Ok(Some(bincode::deserialize(&value)?)),
            None => Ok(None),
        }
    }

    /// A fresh cursor over the stored vote, for the merge or for a repair
    /// re-check.
    pub fn voice(&self) -> Result<Voice> {
        let tree = self.vote_tree.as_ref().ok_or(super::Error::NotActive)?;
        Ok(Voice::new(self.id, Box::new(SledVoteSource::new(tree))))
    }

    pub fn mark_dropped(&mut self, reason: DropReason) {
        self.drop_reason = Some(reason);
        self.status = match reason {
            DropReason::Declined => PeerStatus::Declined,
            _ => PeerStatus::Dropped,
        };
    }

    /// Drops the vote tree handle. Idempotent; the tree itself is removed by
    /// the session when the poll directory is cleaned up.
    pub fn release(&mut self, db: &sled::Db, poll: &PollId) -> Result<()> {
        if self.vote_tree.take().is_some() {
            db.drop_tree(vote_tree_name(poll, &self.id))?;
        }
        Ok(())
    }
}
