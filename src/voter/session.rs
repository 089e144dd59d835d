//! The voter session actor.
//!
//! One `VoterSession` runs per poll this node was invited to. The ballot
//! (the voter's own hash blocks) accumulates in a sled tree keyed by URL,
//! so the vote goes out in URL order without being held in memory.

use super::vsm::{step, VoterEffect, VoterEvent, VoterState};
use super::Result;
use crate::blocks::{Nonce, Url, VoteBlock};
use crate::config::PollConfig;
use crate::content::ContentStore;
use crate::hasher::{
    CancelHash, HashAlgorithm, HashEvent, HashEventKind, HashOutcome, HashRequest, HashService,
    ScheduleHash,
};
use crate::message::{EffortProof, Nominate, Poll, PollAck, Receipt, Repair, Vote};
use crate::peer_id::{Id, PollId};
use crate::protocol::{Inbound, PollMessage, SendMessage};

use actix::{Actor, ActorFutureExt, Addr, AsyncContext, Context, Handler, Recipient, WrapFuture};
use colored::Colorize;
use tracing::{debug, info, warn};

use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

/// Sent to the manager when the voter side of a poll winds down.
#[derive(Debug, Clone, Message)]
#[rtype(result = "()")]
pub struct VoterFinished {
    pub key: PollId,
    /// The receipt's agreement percent, when one was received.
    pub agreement: Option<u32>,
}

#[derive(Debug, Clone, Message)]
#[rtype(result = "VoterReport")]
pub struct VoterStatus;

#[derive(Debug, Clone, MessageResponse)]
pub struct VoterReport {
    pub key: PollId,
    pub poller: Id,
    pub state: VoterState,
}

fn ballot_tree_name(key: &PollId) -> String {
    format!("poll-{}-ballot", key.to_hex())
}

fn until(deadline: SystemTime) -> Duration {
    deadline.duration_since(SystemTime::now()).unwrap_or(Duration::from_secs(0))
}

pub struct VoterSession {
    id: Id,
    key: PollId,
    poller: Id,
    algorithm: HashAlgorithm,
    config: PollConfig,
    store: Arc<dyn ContentStore>,
    db: sled::Db,
    registry: crate::peers::PeerRegistry,
    hasher: Addr<HashService>,
    transport: Recipient<SendMessage>,
    finished: Recipient<VoterFinished>,

    state: VoterState,
    intro_effort: EffortProof,
    poller_nonce: Nonce,
    voter_nonce: Nonce,
    vote_deadline: SystemTime,
    poll_deadline: SystemTime,

    ballot_tree: sled::Tree,
    /// False until the local hash finishes; a vote sent after a hash
    /// timeout is marked incomplete.
    hash_complete: bool,
    pending_proof: Option<EffortProof>,
    agreement: Option<u32>,
    released: bool,
}

impl VoterSession {
    /// Builds a session from an invitation. An unsupported algorithm or an
    /// AU this node does not hold is a construction error; the manager
    /// declines on our behalf.
    pub fn from_poll(
        id: Id,
        poll: &Poll,
        config: PollConfig,
        store: Arc<dyn ContentStore>,
        db: sled::Db,
        registry: crate::peers::PeerRegistry,
        hasher: Addr<HashService>,
        transport: Recipient<SendMessage>,
        finished: Recipient<VoterFinished>,
    ) -> Result<Self> {
        let algorithm = HashAlgorithm::from_str(&poll.algorithm)?;
        if store.au_id() != poll.au_id {
            return Err(super::Error::WrongAu {
                expected: store.au_id(),
                got: poll.au_id.clone(),
            });
        }
        let ballot_tree = db.open_tree(ballot_tree_name(&poll.key))?;
        ballot_tree.clear()?;
        Ok(VoterSession {
            id,
            key: poll.key,
            poller: poll.poller,
            algorithm,
            config,
            store,
            db,
            registry,
            hasher,
            transport,
            finished,
            state: VoterState::VerifyPollEffort,
            intro_effort: poll.intro_effort.clone(),
            poller_nonce: poll.poller_nonce.clone(),
            voter_nonce: crate::hasher::make_nonce(),
            vote_deadline: poll.vote_deadline,
            poll_deadline: poll.poll_deadline,
            ballot_tree,
            hash_complete: false,
            pending_proof: None,
            agreement: None,
            released: false,
        })
    }

    fn send(&self, message: PollMessage) {
        let _ = self.transport.do_send(SendMessage { to: self.poller, message });
    }

    fn drive(&mut self, ctx: &mut Context<Self>, event: VoterEvent) {
        let mut pending = vec![event];
        while let Some(event) = pending.pop() {
            let (next, effects) = step(self.state, event);
            self.state = next;
            for effect in effects {
                if let Some(follow) = self.apply_effect(ctx, effect) {
                    pending.push(follow);
                }
            }
        }
    }

    fn apply_effect(&mut self, ctx: &mut Context<Self>, effect: VoterEffect) -> Option<VoterEvent> {
        match effect {
            VoterEffect::VerifyPollEffort => {
                let ok = self.intro_effort.verify()
                    && SystemTime::now() < self.vote_deadline;
                if ok {
                    Some(VoterEvent::PollEffortOk)
                } else {
                    Some(VoterEvent::PollEffortBad)
                }
            }
            // The AU was checked at construction; an invitation that got
            // this far is accepted.
            VoterEffect::DecideParticipation => Some(VoterEvent::Accepted),
            VoterEffect::ProveAckEffort => Some(VoterEvent::AckEffortProven),
            VoterEffect::SendPollAck => {
                let ack = PollAck::accept(
                    self.key,
                    self.id,
                    EffortProof::generate(),
                    self.voter_nonce.clone(),
                );
                self.send(PollMessage::PollAck(ack));
                Some(VoterEvent::PollAckSent)
            }
            VoterEffect::SendDecline => {
                info!("[{}] declining poll {} from {}", "voter".yellow(), self.key, self.poller);
                self.send(PollMessage::PollAck(PollAck::decline(self.key, self.id)));
                None
            }
            VoterEffect::VerifyPollProof => {
                let ok = self
                    .pending_proof
                    .as_ref()
                    .map(|proof| proof.verify())
                    .unwrap_or(false);
                if ok {
                    Some(VoterEvent::PollProofOk)
                } else {
                    Some(VoterEvent::PollProofBad)
                }
            }
            VoterEffect::SendNominate => {
                let nominees = self.pick_nominees();
                debug!(
                    "[{}] poll {} nominating {} peers",
                    "voter".yellow(),
                    self.key,
                    nominees.len()
                );
                self.send(PollMessage::Nominate(Nominate {
                    key: self.key,
                    voter: self.id,
                    nominees,
                }));
                Some(VoterEvent::NominateSent)
            }
            VoterEffect::StartHash => {
                self.start_hash(ctx);
                None
            }
            VoterEffect::SendVote => {
                match self.assemble_vote() {
                    Ok(blocks) => {
                        info!(
                            "[{}] poll {} casting vote, {} blocks, complete: {}",
                            "voter".yellow(),
                            self.key,
                            blocks.len(),
                            self.hash_complete
                        );
                        self.send(PollMessage::Vote(Vote {
                            key: self.key,
                            voter: self.id,
                            blocks,
                            complete: self.hash_complete,
                        }));
                        Some(VoterEvent::VoteSent)
                    }
                    Err(err) => {
                        warn!("[{}] cannot assemble vote for poll {}: {}", "voter".yellow(), self.key, err);
                        Some(VoterEvent::BadMessage)
                    }
                }
            }
            // The repair payload is handled where it arrives.
            VoterEffect::ServeRepair => None,
            VoterEffect::RecordReceipt => {
                if let Some(agreement) = self.agreement {
                    if let Err(err) = self.registry.record_agreement(&self.poller, agreement) {
                        warn!(
                            "[{}] cannot record agreement of {}: {}",
                            "voter".yellow(),
                            self.poller,
                            err
                        );
                    }
                }
                Some(VoterEvent::ReceiptProcessed)
            }
            VoterEffect::Finalize => {
                self.release();
                None
            }
        }
    }

    fn pick_nominees(&self) -> Vec<Id> {
        match self.registry.all() {
            Ok(entries) => entries
                .into_iter()
                .map(|e| e.id)
                .filter(|id| *id != self.poller && *id != self.id)
                .take(self.config.target_outer_circle_size)
                .collect(),
            Err(err) => {
                warn!("[{}] cannot read peer registry: {}", "voter".yellow(), err);
                vec![]
            }
        }
    }

    fn start_hash(&mut self, ctx: &mut Context<Self>) {
        let request = HashRequest {
            poll: self.key,
            store: self.store.clone(),
            algorithm: self.algorithm,
            poller_nonce: self.poller_nonce.clone(),
            voter_nonces: vec![(self.id, self.voter_nonce.clone())],
            deadline: self.vote_deadline,
        };
        let schedule = ScheduleHash { request, events: ctx.address().recipient() };
        let fut = self.hasher.send(schedule).into_actor(self).map(|reserved, act, ctx| {
            if !matches!(reserved, Ok(true)) {
                warn!("[{}] no hashing time for poll {}", "voter".yellow(), act.key);
                act.drive(ctx, VoterEvent::HashingFailed);
            }
        });
        ctx.spawn(fut);
    }

    /// Projects the stored ballot into vote blocks, in URL order.
    fn assemble_vote(&self) -> Result<Vec<VoteBlock>> {
        let mut blocks = vec![];
        for item in self.ballot_tree.iter() {
            let (_key, value) = item?;
            let hash_block: crate::blocks::HashBlock = bincode::deserialize(&value)?;
            blocks.push(hash_block.to_vote_block(&self.id));
        }
        Ok(blocks)
    }

    fn serve_repair(&mut self, url: Url) {
        let agreement = self.registry.agreement(&self.poller).unwrap_or(0);
        if agreement < self.config.min_agreement_for_repair {
            info!(
                "[{}] refusing repair of {} for {}: agreement {} below {}",
                "voter".yellow(),
                url,
                self.poller,
                agreement,
                self.config.min_agreement_for_repair
            );
            return;
        }
        match self.store.versions(&url) {
            Ok(versions) if !versions.is_empty() => {
                let content = versions[0].clone();
                self.send(PollMessage::Repair(Repair {
                    key: self.key,
                    voter: self.id,
                    url,
                    content,
                }));
            }
            Ok(_) | Err(_) => {
                warn!("[{}] cannot serve repair of {}: content missing", "voter".yellow(), url)
            }
        }
    }

    /// Idempotent teardown of the per-poll resources.
    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        let _ = self.hasher.do_send(CancelHash { poll: self.key });
        if let Err(err) = self.db.drop_tree(ballot_tree_name(&self.key)) {
            warn!("[{}] cannot drop ballot tree of poll {}: {}", "voter".yellow(), self.key, err);
        }
        let _ = self
            .finished
            .do_send(VoterFinished { key: self.key, agreement: self.agreement });
        info!("[{}] poll {} finished in {:?}", "voter".yellow(), self.key, self.state);
    }
}

impl Actor for VoterSession {
    type Context = Context<Self>;

    fn started(&mut self, ctx: &mut Context<Self>) {
        debug!("[{}] invited to poll {} by {}", "voter".yellow(), self.key, self.poller);
        self.drive(ctx, VoterEvent::Start);
        // Every wait state answers to the poll deadline, with a grace
        // period for a receipt that is already in flight.
        ctx.run_later(until(self.poll_deadline + self.config.receipt_padding), |act, ctx| {
            if act.state != VoterState::Finalize && !act.released {
                act.drive(ctx, VoterEvent::Deadline);
            }
        });
    }
}

impl Handler<Inbound> for VoterSession {
    type Result = ();

    fn handle(&mut self, msg: Inbound, ctx: &mut Context<Self>) -> Self::Result {
        if msg.from != self.poller {
            debug!("[{}] poll {} ignoring message from non-poller {}", "voter".yellow(), self.key, msg.from);
            return;
        }
        match msg.message {
            PollMessage::PollProof(proof) => {
                self.pending_proof = Some(proof.remaining_effort);
                self.drive(ctx, VoterEvent::PollProofReceived);
            }
            PollMessage::VoteRequest(_) => self.drive(ctx, VoterEvent::VoteRequested),
            PollMessage::RepairRequest(request) => {
                self.drive(ctx, VoterEvent::RepairRequested);
                // The machine stays in WaitReceipt only if the request was
                // legal in the current phase.
                if self.state == VoterState::WaitReceipt {
                    self.serve_repair(request.url);
                }
            }
            PollMessage::Receipt(receipt) => self.handle_receipt(ctx, receipt),
            other => {
                debug!(
                    "[{}] poll {} unexpected {:?} from poller",
                    "voter".yellow(),
                    self.key,
                    other
                );
                self.drive(ctx, VoterEvent::BadMessage);
            }
        }
    }
}

impl VoterSession {
    fn handle_receipt(&mut self, ctx: &mut Context<Self>, receipt: Receipt) {
        debug!(
            "[{}] poll {} receipt: {:?}, agreement {}%",
            "voter".yellow(),
            self.key,
            receipt.outcome,
            receipt.agreement
        );
        self.agreement = Some(receipt.agreement);
        self.drive(ctx, VoterEvent::ReceiptReceived);
    }
}

impl Handler<HashEvent> for VoterSession {
    type Result = ();

    fn handle(&mut self, msg: HashEvent, ctx: &mut Context<Self>) -> Self::Result {
        if msg.poll != self.key {
            return;
        }
        match msg.kind {
            HashEventKind::Block(block) => match bincode::serialize(&block) {
                Ok(bytes) => {
                    if let Err(err) = self.ballot_tree.insert(block.url.as_bytes(), bytes) {
                        warn!("[{}] cannot store ballot block {}: {}", "voter".yellow(), block.url, err);
                    }
                }
                Err(err) => {
                    warn!("[{}] cannot encode ballot block {}: {}", "voter".yellow(), block.url, err)
                }
            },
            HashEventKind::Done(HashOutcome::Completed) => {
                self.hash_complete = true;
                self.drive(ctx, VoterEvent::HashingDone);
            }
            HashEventKind::Done(HashOutcome::Timeout) => {
                // Cast what we managed to hash; the poller tallies a
                // truncated vote for the blocks it covers.
                warn!("[{}] poll {} hash timed out, vote will be incomplete", "voter".yellow(), self.key);
                self.drive(ctx, VoterEvent::HashingDone);
            }
            HashEventKind::Done(HashOutcome::Aborted) => {
                if !self.released {
                    self.drive(ctx, VoterEvent::HashingFailed);
                }
            }
        }
    }
}

impl Handler<VoterStatus> for VoterSession {
    type Result = VoterReport;

    fn handle(&mut self, _msg: VoterStatus, _ctx: &mut Context<Self>) -> Self::Result {
        VoterReport { key: self.key, poller: self.poller, state: self.state }
    }
}
