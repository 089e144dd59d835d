//! The poller session actor.
//!
//! One `PollerSession` runs per poll this node calls. The actor mailbox
//! serializes the three things that mutate poll state: inbound protocol
//! messages, hash events and timer ticks. All per-participant protocol
//! logic lives in the transition table ([super::psm]); the session owns the
//! resources (sled trees, repair queue, tally) and interprets the effects.

use super::invite::{select_inner_circle, select_outer_circle};
use super::participant::{Participant, PeerStatus};
use super::psm::{step, PollerEffect, PollerEvent};
use super::Result;
use crate::blocks::{compare, Comparison, Nonce, Url};
use crate::checkpoint::{self, ParticipantCheckpoint, PollCheckpoint, TallyCounts};
use crate::config::PollConfig;
use crate::content::ContentStore;
use crate::hasher::{
    hash_url, CancelHash, HashAlgorithm, HashEvent, HashEventKind, HashOutcome, HashRequest,
    HashService, ScheduleHash,
};
use crate::message::{
    EffortProof, Nominate, Poll, PollAck, PollProof, Receipt, ReceiptOutcome, Repair,
    RepairRequest, Vote, VoteRequest,
};
use crate::peer_id::{Id, PollId};
use crate::protocol::{Inbound, PollMessage, SendMessage};
use crate::repair::{choose_source, RepairQueue, RepairSource};
use crate::tally::{BlockTally, SledHashSource, UrlTallier};
use crate::util;

use actix::{Actor, ActorFutureExt, Addr, AsyncContext, Context, Handler, Recipient, WrapFuture};
use colored::Colorize;
use tracing::{debug, info, warn};

use std::collections::{BTreeMap, HashMap, HashSet};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

/// Where the poll as a whole stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PollStatus {
    Pending,
    Inviting,
    WaitingVotes,
    Tallying,
    Repairing,
    Closing,
    Complete,
    NoQuorum,
    Expired,
    Aborted,
}

impl PollStatus {
    pub fn is_terminal(&self) -> bool {
        match self {
            PollStatus::Complete | PollStatus::NoQuorum | PollStatus::Expired
            | PollStatus::Aborted => true,
            _ => false,
        }
    }
}

/// Everything needed to call a poll.
#[derive(Debug, Clone)]
pub struct PollSpec {
    pub key: PollId,
    pub poller: Id,
    pub au_id: String,
    pub algorithm: HashAlgorithm,
    pub config: PollConfig,
}

#[derive(Debug, Clone, Message)]
#[rtype(result = "()")]
pub struct StartPoll;

/// Aborts the poll. Idempotent; a finished poll ignores it.
#[derive(Debug, Clone, Message)]
#[rtype(result = "()")]
pub struct StopPoll;

#[derive(Debug, Clone, Message)]
#[rtype(result = "StatusReport")]
pub struct GetStatus;

#[derive(Debug, Clone, Serialize, Deserialize, MessageResponse)]
pub struct StatusReport {
    pub key: PollId,
    pub status: PollStatus,
    pub participants: Vec<(Id, PeerStatus)>,
    pub counts: TallyCounts,
    pub outstanding_repairs: usize,
    /// Share of tallied URLs the poll agreed on, in percent.
    pub agreement: u32,
}

/// Sent to the manager when the poll reaches a terminal status.
#[derive(Debug, Clone, Message)]
#[rtype(result = "()")]
pub struct PollFinished {
    pub key: PollId,
    pub status: PollStatus,
}

/// Internal self-notify driving one slice of the URL merge, so a large
/// tally never monopolizes the mailbox.
#[derive(Debug, Clone, Message)]
#[rtype(result = "()")]
struct TallyStep;

#[derive(Default)]
struct AgreementCount {
    agreed: u64,
    counted: u64,
}

pub struct PollerSession {
    id: Id,
    key: PollId,
    au_id: String,
    algorithm: HashAlgorithm,
    config: PollConfig,
    store: Arc<dyn ContentStore>,
    db: sled::Db,
    registry: crate::peers::PeerRegistry,
    hasher: Addr<HashService>,
    transport: Recipient<SendMessage>,
    finished: Recipient<PollFinished>,

    status: PollStatus,
    poller_nonce: Nonce,
    vote_deadline: SystemTime,
    poll_deadline: SystemTime,
    participants: HashMap<Id, Participant>,
    nominations: BTreeMap<Id, Vec<Id>>,
    /// Every peer ever invited, inner or outer circle.
    invited: HashSet<Id>,

    hash_tree: sled::Tree,
    hash_scheduled: bool,
    hash_done: bool,
    vote_deadline_passed: bool,

    tallier: Option<UrlTallier>,
    counts: TallyCounts,
    agreement: HashMap<Id, AgreementCount>,
    repairs: RepairQueue,
    extra_time_granted: bool,
    receipt_outcome: ReceiptOutcome,
    resumed: bool,
}

fn hash_tree_name(key: &PollId) -> String {
    format!("poll-{}-hashes", key.to_hex())
}

fn until(deadline: SystemTime) -> Duration {
    deadline.duration_since(SystemTime::now()).unwrap_or(Duration::from_secs(0))
}

impl PollerSession {
    pub fn new(
        spec: PollSpec,
        store: Arc<dyn ContentStore>,
        db: sled::Db,
        registry: crate::peers::PeerRegistry,
        hasher: Addr<HashService>,
        transport: Recipient<SendMessage>,
        finished: Recipient<PollFinished>,
    ) -> Result<Self> {
        let hash_tree = db.open_tree(hash_tree_name(&spec.key))?;
        hash_tree.clear()?;
        let now = SystemTime::now();
        Ok(PollerSession {
            id: spec.poller,
            key: spec.key,
            au_id: spec.au_id,
            algorithm: spec.algorithm,
            vote_deadline: now + spec.config.vote_duration(),
            poll_deadline: now + spec.config.poll_duration(),
            repairs: RepairQueue::new(spec.config.max_repairs),
            config: spec.config,
            store,
            db,
            registry,
            hasher,
            transport,
            finished,
            status: PollStatus::Pending,
            poller_nonce: crate::hasher::make_nonce(),
            participants: HashMap::new(),
            nominations: BTreeMap::new(),
            invited: HashSet::new(),
            hash_tree,
            hash_scheduled: false,
            hash_done: false,
            vote_deadline_passed: false,
            tallier: None,
            counts: TallyCounts::default(),
            agreement: HashMap::new(),
            extra_time_granted: false,
            receipt_outcome: ReceiptOutcome::Complete,
            resumed: false,
        })
    }

    /// Rebuilds a session from its checkpoint. Vote and hash blocks live in
    /// sled and survived on their own; only the control state is restored.
    pub fn resume(
        poll: PollCheckpoint,
        peers: Vec<ParticipantCheckpoint>,
        config: PollConfig,
        store: Arc<dyn ContentStore>,
        db: sled::Db,
        registry: crate::peers::PeerRegistry,
        hasher: Addr<HashService>,
        transport: Recipient<SendMessage>,
        finished: Recipient<PollFinished>,
    ) -> Result<Self> {
        let algorithm = HashAlgorithm::from_str(&poll.algorithm)?;
        let hash_tree = db.open_tree(hash_tree_name(&poll.key))?;
        let mut participants = HashMap::new();
        let mut invited = HashSet::new();
        for checkpoint in peers.iter() {
            invited.insert(checkpoint.id);
            participants
                .insert(checkpoint.id, Participant::from_checkpoint(&db, &poll.key, checkpoint)?);
        }
        Ok(PollerSession {
            id: poll.poller,
            key: poll.key,
            au_id: poll.au_id,
            algorithm,
            config,
            store,
            db,
            registry,
            hasher,
            transport,
            finished,
            status: poll.status,
            poller_nonce: poll.poller_nonce,
            vote_deadline: poll.vote_deadline,
            poll_deadline: poll.poll_deadline,
            participants,
            nominations: BTreeMap::new(),
            invited,
            hash_tree,
            hash_scheduled: false,
            hash_done: false,
            vote_deadline_passed: SystemTime::now() >= poll.vote_deadline,
            tallier: None,
            counts: poll.counts,
            agreement: HashMap::new(),
            repairs: poll.repairs,
            extra_time_granted: poll.extra_time_granted,
            receipt_outcome: ReceiptOutcome::Complete,
            resumed: true,
        })
    }

    fn voter_nonces(&self) -> Vec<(Id, Nonce)> {
        self.participants
            .values()
            .filter(|p| p.is_active())
            .filter_map(|p| p.voter_nonce.as_ref().map(|n| (p.id, n.clone())))
            .collect()
    }

    fn accepted_count(&self) -> usize {
        self.participants
            .values()
            .filter(|p| p.is_active() && p.voter_nonce.is_some())
            .count()
    }

    fn send(&self, to: Id, message: PollMessage) {
        let _ = self.transport.do_send(SendMessage { to, message });
    }

    /// Runs a participant's machine to quiescence: each effect may produce a
    /// follow-up event, fed back in until none remain.
    fn drive(&mut self, peer: Id, event: PollerEvent) {
        let mut pending = vec![event];
        while let Some(event) = pending.pop() {
            let state = match self.participants.get(&peer) {
                Some(p) => p.state,
                None => return,
            };
            let (next, effects) = step(state, event);
            if let Some(p) = self.participants.get_mut(&peer) {
                p.state = next;
            }
            for effect in effects {
                if let Some(follow) = self.apply_effect(peer, effect) {
                    pending.push(follow);
                }
            }
        }
    }

    fn apply_effect(&mut self, peer: Id, effect: PollerEffect) -> Option<PollerEvent> {
        match effect {
            PollerEffect::ProveIntroEffort => Some(PollerEvent::IntroEffortProven),
            PollerEffect::SendPoll => {
                let poll = Poll {
                    key: self.key,
                    poller: self.id,
                    au_id: self.au_id.clone(),
                    version: crate::message::CURRENT_VERSION,
                    algorithm: self.algorithm.to_string(),
                    intro_effort: EffortProof::generate(),
                    poller_nonce: self.poller_nonce.clone(),
                    vote_deadline: self.vote_deadline,
                    poll_deadline: self.poll_deadline,
                };
                self.send(peer, PollMessage::Poll(poll));
                if let Some(p) = self.participants.get_mut(&peer) {
                    p.status = PeerStatus::Invited;
                }
                if let Err(err) = self.registry.record_invited(&peer) {
                    warn!("[{}] cannot record invitation of {}: {}", "poller".cyan(), peer, err);
                }
                Some(PollerEvent::PollSent)
            }
            PollerEffect::VerifyAckEffort => {
                let ok = self
                    .participants
                    .get(&peer)
                    .and_then(|p| p.ack_effort.as_ref())
                    .map(|proof| proof.verify())
                    .unwrap_or(false);
                if ok {
                    if let Some(p) = self.participants.get_mut(&peer) {
                        p.status = PeerStatus::Accepted;
                    }
                    Some(PollerEvent::AckEffortOk)
                } else {
                    Some(PollerEvent::AckEffortBad)
                }
            }
            PollerEffect::ProveRemainingEffort => Some(PollerEvent::RemainingEffortProven),
            PollerEffect::SendPollProof => {
                let proof =
                    PollProof { key: self.key, remaining_effort: EffortProof::generate() };
                self.send(peer, PollMessage::PollProof(proof));
                Some(PollerEvent::PollProofSent)
            }
            PollerEffect::SendVoteRequest => {
                self.send(peer, PollMessage::VoteRequest(VoteRequest { key: self.key }));
                Some(PollerEvent::VoteRequestSent)
            }
            // Repair payloads are handled where they arrive; the machine
            // only confirms the phase admits them.
            PollerEffect::ProcessRepair => None,
            PollerEffect::SendReceipt => {
                let agreement = self
                    .agreement
                    .get(&peer)
                    .map(|a| util::percent(a.agreed, a.counted))
                    .unwrap_or(0);
                let receipt =
                    Receipt { key: self.key, outcome: self.receipt_outcome, agreement };
                self.send(peer, PollMessage::Receipt(receipt));
                if let Err(err) = self.registry.record_agreement(&peer, agreement) {
                    warn!("[{}] cannot record agreement of {}: {}", "poller".cyan(), peer, err);
                }
                Some(PollerEvent::ReceiptSent)
            }
            PollerEffect::Drop(reason) => {
                info!("[{}] dropping {} from poll {}: {:?}", "poller".cyan(), peer, self.key, reason);
                if let Some(p) = self.participants.get_mut(&peer) {
                    p.mark_dropped(reason);
                }
                None
            }
            PollerEffect::Finalize => {
                if let Some(p) = self.participants.get_mut(&peer) {
                    if p.drop_reason.is_none() {
                        p.status = PeerStatus::Complete;
                    }
                }
                None
            }
            PollerEffect::Checkpoint => {
                self.checkpoint_participant(peer);
                self.checkpoint_poll();
                None
            }
        }
    }

    fn checkpoint_poll(&self) {
        let checkpoint = PollCheckpoint {
            key: self.key,
            poller: self.id,
            au_id: self.au_id.clone(),
            algorithm: self.algorithm.to_string(),
            poller_nonce: self.poller_nonce.clone(),
            vote_deadline: self.vote_deadline,
            poll_deadline: self.poll_deadline,
            status: self.status,
            counts: self.counts.clone(),
            repairs: self.repairs.clone(),
            extra_time_granted: self.extra_time_granted,
        };
        let base = std::path::Path::new(&self.config.state_path);
        if let Err(err) = checkpoint::save_poll(base, &checkpoint) {
            warn!("[{}] cannot checkpoint poll {}: {}", "poller".cyan(), self.key, err);
        }
    }

    fn checkpoint_participant(&self, peer: Id) {
        let checkpoint = match self.participants.get(&peer) {
            Some(p) => p.to_checkpoint(),
            None => return,
        };
        let base = std::path::Path::new(&self.config.state_path);
        if let Err(err) = checkpoint::save_participant(base, &self.key, &checkpoint) {
            warn!("[{}] cannot checkpoint {} in poll {}: {}", "poller".cyan(), peer, self.key, err);
        }
    }

    fn invite(&mut self, peers: Vec<Id>, outer_circle: bool) {
        for peer in peers {
            if !self.invited.insert(peer) {
                continue;
            }
            match Participant::new(&self.db, &self.key, peer, outer_circle) {
                Ok(participant) => {
                    self.participants.insert(peer, participant);
                    self.drive(peer, PollerEvent::Start);
                }
                Err(err) => {
                    warn!("[{}] cannot admit {} to poll {}: {}", "poller".cyan(), peer, self.key, err)
                }
            }
        }
    }

    fn invite_inner_circle(&mut self) {
        let entries = match self.registry.all() {
            Ok(entries) => entries,
            Err(err) => {
                warn!("[{}] cannot read peer registry: {}", "poller".cyan(), err);
                return;
            }
        };
        let mut exclude: HashSet<Id> = self.invited.clone();
        exclude.insert(self.id);
        let mut rng = rand::thread_rng();
        let selected = select_inner_circle(
            &mut rng,
            &entries,
            &self.config.groups,
            &exclude,
            self.config.invitation_size(),
            SystemTime::now(),
        );
        info!("[{}] poll {} inviting {} inner circle peers", "poller".cyan(), self.key, selected.len());
        self.invite(selected, false);
    }

    /// A follow-up invitation round: tops the poll up from nominations until
    /// the target size is met.
    fn invitation_round(&mut self, ctx: &mut Context<Self>) {
        if self.status != PollStatus::Inviting && self.status != PollStatus::WaitingVotes {
            return;
        }
        if self.accepted_count() >= self.config.target_poll_size() {
            self.maybe_schedule_hash(ctx);
            return;
        }
        let mut exclude: HashSet<Id> = self.invited.clone();
        exclude.insert(self.id);
        let mut rng = rand::thread_rng();
        let wanted = self
            .config
            .target_outer_circle_size
            .min(self.config.invitation_size());
        let selected = select_outer_circle(&mut rng, &self.nominations, &exclude, wanted);
        if selected.is_empty() {
            // Nominations exhausted; run with who we have.
            self.maybe_schedule_hash(ctx);
            return;
        }
        if self.config.enable_discovery {
            for peer in selected.iter() {
                if let Err(err) = self.registry.admit(peer) {
                    warn!("[{}] cannot admit nominee {}: {}", "poller".cyan(), peer, err);
                }
            }
        }
        debug!("[{}] poll {} inviting {} outer circle peers", "poller".cyan(), self.key, selected.len());
        self.invite(selected, true);
    }

    fn maybe_schedule_hash(&mut self, ctx: &mut Context<Self>) {
        if self.hash_scheduled || self.status.is_terminal() {
            return;
        }
        let nonces = self.voter_nonces();
        if nonces.is_empty() {
            return;
        }
        self.hash_scheduled = true;
        self.status = PollStatus::WaitingVotes;
        let request = HashRequest {
            poll: self.key,
            store: self.store.clone(),
            algorithm: self.algorithm,
            poller_nonce: self.poller_nonce.clone(),
            voter_nonces: nonces,
            deadline: self.poll_deadline,
        };
        let schedule = ScheduleHash { request, events: ctx.address().recipient() };
        let fut = self.hasher.send(schedule).into_actor(self).map(|reserved, act, ctx| {
            // A refusal means no hashing time remains before the deadline.
            if !matches!(reserved, Ok(true)) {
                act.close_poll(ctx, PollStatus::Expired);
            }
        });
        ctx.spawn(fut);
        self.checkpoint_poll();
    }

    fn all_votes_in(&self) -> bool {
        let active: Vec<&Participant> =
            self.participants.values().filter(|p| p.is_active()).collect();
        !active.is_empty() && active.iter().all(|p| p.has_voted())
    }

    fn maybe_begin_tally(&mut self, ctx: &mut Context<Self>) {
        if self.tallier.is_some() || self.status.is_terminal() || self.status == PollStatus::Repairing {
            return;
        }
        if !self.hash_done {
            return;
        }
        if !self.all_votes_in() && !self.vote_deadline_passed {
            return;
        }
        self.begin_tally(ctx);
    }

    fn begin_tally(&mut self, ctx: &mut Context<Self>) {
        let voted: Vec<&Participant> = self
            .participants
            .values()
            .filter(|p| p.is_active() && p.has_voted())
            .collect();
        if voted.len() < self.config.quorum {
            info!(
                "[{}] poll {} has {} votes, quorum is {}",
                "poller".cyan(),
                self.key,
                voted.len(),
                self.config.quorum
            );
            self.close_poll(ctx, PollStatus::NoQuorum);
            return;
        }
        let mut voices = vec![];
        for participant in voted {
            match participant.voice() {
                Ok(voice) => voices.push(voice),
                Err(err) => {
                    warn!("[{}] cannot open voice of {}: {}", "poller".cyan(), participant.id, err)
                }
            }
        }
        let source = Box::new(SledHashSource::new(&self.hash_tree));
        match UrlTallier::new(source, voices, self.config.max_block_error_count) {
            Ok(tallier) => {
                info!("[{}] poll {} tallying", "poller".cyan(), self.key);
                self.status = PollStatus::Tallying;
                self.counts = TallyCounts::default();
                self.tallier = Some(tallier);
                self.checkpoint_poll();
                ctx.notify(TallyStep);
            }
            Err(err) => {
                warn!("[{}] poll {} tally failed: {}", "poller".cyan(), self.key, err);
                self.close_poll(ctx, PollStatus::Aborted);
            }
        }
    }

    fn record_tallied_url(&mut self, url: Url, tally: BlockTally) {
        for voter in tally.agree.iter() {
            let entry = self.agreement.entry(*voter).or_default();
            entry.agreed += 1;
            entry.counted += 1;
        }
        for voter in
            tally.disagree.iter().chain(tally.poller_only.iter()).chain(tally.voter_only.iter())
        {
            self.agreement.entry(*voter).or_default().counted += 1;
        }

        let verdict = tally.verdict(self.config.quorum, self.config.vote_margin);
        debug!("[{}] poll {} url {} verdict {:?}", "tally".magenta(), self.key, url, verdict);
        match verdict {
            crate::tally::Verdict::Won => self.counts.agreed += 1,
            crate::tally::Verdict::NoQuorum => self.counts.no_quorum += 1,
            crate::tally::Verdict::TooClose => self.counts.too_close += 1,
            crate::tally::Verdict::LostExtraBlock if self.config.delete_extra_blocks => {
                self.counts.disagreed += 1;
                match self.store.delete(&url) {
                    Ok(()) => self.counts.repaired += 1,
                    Err(err) => {
                        warn!("[{}] cannot delete extra block {}: {}", "poller".cyan(), url, err)
                    }
                }
            }
            verdict => {
                self.counts.disagreed += 1;
                if !self.config.repairs_enabled() {
                    return;
                }
                let candidates: Vec<Id> = tally
                    .repair_candidates()
                    .into_iter()
                    .filter(|id| {
                        self.participants.get(id).map(|p| p.is_active()).unwrap_or(false)
                    })
                    .collect();
                let mut rng = rand::thread_rng();
                let source = choose_source(
                    &mut rng,
                    &candidates,
                    self.config.repair_from_peer_percent,
                    self.store.publisher_down(),
                );
                match source {
                    Some(source) => {
                        self.repairs.offer(url, source);
                    }
                    None => warn!(
                        "[{}] no repair source for {} ({:?})",
                        "poller".cyan(),
                        url,
                        verdict
                    ),
                }
            }
        }
    }

    fn after_tally(&mut self, ctx: &mut Context<Self>) {
        // Every voice has been fully consumed.
        let voted: Vec<Id> = self
            .participants
            .values()
            .filter(|p| p.is_active() && p.has_voted())
            .map(|p| p.id)
            .collect();
        for peer in voted {
            self.drive(peer, PollerEvent::VoiceExhausted);
        }
        if self.repairs.is_idle() {
            self.close_poll(ctx, PollStatus::Complete);
        } else {
            info!(
                "[{}] poll {} entering repair phase, {} outstanding",
                "poller".cyan(),
                self.key,
                self.repairs.outstanding()
            );
            self.status = PollStatus::Repairing;
            self.checkpoint_poll();
            self.dispatch_repairs(ctx);
        }
    }

    fn dispatch_repairs(&mut self, ctx: &mut Context<Self>) {
        while let Some(record) = self.repairs.start_next() {
            match record.source {
                RepairSource::Peer(peer) => {
                    self.send(
                        peer,
                        PollMessage::RepairRequest(RepairRequest {
                            key: self.key,
                            url: record.url.clone(),
                        }),
                    );
                }
                RepairSource::Publisher => match self.store.recrawl(vec![record.url.clone()]) {
                    Ok(()) => self.verify_repair(ctx, record.url.clone()),
                    Err(err) => {
                        warn!("[{}] recrawl of {} failed: {}", "poller".cyan(), record.url, err);
                        self.repairs.fail(&record.url);
                    }
                },
            }
        }
        self.maybe_finish_repairs(ctx);
    }

    /// Re-hashes a repaired URL and re-checks it against the stored votes of
    /// the peers that tallied it. The repair counts only if the new copy
    /// wins outright.
    fn verify_repair(&mut self, ctx: &mut Context<Self>, url: Url) {
        let request = HashRequest {
            poll: self.key,
            store: self.store.clone(),
            algorithm: self.algorithm,
            poller_nonce: self.poller_nonce.clone(),
            voter_nonces: self.voter_nonces(),
            deadline: self.poll_deadline,
        };
        let block = hash_url(&request, &url);
        match bincode::serialize(&block) {
            Ok(bytes) => {
                if let Err(err) = self.hash_tree.insert(url.as_bytes(), bytes) {
                    warn!("[{}] cannot store re-hash of {}: {}", "poller".cyan(), url, err);
                }
            }
            Err(err) => warn!("[{}] cannot encode re-hash of {}: {}", "poller".cyan(), url, err),
        }

        let mut tally = BlockTally::new();
        for participant in self.participants.values() {
            if !participant.is_active() || !participant.has_voted() {
                continue;
            }
            match participant.vote_block(&url) {
                Ok(Some(vote_block)) => {
                    match compare(&block, &vote_block, &participant.id) {
                        Comparison::Agree => tally.agree.push(participant.id),
                        Comparison::Disagree => tally.disagree.push(participant.id),
                        Comparison::Abstain => (),
                    }
                }
                Ok(None) => tally.poller_only.push(participant.id),
                Err(err) => {
                    warn!("[{}] cannot re-check {} for {}: {}", "poller".cyan(), url, participant.id, err)
                }
            }
        }
        let verdict = tally.verdict(self.config.quorum, self.config.vote_margin);
        if verdict == crate::tally::Verdict::Won {
            info!("[{}] poll {} repaired {}", "poller".cyan(), self.key, url);
            self.repairs.complete(&url);
            self.counts.repaired += 1;
        } else {
            warn!(
                "[{}] poll {} repair of {} did not verify: {:?}",
                "poller".cyan(),
                self.key,
                url,
                verdict
            );
            self.repairs.fail(&url);
        }
        self.checkpoint_poll();
        self.maybe_finish_repairs(ctx);
    }

    fn maybe_finish_repairs(&mut self, ctx: &mut Context<Self>) {
        if self.status == PollStatus::Repairing && self.repairs.is_idle() {
            self.close_poll(ctx, PollStatus::Complete);
        }
    }

    fn close_poll(&mut self, _ctx: &mut Context<Self>, status: PollStatus) {
        if self.status.is_terminal() {
            return;
        }
        self.receipt_outcome = match status {
            PollStatus::Complete => ReceiptOutcome::Complete,
            PollStatus::NoQuorum => ReceiptOutcome::NoQuorum,
            PollStatus::Expired => ReceiptOutcome::Expired,
            _ => ReceiptOutcome::Aborted,
        };
        self.status = PollStatus::Closing;
        let _ = self.hasher.do_send(CancelHash { poll: self.key });

        let peers: Vec<Id> = self.participants.keys().cloned().collect();
        for peer in peers.iter() {
            self.drive(*peer, PollerEvent::PollClosing);
        }
        self.status = status;
        info!("[{}] poll {} finished: {:?}", "poller".cyan(), self.key, status);

        // Per-poll storage is gone once the receipt round is out.
        let db = self.db.clone();
        let key = self.key;
        for participant in self.participants.values_mut() {
            if let Err(err) = participant.release(&db, &key) {
                warn!("[{}] cannot release votes of {}: {}", "poller".cyan(), participant.id, err);
            }
        }
        if let Err(err) = self.db.drop_tree(hash_tree_name(&self.key)) {
            warn!("[{}] cannot drop hash tree of poll {}: {}", "poller".cyan(), self.key, err);
        }
        let base = std::path::Path::new(&self.config.state_path);
        if let Err(err) = checkpoint::remove_poll_dir(base, &self.key) {
            warn!("[{}] cannot remove state of poll {}: {}", "poller".cyan(), self.key, err);
        }
        let _ = self.finished.do_send(PollFinished { key: self.key, status });
    }

    fn arm_timers(&mut self, ctx: &mut Context<Self>) {
        if self.config.enable_invitations {
            ctx.run_interval(self.config.time_between_invitations, |act, ctx| {
                act.invitation_round(ctx)
            });
        }
        ctx.run_later(until(self.vote_deadline), |act, ctx| act.on_vote_deadline(ctx));
        ctx.run_later(until(self.poll_deadline), |act, ctx| act.on_poll_deadline(ctx));
    }

    fn on_vote_deadline(&mut self, ctx: &mut Context<Self>) {
        if self.status.is_terminal() || self.vote_deadline_passed {
            return;
        }
        self.vote_deadline_passed = true;
        let laggards: Vec<Id> = self
            .participants
            .values()
            .filter(|p| p.is_active() && !p.has_voted())
            .map(|p| p.id)
            .collect();
        for peer in laggards {
            self.drive(peer, PollerEvent::Deadline);
        }
        // Last chance to start hashing with the acceptances we have.
        self.maybe_schedule_hash(ctx);
        self.maybe_begin_tally(ctx);
    }

    fn on_poll_deadline(&mut self, ctx: &mut Context<Self>) {
        if self.status.is_terminal() {
            return;
        }
        if !self.repairs.is_idle() && !self.extra_time_granted {
            // One bounded extension while repairs are still outstanding.
            self.extra_time_granted = true;
            self.poll_deadline = SystemTime::now() + self.config.extra_poll_time;
            info!(
                "[{}] poll {} extended for {} outstanding repairs",
                "poller".cyan(),
                self.key,
                self.repairs.outstanding()
            );
            self.checkpoint_poll();
            ctx.run_later(until(self.poll_deadline), |act, ctx| act.on_poll_deadline(ctx));
            return;
        }
        self.close_poll(ctx, PollStatus::Expired);
    }
}

impl Actor for PollerSession {
    type Context = Context<Self>;

    fn started(&mut self, _ctx: &mut Context<Self>) {
        debug!("[{}] started session for poll {}", "poller".cyan(), self.key);
    }
}

impl Handler<StartPoll> for PollerSession {
    type Result = ();

    fn handle(&mut self, _msg: StartPoll, ctx: &mut Context<Self>) -> Self::Result {
        if self.resumed {
            self.resume_in_flight(ctx);
            return;
        }
        if self.status != PollStatus::Pending {
            return;
        }
        info!("[{}] calling poll {} on {}", "poller".cyan(), self.key, self.au_id);
        self.status = PollStatus::Inviting;
        self.invite_inner_circle();
        self.arm_timers(ctx);
        self.checkpoint_poll();
    }
}

impl PollerSession {
    fn resume_in_flight(&mut self, ctx: &mut Context<Self>) {
        self.resumed = false;
        info!("[{}] resuming poll {} at {:?}", "poller".cyan(), self.key, self.status);
        match self.status {
            PollStatus::Tallying => {
                // Votes and hashes are durable; the merge restarts from the
                // top with fresh counters.
                self.hash_done = true;
                self.arm_timers(ctx);
                self.begin_tally(ctx);
            }
            PollStatus::Repairing => {
                self.hash_done = true;
                self.arm_timers(ctx);
                self.repairs.reset_active();
                self.dispatch_repairs(ctx);
            }
            PollStatus::Closing => {
                self.close_poll(ctx, PollStatus::Complete);
            }
            status if status.is_terminal() => (),
            _ => {
                // Invitation or vote phase: the hash was not durable beyond
                // its tree, so start it over and keep waiting for votes.
                if let Err(err) = self.hash_tree.clear() {
                    warn!("[{}] cannot clear hash tree of poll {}: {}", "poller".cyan(), self.key, err);
                }
                self.arm_timers(ctx);
                self.maybe_schedule_hash(ctx);
            }
        }
    }
}

impl Handler<StopPoll> for PollerSession {
    type Result = ();

    fn handle(&mut self, _msg: StopPoll, ctx: &mut Context<Self>) -> Self::Result {
        self.close_poll(ctx, PollStatus::Aborted);
    }
}

impl Handler<GetStatus> for PollerSession {
    type Result = StatusReport;

    fn handle(&mut self, _msg: GetStatus, _ctx: &mut Context<Self>) -> Self::Result {
        let tallied = self.counts.agreed
            + self.counts.disagreed
            + self.counts.no_quorum
            + self.counts.too_close;
        StatusReport {
            key: self.key,
            status: self.status,
            participants: self.participants.values().map(|p| (p.id, p.status)).collect(),
            counts: self.counts.clone(),
            outstanding_repairs: self.repairs.outstanding(),
            agreement: util::percent(self.counts.agreed, tallied),
        }
    }
}

impl Handler<Inbound> for PollerSession {
    type Result = ();

    fn handle(&mut self, msg: Inbound, ctx: &mut Context<Self>) -> Self::Result {
        if self.status.is_terminal() {
            return;
        }
        let from = msg.from;
        if !self.participants.contains_key(&from) {
            debug!("[{}] poll {} ignoring message from stranger {}", "poller".cyan(), self.key, from);
            return;
        }
        match msg.message {
            PollMessage::PollAck(ack) => self.handle_ack(ctx, from, ack),
            PollMessage::Nominate(nominate) => self.handle_nominate(from, nominate),
            PollMessage::Vote(vote) => self.handle_vote(ctx, from, vote),
            PollMessage::Repair(repair) => self.handle_repair(ctx, from, repair),
            other => {
                debug!(
                    "[{}] poll {} unexpected {:?} from {}",
                    "poller".cyan(),
                    self.key,
                    other,
                    from
                );
                self.drive(from, PollerEvent::BadMessage);
            }
        }
    }
}

impl PollerSession {
    fn handle_ack(&mut self, ctx: &mut Context<Self>, from: Id, ack: PollAck) {
        if ack.voter != from {
            self.drive(from, PollerEvent::BadMessage);
            return;
        }
        if let Err(err) = self.registry.record_contact(&from) {
            warn!("[{}] cannot record contact with {}: {}", "poller".cyan(), from, err);
        }
        if let Some(p) = self.participants.get_mut(&from) {
            p.ack_effort = ack.ack_effort;
            p.voter_nonce = ack.voter_nonce;
        }
        self.drive(from, PollerEvent::AckReceived { accept: ack.accept });
        if self.accepted_count() >= self.config.target_poll_size() {
            self.maybe_schedule_hash(ctx);
        }
    }

    fn handle_nominate(&mut self, from: Id, nominate: Nominate) {
        if nominate.voter != from {
            self.drive(from, PollerEvent::BadMessage);
            return;
        }
        let nominees: Vec<Id> =
            nominate.nominees.into_iter().filter(|id| *id != self.id).collect();
        if let Some(p) = self.participants.get_mut(&from) {
            p.nominees = nominees.clone();
            p.status = PeerStatus::Nominated;
        }
        self.nominations.insert(from, nominees);
        self.drive(from, PollerEvent::NominateReceived);
    }

    fn handle_vote(&mut self, ctx: &mut Context<Self>, from: Id, vote: Vote) {
        if vote.voter != from {
            self.drive(from, PollerEvent::BadMessage);
            return;
        }
        let recorded = match self.participants.get_mut(&from) {
            Some(p) => p.record_vote(&vote.blocks, vote.complete),
            None => return,
        };
        if let Err(err) = recorded {
            warn!("[{}] cannot store vote of {}: {}", "poller".cyan(), from, err);
            self.drive(from, PollerEvent::BadMessage);
            return;
        }
        if vote.complete {
            debug!(
                "[{}] poll {} vote from {} ({} blocks)",
                "poller".cyan(),
                self.key,
                from,
                vote.blocks.len()
            );
            self.drive(from, PollerEvent::VoteReceived);
            self.maybe_begin_tally(ctx);
        }
    }

    fn handle_repair(&mut self, ctx: &mut Context<Self>, from: Id, repair: Repair) {
        if repair.voter != from {
            self.drive(from, PollerEvent::BadMessage);
            return;
        }
        match self.repairs.active_source(&repair.url) {
            Some(RepairSource::Peer(peer)) if peer == from => (),
            _ => {
                debug!(
                    "[{}] poll {} unsolicited repair of {} from {}",
                    "poller".cyan(),
                    self.key,
                    repair.url,
                    from
                );
                return;
            }
        }
        self.drive(from, PollerEvent::RepairReceived);
        if let Err(err) = self.store.store_repair(&repair.url, &repair.content) {
            warn!("[{}] cannot store repair of {}: {}", "poller".cyan(), repair.url, err);
            self.repairs.fail(&repair.url);
            self.maybe_finish_repairs(ctx);
            return;
        }
        self.verify_repair(ctx, repair.url);
    }
}

impl Handler<HashEvent> for PollerSession {
    type Result = ();

    fn handle(&mut self, msg: HashEvent, ctx: &mut Context<Self>) -> Self::Result {
        if msg.poll != self.key || self.status.is_terminal() {
            return;
        }
        match msg.kind {
            HashEventKind::Block(block) => match bincode::serialize(&block) {
                Ok(bytes) => {
                    if let Err(err) = self.hash_tree.insert(block.url.as_bytes(), bytes) {
                        warn!("[{}] cannot store hash of {}: {}", "poller".cyan(), block.url, err);
                    }
                }
                Err(err) => {
                    warn!("[{}] cannot encode hash of {}: {}", "poller".cyan(), block.url, err)
                }
            },
            HashEventKind::Done(HashOutcome::Completed) => {
                debug!("[{}] poll {} content hash complete", "poller".cyan(), self.key);
                self.hash_done = true;
                self.maybe_begin_tally(ctx);
            }
            HashEventKind::Done(outcome) => {
                warn!("[{}] poll {} content hash failed: {:?}", "poller".cyan(), self.key, outcome);
                self.close_poll(ctx, PollStatus::Expired);
            }
        }
    }
}

impl Handler<TallyStep> for PollerSession {
    type Result = ();

    fn handle(&mut self, _msg: TallyStep, ctx: &mut Context<Self>) -> Self::Result {
        let mut tallier = match self.tallier.take() {
            Some(tallier) => tallier,
            None => return,
        };
        for _ in 0..self.config.hash_slice_size {
            match tallier.next() {
                Ok(Some(step)) => self.record_tallied_url(step.url, step.tally),
                Ok(None) => {
                    self.after_tally(ctx);
                    return;
                }
                Err(err) => {
                    warn!("[{}] poll {} tally aborted: {}", "poller".cyan(), self.key, err);
                    self.close_poll(ctx, PollStatus::Aborted);
                    return;
                }
            }
        }
        // Yield between slices.
        self.tallier = Some(tallier);
        ctx.notify(TallyStep);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::content::MemStore;
    use crate::hasher::make_nonce;
    use crate::peers::{PeerEntry, PeerRegistry};

    use std::sync::Mutex;

    struct Transport {
        sent: Arc<Mutex<Vec<SendMessage>>>,
    }

    impl Actor for Transport {
        type Context = Context<Self>;
    }

    impl Handler<SendMessage> for Transport {
        type Result = ();

        fn handle(&mut self, msg: SendMessage, _ctx: &mut Context<Self>) -> Self::Result {
            self.sent.lock().unwrap().push(msg);
        }
    }

    struct Sink;

    impl Actor for Sink {
        type Context = Context<Self>;
    }

    impl Handler<PollFinished> for Sink {
        type Result = ();

        fn handle(&mut self, _msg: PollFinished, _ctx: &mut Context<Self>) -> Self::Result {}
    }

    struct Fixture {
        session: Addr<PollerSession>,
        sent: Arc<Mutex<Vec<SendMessage>>>,
        peers: Vec<Id>,
        key: PollId,
    }

    fn fixture(peer_count: usize, config: PollConfig) -> Fixture {
        let db = sled::Config::new().temporary(true).open().unwrap();
        let registry = PeerRegistry::open(&db).unwrap();
        let mut peers = vec![];
        for _ in 0..peer_count {
            let id = Id::generate();
            registry.upsert(&PeerEntry::new(id)).unwrap();
            peers.push(id);
        }
        let store = MemStore::new("au-test");
        store.insert("/a", b"alpha");

        let sent = Arc::new(Mutex::new(vec![]));
        let transport = Transport { sent: sent.clone() }.start();
        let finished = Sink.start();
        let hasher = HashService::new(8).start();

        let state = tempfile::tempdir().unwrap();
        let config =
            PollConfig { state_path: state.path().to_string_lossy().to_string(), ..config };

        let key = PollId::generate();
        let spec = PollSpec {
            key,
            poller: Id::generate(),
            au_id: "au-test".to_string(),
            algorithm: HashAlgorithm::Blake3,
            config,
        };
        let session = PollerSession::new(
            spec,
            store,
            db,
            registry,
            hasher,
            transport.recipient(),
            finished.recipient(),
        )
        .unwrap()
        .start();
        // The tempdir must outlive the actor; leak it for the test.
        std::mem::forget(state);
        Fixture { session, sent, peers, key }
    }

    fn sent_polls(sent: &Arc<Mutex<Vec<SendMessage>>>) -> Vec<Id> {
        sent.lock()
            .unwrap()
            .iter()
            .filter_map(|m| match &m.message {
                PollMessage::Poll(_) => Some(m.to),
                _ => None,
            })
            .collect()
    }

    #[actix_rt::test]
    async fn test_start_poll_invites_known_peers() {
        let f = fixture(3, PollConfig::default());
        f.session.send(StartPoll).await.unwrap();

        let invited = sent_polls(&f.sent);
        assert_eq!(invited.len(), 3);
        for peer in f.peers.iter() {
            assert!(invited.contains(peer));
        }
        let report = f.session.send(GetStatus).await.unwrap();
        assert_eq!(report.status, PollStatus::Inviting);
        assert!(report.participants.iter().all(|(_, s)| *s == PeerStatus::Invited));
    }

    #[actix_rt::test]
    async fn test_declined_ack_drops_participant() {
        let f = fixture(2, PollConfig::default());
        f.session.send(StartPoll).await.unwrap();

        let voter = f.peers[0];
        f.session
            .send(Inbound {
                from: voter,
                message: PollMessage::PollAck(PollAck::decline(f.key, voter)),
            })
            .await
            .unwrap();

        let report = f.session.send(GetStatus).await.unwrap();
        let status = report.participants.iter().find(|(id, _)| *id == voter).unwrap().1;
        assert_eq!(status, PeerStatus::Declined);
    }

    #[actix_rt::test]
    async fn test_accept_and_nominate_reach_vote_request() {
        let f = fixture(2, PollConfig::default());
        f.session.send(StartPoll).await.unwrap();

        let voter = f.peers[0];
        let ack = PollAck::accept(f.key, voter, EffortProof::generate(), make_nonce());
        f.session.send(Inbound { from: voter, message: PollMessage::PollAck(ack) }).await.unwrap();

        // Acceptance must be answered with the remaining effort proof.
        let proofs: Vec<Id> = f
            .sent
            .lock()
            .unwrap()
            .iter()
            .filter_map(|m| match &m.message {
                PollMessage::PollProof(_) => Some(m.to),
                _ => None,
            })
            .collect();
        assert_eq!(proofs, vec![voter]);

        let nominate =
            Nominate { key: f.key, voter, nominees: vec![Id::generate()] };
        f.session
            .send(Inbound { from: voter, message: PollMessage::Nominate(nominate) })
            .await
            .unwrap();

        let requests: Vec<Id> = f
            .sent
            .lock()
            .unwrap()
            .iter()
            .filter_map(|m| match &m.message {
                PollMessage::VoteRequest(_) => Some(m.to),
                _ => None,
            })
            .collect();
        assert_eq!(requests, vec![voter]);
    }

    #[actix_rt::test]
    async fn test_malformed_ack_effort_drops_participant() {
        let f = fixture(1, PollConfig::default());
        f.session.send(StartPoll).await.unwrap();

        let voter = f.peers[0];
        let ack = PollAck {
            key: f.key,
            voter,
            accept: true,
            ack_effort: Some(EffortProof(vec![1, 2, 3])),
            voter_nonce: Some(make_nonce()),
        };
        f.session.send(Inbound { from: voter, message: PollMessage::PollAck(ack) }).await.unwrap();

        let report = f.session.send(GetStatus).await.unwrap();
        let status = report.participants.iter().find(|(id, _)| *id == voter).unwrap().1;
        assert_eq!(status, PeerStatus::Dropped);
    }

    #[actix_rt::test]
    async fn test_stop_poll_is_idempotent() {
        let f = fixture(2, PollConfig::default());
        f.session.send(StartPoll).await.unwrap();
        f.session.send(StopPoll).await.unwrap();
        f.session.send(StopPoll).await.unwrap();

        let report = f.session.send(GetStatus).await.unwrap();
        assert_eq!(report.status, PollStatus::Aborted);
    }

    #[actix_rt::test]
    async fn test_messages_from_strangers_are_ignored() {
        let f = fixture(1, PollConfig::default());
        f.session.send(StartPoll).await.unwrap();

        let stranger = Id::generate();
        f.session
            .send(Inbound {
                from: stranger,
                message: PollMessage::PollAck(PollAck::decline(f.key, stranger)),
            })
            .await
            .unwrap();

        let report = f.session.send(GetStatus).await.unwrap();
        assert_eq!(report.participants.len(), 1);
        assert_ne!(report.participants[0].0, stranger);
    }
}
