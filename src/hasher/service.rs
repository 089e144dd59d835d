//! The scheduler boundary: bulk content hashing as a time-sliced job.
//!
//! Hashing a whole archival unit is the one operation expected to take real
//! wall-clock time, so it never runs on the message dispatch path. A session
//! hands the [HashService] a [ScheduleHash]; the service walks the AU's URL
//! set a slice at a time through a self-notify loop, emitting one
//! [HashEvent] per block and a final completion event. Jobs are cancellable
//! and respect the poll deadline.

use crate::blocks::{HashBlock, HashVersion, Nonce, Url};
use crate::content::ContentStore;
use crate::peer_id::{Id, PollId};

use super::digest::{challenge_digest, plain_digest, HashAlgorithm};

use actix::{Actor, AsyncContext, Context, Handler, Recipient};
use colored::Colorize;
use tracing::{debug, info, warn};

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::SystemTime;

/// Everything needed to hash one AU for one poll.
#[derive(Clone)]
pub struct HashRequest {
    pub poll: PollId,
    pub store: Arc<dyn ContentStore>,
    pub algorithm: HashAlgorithm,
    pub poller_nonce: Nonce,
    /// One (voter, nonce) pair per invited voter; each yields a challenge
    /// digest in every emitted block.
    pub voter_nonces: Vec<(Id, Nonce)>,
    pub deadline: SystemTime,
}

/// Reserves hashing time for a poll. The result is `false` when no time can
/// be reserved before the deadline (the caller ends the poll with `NoTime`).
#[derive(Clone, Message)]
#[rtype(result = "bool")]
pub struct ScheduleHash {
    pub request: HashRequest,
    pub events: Recipient<HashEvent>,
}

/// Cancels an outstanding hash job. Idempotent.
#[derive(Debug, Clone, Message)]
#[rtype(result = "()")]
pub struct CancelHash {
    pub poll: PollId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum HashOutcome {
    Completed,
    /// The deadline passed while blocks were still unhashed.
    Timeout,
    Aborted,
}

#[derive(Clone, Message)]
#[rtype(result = "()")]
pub struct HashEvent {
    pub poll: PollId,
    pub kind: HashEventKind,
}

#[derive(Clone)]
pub enum HashEventKind {
    /// One URL's digests are ready.
    Block(HashBlock),
    /// The job finished; no further events follow.
    Done(HashOutcome),
}

struct Job {
    request: HashRequest,
    events: Recipient<HashEvent>,
    urls: VecDeque<Url>,
}

/// Hashes one URL: every preserved version, plain digest plus one challenge
/// digest per invited voter. A repository read error yields a single
/// `hash_error` version, which tallies as an abstention.
pub fn hash_url(request: &HashRequest, url: &Url) -> HashBlock {
    let mut block = HashBlock::new(url.clone());
    match request.store.versions(url) {
        Ok(versions) => {
            let mut offset = 0u64;
            for content in versions.iter() {
                let mut challenges = BTreeMap::new();
                for (voter, nonce) in request.voter_nonces.iter() {
                    let d = challenge_digest(
                        request.algorithm,
                        &request.poller_nonce,
                        nonce,
                        content,
                    );
                    challenges.insert(*voter, d);
                }
                block.versions.push(HashVersion {
                    plain: plain_digest(request.algorithm, content),
                    challenges,
                    offset,
                    size: content.len() as u64,
                    hash_error: false,
                });
                offset += content.len() as u64;
            }
        }
        Err(err) => {
            warn!("[{}] read error hashing {}: {}", "hasher".blue(), url, err);
            block.versions.push(HashVersion {
                plain: crate::blocks::Digest(vec![]),
                challenges: BTreeMap::new(),
                offset: 0,
                size: 0,
                hash_error: true,
            });
        }
    }
    block
}

/// The hashing scheduler.
pub struct HashService {
    /// URLs hashed per time slice.
    slice_size: usize,
    jobs: HashMap<PollId, Job>,
}

impl HashService {
    pub fn new(slice_size: usize) -> Self {
        HashService { slice_size, jobs: HashMap::new() }
    }
}

impl Actor for HashService {
    type Context = Context<Self>;

    fn started(&mut self, _ctx: &mut Context<Self>) {
        debug!("started hash service");
    }
}

impl Handler<ScheduleHash> for HashService {
    type Result = bool;

    fn handle(&mut self, msg: ScheduleHash, ctx: &mut Context<Self>) -> Self::Result {
        let poll = msg.request.poll;
        if SystemTime::now() >= msg.request.deadline {
            info!("[{}] no time to hash before deadline for poll {}", "hasher".blue(), poll);
            return false;
        }
        let urls = match msg.request.store.urls() {
            Ok(urls) => urls,
            Err(err) => {
                warn!("[{}] cannot enumerate AU for poll {}: {}", "hasher".blue(), poll, err);
                return false;
            }
        };
        info!("[{}] scheduled hash of {} urls for poll {}", "hasher".blue(), urls.len(), poll);
        self.jobs.insert(poll, Job { request: msg.request, events: msg.events, urls: urls.into() });
        ctx.notify(Slice { poll });
        true
    }
}

impl Handler<CancelHash> for HashService {
    type Result = ();

    fn handle(&mut self, msg: CancelHash, _ctx: &mut Context<Self>) -> Self::Result {
        if let Some(job) = self.jobs.remove(&msg.poll) {
            debug!("[{}] cancelled hash job for poll {}", "hasher".blue(), msg.poll);
            let _ = job
                .events
                .do_send(HashEvent { poll: msg.poll, kind: HashEventKind::Done(HashOutcome::Aborted) });
        }
    }
}

#[derive(Debug, Clone, Message)]
#[rtype(result = "()")]
struct Slice {
    poll: PollId,
}

impl Handler<Slice> for HashService {
    type Result = ();

    fn handle(&mut self, msg: Slice, ctx: &mut Context<Self>) -> Self::Result {
        let slice_size = self.slice_size;
        let outcome = match self.jobs.get_mut(&msg.poll) {
            // Cancelled in the meantime
            None => return,
            Some(job) => {
                if SystemTime::now() >= job.request.deadline {
                    Some(HashOutcome::Timeout)
                } else {
                    let mut finished = None;
                    for _ in 0..slice_size {
                        match job.urls.pop_front() {
                            Some(url) => {
                                let block = hash_url(&job.request, &url);
                                let _ = job.events.do_send(HashEvent {
                                    poll: msg.poll,
                                    kind: HashEventKind::Block(block),
                                });
                            }
                            None => {
                                finished = Some(HashOutcome::Completed);
                                break;
                            }
                        }
                    }
                    finished
                }
            }
        };
        match outcome {
            Some(outcome) => {
                let job = self.jobs.remove(&msg.poll).unwrap();
                let _ = job
                    .events
                    .do_send(HashEvent { poll: msg.poll, kind: HashEventKind::Done(outcome) });
            }
            // Yield to other polls between slices.
            None => ctx.notify(Slice { poll: msg.poll }),
        }
    }
}
