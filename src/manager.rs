//! The poll manager: owns every live session and the dispatch boundary.
//!
//! The transport hands the manager raw `(from, message)` pairs; the manager
//! routes them to the owning poller or voter session by poll key, creating
//! voter sessions on the fly when an invitation for a known AU arrives. On
//! startup it scans the state directory and resumes checkpointed polls.

use crate::checkpoint;
use crate::config::PollConfig;
use crate::content::ContentStore;
use crate::hasher::{HashAlgorithm, HashService};
use crate::message::PollAck;
use crate::peer_id::{Id, PollId};
use crate::poller::{
    GetStatus, PollFinished, PollSpec, PollStatus, PollerSession, StartPoll, StatusReport,
    StopPoll,
};
use crate::protocol::{Inbound, PollMessage, SendMessage};
use crate::voter::{VoterFinished, VoterSession};
use crate::{Error, Result};

use actix::{Actor, Addr, AsyncContext, Context, Handler, Recipient, ResponseFuture};
use colored::Colorize;
use tracing::{debug, info, warn};

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Registers the content store of one archival unit; polls can only be
/// called or answered for registered AUs.
#[derive(Message)]
#[rtype(result = "()")]
pub struct RegisterAu {
    pub store: Arc<dyn ContentStore>,
}

/// Calls a new poll on an AU. Construction errors are fatal for the call
/// and surface here; a successfully created poll runs autonomously.
#[derive(Debug, Clone, Message)]
#[rtype(result = "crate::Result<PollId>")]
pub struct CallPoll {
    pub au_id: String,
}

/// Aborts one poll; unknown keys are ignored.
#[derive(Debug, Clone, Message)]
#[rtype(result = "()")]
pub struct AbortPoll {
    pub key: PollId,
}

#[derive(Debug, Clone, Message)]
#[rtype(result = "Option<StatusReport>")]
pub struct GetPollReport {
    pub key: PollId,
}

#[derive(Debug, Clone, Message)]
#[rtype(result = "PollDirectory")]
pub struct ListPolls;

/// Operator-facing overview of everything the manager tracks.
#[derive(Debug, Clone, MessageResponse)]
pub struct PollDirectory {
    /// Polls this node called, still running.
    pub calling: Vec<PollId>,
    /// Polls this node is voting in.
    pub voting: Vec<PollId>,
    /// Terminal outcomes of past called polls.
    pub finished: Vec<(PollId, PollStatus)>,
}

pub struct PollManager {
    id: Id,
    config: PollConfig,
    algorithm: HashAlgorithm,
    db: sled::Db,
    registry: crate::peers::PeerRegistry,
    hasher: Addr<HashService>,
    transport: Recipient<SendMessage>,
    stores: HashMap<String, Arc<dyn ContentStore>>,
    pollers: HashMap<PollId, Addr<PollerSession>>,
    voters: HashMap<PollId, Addr<VoterSession>>,
    finished: Vec<(PollId, PollStatus)>,
}

/// Poll keys are the hash of the caller, the AU and the call time.
fn make_poll_id(poller: &Id, au_id: &str) -> PollId {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let mut bytes = vec![];
    bytes.extend_from_slice(poller.as_bytes());
    bytes.extend_from_slice(au_id.as_bytes());
    bytes.extend_from_slice(&nanos.to_be_bytes());
    Id::new(&bytes)
}

impl PollManager {
    pub fn new(
        id: Id,
        config: PollConfig,
        algorithm: HashAlgorithm,
        db: sled::Db,
        hasher: Addr<HashService>,
        transport: Recipient<SendMessage>,
    ) -> Result<Self> {
        let registry = crate::peers::PeerRegistry::open(&db)?;
        Ok(PollManager {
            id,
            config,
            algorithm,
            db,
            registry,
            hasher,
            transport,
            stores: HashMap::new(),
            pollers: HashMap::new(),
            voters: HashMap::new(),
            finished: vec![],
        })
    }

    pub fn registry(&self) -> crate::peers::PeerRegistry {
        self.registry.clone()
    }

    fn call_poll(&mut self, ctx: &mut Context<Self>, au_id: &str) -> Result<PollId> {
        let store = self
            .stores
            .get(au_id)
            .cloned()
            .ok_or_else(|| Error::PollConstruction(format!("unknown AU {}", au_id)))?;
        let key = make_poll_id(&self.id, au_id);
        let spec = PollSpec {
            key,
            poller: self.id,
            au_id: au_id.to_string(),
            algorithm: self.algorithm,
            config: self.config.clone(),
        };
        let session = PollerSession::new(
            spec,
            store,
            self.db.clone(),
            self.registry.clone(),
            self.hasher.clone(),
            self.transport.clone(),
            ctx.address().recipient(),
        )
        .map_err(|err| Error::PollConstruction(format!("{}", err)))?
        .start();
        session.do_send(StartPoll);
        self.pollers.insert(key, session);
        info!("[{}] called poll {} on {}", "manager".green(), key, au_id);
        Ok(key)
    }

    /// An invitation for an unknown poll: answer it by spinning up a voter
    /// session, or decline when this node cannot serve the poll.
    fn accept_invitation(&mut self, ctx: &mut Context<Self>, from: Id, poll: &crate::message::Poll) {
        if poll.poller != from {
            debug!("[{}] invitation with forged poller id from {}", "manager".green(), from);
            return;
        }
        let store = match self.stores.get(&poll.au_id) {
            Some(store) => store.clone(),
            None => {
                info!(
                    "[{}] declining poll {}: AU {} not held",
                    "manager".green(),
                    poll.key,
                    poll.au_id
                );
                let _ = self.transport.do_send(SendMessage {
                    to: from,
                    message: PollMessage::PollAck(PollAck::decline(poll.key, self.id)),
                });
                return;
            }
        };
        match VoterSession::from_poll(
            self.id,
            poll,
            self.config.clone(),
            store,
            self.db.clone(),
            self.registry.clone(),
            self.hasher.clone(),
            self.transport.clone(),
            ctx.address().recipient(),
        ) {
            Ok(session) => {
                self.voters.insert(poll.key, session.start());
            }
            Err(err) => {
                warn!("[{}] cannot join poll {}: {}", "manager".green(), poll.key, err);
                let _ = self.transport.do_send(SendMessage {
                    to: from,
                    message: PollMessage::PollAck(PollAck::decline(poll.key, self.id)),
                });
            }
        }
    }

    /// Reloads every checkpointed poll from the state directory.
    fn restore(&mut self, ctx: &mut Context<Self>) {
        let base_path = self.config.state_path.clone();
        let base = Path::new(&base_path);
        let keys = match checkpoint::poll_dirs(base) {
            Ok(keys) => keys,
            Err(err) => {
                warn!("[{}] cannot scan state directory: {}", "manager".green(), err);
                return;
            }
        };
        for key in keys {
            if let Err(err) = self.restore_poll(ctx, base, &key) {
                warn!("[{}] cannot restore poll {}: {}", "manager".green(), key, err);
            }
        }
    }

    fn restore_poll(&mut self, ctx: &mut Context<Self>, base: &Path, key: &PollId) -> Result<()> {
        let poll = checkpoint::load_poll(base, key)?;
        let peers = checkpoint::load_participants(base, key)?;
        let store = self
            .stores
            .get(&poll.au_id)
            .cloned()
            .ok_or_else(|| Error::PollConstruction(format!("AU {} no longer held", poll.au_id)))?;
        let session = PollerSession::resume(
            poll,
            peers,
            self.config.clone(),
            store,
            self.db.clone(),
            self.registry.clone(),
            self.hasher.clone(),
            self.transport.clone(),
            ctx.address().recipient(),
        )
        .map_err(|err| Error::PollConstruction(format!("{}", err)))?
        .start();
        session.do_send(StartPoll);
        self.pollers.insert(*key, session);
        info!("[{}] restored poll {}", "manager".green(), key);
        Ok(())
    }
}

impl Actor for PollManager {
    type Context = Context<Self>;

    fn started(&mut self, ctx: &mut Context<Self>) {
        info!("[{}] started as {}", "manager".green(), self.id);
        self.restore(ctx);
    }
}

impl Handler<RegisterAu> for PollManager {
    type Result = ();

    fn handle(&mut self, msg: RegisterAu, ctx: &mut Context<Self>) -> Self::Result {
        debug!("[{}] registered AU {}", "manager".green(), msg.store.au_id());
        self.stores.insert(msg.store.au_id(), msg.store);
        // AUs may be registered after startup restored nothing for them.
        self.restore(ctx);
    }
}

impl Handler<CallPoll> for PollManager {
    type Result = Result<PollId>;

    fn handle(&mut self, msg: CallPoll, ctx: &mut Context<Self>) -> Self::Result {
        self.call_poll(ctx, &msg.au_id)
    }
}

impl Handler<AbortPoll> for PollManager {
    type Result = ();

    fn handle(&mut self, msg: AbortPoll, _ctx: &mut Context<Self>) -> Self::Result {
        if let Some(session) = self.pollers.get(&msg.key) {
            session.do_send(StopPoll);
        }
    }
}

impl Handler<Inbound> for PollManager {
    type Result = ();

    fn handle(&mut self, msg: Inbound, ctx: &mut Context<Self>) -> Self::Result {
        let key = msg.message.key();
        if let Some(session) = self.pollers.get(&key) {
            session.do_send(msg);
            return;
        }
        if let Some(session) = self.voters.get(&key) {
            session.do_send(msg);
            return;
        }
        match &msg.message {
            PollMessage::Poll(poll) => {
                let poll = poll.clone();
                self.accept_invitation(ctx, msg.from, &poll);
            }
            other => debug!(
                "[{}] dropping {:?} for unknown poll {}",
                "manager".green(),
                other,
                key
            ),
        }
    }
}

impl Handler<PollFinished> for PollManager {
    type Result = ();

    fn handle(&mut self, msg: PollFinished, _ctx: &mut Context<Self>) -> Self::Result {
        if self.pollers.remove(&msg.key).is_some() {
            self.finished.push((msg.key, msg.status));
        }
    }
}

impl Handler<VoterFinished> for PollManager {
    type Result = ();

    fn handle(&mut self, msg: VoterFinished, _ctx: &mut Context<Self>) -> Self::Result {
        self.voters.remove(&msg.key);
    }
}

impl Handler<GetPollReport> for PollManager {
    type Result = ResponseFuture<Option<StatusReport>>;

    fn handle(&mut self, msg: GetPollReport, _ctx: &mut Context<Self>) -> Self::Result {
        let session = self.pollers.get(&msg.key).cloned();
        Box::pin(async move {
            match session {
                Some(session) => session.send(GetStatus).await.ok(),
                None => None,
            }
        })
    }
}

impl Handler<ListPolls> for PollManager {
    type Result = PollDirectory;

    fn handle(&mut self, _msg: ListPolls, _ctx: &mut Context<Self>) -> Self::Result {
        PollDirectory {
            calling: self.pollers.keys().cloned().collect(),
            voting: self.voters.keys().cloned().collect(),
            finished: self.finished.clone(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::content::MemStore;
    use crate::message::EffortProof;

    use std::sync::Mutex;
    use std::time::Duration;

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

    struct Fixture {
        manager: Addr<PollManager>,
        sent: Arc<Mutex<Vec<SendMessage>>>,
        id: Id,
    }

    fn fixture() -> Fixture {
        let db = sled::Config::new().temporary(true).open().unwrap();
        let sent = Arc::new(Mutex::new(vec![]));
        let transport = Transport { sent: sent.clone() }.start();
        let hasher = HashService::new(8).start();
        let state = tempfile::tempdir().unwrap();
        let config = PollConfig {
            state_path: state.path().to_string_lossy().to_string(),
            ..PollConfig::default()
        };
        std::mem::forget(state);

        let id = Id::generate();
        let manager = PollManager::new(
            id,
            config,
            HashAlgorithm::Blake3,
            db,
            hasher,
            transport.recipient(),
        )
        .unwrap()
        .start();
        Fixture { manager, sent, id }
    }

    fn invitation(key: PollId, poller: Id, au_id: &str) -> crate::message::Poll {
        let now = SystemTime::now();
        crate::message::Poll {
            key,
            poller,
            au_id: au_id.to_string(),
            version: crate::message::CURRENT_VERSION,
            algorithm: "blake3".to_string(),
            intro_effort: EffortProof::generate(),
            poller_nonce: crate::hasher::make_nonce(),
            vote_deadline: now + Duration::from_secs(300),
            poll_deadline: now + Duration::from_secs(600),
        }
    }

    #[actix_rt::test]
    async fn test_call_poll_requires_registered_au() {
        let f = fixture();
        let result =
            f.manager.send(CallPoll { au_id: "au-test".to_string() }).await.unwrap();
        assert!(result.is_err());

        let store = MemStore::new("au-test");
        store.insert("/a", b"alpha");
        f.manager.send(RegisterAu { store }).await.unwrap();

        let key =
            f.manager.send(CallPoll { au_id: "au-test".to_string() }).await.unwrap().unwrap();
        let report = f.manager.send(GetPollReport { key }).await.unwrap().unwrap();
        assert_eq!(report.status, PollStatus::Inviting);
    }

    #[actix_rt::test]
    async fn test_invitation_creates_voter_session() {
        let f = fixture();
        let store = MemStore::new("au-test");
        store.insert("/a", b"alpha");
        f.manager.send(RegisterAu { store }).await.unwrap();

        let poller = Id::generate();
        let key = PollId::generate();
        f.manager
            .send(Inbound {
                from: poller,
                message: PollMessage::Poll(invitation(key, poller, "au-test")),
            })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let directory = f.manager.send(ListPolls).await.unwrap();
        assert_eq!(directory.voting, vec![key]);
        let accepted = f.sent.lock().unwrap().iter().any(|m| match &m.message {
            PollMessage::PollAck(ack) => ack.accept,
            _ => false,
        });
        assert!(accepted);
    }

    #[actix_rt::test]
    async fn test_invitation_for_unknown_au_is_declined() {
        let f = fixture();
        let poller = Id::generate();
        let key = PollId::generate();
        f.manager
            .send(Inbound {
                from: poller,
                message: PollMessage::Poll(invitation(key, poller, "au-absent")),
            })
            .await
            .unwrap();

        let declined = f.sent.lock().unwrap().iter().any(|m| match &m.message {
            PollMessage::PollAck(ack) => !ack.accept && ack.key == key && ack.voter == f.id,
            _ => false,
        });
        assert!(declined);
        let directory = f.manager.send(ListPolls).await.unwrap();
        assert!(directory.voting.is_empty());
    }

    #[actix_rt::test]
    async fn test_messages_for_unknown_polls_are_dropped() {
        let f = fixture();
        // Must not panic or create a session.
        f.manager
            .send(Inbound {
                from: Id::generate(),
                message: PollMessage::VoteRequest(crate::message::VoteRequest {
                    key: PollId::generate(),
                }),
            })
            .await
            .unwrap();
        let directory = f.manager.send(ListPolls).await.unwrap();
        assert!(directory.calling.is_empty() && directory.voting.is_empty());
    }
}
