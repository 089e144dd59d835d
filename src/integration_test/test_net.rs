//! In-process network harness: one manager per test node, wired together
//! through a router actor so every outbound message is delivered as an
//! inbound one on the destination node.

use crate::config::PollConfig;
use crate::content::MemStore;
use crate::hasher::{HashAlgorithm, HashService};
use crate::manager::{PollManager, RegisterAu};
use crate::peer_id::Id;
use crate::peers::PeerRegistry;
use crate::protocol::{Inbound, SendMessage};

use actix::{Actor, Addr, Context, Handler, Recipient};

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Delivers every outbound message to the destination node's manager.
pub struct Router {
    managers: HashMap<Id, Recipient<Inbound>>,
}

impl Router {
    pub fn new() -> Self {
        Router { managers: HashMap::new() }
    }
}

impl Actor for Router {
    type Context = Context<Self>;
}

#[derive(Message)]
#[rtype(result = "()")]
pub struct Join {
    pub id: Id,
    pub manager: Recipient<Inbound>,
}

#[derive(Message)]
#[rtype(result = "()")]
pub struct Routed {
    pub from: Id,
    pub send: SendMessage,
}

impl Handler<Join> for Router {
    type Result = ();

    fn handle(&mut self, msg: Join, _ctx: &mut Context<Self>) -> Self::Result {
        self.managers.insert(msg.id, msg.manager);
    }
}

impl Handler<Routed> for Router {
    type Result = ();

    fn handle(&mut self, msg: Routed, _ctx: &mut Context<Self>) -> Self::Result {
        if let Some(manager) = self.managers.get(&msg.send.to) {
            let _ = manager.do_send(Inbound { from: msg.from, message: msg.send.message });
        }
    }
}

/// The per-node outbound endpoint: stamps the sender id onto every message.
pub struct Link {
    pub from: Id,
    pub router: Addr<Router>,
}

impl Actor for Link {
    type Context = Context<Self>;
}

impl Handler<SendMessage> for Link {
    type Result = ();

    fn handle(&mut self, msg: SendMessage, _ctx: &mut Context<Self>) -> Self::Result {
        self.router.do_send(Routed { from: self.from, send: msg });
    }
}

pub struct TestNode {
    pub id: Id,
    pub manager: Addr<PollManager>,
    pub registry: PeerRegistry,
    pub store: Arc<MemStore>,
}

/// Short deadlines so a full poll runs in well under a second of real work,
/// and a 55% margin so three voters out of five carry a verdict.
pub fn poll_test_config(state_path: &Path) -> PollConfig {
    PollConfig {
        quorum: 5,
        vote_margin: 55,
        target_size_quorum_multiplier: 1.0,
        time_between_invitations: Duration::from_millis(200),
        estimated_hash_duration: Duration::from_millis(100),
        vote_duration_multiplier: 1,
        vote_duration_padding: Duration::from_secs(5),
        tally_duration_multiplier: 1,
        tally_duration_padding: Duration::from_secs(5),
        repair_from_peer_percent: 100,
        min_agreement_for_repair: 0,
        state_path: state_path.to_string_lossy().to_string(),
        ..PollConfig::default()
    }
}

pub async fn build_node(router: &Addr<Router>, au_id: &str, config: PollConfig) -> TestNode {
    let id = Id::generate();
    let db = sled::Config::new().temporary(true).open().unwrap();
    let hasher = HashService::new(16).start();
    let link = Link { from: id, router: router.clone() }.start();
    let manager =
        PollManager::new(id, config, HashAlgorithm::Blake3, db, hasher, link.recipient())
            .unwrap();
    let registry = manager.registry();
    let manager = manager.start();
    let store = MemStore::new(au_id);
    manager.send(RegisterAu { store: store.clone() }).await.unwrap();
    router.send(Join { id, manager: manager.clone().recipient() }).await.unwrap();
    TestNode { id, manager, registry, store }
}
