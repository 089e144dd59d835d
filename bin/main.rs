use tracing::{debug, info};
use tracing_subscriber;

use actix::{Actor, Context, Handler};
use clap::{value_t, App, Arg};
use ed25519_dalek::Keypair;
use rand::rngs::OsRng;

use custodia::config::{PollConfig, Settings};
use custodia::hasher::{HashAlgorithm, HashService};
use custodia::manager::PollManager;
use custodia::peer_id::Id;
use custodia::protocol::SendMessage;
use custodia::Result;

use std::path::Path;
use std::str::FromStr;

/// Placeholder transport: the wire layer is a separate component and is
/// wired in through `Recipient<SendMessage>`; until it is attached every
/// outbound message is logged and dropped.
struct LoggingTransport;

impl Actor for LoggingTransport {
    type Context = Context<Self>;
}

impl Handler<SendMessage> for LoggingTransport {
    type Result = ();

    fn handle(&mut self, msg: SendMessage, _ctx: &mut Context<Self>) -> Self::Result {
        debug!("outbound to {}: {:?}", msg.to, msg.message);
    }
}

fn node_identity(settings: &Settings) -> Result<Id> {
    let keypair = match &settings.keypair {
        Some(keypair_hex) => {
            let bytes = hex::decode(keypair_hex)
                .map_err(|err| custodia::Error::Keypair(format!("{}", err)))?;
            Keypair::from_bytes(&bytes)
                .map_err(|err| custodia::Error::Keypair(format!("{}", err)))?
        }
        None => {
            let mut csprng = OsRng {};
            let keypair = Keypair::generate(&mut csprng);
            info!("generated keypair {}", hex::encode(keypair.to_bytes()));
            keypair
        }
    };
    Ok(Id::new(keypair.public.as_bytes()))
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_level(false)
        .with_target(false)
        .without_time()
        .compact()
        .with_max_level(tracing::Level::INFO)
        .init();

    let matches = App::new("custodia")
        .version("0.1")
        .about("Runs a custodia preservation audit node")
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("CONFIG")
                .takes_value(true)
                .required(true),
        )
        .arg(
            Arg::with_name("state-path")
                .short("s")
                .long("state-path")
                .value_name("STATE_PATH")
                .takes_value(true)
                .required(false),
        )
        .get_matches();

    let config_path = value_t!(matches.value_of("config"), String).unwrap_or_else(|e| e.exit());
    let mut settings = Settings::load(&config_path)?;
    if let Some(state_path) = matches.value_of("state-path") {
        settings.state_path = state_path.to_string();
    }

    let node_id = node_identity(&settings)?;
    info!("node {} is starting, groups {:?}", node_id, settings.groups);

    let algorithm = HashAlgorithm::from_str(&settings.hash_algorithm)?;
    let config = PollConfig {
        state_path: settings.state_path.clone(),
        groups: settings.groups.clone(),
        ..PollConfig::default()
    };
    let db_path = Path::new(&settings.state_path).join("custodia.sled");

    let sys = actix::System::new();
    sys.block_on(async move {
        let db = sled::open(db_path).unwrap();
        let hasher = HashService::new(config.hash_slice_size).start();
        let transport = LoggingTransport.start();
        let manager =
            PollManager::new(node_id, config, algorithm, db, hasher, transport.recipient())
                .unwrap();
        let _manager = manager.start();

        let sig = if cfg!(unix) {
            use futures::future::FutureExt;
            use tokio::signal::unix::{signal, SignalKind};

            let mut sigint = signal(SignalKind::interrupt()).unwrap();
            let mut sigterm = signal(SignalKind::terminate()).unwrap();

            futures::select! {
                _ = sigint.recv().fuse() => "SIGINT",
                _ = sigterm.recv().fuse() => "SIGTERM"
            }
        } else {
            tokio::signal::ctrl_c().await.unwrap();
            "Ctrl+C"
        };
        info!("got {}, stopping...", sig);

        actix::System::current().stop();
    });
    sys.run().unwrap();

    Ok(())
}
