//! Durable poll state.
//!
//! Each poll owns a directory named by its hex key under the configured
//! state path, holding a `poll.state` file plus one `peer-<hex>.state` per
//! participant, all bincode-encoded. Writes go through a temp file and a
//! rename so a crash mid-write leaves the previous snapshot intact. Vote
//! blocks themselves are not duplicated here; they live in sled trees that
//! survive a restart on their own.

use crate::blocks::Nonce;
use crate::peer_id::{Id, PollId};
use crate::poller::{DropReason, PeerStatus, PollStatus, PollerState};
use crate::repair::RepairQueue;

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

const POLL_FILE: &str = "poll.state";
const PEER_PREFIX: &str = "peer-";
const PEER_SUFFIX: &str = ".state";

#[derive(Debug)]
pub enum Error {
    Io(std::io::Error),
    Bincode(bincode::Error),
    /// A state file or directory name that cannot be decoded.
    Corrupt(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl std::error::Error for Error {}

impl std::convert::From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        Error::Io(error)
    }
}

impl std::convert::From<bincode::Error> for Error {
    fn from(error: bincode::Error) -> Self {
        Error::Bincode(error)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Running URL-level counters, persisted so a resumed poll reports the same
/// totals it had accumulated.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TallyCounts {
    pub agreed: u64,
    pub disagreed: u64,
    pub no_quorum: u64,
    pub too_close: u64,
    pub repaired: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollCheckpoint {
    pub key: PollId,
    pub poller: Id,
    pub au_id: String,
    pub algorithm: String,
    pub poller_nonce: Nonce,
    pub vote_deadline: SystemTime,
    pub poll_deadline: SystemTime,
    pub status: PollStatus,
    pub counts: TallyCounts,
    pub repairs: RepairQueue,
    /// Whether the one-shot deadline extension for outstanding repairs has
    /// already been granted.
    pub extra_time_granted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParticipantCheckpoint {
    pub id: Id,
    pub state: PollerState,
    pub status: PeerStatus,
    pub outer_circle: bool,
    pub voter_nonce: Option<Nonce>,
    pub nominees: Vec<Id>,
    pub vote_complete: bool,
    pub drop_reason: Option<DropReason>,
}

pub fn poll_dir(base: &Path, key: &PollId) -> PathBuf {
    base.join(key.to_hex())
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

pub fn save_poll(base: &Path, checkpoint: &PollCheckpoint) -> Result<()> {
    let dir = poll_dir(base, &checkpoint.key);
    fs::create_dir_all(&dir)?;
    let bytes = bincode::serialize(checkpoint)?;
    write_atomic(&dir.join(POLL_FILE), &bytes)
}

pub fn load_poll(base: &Path, key: &PollId) -> Result<PollCheckpoint> {
    let bytes = fs::read(poll_dir(base, key).join(POLL_FILE))?;
    Ok(bincode::deserialize(&bytes)?)
}

pub fn save_participant(
    base: &Path,
    key: &PollId,
    checkpoint: &ParticipantCheckpoint,
) -> Result<()> {
    let dir = poll_dir(base, key);
    fs::create_dir_all(&dir)?;
    let name = format!("{}{}{}", PEER_PREFIX, checkpoint.id.to_hex(), PEER_SUFFIX);
    let bytes = bincode::serialize(checkpoint)?;
    write_atomic(&dir.join(name), &bytes)
}

pub fn load_participants(base: &Path, key: &PollId) -> Result<Vec<ParticipantCheckpoint>> {
    let dir = poll_dir(base, key);
    let mut participants = vec![];
    for entry in fs::read_dir(&dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        if !name.starts_with(PEER_PREFIX) || !name.ends_with(PEER_SUFFIX) {
            continue;
        }
        let bytes = fs::read(entry.path())?;
        let checkpoint: ParticipantCheckpoint = bincode::deserialize(&bytes)
            .map_err(|_| Error::Corrupt(name.clone()))?;
        participants.push(checkpoint);
    }
    Ok(participants)
}

/// Scans the state path for resumable polls, skipping entries that are not
/// poll directories.
pub fn poll_dirs(base: &Path) -> Result<Vec<PollId>> {
    if !base.exists() {
        return Ok(vec![]);
    }
    let mut keys = vec![];
    for entry in fs::read_dir(base)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if let Ok(key) = PollId::from_hex(&name) {
            if entry.path().join(POLL_FILE).exists() {
                keys.push(key);
            }
        }
    }
    Ok(keys)
}

/// Finished polls leave no state behind.
pub fn remove_poll_dir(base: &Path, key: &PollId) -> Result<()> {
    let dir = poll_dir(base, key);
    if dir.exists() {
        fs::remove_dir_all(&dir)?;
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use std::time::Duration;

    fn poll_checkpoint(key: PollId) -> PollCheckpoint {
        PollCheckpoint {
            key,
            poller: Id::one(),
            au_id: "au-1".to_string(),
            algorithm: "blake3".to_string(),
            poller_nonce: vec![7; 20],
            vote_deadline: SystemTime::UNIX_EPOCH + Duration::from_secs(1000),
            poll_deadline: SystemTime::UNIX_EPOCH + Duration::from_secs(2000),
            status: PollStatus::Tallying,
            counts: TallyCounts { agreed: 3, disagreed: 1, ..TallyCounts::default() },
            repairs: RepairQueue::new(10),
            extra_time_granted: false,
        }
    }

    #[test]
    fn test_poll_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let key = PollId::generate();
        save_poll(dir.path(), &poll_checkpoint(key)).unwrap();
        let loaded = load_poll(dir.path(), &key).unwrap();
        assert_eq!(loaded.au_id, "au-1");
        assert_eq!(loaded.counts.agreed, 3);
        assert_eq!(loaded.status, PollStatus::Tallying);
    }

    #[test]
    fn test_participants_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let key = PollId::generate();
        save_poll(dir.path(), &poll_checkpoint(key)).unwrap();
        for id in [Id::one(), Id::two()].iter() {
            let checkpoint = ParticipantCheckpoint {
                id: *id,
                state: PollerState::TallyVote,
                status: PeerStatus::Voted,
                outer_circle: false,
                voter_nonce: Some(vec![1; 20]),
                nominees: vec![Id::zero()],
                vote_complete: true,
                drop_reason: None,
            };
            save_participant(dir.path(), &key, &checkpoint).unwrap();
        }
        let loaded = load_participants(dir.path(), &key).unwrap();
        assert_eq!(loaded.len(), 2);
        assert!(loaded.iter().all(|p| p.vote_complete));
    }

    #[test]
    fn test_scan_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        let a = PollId::generate();
        let b = PollId::generate();
        save_poll(dir.path(), &poll_checkpoint(a)).unwrap();
        save_poll(dir.path(), &poll_checkpoint(b)).unwrap();
        // A stray directory must not be picked up.
        std::fs::create_dir(dir.path().join("not-a-poll")).unwrap();

        let mut found = poll_dirs(dir.path()).unwrap();
        found.sort();
        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(found, expected);

        remove_poll_dir(dir.path(), &a).unwrap();
        remove_poll_dir(dir.path(), &a).unwrap();
        assert_eq!(poll_dirs(dir.path()).unwrap(), vec![b]);
    }

    #[test]
    fn test_save_overwrites_previous_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let key = PollId::generate();
        let mut checkpoint = poll_checkpoint(key);
        save_poll(dir.path(), &checkpoint).unwrap();
        checkpoint.counts.agreed = 42;
        checkpoint.status = PollStatus::Closing;
        save_poll(dir.path(), &checkpoint).unwrap();
        let loaded = load_poll(dir.path(), &key).unwrap();
        assert_eq!(loaded.counts.agreed, 42);
        assert_eq!(loaded.status, PollStatus::Closing);
    }
}
