//! Poll engine configuration.
//!
//! All tunables are carried in an explicit [PollConfig] threaded through
//! construction; nothing reads global state. The daemon loads a [Settings]
//! file at startup and converts it into a `PollConfig`.

use config::{Config, File};
pub use config::ConfigError;
use serde::Deserialize;

use std::time::Duration;

/// Tunable parameters governing a single poll.
///
/// Durations are stored in seconds in the settings file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollConfig {
    /// Minimum number of agreeing + disagreeing voters required for a verdict.
    pub quorum: usize,
    /// Required winning-side share (percent) to avoid a `TooClose` verdict.
    pub vote_margin: u32,
    /// Target number of outer circle peers gathered from nominations.
    pub target_outer_circle_size: usize,
    /// Invitations sent = target size * this multiplier.
    pub invitation_size_target_multiplier: f64,
    /// Target poll size = quorum * this multiplier (the "excess" over quorum).
    pub target_size_quorum_multiplier: f64,
    /// Delay between follow-up invitation rounds.
    pub time_between_invitations: Duration,
    /// Whether follow-up invitations are sent at all.
    pub enable_invitations: bool,
    /// Whether peers outside the known-peer registry may be admitted from
    /// nominations.
    pub enable_discovery: bool,
    /// Vote deadline = estimated hash duration * multiplier + padding.
    pub vote_duration_multiplier: u32,
    pub vote_duration_padding: Duration,
    /// Poll deadline = vote deadline + estimated hash duration * multiplier +
    /// padding.
    pub tally_duration_multiplier: u32,
    pub tally_duration_padding: Duration,
    /// Estimated wall-clock duration of a full content hash of the AU.
    pub estimated_hash_duration: Duration,
    /// Maximum simultaneously outstanding repairs. Zero disables repairs
    /// entirely; negative means unlimited.
    pub max_repairs: i64,
    /// Probability (percent) of fetching a repair from a disagreeing peer
    /// rather than from the publisher.
    pub repair_from_peer_percent: u32,
    /// Delete a block the quorum says we should not have, instead of
    /// re-fetching it.
    pub delete_extra_blocks: bool,
    /// Minimum recorded agreement (percent) a peer must have before we serve
    /// it repair content.
    pub min_agreement_for_repair: u32,
    /// Number of tolerated block I/O errors while tallying before the whole
    /// poll is aborted.
    pub max_block_error_count: usize,
    /// Extra time the poll may stay open past its deadline while repairs are
    /// outstanding.
    pub extra_poll_time: Duration,
    /// Grace period a voter waits past the poll deadline for a late receipt.
    pub receipt_padding: Duration,
    /// Number of URLs hashed per scheduler time slice.
    pub hash_slice_size: usize,
    /// Directory holding per-poll checkpoint state.
    pub state_path: String,
    /// Preservation groups this node declares membership of; peers with
    /// disjoint groups are filtered out of invitation rounds.
    pub groups: Vec<String>,
}

impl Default for PollConfig {
    fn default() -> Self {
        PollConfig {
            quorum: 5,
            vote_margin: 75,
            target_outer_circle_size: 10,
            invitation_size_target_multiplier: 1.5,
            target_size_quorum_multiplier: 1.25,
            time_between_invitations: Duration::from_secs(120),
            enable_invitations: true,
            enable_discovery: true,
            vote_duration_multiplier: 4,
            vote_duration_padding: Duration::from_secs(300),
            tally_duration_multiplier: 5,
            tally_duration_padding: Duration::from_secs(300),
            estimated_hash_duration: Duration::from_secs(60),
            max_repairs: 1000,
            repair_from_peer_percent: 50,
            delete_extra_blocks: false,
            min_agreement_for_repair: 50,
            max_block_error_count: 10,
            extra_poll_time: Duration::from_secs(1200),
            receipt_padding: Duration::from_secs(300),
            hash_slice_size: 64,
            state_path: "state".to_string(),
            groups: vec![],
        }
    }
}

impl PollConfig {
    /// The number of participants (agreeing or expected to agree) at which
    /// follow-up invitations stop.
    pub fn target_poll_size(&self) -> usize {
        (self.quorum as f64 * self.target_size_quorum_multiplier).ceil() as usize
    }

    /// Upper bound on the number of peers invited in one round.
    pub fn invitation_size(&self) -> usize {
        (self.target_poll_size() as f64 * self.invitation_size_target_multiplier).ceil() as usize
    }

    /// Deadline by which all votes must have been received.
    pub fn vote_duration(&self) -> Duration {
        self.estimated_hash_duration * self.vote_duration_multiplier + self.vote_duration_padding
    }

    /// Total poll duration, from call to receipt.
    pub fn poll_duration(&self) -> Duration {
        self.vote_duration()
            + self.estimated_hash_duration * self.tally_duration_multiplier
            + self.tally_duration_padding
    }

    pub fn repairs_enabled(&self) -> bool {
        self.max_repairs != 0
    }
}

// For explanation, see issue: https://github.com/serde-rs/serde/issues/368
fn default_algorithm() -> String {
    "blake3".to_string()
}
fn default_groups() -> Vec<String> {
    vec![]
}
fn default_state_path() -> String {
    match dirs::home_dir() {
        Some(home) => home.join(".custodia").to_string_lossy().to_string(),
        None => ".custodia".to_string(),
    }
}

/// Daemon-level settings loaded from a configuration file.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Settings {
    /// Identity keypair (hex) of this node; generated when absent.
    pub keypair: Option<String>,
    /// Preservation groups this node declares membership of.
    #[serde(default = "default_groups")]
    pub groups: Vec<String>,
    #[serde(default = "default_algorithm")]
    pub hash_algorithm: String,
    #[serde(default = "default_state_path")]
    pub state_path: String,
}

impl Settings {
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let mut settings = Config::new();
        settings.merge(File::with_name(path))?;
        settings.try_into()
    }
}
