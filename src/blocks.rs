//! Vote and hash block data model.
//!
//! A poll compares content one URL at a time. Each URL may carry several
//! preserved versions; every version is identified by a plain (content-only)
//! digest and a challenge digest computed over both parties' nonces and the
//! content, so a peer cannot answer with a precomputed hash.

use crate::peer_id::Id;

use std::collections::BTreeMap;

/// URLs are the tally keys; blocks are merged in lexicographic URL order.
pub type Url = String;

/// Per-peer secret random bytes mixed into the challenge digest.
pub type Nonce = Vec<u8>;

/// A content digest, sized by the poll's hash algorithm.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Digest(pub Vec<u8>);

impl std::fmt::Debug for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", hex::encode(&self.0))
    }
}

/// One preserved version of a URL as reported by a voter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockVersion {
    pub plain: Digest,
    pub challenge: Digest,
    pub offset: u64,
    pub size: u64,
    /// An abstention marker: the voter failed to hash this version and it
    /// must count for neither side.
    pub hash_error: bool,
}

/// One voter's per-URL digest record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteBlock {
    pub url: Url,
    pub versions: Vec<BlockVersion>,
}

impl VoteBlock {
    pub fn new(url: Url) -> Self {
        VoteBlock { url, versions: vec![] }
    }
}

/// One preserved version of a URL on the poller's side. The challenge digest
/// depends on the voter's nonce, so one digest is kept per invited voter,
/// computed in a single pass over the content and reused across the tally.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HashVersion {
    pub plain: Digest,
    pub challenges: BTreeMap<Id, Digest>,
    pub offset: u64,
    pub size: u64,
    pub hash_error: bool,
}

/// The poller's own per-URL digest record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HashBlock {
    pub url: Url,
    pub versions: Vec<HashVersion>,
}

impl HashBlock {
    pub fn new(url: Url) -> Self {
        HashBlock { url, versions: vec![] }
    }

    /// Projects the poller-side record into the vote a voter with `voter_id`
    /// would cast, used when this node participates in a poll as a voter.
    pub fn to_vote_block(&self, voter_id: &Id) -> VoteBlock {
        let versions = self
            .versions
            .iter()
            .filter_map(|v| {
                v.challenges.get(voter_id).map(|challenge| BlockVersion {
                    plain: v.plain.clone(),
                    challenge: challenge.clone(),
                    offset: v.offset,
                    size: v.size,
                    hash_error: v.hash_error,
                })
            })
            .collect();
        VoteBlock { url: self.url.clone(), versions }
    }
}

/// How a single voter relates to the poller on one URL both sides hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Agree,
    Disagree,
    /// Every usable version on one side or the other carried a hash error;
    /// the voter abstains on this URL.
    Abstain,
}

/// Compares a voter's block against the poller's block.
///
/// Version order is irrelevant: if *any* non-abstaining poller version has a
/// challenge digest for this voter identical to *any* non-abstaining voter
/// version, the voter agrees. Insertion or deletion of intervening versions
/// is thereby tolerated.
pub fn compare(hash_block: &HashBlock, vote_block: &VoteBlock, voter: &Id) -> Comparison {
    let poller_digests: Vec<&Digest> = hash_block
        .versions
        .iter()
        .filter(|v| !v.hash_error)
        .filter_map(|v| v.challenges.get(voter))
        .collect();
    let voter_digests: Vec<&Digest> =
        vote_block.versions.iter().filter(|v| !v.hash_error).map(|v| &v.challenge).collect();
    if poller_digests.is_empty() || voter_digests.is_empty() {
        return Comparison::Abstain;
    }
    for pd in poller_digests.iter() {
        if voter_digests.iter().any(|vd| vd == pd) {
            return Comparison::Agree;
        }
    }
    Comparison::Disagree
}

#[cfg(test)]
mod test {
    use super::*;

    fn digest(b: u8) -> Digest {
        Digest(vec![b; 32])
    }

    fn vote_version(challenge: Digest, hash_error: bool) -> BlockVersion {
        BlockVersion { plain: digest(0xaa), challenge, offset: 0, size: 10, hash_error }
    }

    fn hash_version(voter: Id, challenge: Digest, hash_error: bool) -> HashVersion {
        let mut challenges = BTreeMap::new();
        challenges.insert(voter, challenge);
        HashVersion { plain: digest(0xaa), challenges, offset: 0, size: 10, hash_error }
    }

    #[test]
    fn test_agreement_is_version_order_independent() {
        let voter = Id::one();
        let mut hb = HashBlock::new("/x".to_string());
        hb.versions.push(hash_version(voter, digest(1), false));
        hb.versions.push(hash_version(voter, digest(2), false));

        // The voter only matches the poller's second version, at position 0.
        let mut vb = VoteBlock::new("/x".to_string());
        vb.versions.push(vote_version(digest(2), false));
        assert_eq!(compare(&hb, &vb, &voter), Comparison::Agree);
    }

    #[test]
    fn test_disagreement() {
        let voter = Id::one();
        let mut hb = HashBlock::new("/x".to_string());
        hb.versions.push(hash_version(voter, digest(1), false));
        let mut vb = VoteBlock::new("/x".to_string());
        vb.versions.push(vote_version(digest(9), false));
        assert_eq!(compare(&hb, &vb, &voter), Comparison::Disagree);
    }

    #[test]
    fn test_hash_error_versions_are_excluded() {
        let voter = Id::one();
        let mut hb = HashBlock::new("/x".to_string());
        hb.versions.push(hash_version(voter, digest(1), false));

        // A matching digest flagged as a hash error must not count.
        let mut vb = VoteBlock::new("/x".to_string());
        vb.versions.push(vote_version(digest(1), true));
        assert_eq!(compare(&hb, &vb, &voter), Comparison::Abstain);

        // All poller versions errored: abstain even though the voter is fine.
        let mut hb = HashBlock::new("/x".to_string());
        hb.versions.push(hash_version(voter, digest(1), true));
        let mut vb = VoteBlock::new("/x".to_string());
        vb.versions.push(vote_version(digest(1), false));
        assert_eq!(compare(&hb, &vb, &voter), Comparison::Abstain);
    }

    #[test]
    fn test_vote_block_projection() {
        let voter = Id::one();
        let other = Id::two();
        let mut hb = HashBlock::new("/x".to_string());
        let mut challenges = BTreeMap::new();
        challenges.insert(voter, digest(1));
        challenges.insert(other, digest(2));
        hb.versions.push(HashVersion {
            plain: digest(0xaa),
            challenges,
            offset: 0,
            size: 10,
            hash_error: false,
        });
        let vb = hb.to_vote_block(&voter);
        assert_eq!(vb.versions.len(), 1);
        assert_eq!(vb.versions[0].challenge, digest(1));
    }
}
