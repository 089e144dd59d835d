//! The repair sub-protocol: deciding where a corrected copy of a disputed
//! block comes from, and tracking repairs through their lifecycle.
mod queue;

pub use queue::{RepairQueue, RepairRecord, RepairSource, RepairStatus};

use crate::peer_id::Id;

use rand::seq::SliceRandom;
use rand::Rng;

/// Chooses the repair source for one URL.
///
/// With `repair_from_peer_percent` probability a random disagreeing (or
/// block-holding) peer serves the repair; otherwise the publisher does. A
/// publisher known to be down forces the peer path.
pub fn choose_source<R: Rng>(
    rng: &mut R,
    candidates: &[Id],
    repair_from_peer_percent: u32,
    publisher_down: bool,
) -> Option<RepairSource> {
    let from_peer =
        publisher_down || rng.gen_range(0, 100) < repair_from_peer_percent.min(100);
    if from_peer {
        match candidates.choose(rng) {
            Some(peer) => Some(RepairSource::Peer(*peer)),
            // Nobody to ask; fall back to the publisher unless it is down.
            None if !publisher_down => Some(RepairSource::Publisher),
            None => None,
        }
    } else {
        Some(RepairSource::Publisher)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use rand::rngs::mock::StepRng;

    #[test]
    fn test_publisher_down_forces_peer() {
        let mut rng = rand::thread_rng();
        let candidates = vec![Id::one(), Id::two()];
        for _ in 0..50 {
            match choose_source(&mut rng, &candidates, 0, true) {
                Some(RepairSource::Peer(id)) => assert!(candidates.contains(&id)),
                other => panic!("expected a peer source, got {:?}", other),
            }
        }
    }

    #[test]
    fn test_zero_percent_prefers_publisher() {
        let mut rng = StepRng::new(0, 1);
        let candidates = vec![Id::one()];
        assert_eq!(
            choose_source(&mut rng, &candidates, 0, false),
            Some(RepairSource::Publisher)
        );
    }

    #[test]
    fn test_no_candidates_and_publisher_down() {
        let mut rng = rand::thread_rng();
        assert_eq!(choose_source(&mut rng, &[], 100, true), None);
        assert_eq!(choose_source(&mut rng, &[], 100, false), Some(RepairSource::Publisher));
    }
}
