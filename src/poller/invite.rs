//! Peer selection for the inner and outer circles.
//!
//! Inner-circle candidates come from the known-peer registry, filtered by
//! preservation-group compatibility and weighted by contact recency. The
//! outer circle is drawn from participant nominations, sampled per
//! nominator so a single peer cannot flood the poll with its friends.

use crate::peer_id::Id;
use crate::peers::PeerEntry;

use rand::seq::SliceRandom;
use rand::Rng;

use std::collections::{BTreeMap, HashSet};
use std::time::{Duration, SystemTime};

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Probability that a candidate survives the invitation roll, stepped by how
/// recently we heard from it. Peers we have never contacted get full weight
/// so newcomers are reachable at all.
pub fn invitation_weight(entry: &PeerEntry, now: SystemTime) -> f64 {
    let last = match entry.last_contact {
        None => return 1.0,
        Some(t) => t,
    };
    let age = match now.duration_since(last) {
        Ok(age) => age,
        // Clock skew; treat a future contact as fresh.
        Err(_) => return 1.0,
    };
    if age <= 5 * DAY {
        1.0
    } else if age <= 30 * DAY {
        2.0 / 3.0
    } else if age <= 90 * DAY {
        1.0 / 3.0
    } else {
        1.0 / 6.0
    }
}

/// Whether a peer's declared groups overlap ours. Unknown groups (either
/// side) pass the filter; an incompatible peer passes again once its retry
/// window has elapsed, so stale group data cannot exile it forever.
fn groups_compatible(entry: &PeerEntry, our_groups: &[String], now: SystemTime) -> bool {
    if entry.groups.is_empty() || our_groups.is_empty() {
        return true;
    }
    if entry.groups.iter().any(|g| our_groups.contains(g)) {
        return true;
    }
    match entry.group_retry_at {
        Some(retry_at) => retry_at <= now,
        None => false,
    }
}

/// Draws the inner circle: weighted rolls over the eligible registry
/// entries, topped up from the rejected pool if the rolls come up short.
pub fn select_inner_circle<R: Rng>(
    rng: &mut R,
    entries: &[PeerEntry],
    our_groups: &[String],
    exclude: &HashSet<Id>,
    count: usize,
    now: SystemTime,
) -> Vec<Id> {
    let mut eligible: Vec<&PeerEntry> = entries
        .iter()
        .filter(|e| !exclude.contains(&e.id))
        .filter(|e| groups_compatible(e, our_groups, now))
        .collect();
    eligible.shuffle(rng);

    let mut selected = vec![];
    let mut passed_over = vec![];
    for entry in eligible {
        if selected.len() >= count {
            break;
        }
        if rng.gen::<f64>() < invitation_weight(entry, now) {
            selected.push(entry.id);
        } else {
            passed_over.push(entry.id);
        }
    }
    // Short polls are worse than inviting a stale peer.
    for id in passed_over {
        if selected.len() >= count {
            break;
        }
        selected.push(id);
    }
    selected
}

/// Draws the outer circle from nominations, taking round-robin from each
/// nominator's (shuffled) list so every nominator contributes evenly.
pub fn select_outer_circle<R: Rng>(
    rng: &mut R,
    nominations: &BTreeMap<Id, Vec<Id>>,
    exclude: &HashSet<Id>,
    count: usize,
) -> Vec<Id> {
    let mut pools: Vec<Vec<Id>> = nominations
        .values()
        .map(|nominees| {
            let mut pool: Vec<Id> =
                nominees.iter().filter(|id| !exclude.contains(id)).cloned().collect();
            pool.shuffle(rng);
            pool
        })
        .collect();

    let mut selected = vec![];
    let mut seen: HashSet<Id> = HashSet::new();
    let mut exhausted = false;
    while selected.len() < count && !exhausted {
        exhausted = true;
        for pool in pools.iter_mut() {
            if selected.len() >= count {
                break;
            }
            if let Some(id) = pool.pop() {
                exhausted = false;
                if seen.insert(id) {
                    selected.push(id);
                }
            }
        }
    }
    selected
}

#[cfg(test)]
mod test {
    use super::*;
    use rand::rngs::mock::StepRng;

    fn entry_contacted(days_ago: u32, now: SystemTime) -> PeerEntry {
        let mut entry = PeerEntry::new(Id::generate());
        entry.last_contact = Some(now - DAY * days_ago);
        entry
    }

    #[test]
    fn test_weight_steps() {
        let now = SystemTime::now();
        let fresh = PeerEntry::new(Id::generate());
        assert_eq!(invitation_weight(&fresh, now), 1.0);
        assert_eq!(invitation_weight(&entry_contacted(3, now), now), 1.0);
        assert_eq!(invitation_weight(&entry_contacted(20, now), now), 2.0 / 3.0);
        assert_eq!(invitation_weight(&entry_contacted(60, now), now), 1.0 / 3.0);
        assert_eq!(invitation_weight(&entry_contacted(120, now), now), 1.0 / 6.0);
    }

    #[test]
    fn test_inner_circle_excludes_and_caps() {
        let now = SystemTime::now();
        let entries: Vec<PeerEntry> =
            (0..10).map(|_| PeerEntry::new(Id::generate())).collect();
        let mut exclude = HashSet::new();
        exclude.insert(entries[0].id);
        // StepRng at zero always rolls 0.0, so every weight passes.
        let mut rng = StepRng::new(0, 0);
        let selected = select_inner_circle(&mut rng, &entries, &[], &exclude, 4, now);
        assert_eq!(selected.len(), 4);
        assert!(!selected.contains(&entries[0].id));
    }

    #[test]
    fn test_inner_circle_tops_up_after_failed_rolls() {
        let now = SystemTime::now();
        // All stale, so the roll (forced to ~1.0) rejects everyone; the
        // top-up pass must still fill the circle.
        let entries: Vec<PeerEntry> = (0..6).map(|_| entry_contacted(200, now)).collect();
        let mut rng = StepRng::new(u64::max_value(), 0);
        let selected =
            select_inner_circle(&mut rng, &entries, &[], &HashSet::new(), 3, now);
        assert_eq!(selected.len(), 3);
    }

    #[test]
    fn test_group_filter_with_retry_window() {
        let now = SystemTime::now();
        let ours = vec!["humanities".to_string()];

        let mut disjoint = PeerEntry::new(Id::generate());
        disjoint.groups = vec!["sciences".to_string()];
        assert!(!groups_compatible(&disjoint, &ours, now));

        disjoint.group_retry_at = Some(now - DAY);
        assert!(groups_compatible(&disjoint, &ours, now));

        disjoint.group_retry_at = Some(now + DAY);
        assert!(!groups_compatible(&disjoint, &ours, now));

        let unknown = PeerEntry::new(Id::generate());
        assert!(groups_compatible(&unknown, &ours, now));
    }

    #[test]
    fn test_outer_circle_dedupes_and_samples_each_nominator() {
        let shared = Id::generate();
        let a_only = Id::generate();
        let b_only = Id::generate();
        let mut nominations = BTreeMap::new();
        nominations.insert(Id::one(), vec![shared, a_only]);
        nominations.insert(Id::two(), vec![shared, b_only]);

        let mut rng = StepRng::new(0, 1);
        let selected = select_outer_circle(&mut rng, &nominations, &HashSet::new(), 10);
        assert_eq!(selected.len(), 3);
        let unique: HashSet<Id> = selected.iter().cloned().collect();
        assert_eq!(unique.len(), 3);
    }

    #[test]
    fn test_outer_circle_respects_exclusions_and_cap() {
        let excluded = Id::generate();
        let mut nominations = BTreeMap::new();
        nominations
            .insert(Id::one(), vec![excluded, Id::generate(), Id::generate(), Id::generate()]);
        let mut exclude = HashSet::new();
        exclude.insert(excluded);

        let mut rng = StepRng::new(0, 1);
        let selected = select_outer_circle(&mut rng, &nominations, &exclude, 2);
        assert_eq!(selected.len(), 2);
        assert!(!selected.contains(&excluded));
    }
}
