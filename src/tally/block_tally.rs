//! Per-URL vote accumulation and the verdict.

use crate::peer_id::Id;

/// The outcome of tallying one URL.
///
/// The precedence between the landslide verdicts and margin-closeness is
/// fixed here as a total order: `LostMissingBlock` and `LostExtraBlock` are
/// checked before quorum and margin, because "everyone says I am missing a
/// block" (or holding an extra one) is actionable regardless of how close
/// the content vote would have been.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Verdict {
    Won,
    Lost,
    /// A quorum of voters lacks a block the poller holds.
    LostExtraBlock,
    /// A quorum of voters holds a block the poller lacks.
    LostMissingBlock,
    NoQuorum,
    TooClose,
}

impl Verdict {
    /// Whether this verdict triggers the repair path.
    pub fn needs_repair(&self) -> bool {
        match self {
            Verdict::Lost | Verdict::LostExtraBlock | Verdict::LostMissingBlock => true,
            Verdict::Won | Verdict::NoQuorum | Verdict::TooClose => false,
        }
    }
}

/// URL-scoped accumulator of the four disjoint voter classifications.
/// Abstaining voters appear in none of the lists.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BlockTally {
    pub agree: Vec<Id>,
    pub disagree: Vec<Id>,
    /// Voters lacking a block the poller holds.
    pub poller_only: Vec<Id>,
    /// Voters holding a block the poller lacks.
    pub voter_only: Vec<Id>,
}

impl BlockTally {
    pub fn new() -> Self {
        BlockTally::default()
    }

    /// Number of counted (agreeing or disagreeing) votes.
    pub fn counted(&self) -> usize {
        self.agree.len() + self.disagree.len()
    }

    /// Reduces the accumulated classification to a verdict.
    ///
    /// `margin` is the required winning-side share of counted votes, in
    /// percent.
    pub fn verdict(&self, quorum: usize, margin: u32) -> Verdict {
        if self.voter_only.len() >= quorum {
            return Verdict::LostMissingBlock;
        }
        if self.poller_only.len() >= quorum {
            return Verdict::LostExtraBlock;
        }
        let agree = self.agree.len();
        let disagree = self.disagree.len();
        if agree + disagree < quorum {
            return Verdict::NoQuorum;
        }
        let winning_share = std::cmp::max(agree, disagree) as f64 / (agree + disagree) as f64;
        if winning_share * 100.0 < margin as f64 {
            return Verdict::TooClose;
        }
        if agree > disagree {
            Verdict::Won
        } else {
            Verdict::Lost
        }
    }

    /// Peers a repair may be fetched from: those who disagreed with our copy
    /// or hold the block we lack.
    pub fn repair_candidates(&self) -> Vec<Id> {
        let mut candidates = self.disagree.clone();
        for id in self.voter_only.iter() {
            if !candidates.contains(id) {
                candidates.push(*id);
            }
        }
        candidates
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn ids(n: usize) -> Vec<Id> {
        (0..n).map(|_| Id::generate()).collect()
    }

    fn tally(agree: usize, disagree: usize) -> BlockTally {
        BlockTally { agree: ids(agree), disagree: ids(disagree), ..BlockTally::default() }
    }

    #[test]
    fn test_won_and_lost() {
        assert_eq!(tally(4, 1).verdict(3, 75), Verdict::Won);
        assert_eq!(tally(1, 4).verdict(3, 75), Verdict::Lost);
    }

    #[test]
    fn test_no_quorum_iff_counted_below_quorum() {
        // Verdict is NoQuorum exactly when agree + disagree < quorum.
        for quorum in 1..8 {
            for agree in 0..5 {
                for disagree in 0..5 {
                    let v = tally(agree, disagree).verdict(quorum, 0);
                    assert_eq!(v == Verdict::NoQuorum, agree + disagree < quorum);
                }
            }
        }
    }

    #[test]
    fn test_raising_quorum_never_flips_a_verdict() {
        // A verdict reached at quorum q is reachable at any q' <= counted.
        let t = tally(6, 4);
        assert_eq!(t.verdict(5, 50), Verdict::Won);
        assert_eq!(t.verdict(10, 50), Verdict::Won);
        assert_eq!(t.verdict(11, 50), Verdict::NoQuorum);
    }

    #[test]
    fn test_margin_symmetry() {
        // 6 agree / 4 disagree: winning share 60% < 75% margin.
        assert_eq!(tally(6, 4).verdict(5, 75), Verdict::TooClose);
        assert_eq!(tally(4, 6).verdict(5, 75), Verdict::TooClose);
        // At margin 60 the same tallies are decisive.
        assert_eq!(tally(6, 4).verdict(5, 60), Verdict::Won);
        assert_eq!(tally(4, 6).verdict(5, 60), Verdict::Lost);
        // Margin 0 and 100 are legal bounds.
        assert_eq!(tally(6, 4).verdict(5, 0), Verdict::Won);
        assert_eq!(tally(6, 4).verdict(5, 100), Verdict::TooClose);
        assert_eq!(tally(10, 0).verdict(5, 100), Verdict::Won);
    }

    #[test]
    fn test_ties_lose() {
        assert_eq!(tally(5, 5).verdict(5, 50), Verdict::Lost);
    }

    #[test]
    fn test_landslide_precedence() {
        // A quorum of voter-only blocks outranks quorum and margin checks.
        let t = BlockTally { voter_only: ids(5), ..BlockTally::default() };
        assert_eq!(t.verdict(5, 75), Verdict::LostMissingBlock);
        let t = BlockTally { poller_only: ids(5), agree: ids(1), ..BlockTally::default() };
        assert_eq!(t.verdict(5, 75), Verdict::LostExtraBlock);
        // Below quorum the landslide lists do not decide.
        let t = BlockTally { voter_only: ids(4), ..BlockTally::default() };
        assert_eq!(t.verdict(5, 75), Verdict::NoQuorum);
    }

    #[test]
    fn test_repair_candidates() {
        let disagree = ids(2);
        let voter_only = ids(1);
        let t = BlockTally {
            agree: ids(3),
            disagree: disagree.clone(),
            voter_only: voter_only.clone(),
            ..BlockTally::default()
        };
        let candidates = t.repair_candidates();
        assert_eq!(candidates.len(), 3);
        assert!(candidates.contains(&disagree[0]));
        assert!(candidates.contains(&voter_only[0]));
    }
}
