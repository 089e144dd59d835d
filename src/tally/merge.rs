//! K-way URL merge across the poller's hash stream and all voices.

use super::block_tally::BlockTally;
use super::voice::{HashBlockSource, Voice};
use super::{Error, Result};
use crate::blocks::{compare, Comparison, Url};

use colored::Colorize;
use priority_queue::PriorityQueue;
use tracing::warn;

use std::cmp::Reverse;

/// One step of the merge: a URL and the tally accumulated over every
/// participant for it.
#[derive(Debug)]
pub struct TalliedUrl {
    pub url: Url,
    pub tally: BlockTally,
}

/// Merges N vote streams and the poller's own hash stream in lock-step by
/// URL.
///
/// A min-heap keyed by each live voice's current URL identifies the smallest
/// outstanding URL at every step; exhausted and spoiled voices leave the
/// heap but are still classified as missing blocks the poller holds. Once
/// the poller's stream is exhausted, remaining voice URLs drain through the
/// same path and tally as voter-only blocks.
pub struct UrlTallier {
    poller: Box<dyn HashBlockSource>,
    current: Option<crate::blocks::HashBlock>,
    voices: Vec<Voice>,
    queue: PriorityQueue<usize, Reverse<Url>>,
    error_count: usize,
    max_errors: usize,
}

impl UrlTallier {
    pub fn new(
        mut poller: Box<dyn HashBlockSource>,
        voices: Vec<Voice>,
        max_errors: usize,
    ) -> Result<Self> {
        let current = poller
            .next_block()
            .map_err(|err| Error::PollerStreamError(format!("{}", err)))?;
        let mut tallier = UrlTallier {
            poller,
            current,
            voices,
            queue: PriorityQueue::new(),
            error_count: 0,
            max_errors,
        };
        for idx in 0..tallier.voices.len() {
            tallier.advance_voice(idx)?;
        }
        Ok(tallier)
    }

    /// Total block I/O errors observed so far.
    pub fn error_count(&self) -> usize {
        self.error_count
    }

    /// Tallies the smallest outstanding URL, or returns `None` when every
    /// stream is exhausted.
    pub fn next(&mut self) -> Result<Option<TalliedUrl>> {
        let poller_url = self.current.as_ref().map(|b| b.url.clone());
        let voice_url = self.queue.peek().map(|(_, Reverse(url))| url.clone());
        let url = match (poller_url, voice_url) {
            (None, None) => return Ok(None),
            (Some(p), None) => p,
            (None, Some(v)) => v,
            (Some(p), Some(v)) => {
                if p <= v {
                    p
                } else {
                    v
                }
            }
        };

        let mut tally = BlockTally::new();
        let poller_has_url = self.current.as_ref().map(|b| b.url == url).unwrap_or(false);
        if poller_has_url {
            let hash_block = self.current.take().unwrap();
            for idx in 0..self.voices.len() {
                if self.voices[idx].spoiled {
                    continue;
                }
                let voter = self.voices[idx].voter;
                let classification = match self.voices[idx].current() {
                    Some(vote_block) if vote_block.url == url => {
                        Some(compare(&hash_block, vote_block, &voter))
                    }
                    // Past this URL or exhausted: the voter lacks the block.
                    _ => None,
                };
                match classification {
                    Some(Comparison::Agree) => {
                        tally.agree.push(voter);
                        self.advance_voice(idx)?;
                    }
                    Some(Comparison::Disagree) => {
                        tally.disagree.push(voter);
                        self.advance_voice(idx)?;
                    }
                    Some(Comparison::Abstain) => {
                        self.advance_voice(idx)?;
                    }
                    None => tally.poller_only.push(voter),
                }
            }
            self.advance_poller()?;
        } else {
            let at_url: Vec<usize> = (0..self.voices.len())
                .filter(|&idx| {
                    !self.voices[idx].spoiled && self.voices[idx].url() == Some(&url)
                })
                .collect();
            for idx in at_url {
                tally.voter_only.push(self.voices[idx].voter);
                self.advance_voice(idx)?;
            }
        }
        Ok(Some(TalliedUrl { url, tally }))
    }

    fn advance_poller(&mut self) -> Result<()> {
        self.current = self
            .poller
            .next_block()
            .map_err(|err| Error::PollerStreamError(format!("{}", err)))?;
        Ok(())
    }

    fn advance_voice(&mut self, idx: usize) -> Result<()> {
        if let Err(err) = self.voices[idx].advance() {
            // Logged once; the spoiled flag keeps the voice out of every
            // later step.
            warn!(
                "[{}] vote stream of {} spoiled: {}",
                "tally".magenta(),
                self.voices[idx].voter,
                err
            );
            self.error_count += 1;
            if self.error_count > self.max_errors {
                return Err(Error::TooManyBlockErrors(self.error_count));
            }
        }
        match self.voices[idx].url() {
            Some(url) => {
                let url = url.clone();
                self.queue.push(idx, Reverse(url));
            }
            None => {
                let _ = self.queue.remove(&idx);
            }
        }
        Ok(())
    }
}
