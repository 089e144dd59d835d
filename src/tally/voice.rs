//! Lazily-advanced, URL-ordered block streams.
//!
//! A *voice* is one participant's vote stream as seen by the merge: a cursor
//! over stored [VoteBlock]s plus a spoiled marker. Vote and hash blocks are
//! kept in sled trees keyed by URL, so a tree iterator yields them in
//! lexicographic URL order without loading the stream into memory.

use super::{Error, Result};
use crate::blocks::{HashBlock, Url, VoteBlock};
use crate::peer_id::Id;

use std::collections::VecDeque;

pub trait VoteBlockSource: Send {
    /// The next block in URL order, or `None` when the stream is exhausted.
    fn next_block(&mut self) -> Result<Option<VoteBlock>>;
}

pub trait HashBlockSource: Send {
    fn next_block(&mut self) -> Result<Option<HashBlock>>;
}

/// Vote stream backed by a sled tree (the canonical store for received
/// votes).
pub struct SledVoteSource {
    iter: sled::Iter,
}

impl SledVoteSource {
    pub fn new(tree: &sled::Tree) -> Self {
        SledVoteSource { iter: tree.iter() }
    }
}

impl VoteBlockSource for SledVoteSource {
    fn next_block(&mut self) -> Result<Option<VoteBlock>> {
        match self.iter.next() {
            None => Ok(None),
            Some(Ok((_key, value))) => {
                let block: VoteBlock = bincode::deserialize(&value)?;
                Ok(Some(block))
            }
            Some(Err(err)) => Err(Error::Sled(err)),
        }
    }
}

/// The poller's own hash stream, also sled-backed.
pub struct SledHashSource {
    iter: sled::Iter,
}

impl SledHashSource {
    pub fn new(tree: &sled::Tree) -> Self {
        SledHashSource { iter: tree.iter() }
    }
}

impl HashBlockSource for SledHashSource {
    fn next_block(&mut self) -> Result<Option<HashBlock>> {
        match self.iter.next() {
            None => Ok(None),
            Some(Ok((_key, value))) => {
                let block: HashBlock = bincode::deserialize(&value)?;
                Ok(Some(block))
            }
            Some(Err(err)) => Err(Error::Sled(err)),
        }
    }
}

/// In-memory vote stream for tests; blocks must be pushed in URL order.
pub struct VecVoteSource {
    blocks: VecDeque<VoteBlock>,
    /// Fail after this many blocks have been served (for spoiled-voice
    /// tests).
    fail_after: Option<usize>,
    served: usize,
}

impl VecVoteSource {
    pub fn new(blocks: Vec<VoteBlock>) -> Self {
        VecVoteSource { blocks: blocks.into(), fail_after: None, served: 0 }
    }

    pub fn failing_after(blocks: Vec<VoteBlock>, fail_after: usize) -> Self {
        VecVoteSource { blocks: blocks.into(), fail_after: Some(fail_after), served: 0 }
    }
}

impl VoteBlockSource for VecVoteSource {
    fn next_block(&mut self) -> Result<Option<VoteBlock>> {
        if let Some(n) = self.fail_after {
            if self.served >= n {
                return Err(Error::PollerStreamError("simulated read failure".to_string()));
            }
        }
        self.served += 1;
        Ok(self.blocks.pop_front())
    }
}

/// In-memory hash stream for tests.
pub struct VecHashSource {
    blocks: VecDeque<HashBlock>,
}

impl VecHashSource {
    pub fn new(blocks: Vec<HashBlock>) -> Self {
        VecHashSource { blocks: blocks.into() }
    }
}

impl HashBlockSource for VecHashSource {
    fn next_block(&mut self) -> Result<Option<HashBlock>> {
        Ok(self.blocks.pop_front())
    }
}

/// One participant's position in the merge.
pub struct Voice {
    pub voter: Id,
    source: Box<dyn VoteBlockSource>,
    current: Option<VoteBlock>,
    /// Set once the underlying stream has failed; a spoiled voice counts for
    /// neither side for the rest of the poll.
    pub spoiled: bool,
}

impl Voice {
    pub fn new(voter: Id, source: Box<dyn VoteBlockSource>) -> Self {
        Voice { voter, source, current: None, spoiled: false }
    }

    pub fn current(&self) -> Option<&VoteBlock> {
        self.current.as_ref()
    }

    pub fn url(&self) -> Option<&Url> {
        self.current.as_ref().map(|b| &b.url)
    }

    /// Advances the cursor. On an I/O error the voice is permanently spoiled
    /// and the error is surfaced once so the caller can count it.
    pub fn advance(&mut self) -> Result<()> {
        if self.spoiled {
            return Ok(());
        }
        match self.source.next_block() {
            Ok(block) => {
                self.current = block;
                Ok(())
            }
            Err(err) => {
                self.spoiled = true;
                self.current = None;
                Err(err)
            }
        }
    }
}
