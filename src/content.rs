//! The content repository boundary.
//!
//! The poll engine never knows the storage format of preserved content; it
//! reads versions, writes repairs and triggers publisher re-crawls through
//! the [ContentStore] trait. The crawler and repository live outside this
//! crate.

use crate::blocks::Url;

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

#[derive(Debug)]
pub enum Error {
    /// The URL is not held in this archival unit.
    NoSuchUrl(Url),
    /// The underlying repository failed; carries the repository's message.
    Storage(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

/// Read/write access to one archival unit's preserved content.
pub trait ContentStore: Send + Sync {
    /// The archival unit this store serves.
    fn au_id(&self) -> String;

    /// All URLs held for the AU, in lexicographic order.
    fn urls(&self) -> Result<Vec<Url>>;

    /// All preserved versions of a URL, newest first.
    fn versions(&self, url: &Url) -> Result<Vec<Vec<u8>>>;

    /// Stores repaired content as the newest version of a URL.
    fn store_repair(&self, url: &Url, content: &[u8]) -> Result<()>;

    /// Removes a URL the audit decided this replica should not hold.
    fn delete(&self, url: &Url) -> Result<()>;

    /// Queues a bulk re-crawl of the given URLs from the publisher.
    fn recrawl(&self, urls: Vec<Url>) -> Result<()>;

    /// Whether the publisher's site is known to be unreachable.
    fn publisher_down(&self) -> bool;
}

/// In-memory store used by tests, benchmarks and the integration runner.
pub struct MemStore {
    au_id: String,
    inner: Mutex<MemStoreInner>,
    publisher_down: bool,
}

struct MemStoreInner {
    content: BTreeMap<Url, Vec<Vec<u8>>>,
    recrawled: Vec<Url>,
}

impl MemStore {
    pub fn new(au_id: &str) -> Arc<Self> {
        Arc::new(MemStore {
            au_id: au_id.to_string(),
            inner: Mutex::new(MemStoreInner { content: BTreeMap::new(), recrawled: vec![] }),
            publisher_down: false,
        })
    }

    pub fn with_publisher_down(au_id: &str) -> Arc<Self> {
        Arc::new(MemStore {
            au_id: au_id.to_string(),
            inner: Mutex::new(MemStoreInner { content: BTreeMap::new(), recrawled: vec![] }),
            publisher_down: true,
        })
    }

    pub fn insert(&self, url: &str, content: &[u8]) {
        let mut inner = self.inner.lock().unwrap();
        inner.content.entry(url.to_string()).or_insert_with(Vec::new).insert(0, content.to_vec());
    }

    /// URLs handed to `recrawl`, for assertions.
    pub fn recrawled(&self) -> Vec<Url> {
        self.inner.lock().unwrap().recrawled.clone()
    }
}

impl ContentStore for MemStore {
    fn au_id(&self) -> String {
        self.au_id.clone()
    }

    fn urls(&self) -> Result<Vec<Url>> {
        Ok(self.inner.lock().unwrap().content.keys().cloned().collect())
    }

    fn versions(&self, url: &Url) -> Result<Vec<Vec<u8>>> {
        self.inner
            .lock()
            .unwrap()
            .content
            .get(url)
            .cloned()
            .ok_or_else(|| Error::NoSuchUrl(url.clone()))
    }

    fn store_repair(&self, url: &Url, content: &[u8]) -> Result<()> {
        self.insert(url, content);
        Ok(())
    }

    fn delete(&self, url: &Url) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.content.remove(url).ok_or_else(|| Error::NoSuchUrl(url.clone()))?;
        Ok(())
    }

    fn recrawl(&self, urls: Vec<Url>) -> Result<()> {
        self.inner.lock().unwrap().recrawled.extend(urls);
        Ok(())
    }

    fn publisher_down(&self) -> bool {
        self.publisher_down
    }
}
