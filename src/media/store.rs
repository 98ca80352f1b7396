//! Media document store seam.
//!
//! The document store itself is external; the dispatcher only needs to
//! resolve `(db, doc)` pairs to streamable attachments. [`MemoryStore`]
//! backs the daemon and the tests.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;

/// One attachment on a media document, in declaration order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub name: String,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub length: Option<u64>,
}

/// A media document as the store hands it back.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaDoc {
    #[serde(default)]
    pub streamable: bool,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

#[async_trait]
pub trait MediaStore: Send + Sync + 'static {
    /// Look up `doc` in database `db`.
    async fn lookup(&self, db: &str, doc: &str) -> Option<MediaDoc>;
}

/// In-memory store keyed by `(db, doc)`.
#[derive(Debug, Default)]
pub struct MemoryStore {
    docs: Mutex<HashMap<(String, String), MediaDoc>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, db: &str, doc: &str, media: MediaDoc) {
        self.docs
            .lock()
            .unwrap()
            .insert((db.to_string(), doc.to_string()), media);
    }
}

#[async_trait]
impl MediaStore for MemoryStore {
    async fn lookup(&self, db: &str, doc: &str) -> Option<MediaDoc> {
        self.docs
            .lock()
            .unwrap()
            .get(&(db.to_string(), doc.to_string()))
            .cloned()
    }
}
