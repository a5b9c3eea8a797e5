use std::{
    collections::{HashMap, VecDeque},
    path::Path,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use nostr::{Event, EventId, Filter, JsonUtil, PublicKey};
use nostr_database::{NostrDatabase, SaveEventStatus};
use nostr_lmdb::NostrLMDB;
use nostr_sdk::{Kind, RelayUrl};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::git_events::{dedup_events, dedup_key};

pub const DEFAULT_TTL: Duration = Duration::from_secs(5 * 60);
pub const PROFILE_TTL: Duration = Duration::from_secs(30 * 60);
pub const MAX_AGE: Duration = Duration::from_secs(7 * 24 * 60 * 60);
const MAX_FILTER_ENTRIES: usize = 1000;

/// The one capability the cache needs from the relay layer. Injected at
/// construction so the cache never depends on the full client.
#[async_trait]
pub trait RelayFetch: Send + Sync {
    async fn fetch(&self, relays: Vec<RelayUrl>, filters: Vec<Filter>) -> Result<Vec<Event>>;
}

/// Persistent-store write failures, split so that environmental conditions
/// can be swallowed while genuine bugs stay visible in the logs.
#[derive(Debug, Error)]
enum CacheWriteError {
    #[error("store quota exhausted: {0}")]
    QuotaExceeded(String),
    #[error("transaction raced: {0}")]
    TransactionRace(String),
    #[error("{0}")]
    Other(String),
}

impl CacheWriteError {
    fn classify(message: String) -> Self {
        let lower = message.to_lowercase();
        if lower.contains("map full") || lower.contains("quota") || lower.contains("no space") {
            CacheWriteError::QuotaExceeded(message)
        } else if lower.contains("busy") || lower.contains("conflict") || lower.contains("race") {
            CacheWriteError::TransactionRace(message)
        } else {
            CacheWriteError::Other(message)
        }
    }
}

enum WriteOp {
    Save(Event),
    Delete(Filter),
}

struct FilterEntry {
    event_ids: Vec<EventId>,
    cached_at: Instant,
    ttl: Duration,
}

#[derive(Default)]
struct MemoryLayer {
    entries: HashMap<String, FilterEntry>,
    fifo: VecDeque<String>,
    events: HashMap<EventId, Event>,
}

impl MemoryLayer {
    fn insert(&mut self, key: String, ids: Vec<EventId>, ttl: Duration) {
        if !self.entries.contains_key(&key) {
            self.fifo.push_back(key.clone());
            while self.fifo.len() > MAX_FILTER_ENTRIES {
                if let Some(evicted) = self.fifo.pop_front() {
                    self.entries.remove(&evicted);
                }
            }
        }
        self.entries.insert(
            key,
            FilterEntry {
                event_ids: ids,
                cached_at: Instant::now(),
                ttl,
            },
        );
    }

    fn remove_event(&mut self, id: &EventId) {
        self.events.remove(id);
        for entry in self.entries.values_mut() {
            entry.event_ids.retain(|eid| eid != id);
        }
    }
}

/// Read-through event cache: a synchronous in-memory layer bounded FIFO-wise
/// in front of a persistent LMDB store whose writes are serialized through a
/// single writer task. Availability beats durability throughout.
pub struct EventCache {
    memory: Mutex<MemoryLayer>,
    db: Arc<NostrLMDB>,
    writer: mpsc::UnboundedSender<WriteOp>,
    fetcher: Arc<dyn RelayFetch>,
}

impl EventCache {
    pub fn open(
        db_path: &Path,
        fetcher: Arc<dyn RelayFetch>,
    ) -> Result<Arc<Self>> {
        let db = Arc::new(
            NostrLMDB::open(db_path)
                .context("failed to open or create the event cache database")?,
        );
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_writer(db.clone(), rx));
        Ok(Arc::new(EventCache {
            memory: Mutex::new(MemoryLayer::default()),
            db,
            writer: tx,
            fetcher,
        }))
    }

    /// Read-through lookup. Fresh entries answer immediately; stale entries
    /// answer immediately and refresh in the background; misses consult the
    /// persistent store, then the relays. Search filters bypass the cache.
    pub async fn events(
        self: &Arc<Self>,
        relays: Vec<RelayUrl>,
        filters: Vec<Filter>,
    ) -> Result<Vec<Event>> {
        if filters.iter().any(|f| f.search.is_some()) {
            return self.fetcher.fetch(relays, filters).await;
        }

        let key = filter_key(&filters);
        if let Some((events, fresh)) = self.get_by_key(&key) {
            if !fresh {
                self.spawn_refresh(relays, filters);
            }
            return Ok(events);
        }

        let persisted = self.query_db(filters.clone()).await?;
        if !persisted.is_empty() {
            // A persistent hit repopulates memory but is of unknown age, so
            // it is stored already-stale: answer now, refresh behind.
            self.store_in_memory(&key, &persisted, Duration::ZERO);
            self.spawn_refresh(relays, filters);
            return Ok(persisted);
        }

        let fetched = self.fetcher.fetch(relays, filters.clone()).await?;
        self.set(&filters, fetched.clone(), None).await;
        Ok(fetched)
    }

    pub fn get(&self, filters: &[Filter]) -> Option<Vec<Event>> {
        self.get_by_key(&filter_key(filters)).map(|(events, _)| events)
    }

    fn get_by_key(&self, key: &str) -> Option<(Vec<Event>, bool)> {
        let memory = self.memory.lock().unwrap();
        let entry = memory.entries.get(key)?;
        let age = entry.cached_at.elapsed();
        if age > MAX_AGE {
            return None;
        }
        let events = entry
            .event_ids
            .iter()
            .filter_map(|id| memory.events.get(id).cloned())
            .collect();
        Some((events, age <= entry.ttl))
    }

    /// Record a result set for a filter key. The newest event per dedup key
    /// wins; displaced events are scheduled for deletion from the store.
    pub async fn set(&self, filters: &[Filter], events: Vec<Event>, ttl: Option<Duration>) {
        let key = filter_key(filters);
        let deduped = self.store_in_memory(&key, &events, ttl.unwrap_or(DEFAULT_TTL));
        for event in deduped {
            let _ = self.writer.send(WriteOp::Save(event));
        }
    }

    fn store_in_memory(&self, key: &str, events: &[Event], ttl: Duration) -> Vec<Event> {
        let deduped = dedup_events(events.to_vec());
        let mut memory = self.memory.lock().unwrap();
        // Losers of the dedup race are purged from both layers.
        let mut replaced: Vec<EventId> = vec![];
        for event in &deduped {
            let new_key = dedup_key(event);
            replaced.extend(
                memory
                    .events
                    .values()
                    .filter(|existing| {
                        dedup_key(existing) == new_key && existing.created_at < event.created_at
                    })
                    .map(|e| e.id),
            );
        }
        for id in &replaced {
            memory.remove_event(id);
            let _ = self
                .writer
                .send(WriteOp::Delete(Filter::new().id(*id)));
        }
        for event in &deduped {
            memory.events.insert(event.id, event.clone());
        }
        memory.insert(
            key.to_string(),
            deduped.iter().map(|e| e.id).collect(),
            ttl,
        );
        deduped
    }

    pub async fn delete_event(&self, id: &EventId) {
        self.memory.lock().unwrap().remove_event(id);
        let _ = self.writer.send(WriteOp::Delete(Filter::new().id(*id)));
    }

    /// Drop every memory entry touching the given author so the next read
    /// refetches. Called eagerly after that author publishes.
    pub async fn invalidate_pubkey(&self, pubkey: &PublicKey) {
        let mut memory = self.memory.lock().unwrap();
        let affected: Vec<EventId> = memory
            .events
            .values()
            .filter(|e| e.pubkey == *pubkey)
            .map(|e| e.id)
            .collect();
        let keys: Vec<String> = memory
            .entries
            .iter()
            .filter(|(_, entry)| entry.event_ids.iter().any(|id| affected.contains(id)))
            .map(|(key, _)| key.clone())
            .collect();
        for key in keys {
            memory.entries.remove(&key);
        }
    }

    /// Apply kind-5 deletion events: every `e`-tagged id is removed from
    /// both layers.
    pub async fn process_deletions(&self, events: &[Event]) {
        for event in events {
            if !event.kind.eq(&Kind::EventDeletion) {
                continue;
            }
            for tag in event.tags.iter() {
                if let [t, id, ..] = tag.as_slice() {
                    if t == "e" {
                        if let Ok(id) = EventId::parse(id) {
                            self.delete_event(&id).await;
                        }
                    }
                }
            }
        }
    }

    pub async fn get_profile(
        self: &Arc<Self>,
        relays: Vec<RelayUrl>,
        pubkey: &PublicKey,
    ) -> Option<Event> {
        let filters = vec![Filter::new().kind(Kind::Metadata).author(*pubkey)];
        if let Some(events) = self.get(&filters) {
            return events.into_iter().next();
        }
        let fetched = self.fetcher.fetch(relays, filters.clone()).await.ok()?;
        self.set(&filters, fetched.clone(), Some(PROFILE_TTL)).await;
        fetched.into_iter().next()
    }

    pub async fn set_profile(&self, pubkey: &PublicKey, event: Event) {
        let filters = vec![Filter::new().kind(Kind::Metadata).author(*pubkey)];
        self.set(&filters, vec![event], Some(PROFILE_TTL)).await;
    }

    /// Look up the profile without going to the network at all. Used on
    /// error paths that must not suspend on relays.
    pub fn cached_profile_name(&self, pubkey: &PublicKey) -> Option<String> {
        let filters = vec![Filter::new().kind(Kind::Metadata).author(*pubkey)];
        let event = self.get(&filters)?.into_iter().next()?;
        let value: serde_json::Value = serde_json::from_str(&event.content).ok()?;
        value
            .get("name")
            .and_then(|n| n.as_str())
            .map(ToString::to_string)
    }

    async fn query_db(&self, filters: Vec<Filter>) -> Result<Vec<Event>> {
        let mut events = vec![];
        for filter in filters {
            events.extend(
                self.db
                    .query(filter)
                    .await
                    .context("failed to query the event cache database")?,
            );
        }
        Ok(dedup_events(events))
    }

    fn spawn_refresh(self: &Arc<Self>, relays: Vec<RelayUrl>, filters: Vec<Filter>) {
        let cache = self.clone();
        tokio::spawn(async move {
            match cache.fetcher.fetch(relays, filters.clone()).await {
                Ok(events) => cache.set(&filters, events, None).await,
                Err(error) => debug!(%error, "background cache refresh failed"),
            }
        });
    }
}

async fn run_writer(db: Arc<NostrLMDB>, mut rx: mpsc::UnboundedReceiver<WriteOp>) {
    while let Some(op) = rx.recv().await {
        let outcome = match op {
            WriteOp::Save(event) => db
                .save_event(&event)
                .await
                .map(|_: SaveEventStatus| ())
                .map_err(|e| e.to_string()),
            WriteOp::Delete(filter) => {
                db.delete(filter).await.map_err(|e| e.to_string())
            }
        };
        if let Err(message) = outcome {
            match CacheWriteError::classify(message) {
                error @ (CacheWriteError::QuotaExceeded(_)
                | CacheWriteError::TransactionRace(_)) => {
                    debug!(%error, "cache write degraded to no-op");
                }
                error @ CacheWriteError::Other(_) => {
                    warn!(%error, "cache write failed");
                }
            }
        }
    }
}

fn filter_key(filters: &[Filter]) -> String {
    filters
        .iter()
        .map(Filter::as_json)
        .collect::<Vec<String>>()
        .join("|")
}
