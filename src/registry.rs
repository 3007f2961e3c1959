use std::{collections::HashMap, sync::Arc};

use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::{correlator::FinalizedEvent, store::ChunkedStore};

pub const RECORDING_KEY_PREFIX: &str = "recording:";

fn recording_key(session_id: &str) -> String {
    format!("{RECORDING_KEY_PREFIX}{session_id}")
}

/// One active recording session. At most one per tab; session identity is the
/// sole correlation key for buffered events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub session_id: String,
    pub tab_id: i64,
    pub started_at: i64,
}

#[derive(Default)]
struct RegistryState {
    by_tab: HashMap<i64, Session>,
    buffers: HashMap<String, Vec<FinalizedEvent>>,
    /// Serializes the durable read-modify-write per session. Storage I/O
    /// happens under these, never under the registry lock itself, so a slow
    /// write for one session cannot stall lookups or other sessions.
    persist_locks: HashMap<String, Arc<Mutex<()>>>,
}

impl RegistryState {
    fn persist_lock(&mut self, session_id: &str) -> Arc<Mutex<()>> {
        Arc::clone(
            self.persist_locks
                .entry(session_id.to_owned())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }
}

/// Maps monitored tabs to their recording sessions and owns the per-session
/// event buffers. Every buffered event is also persisted immediately, so a
/// dead process loses at most the one event that was in flight; the in-memory
/// state is never authoritative across restarts.
pub struct SessionRegistry {
    store: ChunkedStore,
    inner: Mutex<RegistryState>,
}

impl SessionRegistry {
    pub fn new(store: ChunkedStore) -> Self {
        Self {
            store,
            inner: Mutex::new(RegistryState::default()),
        }
    }

    pub fn store(&self) -> &ChunkedStore {
        &self.store
    }

    /// Starts (or restarts) recording for a tab. Re-registering a tab
    /// overwrites its mapping; tab navigation within one session does exactly
    /// that.
    pub async fn register_session(&self, tab_id: i64, session_id: &str, started_at: i64) {
        let mut inner = self.inner.lock().await;
        let previous = inner.by_tab.insert(
            tab_id,
            Session {
                session_id: session_id.to_owned(),
                tab_id,
                started_at,
            },
        );
        inner.buffers.entry(session_id.to_owned()).or_default();
        match previous {
            Some(previous) if previous.session_id != session_id => {
                tracing::info!(
                    tab_id,
                    session_id,
                    replaced = %previous.session_id,
                    "tab remapped to a new recording session"
                );
            }
            _ => tracing::debug!(tab_id, session_id, "recording session registered"),
        }
    }

    pub async fn session_for_tab(&self, tab_id: i64) -> Option<Session> {
        self.inner.lock().await.by_tab.get(&tab_id).cloned()
    }

    #[cfg(test)]
    pub async fn buffered_events(&self, session_id: &str) -> Vec<FinalizedEvent> {
        self.inner
            .lock()
            .await
            .buffers
            .get(session_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Appends the event to the session buffer and immediately persists it
    /// with a read-modify-write of the durable array. The registry lock is
    /// released before the storage I/O; the per-session persist lock keeps
    /// concurrent read-modify-write cycles from interleaving.
    pub async fn buffer_event(&self, session_id: &str, event: FinalizedEvent) -> anyhow::Result<()> {
        let persist_lock = {
            let mut inner = self.inner.lock().await;
            inner
                .buffers
                .entry(session_id.to_owned())
                .or_default()
                .push(event.clone());
            inner.persist_lock(session_id)
        };
        let _persist = persist_lock.lock().await;

        let key = recording_key(session_id);
        let mut persisted: Vec<FinalizedEvent> = self
            .store
            .get(&key)
            .await
            .with_context(|| format!("read persisted events for `{session_id}`"))?
            .unwrap_or_default();
        if !persisted.iter().any(|existing| existing.id == event.id) {
            persisted.push(event);
            self.store
                .put(&key, &persisted)
                .await
                .with_context(|| format!("persist event for `{session_id}`"))?;
        }
        Ok(())
    }

    /// Reconciles the in-memory buffer with the durable array, skipping events
    /// the incremental path already wrote, then clears the buffer. Returns the
    /// persisted event count.
    pub async fn flush_session(&self, session_id: &str) -> anyhow::Result<usize> {
        let (buffered, persist_lock) = {
            let mut inner = self.inner.lock().await;
            let buffered = inner.buffers.remove(session_id).unwrap_or_default();
            inner.buffers.insert(session_id.to_owned(), Vec::new());
            (buffered, inner.persist_lock(session_id))
        };
        let _persist = persist_lock.lock().await;

        let key = recording_key(session_id);
        let mut persisted: Vec<FinalizedEvent> = self
            .store
            .get(&key)
            .await
            .with_context(|| format!("read persisted events for `{session_id}`"))?
            .unwrap_or_default();

        let before = persisted.len();
        for event in buffered {
            if !persisted.iter().any(|existing| existing.id == event.id) {
                persisted.push(event);
            }
        }
        if persisted.len() != before {
            self.store
                .put(&key, &persisted)
                .await
                .with_context(|| format!("flush events for `{session_id}`"))?;
        }
        Ok(persisted.len())
    }

    /// Stops recording: flushes, drops the tab mapping and the buffer. The
    /// event history stays durable under the session's key. Returns the
    /// persisted event count.
    pub async fn end_session(&self, session_id: &str) -> anyhow::Result<usize> {
        let count = self.flush_session(session_id).await?;
        let mut inner = self.inner.lock().await;
        inner
            .by_tab
            .retain(|_, session| session.session_id != session_id);
        inner.buffers.remove(session_id);
        inner.persist_locks.remove(session_id);
        tracing::info!(session_id, persisted = count, "recording session ended");
        Ok(count)
    }

    /// Startup recovery: reports what survived the previous process under the
    /// recording key space. Tab mappings and buffers are deliberately not
    /// rebuilt; only the durable history is authoritative.
    pub async fn resume(&self) -> anyhow::Result<Vec<(String, usize)>> {
        let keys = self
            .store
            .keys(RECORDING_KEY_PREFIX)
            .await
            .context("scan recording keys")?;

        let mut recovered = Vec::with_capacity(keys.len());
        for key in keys {
            let session_id = key
                .strip_prefix(RECORDING_KEY_PREFIX)
                .unwrap_or(&key)
                .to_owned();
            let count = self
                .store
                .get::<Vec<FinalizedEvent>>(&key)
                .await
                .with_context(|| format!("read persisted events for `{session_id}`"))?
                .map(|events| events.len())
                .unwrap_or(0);
            tracing::info!(session_id = %session_id, events = count, "recovered session history");
            recovered.push((session_id, count));
        }
        Ok(recovered)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use std::time::Duration;

    use super::SessionRegistry;
    use crate::correlator::{EventSource, FinalizedEvent};
    use crate::store::{ChunkedStore, KeyValueStore, MemoryStore, StoreError};

    fn chunked_store() -> ChunkedStore {
        let primitive = Arc::new(MemoryStore::new(8192));
        ChunkedStore::new(primitive as Arc<dyn KeyValueStore>, 4096)
    }

    /// Backend whose reads stall, standing in for saturated storage.
    struct SlowStore {
        inner: MemoryStore,
        read_delay: Duration,
    }

    impl KeyValueStore for SlowStore {
        fn put_item(&self, key: &str, value: &str) -> Result<(), StoreError> {
            self.inner.put_item(key, value)
        }

        fn get_item(&self, key: &str) -> Result<Option<String>, StoreError> {
            std::thread::sleep(self.read_delay);
            self.inner.get_item(key)
        }

        fn remove_item(&self, key: &str) -> Result<(), StoreError> {
            self.inner.remove_item(key)
        }

        fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
            self.inner.keys_with_prefix(prefix)
        }

        fn bytes_in_use(&self) -> Result<u64, StoreError> {
            self.inner.bytes_in_use()
        }
    }

    fn event(id: &str, session_id: &str) -> FinalizedEvent {
        FinalizedEvent {
            id: id.to_owned(),
            session_id: session_id.to_owned(),
            source: EventSource::Network,
            kind: "xhr".to_owned(),
            method: "GET".to_owned(),
            url: "https://a.example/x".to_owned(),
            status: Some(200),
            error: None,
            started_at: 1_000,
            ended_at: 1_050,
            duration_ms: 50,
            redirects: Vec::new(),
        }
    }

    #[tokio::test]
    async fn re_registering_a_tab_overwrites_the_mapping() {
        let registry = SessionRegistry::new(chunked_store());
        registry.register_session(42, "s1", 1_000).await;
        registry.register_session(42, "s2", 2_000).await;

        let session = registry.session_for_tab(42).await.unwrap();
        assert_eq!(session.session_id, "s2");
        assert_eq!(session.started_at, 2_000);
    }

    #[tokio::test]
    async fn buffered_event_survives_a_simulated_restart_exactly_once() {
        let store = chunked_store();
        let registry = SessionRegistry::new(store.clone());
        registry.register_session(42, "s1", 1_000).await;
        registry.buffer_event("s1", event("e1", "s1")).await.unwrap();

        // New registry over the same store stands in for a restarted process
        // whose in-memory buffer is gone.
        let restarted = SessionRegistry::new(store);
        let count = restarted.flush_session("s1").await.unwrap();
        assert_eq!(count, 1);

        let persisted: Vec<FinalizedEvent> =
            restarted.store().get("recording:s1").await.unwrap().unwrap();
        assert_eq!(persisted.len(), 1);
        assert_eq!(persisted[0].id, "e1");
    }

    #[tokio::test]
    async fn flush_does_not_duplicate_incrementally_persisted_events() {
        let registry = SessionRegistry::new(chunked_store());
        registry.register_session(42, "s1", 1_000).await;
        registry.buffer_event("s1", event("e1", "s1")).await.unwrap();
        registry.buffer_event("s1", event("e2", "s1")).await.unwrap();

        assert_eq!(registry.flush_session("s1").await.unwrap(), 2);
        // A second flush with an empty buffer is a no-op.
        assert_eq!(registry.flush_session("s1").await.unwrap(), 2);

        let persisted: Vec<FinalizedEvent> =
            registry.store().get("recording:s1").await.unwrap().unwrap();
        assert_eq!(persisted.len(), 2);
    }

    #[tokio::test]
    async fn ending_a_session_drops_the_mapping_but_keeps_history() {
        let registry = SessionRegistry::new(chunked_store());
        registry.register_session(42, "s1", 1_000).await;
        registry.buffer_event("s1", event("e1", "s1")).await.unwrap();

        let count = registry.end_session("s1").await.unwrap();
        assert_eq!(count, 1);
        assert!(registry.session_for_tab(42).await.is_none());

        let persisted: Option<Vec<FinalizedEvent>> =
            registry.store().get("recording:s1").await.unwrap();
        assert_eq!(persisted.map(|events| events.len()), Some(1));
    }

    #[tokio::test]
    async fn resume_reports_recovered_session_counts() {
        let store = chunked_store();
        let registry = SessionRegistry::new(store.clone());
        registry.register_session(42, "s1", 1_000).await;
        registry.register_session(43, "s2", 1_000).await;
        registry.buffer_event("s1", event("e1", "s1")).await.unwrap();
        registry.buffer_event("s2", event("e2", "s2")).await.unwrap();
        registry.buffer_event("s2", event("e3", "s2")).await.unwrap();

        let restarted = SessionRegistry::new(store);
        let recovered = restarted.resume().await.unwrap();
        assert_eq!(
            recovered,
            vec![("s1".to_owned(), 1), ("s2".to_owned(), 2)]
        );
    }

    #[tokio::test]
    async fn slow_persistence_does_not_block_registry_lookups() {
        let slow = Arc::new(SlowStore {
            inner: MemoryStore::new(8192),
            read_delay: Duration::from_millis(200),
        });
        let store = ChunkedStore::new(slow as Arc<dyn KeyValueStore>, 4096);
        let registry = Arc::new(SessionRegistry::new(store));
        registry.register_session(42, "s1", 1_000).await;
        registry.register_session(43, "s2", 1_000).await;

        let writer = tokio::spawn({
            let registry = Arc::clone(&registry);
            async move { registry.buffer_event("s1", event("e1", "s1")).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        // While s1's read-modify-write stalls on storage, lookups and other
        // sessions' buffering proceed.
        let lookup = tokio::time::timeout(Duration::from_millis(50), registry.session_for_tab(43))
            .await
            .expect("lookup should not wait on persistence");
        assert!(lookup.is_some());

        writer.await.unwrap().unwrap();
        assert_eq!(registry.flush_session("s1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn large_session_histories_round_trip_through_chunking() {
        let primitive = Arc::new(MemoryStore::new(512));
        let store = ChunkedStore::new(Arc::clone(&primitive) as Arc<dyn KeyValueStore>, 128);
        let registry = SessionRegistry::new(store);
        registry.register_session(42, "s1", 1_000).await;

        for index in 0..20 {
            registry
                .buffer_event("s1", event(&format!("e{index}"), "s1"))
                .await
                .unwrap();
        }

        assert_eq!(registry.flush_session("s1").await.unwrap(), 20);
        // The history long since outgrew the 512 byte item ceiling.
        assert!(primitive.get_item("recording:s1").unwrap().is_none());
        assert!(primitive.get_item("recording:s1:chunks").unwrap().is_some());
    }
}
