//! Persistence: the backing key/value store interface, the namespaced key
//! schema, and the debounced event-log writer.

use std::collections::HashMap;
use std::sync::mpsc::{channel, RecvTimeoutError, Sender};
use std::sync::Mutex;
use std::thread::JoinHandle;
use std::time::Duration;

/// The durable backing store. Whole-value semantics only: no range scans,
/// no transactions. Implementations must be safe to call from the engine's
/// persistence and refresh threads.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> std::io::Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> std::io::Result<()>;
    fn remove(&self, key: &str) -> std::io::Result<()>;
}

/// In-memory store, used in tests and as a default for hosts that do not
/// need durability.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> MemoryStore {
        MemoryStore::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> std::io::Result<Option<String>> {
        Ok(self.entries.lock().unwrap().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> std::io::Result<()> {
        self.entries
            .lock()
            .unwrap()
            .insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    fn remove(&self, key: &str) -> std::io::Result<()> {
        self.entries.lock().unwrap().remove(key);
        Ok(())
    }
}

/// Stable device identifier, shared across tenants.
pub const DEVICE_ID_KEY: &str = "flipkit.device_id";
/// First-initialization marker, shared across tenants.
pub const FIRST_OPEN_KEY: &str = "flipkit.first_open";

/// Key schema for everything namespaced by `(company, tenant, environment)`.
#[derive(Debug, Clone)]
pub(crate) struct StorageKeys {
    prefix: String,
}

impl StorageKeys {
    pub fn new(company: &str, tenant: &str, environment: &str) -> StorageKeys {
        StorageKeys {
            prefix: format!("flipkit.{company}.{tenant}.{environment}"),
        }
    }

    pub fn rules_body(&self) -> String {
        format!("{}.rules", self.prefix)
    }

    pub fn rules_hash(&self) -> String {
        format!("{}.rules_hash", self.prefix)
    }

    pub fn rules_fetched_at(&self) -> String {
        format!("{}.rules_fetched_at", self.prefix)
    }

    pub fn rule_indexes(&self) -> String {
        format!("{}.rule_indexes", self.prefix)
    }

    pub fn events(&self) -> String {
        format!("{}.events", self.prefix)
    }

    pub fn schema_state(&self) -> String {
        format!("{}.schema_state", self.prefix)
    }
}

/// Remove every persisted key for the given namespace. Cross-tenant keys
/// (device id, first-open flag) are left alone.
pub fn clear_cache(
    store: &dyn KeyValueStore,
    company: &str,
    tenant: &str,
    environment: &str,
) -> std::io::Result<()> {
    let keys = StorageKeys::new(company, tenant, environment);
    store.remove(&keys.rules_body())?;
    store.remove(&keys.rules_hash())?;
    store.remove(&keys.rules_fetched_at())?;
    store.remove(&keys.rule_indexes())?;
    store.remove(&keys.events())?;
    store.remove(&keys.schema_state())?;
    Ok(())
}

const QUIET_PERIOD: Duration = Duration::from_secs(5);
const FLUSH_THRESHOLD: usize = 10;

/// Debounced writer for the event log.
///
/// Each append signals the writer thread; a write fires after a quiet period
/// with no further appends, or immediately once enough appends accumulate,
/// whichever comes first. The flush callback serializes the current log and
/// stores it; it runs entirely off the mutation path.
pub(crate) struct DebouncedWriter {
    sender: Option<Sender<()>>,
    join_handle: Option<JoinHandle<()>>,
}

impl DebouncedWriter {
    pub fn start<F>(flush: F) -> std::io::Result<DebouncedWriter>
    where
        F: Fn() + Send + 'static,
    {
        DebouncedWriter::start_with_tuning(flush, QUIET_PERIOD, FLUSH_THRESHOLD)
    }

    pub fn start_with_tuning<F>(
        flush: F,
        quiet_period: Duration,
        flush_threshold: usize,
    ) -> std::io::Result<DebouncedWriter>
    where
        F: Fn() + Send + 'static,
    {
        let (sender, receiver) = channel::<()>();
        let join_handle = std::thread::Builder::new()
            .name("flipkit-writer".to_owned())
            .spawn(move || loop {
                // Block until the first append of a batch.
                match receiver.recv() {
                    Ok(()) => {}
                    Err(_) => return,
                }
                let mut pending = 1usize;
                loop {
                    match receiver.recv_timeout(quiet_period) {
                        Ok(()) => {
                            pending += 1;
                            if pending >= flush_threshold {
                                break;
                            }
                        }
                        Err(RecvTimeoutError::Timeout) => break,
                        Err(RecvTimeoutError::Disconnected) => {
                            flush();
                            return;
                        }
                    }
                }
                flush();
            })?;

        Ok(DebouncedWriter {
            sender: Some(sender),
            join_handle: Some(join_handle),
        })
    }

    /// Record one append; the actual write is scheduled by the thread.
    pub fn record_append(&self) {
        if let Some(sender) = &self.sender {
            let _ = sender.send(());
        }
    }

    /// Flush anything pending and stop the thread.
    pub fn shutdown(&mut self) {
        drop(self.sender.take());
        if let Some(handle) = self.join_handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for DebouncedWriter {
    fn drop(&mut self) {
        self.shutdown();
    }
}
