//! The engine: host API surface and the concurrency discipline that keeps
//! the core state consistent.
//!
//! All state-changing operations serialize through a single writer lock and
//! re-evaluate the feature table before returning, so a read issued after a
//! mutation always reflects it. Network fetches and persistence writes run
//! on their own threads and re-enter the lock only to install results.
//! Listener callbacks fire on the notification thread, never under locks.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use chrono::Utc;
use rand::distributions::Alphanumeric;
use rand::{thread_rng, Rng};

use crate::config::{EngineConfig, ReadyCallback};
use crate::event_log::{EventLog, EventRecord};
use crate::feature_table::{Change, FeatureTable};
use crate::fetcher::{HttpTransport, RuleTransport};
use crate::listeners::{
    ListenerRegistry, ListenerToken, NotificationPublisher, NotificationThread,
};
use crate::persistence::{
    self, DebouncedWriter, KeyValueStore, StorageKeys, DEVICE_ID_KEY, FIRST_OPEN_KEY,
};
use crate::poller_thread::PollerThread;
use crate::properties::{PropertyStore, COUNTRY_PROPERTY};
use crate::rules::{EvalContext, IndexEnvelope, RuleSet};
use crate::values::DynValue;
use crate::Result;

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Values the lowercase of which counts as "enabled".
const ENABLED_VALUES: [&str; 4] = ["true", "on", "enabled", "1"];

struct CoreState {
    events: EventLog,
    properties: PropertyStore,
    rules: Option<RuleSet>,
    features: FeatureTable,
}

pub(crate) struct EngineShared {
    company: String,
    tenant: String,
    environment: String,
    state: RwLock<CoreState>,
    publisher: NotificationPublisher,
    listeners: Arc<ListenerRegistry>,
    store: Option<Arc<dyn KeyValueStore>>,
    keys: StorageKeys,
    transport: Option<Arc<dyn RuleTransport>>,
    auto_refresh: bool,
    debug: bool,
    /// Collapses concurrent refresh attempts into the in-flight one.
    fetch_in_flight: AtomicBool,
    ready_fired: AtomicBool,
    last_fetch: Mutex<Option<Instant>>,
    poll_interval: Mutex<Duration>,
    on_ready: Option<ReadyCallback>,
    on_rules_updated: Option<ReadyCallback>,
}

/// The feature-flag engine.
///
/// Owned by the host; all methods take `&self` and are safe to call from any
/// thread. Construct with [`Engine::new`] for the full fetch lifecycle or
/// [`Engine::new_local`] to evaluate a host-supplied rule document with no
/// network or persistence.
pub struct Engine {
    shared: Arc<EngineShared>,
    notifier: NotificationThread,
    writer: Option<DebouncedWriter>,
    poller: Option<PollerThread>,
}

impl Engine {
    /// Create an engine for the given configuration.
    ///
    /// Cached rules and event history are loaded from the backing store
    /// before this returns; the first network fetch happens on the refresh
    /// thread when auto-refresh is enabled, or on an explicit
    /// [`Engine::refresh_rules`] call otherwise.
    ///
    /// # Errors
    ///
    /// [`crate::Error::InvalidConfiguration`] when identifiers are empty or
    /// contain whitespace, or the API key is missing. No network traffic is
    /// attempted in that case.
    pub fn new(config: EngineConfig) -> Result<Engine> {
        config.validate()?;

        let transport: Arc<dyn RuleTransport> = match &config.transport {
            Some(transport) => Arc::clone(transport),
            None => Arc::new(HttpTransport::new(
                &config.base_url,
                &config.api_key,
                &config.company,
                &config.tenant,
                &config.environment,
            )?),
        };

        Engine::build(config, Some(transport))
    }

    /// Create an engine in local mode: no network, no background refresh.
    /// When `rules_json` is given it is parsed and installed directly;
    /// further documents can be supplied via [`Engine::install_rules`].
    pub fn new_local(rules_json: Option<&str>) -> Result<Engine> {
        let config = EngineConfig::new("local", "local", "local", "local")
            .auto_refresh(false);
        let engine = Engine::build(config, None)?;
        if let Some(body) = rules_json {
            engine.install_rules(body)?;
        }
        Ok(engine)
    }

    fn build(config: EngineConfig, transport: Option<Arc<dyn RuleTransport>>) -> Result<Engine> {
        let listeners = Arc::new(ListenerRegistry::default());
        let notifier = NotificationThread::start(Arc::clone(&listeners))?;
        let keys = StorageKeys::new(&config.company, &config.tenant, &config.environment);

        let shared = Arc::new(EngineShared {
            company: config.company,
            tenant: config.tenant,
            environment: config.environment,
            state: RwLock::new(CoreState {
                events: EventLog::new(config.max_events, config.max_event_age_days),
                properties: PropertyStore::default(),
                rules: None,
                features: FeatureTable::default(),
            }),
            publisher: notifier.publisher(),
            listeners,
            store: config.store,
            keys,
            transport,
            auto_refresh: config.auto_refresh,
            debug: config.debug,
            fetch_in_flight: AtomicBool::new(false),
            ready_fired: AtomicBool::new(false),
            last_fetch: Mutex::new(None),
            poll_interval: Mutex::new(config.poll_interval),
            on_ready: config.on_ready,
            on_rules_updated: config.on_rules_updated,
        });

        if let Some(store) = &shared.store {
            ensure_device_identity(store.as_ref());
        }
        shared.load_cached_state();

        let writer = match &shared.store {
            Some(_) => {
                let flush_target = Arc::clone(&shared);
                Some(DebouncedWriter::start(move || flush_target.persist_events())?)
            }
            None => None,
        };

        let poller = if shared.auto_refresh && shared.transport.is_some() {
            let refresh_target = Arc::clone(&shared);
            let initial = shared.current_poll_interval();
            Some(PollerThread::start(initial, move || refresh_target.refresh())?)
        } else {
            None
        };

        Ok(Engine {
            shared,
            notifier,
            writer,
            poller,
        })
    }

    /// Append a behavioral event with no parameters.
    pub fn log_event(&self, name: &str) {
        self.log_event_with(name, BTreeMap::new());
    }

    /// Append a behavioral event with flat parameters.
    pub fn log_event_with(&self, name: &str, params: BTreeMap<String, DynValue>) {
        let now = now_ms();
        let record = EventRecord::with_params(name, now, params);
        self.shared.mutate(|state| state.events.append(record, now));
        if let Some(writer) = &self.writer {
            writer.record_append();
        }
    }

    pub fn set_user_property(&self, key: &str, value: &str) {
        let (key, value) = (key.to_owned(), value.to_owned());
        self.shared
            .mutate(move |state| state.properties.set_user(key, value));
    }

    pub fn remove_user_property(&self, key: &str) {
        self.shared.mutate(|state| state.properties.remove_user(key));
    }

    pub fn set_device_property(&self, key: &str, value: &str) {
        let (key, value) = (key.to_owned(), value.to_owned());
        self.shared
            .mutate(move |state| state.properties.set_device(key, value));
    }

    pub fn remove_device_property(&self, key: &str) {
        self.shared
            .mutate(|state| state.properties.remove_device(key));
    }

    /// The current value of a feature, or `None` when no rule matched.
    ///
    /// Never panics and never blocks on the network; a due background
    /// refresh may be kicked off as a side effect.
    pub fn get_feature_value(&self, feature: &str) -> Option<String> {
        let value = self
            .shared
            .state
            .read()
            .expect("thread holding engine state lock should not panic")
            .features
            .value_of(feature);
        self.shared.maybe_background_refresh();
        value
    }

    /// Whether the feature's value reads as enabled (`true`, `on`,
    /// `enabled`, or `1`, case-insensitive).
    pub fn is_feature_enabled(&self, feature: &str) -> bool {
        match self.get_feature_value(feature) {
            Some(value) => ENABLED_VALUES.contains(&value.to_lowercase().as_str()),
            None => false,
        }
    }

    /// Snapshot of every known feature and its current value.
    pub fn get_all_feature_values(&self) -> HashMap<String, Option<String>> {
        self.shared
            .state
            .read()
            .expect("thread holding engine state lock should not panic")
            .features
            .snapshot()
    }

    /// Clear a feature's cached value. The entry reads as absent until the
    /// next mutation re-evaluates its rules, which re-arms count-based
    /// triggers.
    pub fn reset_feature(&self, feature: &str) {
        let change = {
            let mut state = self
                .shared
                .state
                .write()
                .expect("thread holding engine state lock should not panic");
            state.features.reset(feature)
        };
        if let Some(change) = change {
            self.shared.commit(&[change]);
        }
    }

    /// Clear every cached feature value.
    pub fn reset_all_features(&self) {
        let changes = {
            let mut state = self
                .shared
                .state
                .write()
                .expect("thread holding engine state lock should not panic");
            state.features.reset_all()
        };
        self.shared.commit(&changes);
    }

    /// Register a listener for one feature's value changes. The callback
    /// runs on the notification thread.
    pub fn add_listener(
        &self,
        feature: &str,
        callback: impl Fn(&str, Option<&str>) + Send + Sync + 'static,
    ) -> ListenerToken {
        self.shared.listeners.add(feature, Arc::new(callback))
    }

    pub fn remove_listener(&self, token: ListenerToken) {
        self.shared.listeners.remove(token);
    }

    pub fn remove_all_listeners(&self, feature: &str) {
        self.shared.listeners.remove_all(feature);
    }

    pub fn clear_all_listeners(&self) {
        self.shared.listeners.clear();
    }

    /// Trigger a refresh now. Collapses into an already in-flight fetch.
    /// A no-op in local mode.
    pub fn refresh_rules(&self) -> Result<()> {
        if self.shared.transport.is_none() {
            return Ok(());
        }
        self.shared.refresh().map(|_| ())
    }

    /// Block until the refresh thread has installed (or confirmed) rules
    /// once. Immediately returns `Ok` when auto-refresh is off.
    pub fn wait_for_rules(&self) -> Result<()> {
        match &self.poller {
            Some(poller) => poller.wait_for_rules(),
            None => Ok(()),
        }
    }

    /// Parse and install a rule document supplied by the host.
    pub fn install_rules(&self, rules_json: &str) -> Result<()> {
        let checksum = crate::rules::ContentHash::of(rules_json.as_bytes());
        let set = RuleSet::parse(rules_json, checksum.to_string())?;
        self.shared.install_rule_set(set, Some(rules_json));
        Ok(())
    }

    /// The event history, oldest first.
    pub fn get_event_history(&self) -> Vec<EventRecord> {
        self.shared
            .state
            .read()
            .expect("thread holding engine state lock should not panic")
            .events
            .snapshot()
    }

    /// Drop every stored event, re-evaluate, and persist the empty log.
    pub fn clear_event_history(&self) {
        self.shared.mutate(|state| state.events.clear());
        self.shared.persist_events();
    }

    /// Remove every key this engine persisted for its
    /// `(company, tenant, environment)` namespace.
    pub fn clear_cache(&self) {
        if let Some(store) = &self.shared.store {
            if let Err(err) = persistence::clear_cache(
                store.as_ref(),
                &self.shared.company,
                &self.shared.tenant,
                &self.shared.environment,
            ) {
                log::warn!(target: "flipkit", "failed to clear cache: {err}");
            }
        }
    }

    /// Stop the refresh, writer, and notification threads. Pending event
    /// writes are flushed and queued notifications delivered.
    pub fn shutdown(&mut self) {
        if let Some(poller) = self.poller.take() {
            let _ = poller.shutdown();
        }
        if let Some(mut writer) = self.writer.take() {
            writer.shutdown();
        }
        self.notifier.shutdown();
    }

    #[cfg(test)]
    pub(crate) fn shared(&self) -> &Arc<EngineShared> {
        &self.shared
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl EngineShared {
    /// Run a state mutation and the evaluation pass that goes with it, then
    /// hand any feature changes to the notification thread. The write lock
    /// is the mutation channel: everything that changes core state funnels
    /// through here.
    fn mutate(&self, f: impl FnOnce(&mut CoreState)) -> Vec<Change> {
        let changes = {
            let mut state = self
                .state
                .write()
                .expect("thread holding engine state lock should not panic");
            f(&mut state);
            Self::recompute_locked(&mut state)
        };
        self.commit(&changes);
        changes
    }

    fn recompute_locked(state: &mut CoreState) -> Vec<Change> {
        let CoreState {
            events,
            properties,
            rules,
            features,
        } = state;
        let ctx = EvalContext {
            events: events.contiguous(),
            user: properties.user(),
            device: properties.device(),
            now_ms: now_ms(),
        };
        features.recompute(rules.as_ref(), &ctx)
    }

    fn commit(&self, changes: &[Change]) {
        if changes.is_empty() {
            return;
        }
        if self.debug {
            log::debug!(target: "flipkit", "{} feature value(s) changed", changes.len());
        } else {
            log::trace!(target: "flipkit", "{} feature value(s) changed", changes.len());
        }
        self.publisher.publish(changes);
    }

    /// Install a new rule set, recompute the feature table, notify, and
    /// persist. The previous rule set is dropped only after the new one is
    /// indexed and the table recomputed.
    fn install_rule_set(&self, set: RuleSet, persist_body: Option<&str>) {
        let version = set.version().to_owned();
        let envelope = set.index_envelope();
        let changes = {
            let mut state = self
                .state
                .write()
                .expect("thread holding engine state lock should not panic");
            state.rules = Some(set);
            Self::recompute_locked(&mut state)
        };
        self.commit(&changes);

        if let (Some(store), Some(body)) = (&self.store, persist_body) {
            let result = store
                .set(&self.keys.rules_body(), body)
                .and_then(|()| store.set(&self.keys.rules_hash(), &version))
                .and_then(|()| {
                    store.set(&self.keys.rules_fetched_at(), &now_ms().to_string())
                })
                .and_then(|()| {
                    match serde_json::to_string(&envelope) {
                        Ok(json) => store.set(&self.keys.rule_indexes(), &json),
                        Err(_) => Ok(()),
                    }
                });
            if let Err(err) = result {
                log::warn!(target: "flipkit", "failed to persist rules cache: {err}");
            }
        }

        log::debug!(target: "flipkit", "installed rules version {version}");
    }

    /// One fetch attempt. Returns the effective poll interval so the timer
    /// can honor a server-mandated minimum.
    pub(crate) fn refresh(self: &Arc<Self>) -> Result<Duration> {
        let Some(transport) = self.transport.clone() else {
            return Ok(self.current_poll_interval());
        };

        if self.fetch_in_flight.swap(true, Ordering::SeqCst) {
            log::debug!(target: "flipkit", "refresh already in flight, collapsing");
            return Ok(self.current_poll_interval());
        }
        let result = self.refresh_inner(transport.as_ref());
        self.fetch_in_flight.store(false, Ordering::SeqCst);

        if let Err(err) = &result {
            log::warn!(target: "flipkit", "rules refresh failed: {err}");
            // The cached copy continues to serve evaluations.
            let has_rules = self
                .state
                .read()
                .expect("thread holding engine state lock should not panic")
                .rules
                .is_some();
            if has_rules {
                self.fire_ready();
            }
        }
        result
    }

    fn refresh_inner(&self, transport: &dyn RuleTransport) -> Result<Duration> {
        let fetched = transport.fetch_pointer()?;

        if let Some(country) = fetched.country {
            self.mutate(move |state| state.properties.set_device(COUNTRY_PROPERTY, country));
        }
        if let Some(min_secs) = fetched.pointer.min_poll_interval_secs {
            self.raise_poll_interval(Duration::from_secs(min_secs));
        }

        let cached_version = self
            .state
            .read()
            .expect("thread holding engine state lock should not panic")
            .rules
            .as_ref()
            .map(|rules| rules.version().to_owned());

        if cached_version.as_deref() == Some(fetched.pointer.version.as_str()) {
            log::debug!(target: "flipkit", "cached rules are current, skipping document fetch");
            self.touch_fetched_at();
            // One evaluation pass to absorb event and property changes that
            // happened since the cached rules were installed.
            self.mutate(|_| {});
        } else {
            let body = transport.fetch_document(&fetched.pointer)?;
            let set = RuleSet::parse(&body, fetched.pointer.version.clone())?;
            self.install_rule_set(set, Some(&body));
            self.fire_rules_updated();
        }

        self.mark_fetched();
        self.fire_ready();
        Ok(self.current_poll_interval())
    }

    /// Kick a background fetch when the poll interval has elapsed since the
    /// last successful one.
    fn maybe_background_refresh(self: &Arc<Self>) {
        if !self.auto_refresh || self.transport.is_none() {
            return;
        }
        let due = {
            let last = self
                .last_fetch
                .lock()
                .expect("thread holding fetch timestamp lock should not panic");
            match *last {
                Some(at) => at.elapsed() >= self.current_poll_interval(),
                None => false,
            }
        };
        if due && !self.fetch_in_flight.load(Ordering::SeqCst) {
            let shared = Arc::clone(self);
            let spawned = std::thread::Builder::new()
                .name("flipkit-refresh".to_owned())
                .spawn(move || {
                    let _ = shared.refresh();
                });
            if let Err(err) = spawned {
                log::warn!(target: "flipkit", "failed to spawn background refresh: {err}");
            }
        }
    }

    pub(crate) fn current_poll_interval(&self) -> Duration {
        *self
            .poll_interval
            .lock()
            .expect("thread holding poll interval lock should not panic")
    }

    /// Raise (never lower) the poll interval to the server-mandated floor.
    fn raise_poll_interval(&self, floor: Duration) {
        let mut interval = self
            .poll_interval
            .lock()
            .expect("thread holding poll interval lock should not panic");
        if floor > *interval {
            log::debug!(
                target: "flipkit",
                "raising poll interval to server minimum of {}s",
                floor.as_secs(),
            );
            *interval = floor;
        }
    }

    fn mark_fetched(&self) {
        *self
            .last_fetch
            .lock()
            .expect("thread holding fetch timestamp lock should not panic") = Some(Instant::now());
    }

    fn touch_fetched_at(&self) {
        if let Some(store) = &self.store {
            if let Err(err) = store.set(&self.keys.rules_fetched_at(), &now_ms().to_string()) {
                log::warn!(target: "flipkit", "failed to refresh rules cache timestamp: {err}");
            }
        }
    }

    fn fire_ready(&self) {
        if self.ready_fired.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(callback) = &self.on_ready {
            callback();
        }
    }

    fn fire_rules_updated(&self) {
        if let Some(callback) = &self.on_rules_updated {
            callback();
        }
    }

    /// Load the cached rule document, its indexes, and the event history
    /// from the backing store. Any corrupt entry is discarded with a
    /// warning; in-memory state starts fresh in that case.
    fn load_cached_state(&self) {
        let Some(store) = &self.store else { return };

        match store.get(&self.keys.events()) {
            Ok(Some(json)) => match serde_json::from_str::<Vec<EventRecord>>(&json) {
                Ok(records) => {
                    let mut state = self
                        .state
                        .write()
                        .expect("thread holding engine state lock should not panic");
                    state.events.restore(records, now_ms());
                }
                Err(err) => {
                    log::warn!(target: "flipkit", "discarding corrupt persisted event history: {err}");
                }
            },
            Ok(None) => {}
            Err(err) => log::warn!(target: "flipkit", "failed to read persisted event history: {err}"),
        }

        let body = store.get(&self.keys.rules_body()).ok().flatten();
        let version = store.get(&self.keys.rules_hash()).ok().flatten();
        if let (Some(body), Some(version)) = (body, version) {
            match RuleSet::parse(&body, version) {
                Ok(mut set) => {
                    if let Ok(Some(json)) = store.get(&self.keys.rule_indexes()) {
                        match serde_json::from_str::<IndexEnvelope>(&json) {
                            Ok(envelope) => {
                                set.try_adopt_indexes(envelope);
                            }
                            Err(err) => {
                                log::warn!(target: "flipkit", "discarding corrupt persisted rule indexes: {err}");
                            }
                        }
                    }
                    self.install_rule_set(set, None);
                }
                Err(err) => {
                    log::warn!(target: "flipkit", "cached rule document failed to parse: {err}");
                }
            }
        }
    }

    /// Serialize the whole event log and store it. Runs on the writer
    /// thread.
    pub(crate) fn persist_events(&self) {
        let Some(store) = &self.store else { return };
        let snapshot = self
            .state
            .read()
            .expect("thread holding engine state lock should not panic")
            .events
            .snapshot();
        match serde_json::to_string(&snapshot) {
            Ok(json) => {
                if let Err(err) = store.set(&self.keys.events(), &json) {
                    log::warn!(target: "flipkit", "failed to persist event history: {err}");
                }
            }
            Err(err) => log::warn!(target: "flipkit", "failed to serialize event history: {err}"),
        }
    }
}

/// Make sure the cross-tenant device identity keys exist. The device id is
/// generated once and kept stable across engine restarts.
fn ensure_device_identity(store: &dyn KeyValueStore) {
    match store.get(DEVICE_ID_KEY) {
        Ok(Some(_)) => {}
        Ok(None) => {
            let id: String = thread_rng()
                .sample_iter(&Alphanumeric)
                .take(22)
                .map(char::from)
                .collect();
            if let Err(err) = store.set(DEVICE_ID_KEY, &id) {
                log::warn!(target: "flipkit", "failed to persist device id: {err}");
            }
        }
        Err(err) => log::warn!(target: "flipkit", "failed to read device id: {err}"),
    }

    match store.get(FIRST_OPEN_KEY) {
        Ok(None) => {
            if let Err(err) = store.set(FIRST_OPEN_KEY, &now_ms().to_string()) {
                log::warn!(target: "flipkit", "failed to persist first-open marker: {err}");
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use super::*;
    use crate::fetcher::{PointerDoc, PointerFetch, RuleTransport};
    use crate::persistence::MemoryStore;
    use crate::{EngineConfig, Error};

    const DOC_A: &str = r#"{"features": {"x": [{"value": "a", "conditions": {}}]}}"#;
    const DOC_B: &str = r#"{"features": {"x": [{"value": "b", "conditions": {}}]}}"#;

    /// Scripted transport: serves a fixed pointer version and document,
    /// counting requests.
    struct FakeTransport {
        version: Mutex<String>,
        document: Mutex<String>,
        min_poll_interval_secs: Option<u64>,
        country: Option<String>,
        pointer_delay: Duration,
        pointer_fetches: AtomicUsize,
        document_fetches: AtomicUsize,
    }

    impl FakeTransport {
        fn serving(version: &str, document: &str) -> FakeTransport {
            FakeTransport {
                version: Mutex::new(version.to_owned()),
                document: Mutex::new(document.to_owned()),
                min_poll_interval_secs: None,
                country: None,
                pointer_delay: Duration::ZERO,
                pointer_fetches: AtomicUsize::new(0),
                document_fetches: AtomicUsize::new(0),
            }
        }
    }

    impl RuleTransport for FakeTransport {
        fn fetch_pointer(&self) -> crate::Result<PointerFetch> {
            self.pointer_fetches.fetch_add(1, Ordering::SeqCst);
            if !self.pointer_delay.is_zero() {
                std::thread::sleep(self.pointer_delay);
            }
            Ok(PointerFetch {
                pointer: PointerDoc {
                    schema_version: None,
                    version: self.version.lock().unwrap().clone(),
                    path: None,
                    updated_at: None,
                    feature_count: None,
                    ttl_secs: None,
                    min_poll_interval_secs: self.min_poll_interval_secs,
                },
                country: self.country.clone(),
            })
        }

        fn fetch_document(&self, _pointer: &PointerDoc) -> crate::Result<String> {
            self.document_fetches.fetch_add(1, Ordering::SeqCst);
            Ok(self.document.lock().unwrap().clone())
        }
    }

    fn engine_with(transport: Arc<FakeTransport>, store: Option<Arc<MemoryStore>>) -> Engine {
        let mut config = EngineConfig::new("acme", "app", "prod", "key")
            .auto_refresh(false)
            .transport(transport);
        if let Some(store) = store {
            config = config.store(store);
        }
        Engine::new(config).unwrap()
    }

    #[test]
    fn rejects_invalid_configuration_without_fetching() {
        let transport = Arc::new(FakeTransport::serving("v1", DOC_A));
        let config = EngineConfig::new("bad id", "t", "e", "k").transport(Arc::clone(&transport) as Arc<dyn RuleTransport>);
        assert!(matches!(
            Engine::new(config),
            Err(Error::InvalidConfiguration(_))
        ));
        assert_eq!(transport.pointer_fetches.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn refresh_installs_fetched_rules() {
        let transport = Arc::new(FakeTransport::serving("v1", DOC_A));
        let engine = engine_with(Arc::clone(&transport), None);

        assert_eq!(engine.get_feature_value("x"), None);
        engine.refresh_rules().unwrap();
        assert_eq!(engine.get_feature_value("x").as_deref(), Some("a"));
        assert_eq!(transport.document_fetches.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn matching_version_skips_document_fetch() {
        let transport = Arc::new(FakeTransport::serving("v1", DOC_A));
        let engine = engine_with(Arc::clone(&transport), None);

        engine.refresh_rules().unwrap();
        engine.refresh_rules().unwrap();

        assert_eq!(transport.pointer_fetches.load(Ordering::SeqCst), 2);
        assert_eq!(transport.document_fetches.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn concurrent_refreshes_collapse() {
        let transport = Arc::new(FakeTransport {
            pointer_delay: Duration::from_millis(150),
            ..FakeTransport::serving("v1", DOC_A)
        });
        let engine = engine_with(Arc::clone(&transport), None);
        let shared_a = Arc::clone(engine.shared());
        let shared_b = Arc::clone(engine.shared());

        let a = std::thread::spawn(move || shared_a.refresh().map(|_| ()));
        std::thread::sleep(Duration::from_millis(30));
        let b = std::thread::spawn(move || shared_b.refresh().map(|_| ()));

        a.join().unwrap().unwrap();
        b.join().unwrap().unwrap();

        assert_eq!(transport.pointer_fetches.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn server_minimum_raises_poll_interval() {
        let transport = Arc::new(FakeTransport {
            min_poll_interval_secs: Some(3600),
            ..FakeTransport::serving("v1", DOC_A)
        });
        let config = EngineConfig::new("acme", "app", "prod", "key")
            .auto_refresh(false)
            .poll_interval(Duration::from_millis(60_000))
            .transport(Arc::clone(&transport) as Arc<dyn RuleTransport>);
        let engine = Engine::new(config).unwrap();

        assert_eq!(
            engine.shared().current_poll_interval(),
            Duration::from_secs(60)
        );
        engine.refresh_rules().unwrap();
        assert_eq!(
            engine.shared().current_poll_interval(),
            Duration::from_secs(3600)
        );
    }

    #[test]
    fn country_header_populates_device_property() {
        let transport = Arc::new(FakeTransport {
            country: Some("DE".to_owned()),
            ..FakeTransport::serving("v1", r#"{
              "features": {
                "geo": [
                  {
                    "value": "eu",
                    "conditions": {
                      "device": [
                        {"key": "country", "value": {"operator": "==", "value": "DE"}}
                      ]
                    }
                  }
                ]
              }
            }"#)
        });
        let engine = engine_with(Arc::clone(&transport), None);
        engine.refresh_rules().unwrap();
        assert_eq!(engine.get_feature_value("geo").as_deref(), Some("eu"));
    }

    #[test]
    fn cached_rules_survive_restart() {
        let store = Arc::new(MemoryStore::new());
        let transport = Arc::new(FakeTransport::serving("v1", DOC_A));
        {
            let engine = engine_with(Arc::clone(&transport), Some(Arc::clone(&store)));
            engine.refresh_rules().unwrap();
            assert_eq!(engine.get_feature_value("x").as_deref(), Some("a"));
        }

        // A fresh engine against the same store serves cached rules with no
        // network traffic.
        let offline = Arc::new(FakeTransport::serving("v1", DOC_A));
        let engine = engine_with(Arc::clone(&offline), Some(Arc::clone(&store)));
        assert_eq!(engine.get_feature_value("x").as_deref(), Some("a"));
        assert_eq!(offline.pointer_fetches.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn failed_fetch_keeps_installed_rules_and_fires_ready() {
        struct FailingTransport;
        impl RuleTransport for FailingTransport {
            fn fetch_pointer(&self) -> crate::Result<PointerFetch> {
                Err(Error::Unauthorized)
            }
            fn fetch_document(&self, _pointer: &PointerDoc) -> crate::Result<String> {
                Err(Error::Unauthorized)
            }
        }

        let store = Arc::new(MemoryStore::new());
        {
            let transport = Arc::new(FakeTransport::serving("v1", DOC_A));
            let engine = engine_with(transport, Some(Arc::clone(&store)));
            engine.refresh_rules().unwrap();
        }

        let ready = Arc::new(AtomicUsize::new(0));
        let ready_counter = Arc::clone(&ready);
        let config = EngineConfig::new("acme", "app", "prod", "key")
            .auto_refresh(false)
            .store(store)
            .transport(Arc::new(FailingTransport))
            .on_ready(move || {
                ready_counter.fetch_add(1, Ordering::SeqCst);
            });
        let engine = Engine::new(config).unwrap();

        assert!(engine.refresh_rules().is_err());
        assert_eq!(engine.get_feature_value("x").as_deref(), Some("a"));
        assert_eq!(ready.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn malformed_document_keeps_previous_rules() {
        let transport = Arc::new(FakeTransport::serving("v1", DOC_A));
        let engine = engine_with(Arc::clone(&transport), None);
        engine.refresh_rules().unwrap();

        *transport.version.lock().unwrap() = "v2".to_owned();
        *transport.document.lock().unwrap() = "not json".to_owned();

        assert!(matches!(engine.refresh_rules(), Err(Error::Parse(_))));
        assert_eq!(engine.get_feature_value("x").as_deref(), Some("a"));
    }

    #[test]
    fn updated_callback_fires_per_install() {
        let updates = Arc::new(AtomicUsize::new(0));
        let update_counter = Arc::clone(&updates);
        let transport = Arc::new(FakeTransport::serving("v1", DOC_A));
        let config = EngineConfig::new("acme", "app", "prod", "key")
            .auto_refresh(false)
            .transport(Arc::clone(&transport) as Arc<dyn RuleTransport>)
            .on_rules_updated(move || {
                update_counter.fetch_add(1, Ordering::SeqCst);
            });
        let engine = Engine::new(config).unwrap();

        engine.refresh_rules().unwrap();
        assert_eq!(updates.load(Ordering::SeqCst), 1);

        // Same version: no new install, no callback.
        engine.refresh_rules().unwrap();
        assert_eq!(updates.load(Ordering::SeqCst), 1);

        *transport.version.lock().unwrap() = "v2".to_owned();
        *transport.document.lock().unwrap() = DOC_B.to_owned();
        engine.refresh_rules().unwrap();
        assert_eq!(updates.load(Ordering::SeqCst), 2);
        assert_eq!(engine.get_feature_value("x").as_deref(), Some("b"));
    }

    #[test]
    fn auto_refresh_fetches_on_startup() {
        let transport = Arc::new(FakeTransport::serving("v1", DOC_A));
        let config =
            EngineConfig::new("acme", "app", "prod", "key").transport(Arc::clone(&transport) as Arc<dyn RuleTransport>);
        let engine = Engine::new(config).unwrap();

        engine.wait_for_rules().unwrap();
        assert_eq!(engine.get_feature_value("x").as_deref(), Some("a"));
        assert_eq!(transport.pointer_fetches.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn device_identity_is_created_once() {
        let store = Arc::new(MemoryStore::new());
        {
            let _engine = engine_with(
                Arc::new(FakeTransport::serving("v1", DOC_A)),
                Some(Arc::clone(&store)),
            );
        }
        let device_id = store.get(DEVICE_ID_KEY).unwrap().unwrap();
        assert_eq!(device_id.len(), 22);
        assert!(store.get(FIRST_OPEN_KEY).unwrap().is_some());

        {
            let _engine = engine_with(
                Arc::new(FakeTransport::serving("v1", DOC_A)),
                Some(Arc::clone(&store)),
            );
        }
        assert_eq!(store.get(DEVICE_ID_KEY).unwrap().unwrap(), device_id);
    }
}
