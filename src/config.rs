//! Host-facing engine configuration.

use std::sync::Arc;
use std::time::Duration;

use crate::event_log::{DEFAULT_MAX_AGE_DAYS, DEFAULT_MAX_EVENTS};
use crate::fetcher::{RuleTransport, DEFAULT_BASE_URL};
use crate::persistence::KeyValueStore;
use crate::{Error, Result};

/// Minimum allowed poll interval.
pub(crate) const MIN_POLL_INTERVAL: Duration = Duration::from_secs(60);
/// Maximum allowed poll interval.
pub(crate) const MAX_POLL_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(300);

pub(crate) type ReadyCallback = Arc<dyn Fn() + Send + Sync>;

/// Configuration for [`Engine`](crate::Engine).
///
/// # Examples
/// ```no_run
/// # use flipkit::{Engine, EngineConfig};
/// let engine = Engine::new(
///     EngineConfig::new("acme", "shop-app", "production", "api-key")
///         .poll_interval(std::time::Duration::from_secs(600)),
/// );
/// ```
pub struct EngineConfig {
    pub(crate) company: String,
    pub(crate) tenant: String,
    pub(crate) environment: String,
    pub(crate) api_key: String,
    pub(crate) base_url: String,
    pub(crate) auto_refresh: bool,
    pub(crate) poll_interval: Duration,
    pub(crate) max_events: usize,
    pub(crate) max_event_age_days: u32,
    pub(crate) debug: bool,
    pub(crate) store: Option<Arc<dyn KeyValueStore>>,
    pub(crate) transport: Option<Arc<dyn RuleTransport>>,
    pub(crate) on_ready: Option<ReadyCallback>,
    pub(crate) on_rules_updated: Option<ReadyCallback>,
}

impl EngineConfig {
    /// Create a configuration for the given tenant coordinates and API key.
    pub fn new(
        company: impl Into<String>,
        tenant: impl Into<String>,
        environment: impl Into<String>,
        api_key: impl Into<String>,
    ) -> EngineConfig {
        EngineConfig {
            company: company.into(),
            tenant: tenant.into(),
            environment: environment.into(),
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_owned(),
            auto_refresh: true,
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_events: DEFAULT_MAX_EVENTS,
            max_event_age_days: DEFAULT_MAX_AGE_DAYS,
            debug: false,
            store: None,
            transport: None,
            on_ready: None,
            on_rules_updated: None,
        }
    }

    /// Override base URL for rule delivery. Hosts should use the default
    /// setting in most cases.
    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Enable or disable the background refresh timer. Defaults to enabled.
    pub fn auto_refresh(mut self, enabled: bool) -> Self {
        self.auto_refresh = enabled;
        self
    }

    /// Set the poll interval. Clamped to [60 s, 24 h]. A server-advertised
    /// minimum can raise the effective interval further at runtime.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval.clamp(MIN_POLL_INTERVAL, MAX_POLL_INTERVAL);
        self
    }

    /// Cap on retained events. Clamped to [100, 100000].
    pub fn max_events(mut self, max_events: usize) -> Self {
        self.max_events = max_events;
        self
    }

    /// Cap on event age in days. Clamped to [1, 365].
    pub fn max_event_age_days(mut self, days: u32) -> Self {
        self.max_event_age_days = days;
        self
    }

    /// Log feature-value changes at debug level instead of trace.
    pub fn debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Durable backing store for the event history and rule cache. Without
    /// one, the engine runs fully in memory.
    pub fn store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Replace the HTTP transport. Primarily a test seam.
    pub fn transport(mut self, transport: Arc<dyn RuleTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Called once, after the first successful pointer check that leaves the
    /// engine with an installed rule set (or immediately on a failed check
    /// when cached rules already serve).
    pub fn on_ready(mut self, callback: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_ready = Some(Arc::new(callback));
        self
    }

    /// Called whenever a new immutable rule document is installed.
    pub fn on_rules_updated(mut self, callback: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_rules_updated = Some(Arc::new(callback));
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        for (label, value) in [
            ("company", &self.company),
            ("tenant", &self.tenant),
            ("environment", &self.environment),
        ] {
            if value.is_empty() {
                return Err(Error::InvalidConfiguration(format!("{label} must not be empty")));
            }
            if value.chars().any(char::is_whitespace) {
                return Err(Error::InvalidConfiguration(format!(
                    "{label} must not contain whitespace"
                )));
            }
        }
        if self.api_key.trim().is_empty() {
            return Err(Error::InvalidConfiguration("api_key must not be empty".to_owned()));
        }
        Ok(())
    }
}
