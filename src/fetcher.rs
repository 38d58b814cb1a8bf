//! HTTP delivery of rule documents: a small pointer file names the current
//! immutable, content-addressed document.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::{Error, Result};

/// The pointer document. Only `version` is required; everything else is
/// advisory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PointerDoc {
    #[serde(default)]
    pub schema_version: Option<String>,
    /// Content hash naming the current immutable rule document.
    pub version: String,
    /// Optional path of the immutable document, relative to the base URL.
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
    #[serde(default)]
    pub feature_count: Option<u64>,
    #[serde(default)]
    pub ttl_secs: Option<u64>,
    /// Server-mandated floor for the local poll interval.
    #[serde(default)]
    pub min_poll_interval_secs: Option<u64>,
}

/// Result of a pointer fetch: the document plus response metadata the
/// engine folds into device properties.
#[derive(Debug, Clone)]
pub struct PointerFetch {
    pub pointer: PointerDoc,
    /// Country reported by the delivery edge, when known.
    pub country: Option<String>,
}

/// Transport used to fetch the pointer and immutable rule documents. The
/// engine only ever talks to this interface; tests substitute a scripted
/// implementation.
pub trait RuleTransport: Send + Sync {
    fn fetch_pointer(&self) -> Result<PointerFetch>;
    fn fetch_document(&self, pointer: &PointerDoc) -> Result<String>;
}

pub const DEFAULT_BASE_URL: &str = "https://rules.flipkit.io/v1";

const API_KEY_HEADER: &str = "X-Api-Key";
const COUNTRY_HEADER: &str = "Country";
/// Timeout for pointer and document requests.
const RESOURCE_TIMEOUT: Duration = Duration::from_secs(30);

/// Production transport over HTTPS.
pub struct HttpTransport {
    // Client holds a connection pool internally, so we're reusing the client
    // between requests.
    client: reqwest::blocking::Client,
    base_url: String,
    api_key: String,
    pointer_path: String,
    /// If we receive a 401 Unauthorized error during a request, it means the
    /// API key is not valid. We cache this error so we don't issue
    /// additional requests to the server.
    unauthorized: AtomicBool,
}

impl HttpTransport {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        company: &str,
        tenant: &str,
        environment: &str,
    ) -> Result<HttpTransport> {
        let client = reqwest::blocking::Client::builder()
            .timeout(RESOURCE_TIMEOUT)
            .build()?;
        Ok(HttpTransport {
            client,
            base_url: base_url.into(),
            api_key: api_key.into(),
            pointer_path: format!("pointers/{company}/{tenant}/{environment}.json"),
            unauthorized: AtomicBool::new(false),
        })
    }

    fn url(&self, path: &str) -> Result<Url> {
        Url::parse(&format!("{}/{}", self.base_url.trim_end_matches('/'), path))
            .map_err(Error::InvalidBaseUrl)
    }

    fn get(&self, url: Url) -> Result<reqwest::blocking::Response> {
        if self.unauthorized.load(Ordering::Relaxed) {
            return Err(Error::Unauthorized);
        }

        let response = self
            .client
            .get(url)
            .header(API_KEY_HEADER, &self.api_key)
            .header(reqwest::header::CACHE_CONTROL, "no-store")
            .send()?;

        response.error_for_status().map_err(|err| {
            if err.status() == Some(StatusCode::UNAUTHORIZED) {
                log::warn!(target: "flipkit", "client is not authorized. Check your API key");
                self.unauthorized.store(true, Ordering::Relaxed);
                Error::Unauthorized
            } else {
                log::warn!(target: "flipkit", "received non-200 response while fetching rules: {err:?}");
                Error::from(err)
            }
        })
    }
}

impl RuleTransport for HttpTransport {
    fn fetch_pointer(&self) -> Result<PointerFetch> {
        log::debug!(target: "flipkit", "fetching rules pointer");
        let response = self.get(self.url(&self.pointer_path)?)?;

        let country = response
            .headers()
            .get(COUNTRY_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);

        let body = response.text()?;
        let pointer: PointerDoc = serde_json::from_str(&body)?;

        log::debug!(target: "flipkit", "pointer names rules version {}", pointer.version);
        Ok(PointerFetch { pointer, country })
    }

    fn fetch_document(&self, pointer: &PointerDoc) -> Result<String> {
        let path = match &pointer.path {
            Some(path) => path.clone(),
            None => format!("objects/{}.json", pointer.version),
        };

        log::debug!(target: "flipkit", "fetching immutable rules document at {path}");
        let response = self.get(self.url(&path)?)?;
        Ok(response.text()?)
    }
}
