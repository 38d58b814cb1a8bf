//! `flipkit` is a client-side feature-flag and remote-configuration engine.
//!
//! Hosts log behavioral events and set user/device properties; the engine
//! evaluates declaratively authored rules locally and returns a value (or
//! absence) for each named feature. Rule documents are delivered through an
//! immutable content-addressed object store fronted by a small pointer
//! file; the engine never phones home for individual evaluations.
//!
//! # Overview
//!
//! The crate is organized as a set of building blocks around [`Engine`]:
//! the event history, the property bags, the rule evaluator with its
//! indexes, the cached feature-value table with change listeners, and the
//! fetch/persist lifecycle. Hosts that only need local evaluation can stay
//! entirely offline via [`Engine::new_local`].
//!
//! # Example
//!
//! ```no_run
//! # use flipkit::{Engine, EngineConfig};
//! let engine = Engine::new(EngineConfig::new(
//!     "acme", "shop-app", "production", "api-key",
//! ))?;
//! engine.log_event("level_complete");
//! if engine.is_feature_enabled("celebration_popup") {
//!     // show it
//! }
//! # Ok::<(), flipkit::Error>(())
//! ```

#![warn(rustdoc::missing_crate_level_docs)]

pub mod comparator;
pub mod event_log;
pub mod fetcher;
pub mod persistence;
pub mod rules;

mod config;
mod engine;
mod error;
mod feature_table;
mod listeners;
mod poller_thread;
mod properties;
mod values;

pub use config::EngineConfig;
pub use engine::Engine;
pub use error::{Error, Result};
pub use event_log::EventRecord;
pub use listeners::ListenerToken;
pub use values::DynValue;
