//! TimeBlocker Core Library
//!
//! This crate provides the decision engine behind the TimeBlocker browser
//! extension: which hostnames are blocked outright, which are tracked
//! against a daily time budget, and what the extension should do when a
//! tab navigates or changes focus.
//!
//! # Architecture
//!
//! All state lives in an explicit [`TrackerState`] owned by the background
//! context. Browser events and popup messages are handled by pure
//! functions in [`dispatch`] that mutate the state and return
//! [`Effect`]s (redirect, notify, persist) for the host to carry out.
//! With the `runtime` feature, [`service::BackgroundService`] drives those
//! functions on tokio, with periodic re-check and day-rollover tasks and a
//! serialized writer to the key-value store.
//!
//! # Modules
//!
//! - `domain`: hostname/registered-domain matching and input normalization
//! - `url`: host extraction from navigation URLs
//! - `tracker`: per-domain time budgets and the single active-tab interval
//! - `engine`: the block decision
//! - `state`: the owned state and its key-value storage encoding
//! - `store`: the persistence gateway trait and an in-memory store
//! - `dispatch`: event and message handlers
//! - `config`: tunables
//! - `service`: tokio background service (feature `runtime`)
//! - `types`: shared type definitions

pub mod config;
pub mod dispatch;
pub mod domain;
pub mod engine;
pub mod error;
pub mod state;
pub mod store;
pub mod tracker;
pub mod types;
pub mod url;

#[cfg(feature = "runtime")]
pub mod service;

// Re-export commonly used types
pub use config::TrackerConfig;
pub use dispatch::{BrowserEvent, Effect, Message, Overview, Reply, WebsiteStatus};
pub use domain::{best_match, matches, normalize_domain_input};
pub use engine::BlockDecisionEngine;
pub use error::{Error, Result};
pub use state::{StateKeys, TrackerState};
pub use store::{MemoryStore, StateStore, StoreMap};
pub use tracker::{Threshold, ThresholdContext, TimeBudgetTracker};
pub use types::{DayKey, Decision, Millis, TabId, TrackedWebsite};

#[cfg(feature = "runtime")]
pub use service::{BackgroundService, Clock, ManualClock, Presenter, SystemClock};
