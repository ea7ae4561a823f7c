//! Pre-rendered HTML snapshots for crawlers.
//!
//! Pathnames are matched against configured routes, rendered by a headless
//! browser running in a supervised worker pool, and cached with a TTL. Stale
//! snapshots are served while a single-flight scheduler regenerates them.

pub mod application;
pub mod cache;
pub mod config;
pub mod domain;
pub mod infra;
pub(crate) mod util;
