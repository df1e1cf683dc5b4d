//! A request-coalescing asynchronous loader.
//!
//! Callers submit keyed requests to a [`Loader`](loader::Loader). Concurrent requests that resolve
//! to the same mutated key share a single background computation, results are kept in a bounded
//! [`HistoryCache`](cache::HistoryCache), and every caller receives exactly one terminal
//! [`QueryOutcome`](loader::QueryOutcome).
//!
//! The crate also contains a small [`Connection`](connection::Connection) state machine for
//! handles to remote resources that are bound and unbound through an external callback source.

#[macro_use]
pub mod metrics;

pub mod cache;
pub mod config;
pub mod connection;
pub mod error;
pub mod loader;
pub mod logging;
pub mod pools;
pub mod utils;
