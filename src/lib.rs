//! Offline-resilient access layer for a Pokédex REST API.
//!
//! [`ApiHelper`] is the entry point: it composes the response cache, the
//! priority request scheduler, per-host rate limiting, connectivity tracking
//! and the offline sync outbox. [`pokedex::PokedexClient`] layers typed
//! endpoints on top.

pub mod api;
pub mod backoff;
pub mod cache;
pub mod cancellation;
pub mod config;
pub mod connectivity;
pub mod error;
pub mod pokedex;
pub mod queue;
pub mod rate_limiter;
pub mod request;
pub mod storage;
pub mod sync;
pub mod transport;

#[cfg(test)]
mod test_support;

use std::sync::{Mutex, MutexGuard, PoisonError};

pub use api::{ApiHelper, ApiHelperConfig, ApiResponse, GetOptions, ResponseSource, ResponseStatus};
pub use error::ApiError;

/// Lock a mutex, recovering the data if a previous holder panicked.
///
/// Guarded state is only mutated in short non-panicking sections, so the
/// data is consistent even after poisoning.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
  mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
