#![forbid(unsafe_code, future_incompatible)]
#![deny(
    missing_docs,
    missing_debug_implementations,
    missing_copy_implementations,
    nonstandard_style,
    unused_qualifications,
    unused_import_braces,
    unused_extern_crates,
    trivial_casts,
    trivial_numeric_casts
)]
#![cfg_attr(docsrs, feature(doc_cfg))]
//! A client-side HTTP request scheduling and caching library.
//!
//! Requests are submitted to a [`RequestQueue`] and resolved cache-first: a
//! dedicated cache worker serves fresh entries immediately, routes misses and
//! expired entries to a pool of network workers (attaching `If-None-Match` /
//! `If-Modified-Since` revalidation hints from the stale entry), and delivers
//! soft-expired entries right away while scheduling a background refresh
//! (stale-while-revalidate). Parsed results are marshalled back to the caller
//! on a designated delivery context, typically a serial executor standing in
//! for an application's main thread.
//!
//! The transport and the storage backend are injected: implement [`Network`]
//! (or use [`BasicNetwork`] over an [`HttpStack`]) and [`Cache`] (or use the
//! bundled disk-backed [`DiskCache`]).
//!
//! ## Basic Usage
//!
//! ```no_run
//! use http_dispatch::{
//!     Network, NetworkResponse, Priority, Request, RequestHandle,
//!     RequestQueue, Result,
//! };
//! use http::Method;
//! use std::sync::Arc;
//!
//! // A stand-in transport; real applications use `BasicNetwork` over an
//! // `HttpStack` or bring their own client.
//! struct StaticNetwork;
//!
//! impl Network for StaticNetwork {
//!     fn perform_request(
//!         &self,
//!         _request: &dyn RequestHandle,
//!     ) -> Result<NetworkResponse> {
//!         Ok(NetworkResponse::new(200, b"hello".to_vec(), Default::default()))
//!     }
//! }
//!
//! fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
//!     let mut queue = RequestQueue::builder(Arc::new(StaticNetwork))
//!         .cache_dir("./request-cache")
//!         .build()?;
//!     queue.start()?;
//!
//!     let request = Request::new(
//!         Method::GET,
//!         "https://example.com/greeting".parse()?,
//!         |response| Ok(String::from_utf8_lossy(&response.data).into_owned()),
//!     )
//!     .with_priority(Priority::High)
//!     .on_response(|response| println!("got: {}", response.result))
//!     .on_error(|error| eprintln!("failed: {error}"));
//!
//!     let handle = queue.add(request);
//!     // `handle.cancel()` would drop the request at the next checkpoint.
//!     # drop(handle);
//!     Ok(())
//! }
//! ```
//!
//! ## Features
//!
//! The following features are available. All are disabled by default.
//!
//! - `manager-moka`: enable [moka](https://github.com/moka-rs/moka),
//! an in-memory cache, backend manager.
//! - `stack-ureq`: enable a socket layer for [`BasicNetwork`] backed by
//! [ureq](https://github.com/algesten/ureq).
mod delivery;
mod dispatch;
mod error;
mod headers;
mod managers;
mod network;
mod queue;
mod request;
mod retry;

#[cfg(feature = "stack-ureq")]
mod stack;

#[cfg(test)]
mod test;

use std::{collections::HashMap, io, time::SystemTime};

use serde::{Deserialize, Serialize};

pub use delivery::{
    Executor, ExecutorDelivery, ResponseDelivery, SerialExecutor,
};
pub use error::{RequestError, Result};
pub use headers::parse_cache_headers;
pub use managers::disk::DiskCache;
pub use network::{BasicNetwork, HttpStack, StackResponse};
pub use queue::{RequestQueue, RequestQueueBuilder};
pub use request::{
    ErasedResponse, Priority, Request, RequestHandle, Response, SharedRequest,
};
pub use retry::{DefaultRetryPolicy, RetryPolicy};

#[cfg(feature = "manager-moka")]
#[cfg_attr(docsrs, doc(cfg(feature = "manager-moka")))]
pub use managers::moka::MokaManager;

// Exposing the moka cache for convenience, renaming to avoid naming conflicts
#[cfg(feature = "manager-moka")]
#[cfg_attr(docsrs, doc(cfg(feature = "manager-moka")))]
pub use moka::sync::{Cache as MokaCache, CacheBuilder as MokaCacheBuilder};

#[cfg(feature = "stack-ureq")]
#[cfg_attr(docsrs, doc(cfg(feature = "stack-ureq")))]
pub use stack::UreqStack;

/// Milliseconds since the Unix epoch, the time base for entry expiry
pub(crate) fn now_millis() -> i64 {
    match SystemTime::now().duration_since(SystemTime::UNIX_EPOCH) {
        Ok(elapsed) => elapsed.as_millis() as i64,
        Err(_) => 0,
    }
}

/// A raw HTTP exchange result as handed back by the transport
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NetworkResponse {
    /// HTTP status code
    pub status: u16,
    /// Response body
    pub data: Vec<u8>,
    /// Response headers
    pub headers: HashMap<String, String>,
    /// True when the server answered 304 to a conditional request; the
    /// transport fills `data` from the stale cache entry in that case
    pub not_modified: bool,
    /// Round-trip duration in milliseconds, including retries
    pub network_time_ms: i64,
}

impl NetworkResponse {
    /// Create a plain (non-conditional) response with no time stamp
    pub fn new(
        status: u16,
        data: Vec<u8>,
        headers: HashMap<String, String>,
    ) -> Self {
        Self { status, data, headers, not_modified: false, network_time_ms: 0 }
    }
}

/// A cached response body together with its freshness metadata.
///
/// All times are absolute milliseconds since the Unix epoch.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct CacheEntry {
    /// Response body
    pub data: Vec<u8>,
    /// Entity tag for revalidation, when the server provided one
    pub etag: Option<String>,
    /// Server `Date` at the time of the original exchange
    pub server_date: i64,
    /// Server `Last-Modified` for the resource
    pub last_modified: i64,
    /// Hard expiry: past this instant the entry must be revalidated
    pub ttl: i64,
    /// Soft expiry: past this instant the entry is served once while a
    /// refresh runs behind it
    pub soft_ttl: i64,
    /// Response headers as received
    pub response_headers: HashMap<String, String>,
}

impl CacheEntry {
    /// True when the entry is past its hard expiry
    pub fn is_expired(&self) -> bool {
        now_millis() > self.ttl
    }

    /// True when the entry is past its soft expiry and should be refreshed
    pub fn refresh_needed(&self) -> bool {
        now_millis() > self.soft_ttl
    }
}

/// A byte-level response store keyed by cache key.
///
/// Implementations must be internally synchronized: the cache worker and the
/// network workers call `get` and `put` concurrently. I/O failures are
/// reported as plain [`io::Error`]s; the dispatch engine logs them and falls
/// back to miss semantics rather than failing the request.
pub trait Cache: Send + Sync {
    /// One-time setup, called by the cache worker before it starts draining
    /// its queue. May perform blocking I/O.
    fn initialize(&self) -> io::Result<()>;

    /// Look up an entry
    fn get(&self, key: &str) -> io::Result<Option<CacheEntry>>;

    /// Store an entry, replacing any previous one under the same key
    fn put(&self, key: &str, entry: CacheEntry) -> io::Result<()>;

    /// Expire an entry in place: with `full_expire` the hard expiry is
    /// zeroed, otherwise only the soft expiry
    fn invalidate(&self, key: &str, full_expire: bool) -> io::Result<()>;

    /// Drop an entry
    fn remove(&self, key: &str) -> io::Result<()>;

    /// Drop every entry
    fn clear(&self) -> io::Result<()>;
}

/// A transport performing one HTTP round trip.
///
/// The transport owns everything between the dispatcher and the socket: it
/// injects `If-None-Match` / `If-Modified-Since` from the request's cache
/// hint, executes the request's retry policy, maps low-level failures onto
/// [`RequestError`] kinds, and on a 304 synthesizes the response body from
/// the stale entry. [`BasicNetwork`] implements this contract over an
/// [`HttpStack`].
pub trait Network: Send + Sync {
    /// Perform the round trip for `request`, blocking through retries
    fn perform_request(
        &self,
        request: &dyn RequestHandle,
    ) -> Result<NetworkResponse>;
}
