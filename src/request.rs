use std::{
    any::Any,
    collections::HashMap,
    fmt,
    sync::atomic::{AtomicBool, Ordering},
    sync::{Arc, Weak},
    thread,
    time::{Duration, Instant},
};

use http::Method;
use log::debug;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::{
    error::{RequestError, Result},
    headers::parse_cache_headers,
    queue::QueueCore,
    retry::{DefaultRetryPolicy, RetryPolicy},
    CacheEntry, NetworkResponse,
};

/// Requests whose event log spans at least this long are dumped on finish
const SLOW_REQUEST_THRESHOLD: Duration = Duration::from_millis(3000);

/// Scheduling priority of a request.
///
/// Queues order by priority first, submission order second.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    Deserialize,
    Serialize,
)]
pub enum Priority {
    /// Background work, drained last
    Low,
    /// The default
    #[default]
    Normal,
    /// Ahead of normal traffic
    High,
    /// Jumps every other class
    Immediate,
}

/// A request as the dispatchers see it, shared between the worker pools.
pub type SharedRequest = Arc<dyn RequestHandle>;

/// A successful delivery handed to a request's response listener.
#[derive(Debug)]
pub struct Response<T> {
    /// The parsed payload
    pub result: T,
    /// Freshness metadata derived from the response headers, when the
    /// response was cacheable
    pub cache_entry: Option<CacheEntry>,
    /// True for the early delivery of a soft-expired cache entry; a terminal
    /// delivery follows once the background refresh completes
    pub intermediate: bool,
}

/// A parsed response with its concrete payload type erased.
///
/// Dispatchers move these between threads without knowing the payload type;
/// the originating request recovers it at delivery time.
pub struct ErasedResponse {
    pub(crate) payload: Box<dyn Any + Send>,
    pub(crate) cache_entry: Option<CacheEntry>,
    pub(crate) intermediate: bool,
}

impl ErasedResponse {
    /// True for the early delivery of a soft-expired cache entry
    pub fn intermediate(&self) -> bool {
        self.intermediate
    }

    /// The freshness metadata attached by the parser, if any
    pub fn cache_entry(&self) -> Option<&CacheEntry> {
        self.cache_entry.as_ref()
    }
}

impl fmt::Debug for ErasedResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErasedResponse")
            .field("cache_entry", &self.cache_entry.is_some())
            .field("intermediate", &self.intermediate)
            .finish_non_exhaustive()
    }
}

struct Marker {
    name: String,
    thread: String,
    at: Instant,
}

#[derive(Default)]
struct MarkerLog {
    markers: Vec<Marker>,
    finished: bool,
}

impl MarkerLog {
    fn add(&mut self, name: &str) {
        if self.finished {
            return;
        }
        let current = thread::current();
        let thread = current
            .name()
            .map(str::to_owned)
            .unwrap_or_else(|| format!("{:?}", current.id()));
        self.markers.push(Marker { name: name.to_owned(), thread, at: Instant::now() });
    }

    fn finish(&mut self, header: &str) {
        if self.finished {
            return;
        }
        self.finished = true;
        let (Some(first), Some(last)) =
            (self.markers.first(), self.markers.last())
        else {
            return;
        };
        let total = last.at.duration_since(first.at);
        if total < SLOW_REQUEST_THRESHOLD {
            return;
        }
        debug!("{} ({}ms total)", header, total.as_millis());
        let mut previous = first.at;
        for marker in &self.markers {
            debug!(
                "(+{:>4}ms) [{}] {}",
                marker.at.duration_since(previous).as_millis(),
                marker.thread,
                marker.name
            );
            previous = marker.at;
        }
    }
}

/// The type-erased view of a request that the dispatch engine operates on.
///
/// [`Request`] implements this; the worker pools, the delivery layer, and
/// transport implementations all speak this trait so requests of different
/// payload types can share the same queues.
pub trait RequestHandle: Send + Sync {
    /// Submission order, assigned by [`RequestQueue::add`](crate::RequestQueue::add)
    fn sequence(&self) -> u64;

    /// HTTP method
    fn method(&self) -> &Method;

    /// Target URL
    fn url(&self) -> &Url;

    /// Key identifying the cached resource; defaults to the URL
    fn cache_key(&self) -> &str;

    /// Scheduling priority
    fn priority(&self) -> Priority;

    /// Caller-supplied grouping tag, if any
    fn tag(&self) -> Option<&str>;

    /// Extra request headers to send verbatim
    fn headers(&self) -> &HashMap<String, String>;

    /// Request body, if any
    fn body(&self) -> Option<&[u8]>;

    /// Whether responses may be served from and written to the cache
    fn should_cache(&self) -> bool;

    /// Flag the request as canceled; checkpoints drop it from there on
    fn cancel(&self);

    /// True once [`cancel`](Self::cancel) has been called
    fn is_canceled(&self) -> bool;

    /// The stale entry attached by the cache worker for revalidation
    fn cache_entry(&self) -> Option<CacheEntry>;

    /// Attach a stale entry so the transport can revalidate against it
    fn set_cache_entry(&self, entry: CacheEntry);

    /// Record that the terminal response is on its way to the listener
    fn mark_delivered(&self);

    /// True once any success delivery (including an intermediate one) has
    /// invoked the listener
    fn has_had_response_delivered(&self) -> bool;

    /// The retry policy's current per-attempt timeout, in milliseconds
    fn retry_timeout_ms(&self) -> u64;

    /// How many retries the policy has consumed so far
    fn retry_count(&self) -> u32;

    /// Ask the retry policy for another attempt; returns `error` when the
    /// policy is exhausted
    fn retry(&self, error: RequestError) -> Result<()>;

    /// Append an event marker to the request's log
    fn add_marker(&self, name: &str);

    /// End the request's life: record `reason`, dump the marker log when the
    /// request was slow, and release it from the owning queue. Idempotent;
    /// only the first call has any effect.
    fn finish(&self, reason: &str);

    /// Run the caller's parser over a raw response and derive cache metadata
    fn parse_network_response(
        &self,
        response: NetworkResponse,
    ) -> Result<ErasedResponse>;

    /// Give the request a chance to refine a transport error, e.g. by
    /// extracting details from an error body
    fn parse_network_error(&self, error: RequestError) -> RequestError;

    /// Invoke the response listener with a recovered payload
    fn deliver_response(&self, response: ErasedResponse);

    /// Invoke the error listener
    fn deliver_error(&self, error: RequestError);
}

type Parser<T> = Box<dyn Fn(&NetworkResponse) -> Result<T> + Send + Sync>;
type ErrorParser = Box<dyn Fn(RequestError) -> RequestError + Send + Sync>;
type ResponseListener<T> = Box<dyn FnMut(Response<T>) + Send>;
type ErrorListener = Box<dyn FnMut(RequestError) + Send>;

/// A single HTTP request with a typed payload.
///
/// Built by the caller, then handed to
/// [`RequestQueue::add`](crate::RequestQueue::add), which assigns its
/// sequence number and owns it until [`finish`](RequestHandle::finish).
pub struct Request<T> {
    method: Method,
    url: Url,
    cache_key: Option<String>,
    priority: Priority,
    tag: Option<String>,
    headers: HashMap<String, String>,
    body: Option<Vec<u8>>,
    should_cache: bool,
    sequence: u64,
    queue: Weak<QueueCore>,
    canceled: AtomicBool,
    delivered: AtomicBool,
    response_delivered: AtomicBool,
    finished: AtomicBool,
    cache_entry: Mutex<Option<CacheEntry>>,
    retry_policy: Mutex<Box<dyn RetryPolicy>>,
    parser: Parser<T>,
    error_parser: Option<ErrorParser>,
    on_response: Mutex<Option<ResponseListener<T>>>,
    on_error: Mutex<Option<ErrorListener>>,
    log: Mutex<MarkerLog>,
}

impl<T> fmt::Debug for Request<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("method", &self.method)
            .field("url", &self.url.as_str())
            .field("sequence", &self.sequence)
            .field("priority", &self.priority)
            .field("should_cache", &self.should_cache)
            .field("canceled", &self.canceled.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl<T: Send + 'static> Request<T> {
    /// Create a request for `url` whose response body is parsed by `parser`.
    ///
    /// Defaults: [`Priority::Normal`], caching enabled, cache key = URL,
    /// [`DefaultRetryPolicy`], no listeners.
    pub fn new(
        method: Method,
        url: Url,
        parser: impl Fn(&NetworkResponse) -> Result<T> + Send + Sync + 'static,
    ) -> Self {
        Self {
            method,
            url,
            cache_key: None,
            priority: Priority::Normal,
            tag: None,
            headers: HashMap::new(),
            body: None,
            should_cache: true,
            sequence: 0,
            queue: Weak::new(),
            canceled: AtomicBool::new(false),
            delivered: AtomicBool::new(false),
            response_delivered: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            cache_entry: Mutex::new(None),
            retry_policy: Mutex::new(Box::new(DefaultRetryPolicy::default())),
            parser: Box::new(parser),
            error_parser: None,
            on_response: Mutex::new(None),
            on_error: Mutex::new(None),
            log: Mutex::new(MarkerLog::default()),
        }
    }

    /// Override the cache key (defaults to the full URL)
    pub fn with_cache_key(mut self, cache_key: impl Into<String>) -> Self {
        self.cache_key = Some(cache_key.into());
        self
    }

    /// Set the scheduling priority
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Attach a grouping tag for bulk cancellation
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    /// Add a request header sent verbatim by the transport
    pub fn with_header(
        mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Attach a request body
    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.body = Some(body);
        self
    }

    /// Opt the request out of (or back into) the cache path
    pub fn with_should_cache(mut self, should_cache: bool) -> Self {
        self.should_cache = should_cache;
        self
    }

    /// Replace the retry policy
    pub fn with_retry_policy(
        mut self,
        policy: impl RetryPolicy + 'static,
    ) -> Self {
        self.retry_policy = Mutex::new(Box::new(policy));
        self
    }

    /// Install a hook refining transport errors before delivery
    pub fn with_error_parser(
        mut self,
        error_parser: impl Fn(RequestError) -> RequestError + Send + Sync + 'static,
    ) -> Self {
        self.error_parser = Some(Box::new(error_parser));
        self
    }

    /// Install the success listener.
    ///
    /// It may run twice for one request: once with
    /// [`Response::intermediate`] set (stale cache entry served while a
    /// refresh runs) and once terminally.
    pub fn on_response(
        self,
        listener: impl FnMut(Response<T>) + Send + 'static,
    ) -> Self {
        *self.on_response.lock() = Some(Box::new(listener));
        self
    }

    /// Install the error listener; runs at most once, and never together
    /// with a terminal success delivery
    pub fn on_error(
        self,
        listener: impl FnMut(RequestError) + Send + 'static,
    ) -> Self {
        *self.on_error.lock() = Some(Box::new(listener));
        self
    }

    /// Wire the request into its owning queue at submission time
    pub(crate) fn bind(&mut self, sequence: u64, queue: Weak<QueueCore>) {
        self.sequence = sequence;
        self.queue = queue;
        self.log.lock().add("add-to-queue");
    }

    #[cfg(test)]
    pub(crate) fn markers(&self) -> Vec<String> {
        self.log.lock().markers.iter().map(|marker| marker.name.clone()).collect()
    }
}

impl<T: Send + 'static> RequestHandle for Request<T> {
    fn sequence(&self) -> u64 {
        self.sequence
    }

    fn method(&self) -> &Method {
        &self.method
    }

    fn url(&self) -> &Url {
        &self.url
    }

    fn cache_key(&self) -> &str {
        self.cache_key.as_deref().unwrap_or_else(|| self.url.as_str())
    }

    fn priority(&self) -> Priority {
        self.priority
    }

    fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    fn body(&self) -> Option<&[u8]> {
        self.body.as_deref()
    }

    fn should_cache(&self) -> bool {
        self.should_cache
    }

    fn cancel(&self) {
        self.canceled.store(true, Ordering::SeqCst);
    }

    fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::SeqCst)
    }

    fn cache_entry(&self) -> Option<CacheEntry> {
        self.cache_entry.lock().clone()
    }

    fn set_cache_entry(&self, entry: CacheEntry) {
        *self.cache_entry.lock() = Some(entry);
    }

    fn mark_delivered(&self) {
        self.delivered.store(true, Ordering::SeqCst);
    }

    fn has_had_response_delivered(&self) -> bool {
        self.response_delivered.load(Ordering::SeqCst)
    }

    fn retry_timeout_ms(&self) -> u64 {
        self.retry_policy.lock().current_timeout_ms()
    }

    fn retry_count(&self) -> u32 {
        self.retry_policy.lock().current_retry_count()
    }

    fn retry(&self, error: RequestError) -> Result<()> {
        self.retry_policy.lock().retry(error)
    }

    fn add_marker(&self, name: &str) {
        self.log.lock().add(name);
    }

    fn finish(&self, reason: &str) {
        if self.finished.swap(true, Ordering::SeqCst) {
            return;
        }
        {
            let mut log = self.log.lock();
            log.add(reason);
            log.finish(&format!("{} {}", self.method, self.url));
        }
        if let Some(core) = self.queue.upgrade() {
            core.finish(self.sequence, self.cache_key(), self.should_cache);
        }
    }

    fn parse_network_response(
        &self,
        response: NetworkResponse,
    ) -> Result<ErasedResponse> {
        let result = (self.parser)(&response)?;
        let cache_entry = parse_cache_headers(&response);
        Ok(ErasedResponse {
            payload: Box::new(result),
            cache_entry,
            intermediate: false,
        })
    }

    fn parse_network_error(&self, error: RequestError) -> RequestError {
        match &self.error_parser {
            Some(refine) => refine(error),
            None => error,
        }
    }

    fn deliver_response(&self, response: ErasedResponse) {
        self.response_delivered.store(true, Ordering::SeqCst);
        let ErasedResponse { payload, cache_entry, intermediate } = response;
        match payload.downcast::<T>() {
            Ok(result) => {
                if let Some(listener) = self.on_response.lock().as_mut() {
                    listener(Response {
                        result: *result,
                        cache_entry,
                        intermediate,
                    });
                }
            }
            Err(_) => {
                log::error!("response payload type mismatch for {}", self.url)
            }
        }
    }

    fn deliver_error(&self, error: RequestError) {
        if let Some(listener) = self.on_error.lock().as_mut() {
            listener(error);
        }
    }
}
