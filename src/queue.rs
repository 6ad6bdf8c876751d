use std::{
    cmp::Ordering as CmpOrdering,
    collections::{hash_map::Entry, BinaryHeap, HashMap, VecDeque},
    fmt, io,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    thread::JoinHandle,
};

use log::debug;
use parking_lot::{Condvar, Mutex};

use crate::{
    delivery::{ExecutorDelivery, ResponseDelivery, SerialExecutor},
    dispatch::{CacheDispatcher, NetworkDispatcher},
    managers::disk::DiskCache,
    request::{Request, RequestHandle, SharedRequest},
    Cache, Network,
};

/// Network worker pool size when none is configured
const DEFAULT_NETWORK_THREAD_POOL_SIZE: usize = 4;

/// Disk cache location when none is configured
const DEFAULT_CACHE_DIR: &str = "./http-dispatch-cache";

/// Disk cache budget when none is configured
const DEFAULT_DISK_CACHE_BYTES: u64 = 5 * 1024 * 1024;

/// Heap entry ordering: priority descending, then submission order
struct Enqueued(SharedRequest);

impl PartialEq for Enqueued {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl Eq for Enqueued {}

impl PartialOrd for Enqueued {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Enqueued {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.0
            .priority()
            .cmp(&other.0.priority())
            .then_with(|| other.0.sequence().cmp(&self.0.sequence()))
    }
}

/// A blocking priority queue shared between the coordinator and one worker
/// pool.
///
/// `take` parks until a request arrives or the caller's quit flag is raised;
/// the flag is re-checked before every pop, so shutdown never drains.
pub(crate) struct DispatchQueue {
    heap: Mutex<BinaryHeap<Enqueued>>,
    available: Condvar,
}

impl DispatchQueue {
    fn new() -> Self {
        Self { heap: Mutex::new(BinaryHeap::new()), available: Condvar::new() }
    }

    pub(crate) fn push(&self, request: SharedRequest) {
        self.heap.lock().push(Enqueued(request));
        self.available.notify_one();
    }

    pub(crate) fn take(&self, quit: &AtomicBool) -> Option<SharedRequest> {
        let mut heap = self.heap.lock();
        loop {
            if quit.load(Ordering::SeqCst) {
                return None;
            }
            if let Some(Enqueued(request)) = heap.pop() {
                return Some(request);
            }
            self.available.wait(&mut heap);
        }
    }

    /// Wake every parked worker so it can observe its quit flag.
    ///
    /// The heap lock is held while notifying: a worker between its quit
    /// check and its wait still holds that lock, so the notification cannot
    /// slip into that window and get lost.
    pub(crate) fn interrupt(&self) {
        let _heap = self.heap.lock();
        self.available.notify_all();
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.heap.lock().len()
    }
}

/// Shared coordinator state: both queues, the in-flight set, and the
/// waiting map that collapses duplicate in-flight cache keys.
pub(crate) struct QueueCore {
    pub(crate) cache_queue: DispatchQueue,
    pub(crate) network_queue: DispatchQueue,
    sequence: AtomicU64,
    current: Mutex<HashMap<u64, SharedRequest>>,
    waiting: Mutex<HashMap<String, VecDeque<SharedRequest>>>,
}

impl QueueCore {
    fn new() -> Self {
        Self {
            cache_queue: DispatchQueue::new(),
            network_queue: DispatchQueue::new(),
            sequence: AtomicU64::new(0),
            current: Mutex::new(HashMap::new()),
            waiting: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::SeqCst)
    }

    /// Register a freshly added request and route it to a queue.
    ///
    /// Cacheable requests whose cache key is already in flight are held on
    /// the waiting list and replayed when the leader finishes.
    pub(crate) fn submit(&self, request: SharedRequest) {
        self.current.lock().insert(request.sequence(), request.clone());

        if !request.should_cache() {
            self.network_queue.push(request);
            return;
        }

        let leader = {
            let mut waiting = self.waiting.lock();
            match waiting.entry(request.cache_key().to_owned()) {
                Entry::Occupied(mut held) => {
                    debug!(
                        "request for cache key {} is in flight, holding",
                        request.cache_key()
                    );
                    request.add_marker("waiting-for-response");
                    held.get_mut().push_back(request);
                    None
                }
                Entry::Vacant(slot) => {
                    slot.insert(VecDeque::new());
                    Some(request)
                }
            }
        };
        if let Some(request) = leader {
            self.cache_queue.push(request);
        }
    }

    /// Drop a finished request from the in-flight set and replay any held
    /// duplicates onto the cache queue
    pub(crate) fn finish(
        &self,
        sequence: u64,
        cache_key: &str,
        should_cache: bool,
    ) {
        self.current.lock().remove(&sequence);
        if !should_cache {
            return;
        }
        let released = self.waiting.lock().remove(cache_key);
        if let Some(followers) = released {
            if !followers.is_empty() {
                debug!(
                    "releasing {} held requests for cache key {}",
                    followers.len(),
                    cache_key
                );
            }
            for follower in followers {
                self.cache_queue.push(follower);
            }
        }
    }

    pub(crate) fn cancel_all(&self, filter: &dyn Fn(&dyn RequestHandle) -> bool) {
        for request in self.current.lock().values() {
            if filter(request.as_ref()) {
                request.cancel();
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn in_flight(&self) -> usize {
        self.current.lock().len()
    }
}

struct Worker {
    quit: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

/// The request coordinator.
///
/// Owns the cache and network priority queues, the in-flight registry, and
/// the worker threads draining them. Requests enter through [`add`](Self::add)
/// and leave when they finish or are dropped by a cancellation checkpoint.
pub struct RequestQueue {
    core: Arc<QueueCore>,
    cache: Arc<dyn Cache>,
    network: Arc<dyn Network>,
    delivery: Arc<dyn ResponseDelivery>,
    thread_pool_size: usize,
    workers: Vec<Worker>,
}

impl fmt::Debug for RequestQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestQueue")
            .field("thread_pool_size", &self.thread_pool_size)
            .field("running", &!self.workers.is_empty())
            .finish_non_exhaustive()
    }
}

impl RequestQueue {
    /// Start configuring a queue over the given transport
    pub fn builder(network: Arc<dyn Network>) -> RequestQueueBuilder {
        RequestQueueBuilder {
            network,
            cache: None,
            cache_dir: None,
            max_cache_bytes: DEFAULT_DISK_CACHE_BYTES,
            delivery: None,
            thread_pool_size: DEFAULT_NETWORK_THREAD_POOL_SIZE,
        }
    }

    /// Spawn the cache worker and the network worker pool.
    ///
    /// Any previously running workers are stopped first, so the call is
    /// idempotent after a matching [`stop`](Self::stop).
    pub fn start(&mut self) -> io::Result<()> {
        self.stop();

        let quit = Arc::new(AtomicBool::new(false));
        let handle = CacheDispatcher::new(
            self.core.clone(),
            self.cache.clone(),
            self.delivery.clone(),
            quit.clone(),
        )
        .spawn()?;
        self.workers.push(Worker { quit, handle });

        for index in 0..self.thread_pool_size {
            let quit = Arc::new(AtomicBool::new(false));
            let handle = NetworkDispatcher::new(
                self.core.clone(),
                self.network.clone(),
                self.cache.clone(),
                self.delivery.clone(),
                quit.clone(),
            )
            .spawn(index)?;
            self.workers.push(Worker { quit, handle });
        }
        Ok(())
    }

    /// Signal every worker to quit, wake the parked ones, and join them.
    ///
    /// Non-draining: requests still queued may never run.
    pub fn stop(&mut self) {
        for worker in &self.workers {
            worker.quit.store(true, Ordering::SeqCst);
        }
        self.core.cache_queue.interrupt();
        self.core.network_queue.interrupt();
        for worker in self.workers.drain(..) {
            let _ = worker.handle.join();
        }
    }

    /// Submit a request.
    ///
    /// Assigns the request's sequence number and routes it: uncacheable
    /// requests go straight to the network queue, duplicates of an in-flight
    /// cache key are held for replay, everything else enters the cache
    /// queue. Returns a handle for cancellation.
    pub fn add<T: Send + 'static>(
        &self,
        mut request: Request<T>,
    ) -> Arc<Request<T>> {
        request.bind(self.core.next_sequence(), Arc::downgrade(&self.core));
        let request = Arc::new(request);
        self.core.submit(request.clone());
        request
    }

    /// Cancel every in-flight request matching `filter`
    pub fn cancel_all(&self, filter: impl Fn(&dyn RequestHandle) -> bool) {
        self.core.cancel_all(&filter);
    }

    /// Cancel every in-flight request carrying `tag`
    pub fn cancel_all_by_tag(&self, tag: &str) {
        self.core.cancel_all(&|request: &dyn RequestHandle| {
            request.tag() == Some(tag)
        });
    }

    /// The cache backend this queue serves from
    pub fn cache(&self) -> &Arc<dyn Cache> {
        &self.cache
    }

    /// Expire a cached entry in place; see [`Cache::invalidate`]
    pub fn invalidate(
        &self,
        cache_key: &str,
        full_expire: bool,
    ) -> io::Result<()> {
        self.cache.invalidate(cache_key, full_expire)
    }

    /// Drop every cached entry
    pub fn clear_cache(&self) -> io::Result<()> {
        self.cache.clear()
    }

    #[cfg(test)]
    pub(crate) fn core(&self) -> &Arc<QueueCore> {
        &self.core
    }
}

impl Drop for RequestQueue {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Configuration for a [`RequestQueue`]; see
/// [`RequestQueue::builder`]
pub struct RequestQueueBuilder {
    network: Arc<dyn Network>,
    cache: Option<Arc<dyn Cache>>,
    cache_dir: Option<PathBuf>,
    max_cache_bytes: u64,
    delivery: Option<Arc<dyn ResponseDelivery>>,
    thread_pool_size: usize,
}

impl fmt::Debug for RequestQueueBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestQueueBuilder")
            .field("cache_dir", &self.cache_dir)
            .field("max_cache_bytes", &self.max_cache_bytes)
            .field("thread_pool_size", &self.thread_pool_size)
            .finish_non_exhaustive()
    }
}

impl RequestQueueBuilder {
    /// Inject a cache backend (otherwise a disk LRU is created)
    pub fn cache(mut self, cache: Arc<dyn Cache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Directory for the default disk cache
    pub fn cache_dir(mut self, cache_dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = Some(cache_dir.into());
        self
    }

    /// Size budget for the default disk cache, in bytes
    pub fn max_cache_bytes(mut self, max_cache_bytes: u64) -> Self {
        self.max_cache_bytes = max_cache_bytes;
        self
    }

    /// Inject a delivery context (otherwise a serial executor thread is
    /// spawned)
    pub fn delivery(mut self, delivery: Arc<dyn ResponseDelivery>) -> Self {
        self.delivery = Some(delivery);
        self
    }

    /// Number of network worker threads
    pub fn thread_pool_size(mut self, thread_pool_size: usize) -> Self {
        self.thread_pool_size = thread_pool_size;
        self
    }

    /// Assemble the queue. Workers are not spawned until
    /// [`RequestQueue::start`]
    pub fn build(self) -> io::Result<RequestQueue> {
        let cache: Arc<dyn Cache> = match self.cache {
            Some(cache) => cache,
            None => Arc::new(DiskCache::new(
                self.cache_dir
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_CACHE_DIR)),
                self.max_cache_bytes,
            )),
        };
        let delivery: Arc<dyn ResponseDelivery> = match self.delivery {
            Some(delivery) => delivery,
            None => Arc::new(ExecutorDelivery::new(Arc::new(
                SerialExecutor::spawn()?,
            ))),
        };
        Ok(RequestQueue {
            core: Arc::new(QueueCore::new()),
            cache,
            network: self.network,
            delivery,
            thread_pool_size: self.thread_pool_size,
            workers: Vec::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{NetworkResponse, Priority};
    use http::Method;

    fn shared(priority: Priority, sequence: u64) -> SharedRequest {
        let mut request = Request::new(
            Method::GET,
            format!("http://example.com/{sequence}").parse().unwrap(),
            |response: &NetworkResponse| Ok(response.data.clone()),
        )
        .with_priority(priority);
        request.bind(sequence, std::sync::Weak::new());
        Arc::new(request)
    }

    #[test]
    fn take_orders_by_priority_then_sequence() {
        let queue = DispatchQueue::new();
        let quit = AtomicBool::new(false);
        queue.push(shared(Priority::Normal, 1));
        queue.push(shared(Priority::High, 2));
        queue.push(shared(Priority::Normal, 0));
        queue.push(shared(Priority::Immediate, 3));

        let order: Vec<u64> = (0..4)
            .map(|_| queue.take(&quit).unwrap().sequence())
            .collect();
        assert_eq!(order, vec![3, 2, 0, 1]);
    }

    #[test]
    fn quit_flag_preempts_queued_work() {
        let queue = DispatchQueue::new();
        queue.push(shared(Priority::Normal, 0));
        let quit = AtomicBool::new(true);
        assert!(queue.take(&quit).is_none());
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn duplicate_cache_keys_are_held() {
        let core = QueueCore::new();
        let first = shared(Priority::Normal, 0);
        let second = {
            let mut request = Request::new(
                Method::GET,
                "http://example.com/0".parse().unwrap(),
                |response: &NetworkResponse| Ok(response.data.clone()),
            );
            request.bind(1, std::sync::Weak::new());
            let arc: SharedRequest = Arc::new(request);
            arc
        };
        core.submit(first.clone());
        core.submit(second);
        assert_eq!(core.cache_queue.len(), 1);
        assert_eq!(core.in_flight(), 2);

        core.finish(0, first.cache_key(), true);
        // the held duplicate is replayed onto the cache queue
        assert_eq!(core.cache_queue.len(), 2);
        assert_eq!(core.in_flight(), 1);
    }

    #[test]
    fn uncacheable_requests_skip_the_cache_queue() {
        let core = QueueCore::new();
        let mut request = Request::new(
            Method::GET,
            "http://example.com/x".parse().unwrap(),
            |response: &NetworkResponse| Ok(response.data.clone()),
        )
        .with_should_cache(false);
        request.bind(0, std::sync::Weak::new());
        core.submit(Arc::new(request));
        assert_eq!(core.cache_queue.len(), 0);
        assert_eq!(core.network_queue.len(), 1);
    }
}
