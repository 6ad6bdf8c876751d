use std::{
    collections::HashMap,
    io,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use crossbeam_channel::{unbounded, Receiver, Sender};
use http::Method;
use parking_lot::Mutex;

use crate::{
    headers::format_date_ms, now_millis, Cache, CacheEntry, Network,
    NetworkResponse, Priority, Request, RequestHandle, RequestQueue, Result,
};

/// What a listener observed, in order
#[derive(Debug, PartialEq, Eq)]
enum Event {
    Response { body: String, intermediate: bool },
    Error(String),
}

type Handler =
    dyn Fn(&dyn RequestHandle, usize) -> Result<NetworkResponse> + Send + Sync;

/// Scripted transport recording call order and revalidation hints
struct MockNetwork {
    handler: Box<Handler>,
    calls: AtomicUsize,
    hints: Mutex<Vec<Option<String>>>,
    order: Mutex<Vec<String>>,
}

impl MockNetwork {
    fn new(
        handler: impl Fn(&dyn RequestHandle, usize) -> Result<NetworkResponse>
            + Send
            + Sync
            + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            handler: Box::new(handler),
            calls: AtomicUsize::new(0),
            hints: Mutex::new(Vec::new()),
            order: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Network for MockNetwork {
    fn perform_request(
        &self,
        request: &dyn RequestHandle,
    ) -> Result<NetworkResponse> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        self.hints
            .lock()
            .push(request.cache_entry().and_then(|entry| entry.etag));
        self.order.lock().push(request.url().path().to_owned());
        (self.handler)(request, call)
    }
}

/// Plain in-memory [`Cache`] for scenario tests
#[derive(Default)]
struct MemoryCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl MemoryCache {
    fn seed(&self, key: &str, entry: CacheEntry) {
        self.entries.lock().insert(key.to_owned(), entry);
    }

    fn stored(&self, key: &str) -> Option<CacheEntry> {
        self.entries.lock().get(key).cloned()
    }
}

impl Cache for MemoryCache {
    fn initialize(&self) -> io::Result<()> {
        Ok(())
    }

    fn get(&self, key: &str) -> io::Result<Option<CacheEntry>> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn put(&self, key: &str, entry: CacheEntry) -> io::Result<()> {
        self.entries.lock().insert(key.to_owned(), entry);
        Ok(())
    }

    fn invalidate(&self, key: &str, full_expire: bool) -> io::Result<()> {
        if let Some(entry) = self.entries.lock().get_mut(key) {
            entry.soft_ttl = 0;
            if full_expire {
                entry.ttl = 0;
            }
        }
        Ok(())
    }

    fn remove(&self, key: &str) -> io::Result<()> {
        self.entries.lock().remove(key);
        Ok(())
    }

    fn clear(&self) -> io::Result<()> {
        self.entries.lock().clear();
        Ok(())
    }
}

fn started_queue(
    network: Arc<MockNetwork>,
    cache: Arc<MemoryCache>,
    thread_pool_size: usize,
) -> RequestQueue {
    let mut queue = RequestQueue::builder(network)
        .cache(cache)
        .thread_pool_size(thread_pool_size)
        .build()
        .unwrap();
    queue.start().unwrap();
    queue
}

fn tracked_request(url: &str, events: Sender<Event>) -> Request<String> {
    let error_events = events.clone();
    Request::new(
        Method::GET,
        url.parse().unwrap(),
        |response: &NetworkResponse| {
            Ok(String::from_utf8_lossy(&response.data).into_owned())
        },
    )
    .on_response(move |response| {
        let _ = events.send(Event::Response {
            body: response.result,
            intermediate: response.intermediate,
        });
    })
    .on_error(move |error| {
        let _ = error_events.send(Event::Error(error.to_string()));
    })
}

fn cacheable_headers(max_age_secs: i64) -> HashMap<String, String> {
    HashMap::from([
        ("Date".to_owned(), format_date_ms(now_millis())),
        ("Cache-Control".to_owned(), format!("max-age={max_age_secs}")),
    ])
}

fn seeded_entry(
    data: &[u8],
    etag: Option<&str>,
    soft_ttl: i64,
    ttl: i64,
) -> CacheEntry {
    CacheEntry {
        data: data.to_vec(),
        etag: etag.map(str::to_owned),
        server_date: now_millis() - 60_000,
        last_modified: now_millis() - 120_000,
        ttl,
        soft_ttl,
        response_headers: HashMap::from([(
            "Content-Type".to_owned(),
            "text/plain".to_owned(),
        )]),
    }
}

fn wait_idle(queue: &RequestQueue) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while queue.core().in_flight() > 0 {
        assert!(Instant::now() < deadline, "queue did not go idle");
        thread::sleep(Duration::from_millis(5));
    }
}

fn recv(events: &Receiver<Event>) -> Event {
    events
        .recv_timeout(Duration::from_secs(2))
        .expect("expected a delivery")
}

fn assert_silent(events: &Receiver<Event>) {
    assert!(
        events.recv_timeout(Duration::from_millis(100)).is_err(),
        "unexpected extra delivery"
    );
}

#[test]
fn cache_miss_then_hit() {
    let network = MockNetwork::new(|_, _| {
        Ok(NetworkResponse::new(200, b"v1".to_vec(), cacheable_headers(60)))
    });
    let cache = Arc::new(MemoryCache::default());
    let queue = started_queue(network.clone(), cache.clone(), 2);
    let (sender, events) = unbounded();

    queue.add(tracked_request("http://example.com/item", sender.clone()));
    assert_eq!(
        recv(&events),
        Event::Response { body: "v1".into(), intermediate: false }
    );
    wait_idle(&queue);
    assert_eq!(network.calls(), 1);
    assert!(cache.stored("http://example.com/item").is_some());

    let handle =
        queue.add(tracked_request("http://example.com/item", sender));
    assert_eq!(
        recv(&events),
        Event::Response { body: "v1".into(), intermediate: false }
    );
    wait_idle(&queue);
    assert_eq!(network.calls(), 1, "second request must be a pure cache hit");
    assert!(handle.markers().contains(&"cache-hit".to_owned()));
}

#[test]
fn stale_while_revalidate_serves_then_revalidates() {
    let network = MockNetwork::new(|request, _| {
        let entry = request.cache_entry().expect("revalidation hint missing");
        Ok(NetworkResponse {
            status: 304,
            data: entry.data,
            headers: entry.response_headers,
            not_modified: true,
            network_time_ms: 1,
        })
    });
    let cache = Arc::new(MemoryCache::default());
    cache.seed(
        "http://example.com/item",
        seeded_entry(
            b"cached",
            Some("\"v1\""),
            now_millis() - 1_000,
            now_millis() + 30_000,
        ),
    );
    let queue = started_queue(network.clone(), cache, 2);
    let (sender, events) = unbounded();

    queue.add(tracked_request("http://example.com/item", sender));

    assert_eq!(
        recv(&events),
        Event::Response { body: "cached".into(), intermediate: true }
    );
    wait_idle(&queue);
    assert_eq!(network.calls(), 1);
    assert_eq!(
        network.hints.lock().as_slice(),
        &[Some("\"v1\"".to_owned())]
    );
    // the 304 after an intermediate delivery is suppressed
    assert_silent(&events);
}

#[test]
fn hard_expired_revalidates_without_intermediate() {
    let network = MockNetwork::new(|_, _| {
        Ok(NetworkResponse::new(
            200,
            b"fresh".to_vec(),
            cacheable_headers(60),
        ))
    });
    let cache = Arc::new(MemoryCache::default());
    cache.seed(
        "http://example.com/item",
        seeded_entry(
            b"old",
            Some("\"v1\""),
            now_millis() - 2_000,
            now_millis() - 1_000,
        ),
    );
    let queue = started_queue(network.clone(), cache.clone(), 2);
    let (sender, events) = unbounded();

    queue.add(tracked_request("http://example.com/item", sender));

    assert_eq!(
        recv(&events),
        Event::Response { body: "fresh".into(), intermediate: false }
    );
    wait_idle(&queue);
    assert_eq!(network.calls(), 1);
    // the stale entry's validator was sent
    assert_eq!(
        network.hints.lock().as_slice(),
        &[Some("\"v1\"".to_owned())]
    );
    // and the cache now holds the new body
    assert_eq!(
        cache.stored("http://example.com/item").unwrap().data,
        b"fresh"
    );
    assert_silent(&events);
}

#[test]
fn canceled_before_dispatch_reaches_no_listener() {
    let network = MockNetwork::new(|_, _| {
        Ok(NetworkResponse::new(200, b"v1".to_vec(), cacheable_headers(60)))
    });
    let cache = Arc::new(MemoryCache::default());
    let mut queue = RequestQueue::builder(network.clone())
        .cache(cache)
        .thread_pool_size(2)
        .build()
        .unwrap();
    let (sender, events) = unbounded();

    // cancel lands while the workers are not yet running
    let handle =
        queue.add(tracked_request("http://example.com/item", sender));
    handle.cancel();
    queue.start().unwrap();

    wait_idle(&queue);
    assert_eq!(network.calls(), 0);
    assert_silent(&events);
}

#[test]
fn duplicate_requests_collapse_onto_one_network_call() {
    let network = MockNetwork::new(|_, _| {
        thread::sleep(Duration::from_millis(50));
        Ok(NetworkResponse::new(200, b"v1".to_vec(), cacheable_headers(60)))
    });
    let cache = Arc::new(MemoryCache::default());
    let queue = started_queue(network.clone(), cache, 4);
    let (sender, events) = unbounded();

    for _ in 0..5 {
        queue.add(tracked_request("http://example.com/item", sender.clone()));
    }

    for _ in 0..5 {
        assert_eq!(
            recv(&events),
            Event::Response { body: "v1".into(), intermediate: false }
        );
    }
    wait_idle(&queue);
    assert_eq!(network.calls(), 1);
}

#[test]
fn immediate_priority_preempts_queued_work() {
    let network = MockNetwork::new(|_, _| {
        Ok(NetworkResponse::new(200, b"ok".to_vec(), HashMap::new()))
    });
    let cache = Arc::new(MemoryCache::default());
    let mut queue = RequestQueue::builder(network.clone())
        .cache(cache)
        .thread_pool_size(1)
        .build()
        .unwrap();
    let (sender, events) = unbounded();

    // queue up normal traffic first, then one immediate request, and only
    // then let the single worker start taking
    for index in 0..10 {
        queue.add(
            tracked_request(
                &format!("http://example.com/normal/{index}"),
                sender.clone(),
            )
            .with_should_cache(false),
        );
    }
    queue.add(
        tracked_request("http://example.com/urgent", sender)
            .with_priority(Priority::Immediate)
            .with_should_cache(false),
    );
    queue.start().unwrap();

    for _ in 0..11 {
        recv(&events);
    }
    wait_idle(&queue);
    assert_eq!(network.order.lock().first().unwrap(), "/urgent");
}

#[test]
fn tagged_requests_cancel_in_bulk() {
    let network = MockNetwork::new(|_, _| {
        Ok(NetworkResponse::new(200, b"ok".to_vec(), HashMap::new()))
    });
    let cache = Arc::new(MemoryCache::default());
    let mut queue = RequestQueue::builder(network.clone())
        .cache(cache)
        .thread_pool_size(2)
        .build()
        .unwrap();
    let (sender, events) = unbounded();

    for index in 0..3 {
        queue.add(
            tracked_request(
                &format!("http://example.com/doomed/{index}"),
                sender.clone(),
            )
            .with_tag("screen-a")
            .with_should_cache(false),
        );
    }
    for index in 0..2 {
        queue.add(
            tracked_request(
                &format!("http://example.com/kept/{index}"),
                sender.clone(),
            )
            .with_tag("screen-b")
            .with_should_cache(false),
        );
    }
    queue.cancel_all_by_tag("screen-a");
    queue.start().unwrap();

    for _ in 0..2 {
        assert!(matches!(recv(&events), Event::Response { .. }));
    }
    wait_idle(&queue);
    assert_eq!(network.calls(), 2);
    assert_silent(&events);
}

#[test]
fn server_errors_reach_the_error_listener_once() {
    let network = MockNetwork::new(|_, _| {
        Err(crate::RequestError::Server {
            response: NetworkResponse::new(500, Vec::new(), HashMap::new()),
            network_time_ms: 3,
        })
    });
    let cache = Arc::new(MemoryCache::default());
    let queue = started_queue(network.clone(), cache, 2);
    let (sender, events) = unbounded();

    queue.add(tracked_request("http://example.com/item", sender));

    assert_eq!(
        recv(&events),
        Event::Error("server responded with status 500".into())
    );
    wait_idle(&queue);
    assert_silent(&events);
}

#[test]
fn parse_failures_surface_as_parse_errors() {
    let network = MockNetwork::new(|_, _| {
        Ok(NetworkResponse::new(200, b"not-json".to_vec(), HashMap::new()))
    });
    let cache = Arc::new(MemoryCache::default());
    let queue = started_queue(network.clone(), cache, 2);
    let (sender, events) = unbounded();
    let error_events = sender.clone();

    let request = Request::new(
        Method::GET,
        "http://example.com/item".parse().unwrap(),
        |_: &NetworkResponse| -> Result<String> {
            Err(crate::RequestError::parse("unexpected body"))
        },
    )
    .on_response(move |response| {
        let _ = sender.send(Event::Response {
            body: response.result,
            intermediate: response.intermediate,
        });
    })
    .on_error(move |error| {
        let _ = error_events.send(Event::Error(error.to_string()));
    });
    queue.add(request);

    assert_eq!(
        recv(&events),
        Event::Error("failed to parse response: unexpected body".into())
    );
    wait_idle(&queue);
    assert_silent(&events);
}

#[test]
fn stopped_queue_drops_queued_requests() {
    let network = MockNetwork::new(|_, _| {
        Ok(NetworkResponse::new(200, b"ok".to_vec(), HashMap::new()))
    });
    let cache = Arc::new(MemoryCache::default());
    let mut queue = RequestQueue::builder(network.clone())
        .cache(cache)
        .thread_pool_size(1)
        .build()
        .unwrap();
    let (sender, events) = unbounded();

    queue.add(
        tracked_request("http://example.com/item", sender)
            .with_should_cache(false),
    );
    // never started: stop must return without touching the request
    queue.stop();
    assert_eq!(network.calls(), 0);
    assert_silent(&events);
}
