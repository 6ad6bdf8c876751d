use std::{
    io,
    sync::{atomic::AtomicBool, Arc},
    thread::{self, JoinHandle},
    time::Instant,
};

use log::warn;

use crate::{
    delivery::ResponseDelivery,
    error::RequestError,
    queue::QueueCore,
    request::SharedRequest,
    Cache, Network, NetworkResponse,
};

/// The single worker draining the cache queue.
///
/// Resolves requests from the cache where possible and forwards the rest to
/// the network queue, attaching the stale entry as a revalidation hint.
pub(crate) struct CacheDispatcher {
    core: Arc<QueueCore>,
    cache: Arc<dyn Cache>,
    delivery: Arc<dyn ResponseDelivery>,
    quit: Arc<AtomicBool>,
}

impl CacheDispatcher {
    pub(crate) fn new(
        core: Arc<QueueCore>,
        cache: Arc<dyn Cache>,
        delivery: Arc<dyn ResponseDelivery>,
        quit: Arc<AtomicBool>,
    ) -> Self {
        Self { core, cache, delivery, quit }
    }

    pub(crate) fn spawn(self) -> io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("cache-dispatcher".into())
            .spawn(move || self.run())
    }

    fn run(self) {
        if let Err(error) = self.cache.initialize() {
            warn!("cache initialization failed: {error}");
        }
        while let Some(request) = self.core.cache_queue.take(&self.quit) {
            self.process(request);
        }
    }

    fn process(&self, request: SharedRequest) {
        request.add_marker("cache-queue-take");

        if request.is_canceled() {
            request.finish("cache-discard-canceled");
            return;
        }

        let entry = match self.cache.get(request.cache_key()) {
            Ok(entry) => entry,
            Err(error) => {
                // degraded to miss semantics
                warn!(
                    "cache read failed for {}: {error}",
                    request.cache_key()
                );
                None
            }
        };

        let Some(entry) = entry else {
            request.add_marker("cache-miss");
            self.core.network_queue.push(request);
            return;
        };

        if entry.is_expired() {
            // the entry's validators ride along so the transport can
            // revalidate instead of refetching
            request.add_marker("cache-hit-expired");
            request.set_cache_entry(entry);
            self.core.network_queue.push(request);
            return;
        }

        request.add_marker("cache-hit");
        let cached = NetworkResponse::new(
            200,
            entry.data.clone(),
            entry.response_headers.clone(),
        );
        let mut response = match request.parse_network_response(cached) {
            Ok(response) => response,
            Err(error) => {
                request.add_marker("cache-parsing-failed");
                self.delivery.post_error(request, error);
                return;
            }
        };
        request.add_marker("cache-hit-parsed");

        if !entry.refresh_needed() {
            self.delivery.post_response(request, response);
            return;
        }

        // soft-expired: serve the stale copy now and refresh behind it once
        // the listener has seen it
        request.add_marker("cache-hit-refresh-needed");
        request.set_cache_entry(entry);
        response.intermediate = true;
        let core = self.core.clone();
        let refresh = request.clone();
        self.delivery.post_response_with(
            request,
            response,
            Some(Box::new(move || core.network_queue.push(refresh))),
        );
    }
}

/// A worker in the network pool.
///
/// Performs the round trip through the injected transport, writes cacheable
/// responses back, and posts the result to the delivery context.
pub(crate) struct NetworkDispatcher {
    core: Arc<QueueCore>,
    network: Arc<dyn Network>,
    cache: Arc<dyn Cache>,
    delivery: Arc<dyn ResponseDelivery>,
    quit: Arc<AtomicBool>,
}

impl NetworkDispatcher {
    pub(crate) fn new(
        core: Arc<QueueCore>,
        network: Arc<dyn Network>,
        cache: Arc<dyn Cache>,
        delivery: Arc<dyn ResponseDelivery>,
        quit: Arc<AtomicBool>,
    ) -> Self {
        Self { core, network, cache, delivery, quit }
    }

    pub(crate) fn spawn(self, index: usize) -> io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name(format!("network-dispatcher-{index}"))
            .spawn(move || self.run())
    }

    fn run(self) {
        while let Some(request) = self.core.network_queue.take(&self.quit) {
            let started = Instant::now();
            request.add_marker("network-queue-take");

            if request.is_canceled() {
                request.finish("network-discard-cancelled");
                continue;
            }

            let network_response =
                match self.network.perform_request(request.as_ref()) {
                    Ok(network_response) => network_response,
                    Err(error) => {
                        self.post_error(&request, error, started);
                        continue;
                    }
                };
            request.add_marker("network-http-complete");

            // an intermediate delivery already handed the caller this body;
            // a second identical delivery is suppressed
            if network_response.not_modified
                && request.has_had_response_delivered()
            {
                request.finish("not-modified");
                continue;
            }

            let response = match request.parse_network_response(network_response)
            {
                Ok(response) => response,
                Err(error) => {
                    self.post_error(&request, error, started);
                    continue;
                }
            };
            request.add_marker("network-parse-complete");

            if request.should_cache() {
                if let Some(entry) = response.cache_entry.clone() {
                    match self.cache.put(request.cache_key(), entry) {
                        Ok(()) => request.add_marker("network-cache-written"),
                        Err(error) => warn!(
                            "cache write failed for {}: {error}",
                            request.cache_key()
                        ),
                    }
                }
            }

            request.mark_delivered();
            self.delivery.post_response(request, response);
        }
    }

    fn post_error(
        &self,
        request: &SharedRequest,
        error: RequestError,
        started: Instant,
    ) {
        let error = error
            .with_network_time_ms(started.elapsed().as_millis() as i64);
        let error = request.parse_network_error(error);
        self.delivery.post_error(request.clone(), error);
    }
}
