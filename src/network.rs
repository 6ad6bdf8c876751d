use std::{collections::HashMap, io, time::Instant};

use log::debug;

use crate::{
    error::{RequestError, Result},
    headers::format_date_ms,
    request::RequestHandle,
    CacheEntry, Network, NetworkResponse,
};

/// Round trips slower than this are logged
const SLOW_REQUEST_THRESHOLD_MS: i64 = 3000;

/// One raw HTTP exchange as seen by an [`HttpStack`]
#[derive(Debug, Clone)]
pub struct StackResponse {
    /// HTTP status code
    pub status: u16,
    /// Response headers
    pub headers: HashMap<String, String>,
    /// Response body
    pub body: Vec<u8>,
}

/// The socket layer under [`BasicNetwork`]: executes exactly one attempt.
///
/// Failures are reported as [`io::Error`]s; the error kind drives
/// classification (`TimedOut` retries per the request's policy, connection
/// kinds surface as [`RequestError::NoConnection`], everything else as
/// [`RequestError::Network`]).
pub trait HttpStack: Send + Sync {
    /// Perform one attempt for `request`, sending `additional_headers` on
    /// top of the request's own, bounded by `timeout_ms`
    fn execute(
        &self,
        request: &dyn RequestHandle,
        additional_headers: &HashMap<String, String>,
        timeout_ms: u64,
    ) -> io::Result<StackResponse>;
}

/// The reference [`Network`] implementation.
///
/// Owns the transport contract: injects `If-None-Match` /
/// `If-Modified-Since` from the request's cache hint, drives the retry
/// policy for timeouts and auth rejections, maps statuses onto the error
/// taxonomy, and on a 304 synthesizes the response from the stale entry.
#[derive(Debug, Clone)]
pub struct BasicNetwork<S> {
    stack: S,
}

impl<S> BasicNetwork<S> {
    /// Wrap a socket layer
    pub fn new(stack: S) -> Self {
        Self { stack }
    }
}

impl<S: HttpStack> BasicNetwork<S> {
    fn attempt_retry(
        &self,
        request: &dyn RequestHandle,
        label: &str,
        error: RequestError,
    ) -> Result<()> {
        request.add_marker(&format!(
            "{label}-retry [timeout={}]",
            request.retry_timeout_ms()
        ));
        request.retry(error)
    }
}

impl<S: HttpStack> Network for BasicNetwork<S> {
    fn perform_request(
        &self,
        request: &dyn RequestHandle,
    ) -> Result<NetworkResponse> {
        let started = Instant::now();
        loop {
            let entry = request.cache_entry();
            let mut additional_headers = HashMap::new();
            if let Some(entry) = &entry {
                if let Some(etag) = &entry.etag {
                    additional_headers
                        .insert("If-None-Match".to_owned(), etag.clone());
                }
                if entry.last_modified > 0 {
                    additional_headers.insert(
                        "If-Modified-Since".to_owned(),
                        format_date_ms(entry.last_modified),
                    );
                }
            }

            let attempt = self.stack.execute(
                request,
                &additional_headers,
                request.retry_timeout_ms(),
            );
            let network_time_ms = started.elapsed().as_millis() as i64;

            let raw = match attempt {
                Ok(raw) => raw,
                Err(error) => match error.kind() {
                    io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => {
                        self.attempt_retry(
                            request,
                            "socket",
                            RequestError::Timeout { network_time_ms },
                        )?;
                        continue;
                    }
                    io::ErrorKind::ConnectionRefused
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::NotConnected
                    | io::ErrorKind::AddrNotAvailable => {
                        return Err(RequestError::NoConnection {
                            source: error,
                            network_time_ms,
                        });
                    }
                    _ => {
                        return Err(RequestError::Network {
                            response: None,
                            source: error,
                            network_time_ms,
                        });
                    }
                },
            };

            if network_time_ms > SLOW_REQUEST_THRESHOLD_MS {
                debug!(
                    "slow round trip for {}: {network_time_ms}ms, status {}, {} retries",
                    request.url(),
                    raw.status,
                    request.retry_count()
                );
            }

            if raw.status == 304 {
                return Ok(not_modified_response(raw, entry, network_time_ms));
            }

            if raw.status == 401 || raw.status == 403 {
                let response = completed(raw, network_time_ms);
                self.attempt_retry(
                    request,
                    "auth",
                    RequestError::Auth { response, network_time_ms },
                )?;
                continue;
            }

            if (200..300).contains(&raw.status) {
                return Ok(completed(raw, network_time_ms));
            }

            return Err(RequestError::Server {
                response: completed(raw, network_time_ms),
                network_time_ms,
            });
        }
    }
}

fn completed(raw: StackResponse, network_time_ms: i64) -> NetworkResponse {
    NetworkResponse {
        status: raw.status,
        data: raw.body,
        headers: raw.headers,
        not_modified: false,
        network_time_ms,
    }
}

/// Build the 304 result: body from the stale entry, fresh headers layered
/// over the cached ones
fn not_modified_response(
    raw: StackResponse,
    entry: Option<CacheEntry>,
    network_time_ms: i64,
) -> NetworkResponse {
    match entry {
        Some(entry) => {
            let mut headers = entry.response_headers;
            headers.extend(raw.headers);
            NetworkResponse {
                status: raw.status,
                data: entry.data,
                headers,
                not_modified: true,
                network_time_ms,
            }
        }
        None => NetworkResponse {
            status: raw.status,
            data: raw.body,
            headers: raw.headers,
            not_modified: true,
            network_time_ms,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DefaultRetryPolicy, Request};
    use http::Method;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    struct ScriptedStack {
        script: Mutex<VecDeque<io::Result<StackResponse>>>,
        seen_headers: Mutex<Vec<HashMap<String, String>>>,
    }

    impl ScriptedStack {
        fn new(
            script: impl IntoIterator<Item = io::Result<StackResponse>>,
        ) -> Self {
            Self {
                script: Mutex::new(script.into_iter().collect()),
                seen_headers: Mutex::new(Vec::new()),
            }
        }
    }

    impl HttpStack for ScriptedStack {
        fn execute(
            &self,
            _request: &dyn RequestHandle,
            additional_headers: &HashMap<String, String>,
            _timeout_ms: u64,
        ) -> io::Result<StackResponse> {
            self.seen_headers.lock().push(additional_headers.clone());
            self.script
                .lock()
                .pop_front()
                .unwrap_or_else(|| Err(io::Error::other("script exhausted")))
        }
    }

    fn ok(status: u16, body: &[u8]) -> io::Result<StackResponse> {
        Ok(StackResponse {
            status,
            headers: HashMap::new(),
            body: body.to_vec(),
        })
    }

    fn request() -> Request<Vec<u8>> {
        Request::new(
            Method::GET,
            "http://example.com/data".parse().unwrap(),
            |response: &NetworkResponse| Ok(response.data.clone()),
        )
    }

    fn stale_entry() -> CacheEntry {
        CacheEntry {
            data: b"stale-body".to_vec(),
            etag: Some("\"v1\"".to_owned()),
            server_date: 0,
            last_modified: 1_400_000_000_000,
            ttl: 0,
            soft_ttl: 0,
            response_headers: HashMap::from([(
                "Content-Type".to_owned(),
                "text/plain".to_owned(),
            )]),
        }
    }

    #[test]
    fn revalidation_headers_come_from_the_cache_hint() {
        let network = BasicNetwork::new(ScriptedStack::new([ok(200, b"v2")]));
        let request = request();
        request.set_cache_entry(stale_entry());

        network.perform_request(&request).unwrap();

        let seen = network.stack.seen_headers.lock();
        assert_eq!(seen[0].get("If-None-Match").unwrap(), "\"v1\"");
        assert_eq!(
            seen[0].get("If-Modified-Since").unwrap(),
            &format_date_ms(1_400_000_000_000)
        );
    }

    #[test]
    fn not_modified_synthesizes_body_from_entry() {
        let fresh_headers =
            HashMap::from([("Age".to_owned(), "0".to_owned())]);
        let network = BasicNetwork::new(ScriptedStack::new([Ok(
            StackResponse {
                status: 304,
                headers: fresh_headers,
                body: Vec::new(),
            },
        )]));
        let request = request();
        request.set_cache_entry(stale_entry());

        let response = network.perform_request(&request).unwrap();
        assert!(response.not_modified);
        assert_eq!(response.data, b"stale-body");
        assert_eq!(response.headers.get("Content-Type").unwrap(), "text/plain");
        assert_eq!(response.headers.get("Age").unwrap(), "0");
    }

    #[test]
    fn auth_rejection_retries_then_succeeds() {
        let network = BasicNetwork::new(ScriptedStack::new([
            ok(401, b""),
            ok(200, b"authorized"),
        ]));
        let request = request();
        let response = network.perform_request(&request).unwrap();
        assert_eq!(response.data, b"authorized");
        assert_eq!(request.retry_count(), 1);
    }

    #[test]
    fn timeouts_exhaust_the_retry_policy() {
        let network = BasicNetwork::new(ScriptedStack::new([
            Err(io::Error::from(io::ErrorKind::TimedOut)),
            Err(io::Error::from(io::ErrorKind::TimedOut)),
        ]));
        let request =
            request().with_retry_policy(DefaultRetryPolicy::new(100, 1, 1.0));
        let error = network.perform_request(&request).unwrap_err();
        assert!(matches!(error, RequestError::Timeout { .. }));
        assert_eq!(network.stack.seen_headers.lock().len(), 2);
    }

    #[test]
    fn server_errors_do_not_retry() {
        let network = BasicNetwork::new(ScriptedStack::new([ok(500, b"boom")]));
        let request = request();
        let error = network.perform_request(&request).unwrap_err();
        assert!(matches!(
            &error,
            RequestError::Server { response, .. } if response.status == 500
        ));
        assert_eq!(network.stack.seen_headers.lock().len(), 1);
    }

    #[test]
    fn connection_failures_are_terminal() {
        let network = BasicNetwork::new(ScriptedStack::new([Err(
            io::Error::from(io::ErrorKind::ConnectionRefused),
        )]));
        let error = network.perform_request(&request()).unwrap_err();
        assert!(matches!(error, RequestError::NoConnection { .. }));
    }
}
