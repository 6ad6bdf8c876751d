use std::{collections::HashMap, io, time::Duration};

use crate::{
    network::{HttpStack, StackResponse},
    request::RequestHandle,
};

/// [`HttpStack`] backed by a [`ureq::Agent`].
///
/// Non-success statuses are returned as responses, not errors; status
/// classification belongs to [`BasicNetwork`](crate::BasicNetwork).
#[cfg_attr(docsrs, doc(cfg(feature = "stack-ureq")))]
#[derive(Debug, Clone)]
pub struct UreqStack {
    agent: ureq::Agent,
}

impl Default for UreqStack {
    fn default() -> Self {
        Self::new()
    }
}

impl UreqStack {
    /// Create a stack over a default agent
    pub fn new() -> Self {
        let config = ureq::config::Config::builder()
            .http_status_as_error(false)
            .build();
        Self { agent: ureq::Agent::new_with_config(config) }
    }

    /// Create a stack over a pre-configured agent.
    ///
    /// The agent should have `http_status_as_error` disabled so error
    /// statuses reach the dispatcher as responses.
    pub fn with_agent(agent: ureq::Agent) -> Self {
        Self { agent }
    }
}

fn to_io_error(error: ureq::Error) -> io::Error {
    match error {
        ureq::Error::Io(io_error) => io_error,
        // ureq folds timeouts into its own error type; recover the kind so
        // the retry classification still sees them
        other => {
            let text = other.to_string();
            if text.contains("timeout") || text.contains("timed out") {
                io::Error::new(io::ErrorKind::TimedOut, other)
            } else {
                io::Error::other(other)
            }
        }
    }
}

impl HttpStack for UreqStack {
    fn execute(
        &self,
        request: &dyn RequestHandle,
        additional_headers: &HashMap<String, String>,
        timeout_ms: u64,
    ) -> io::Result<StackResponse> {
        let url = request.url().as_str();
        let timeout = Some(Duration::from_millis(timeout_ms));
        let method = request.method().as_str();

        let mut headers: Vec<(&str, &str)> = Vec::new();
        for (name, value) in request.headers() {
            headers.push((name.as_str(), value.as_str()));
        }
        for (name, value) in additional_headers {
            headers.push((name.as_str(), value.as_str()));
        }

        // ureq's builder typestate splits body-less and body-carrying
        // methods, hence the two arms
        let result = match method {
            "GET" | "HEAD" | "DELETE" | "OPTIONS" => {
                let mut req = match method {
                    "GET" => self.agent.get(url),
                    "HEAD" => self.agent.head(url),
                    "DELETE" => self.agent.delete(url),
                    _ => self.agent.options(url),
                };
                req = req.config().timeout_global(timeout).build();
                for (name, value) in &headers {
                    req = req.header(*name, *value);
                }
                req.call()
            }
            "POST" | "PUT" | "PATCH" => {
                let mut req = match method {
                    "POST" => self.agent.post(url),
                    "PUT" => self.agent.put(url),
                    _ => self.agent.patch(url),
                };
                req = req.config().timeout_global(timeout).build();
                for (name, value) in &headers {
                    req = req.header(*name, *value);
                }
                req.send(request.body().unwrap_or_default())
            }
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("unsupported method: {method}"),
                ))
            }
        };

        let mut response = result.map_err(to_io_error)?;
        let status = response.status().as_u16();
        let mut response_headers = HashMap::new();
        for (name, value) in response.headers() {
            if let Ok(value) = value.to_str() {
                response_headers
                    .insert(name.as_str().to_owned(), value.to_owned());
            }
        }
        let body = response.body_mut().read_to_vec().map_err(io::Error::other)?;

        Ok(StackResponse { status, headers: response_headers, body })
    }
}
