use std::{fmt, io, sync::Arc, thread};

use crossbeam_channel::{unbounded, Sender};
use log::warn;

use crate::{
    error::RequestError,
    request::{ErasedResponse, SharedRequest},
};

/// Something that runs tasks on the delivery context.
///
/// Typically a handle onto an application's main-thread dispatcher; the
/// bundled [`SerialExecutor`] is a standalone equivalent.
pub trait Executor: Send + Sync {
    /// Submit a task; must not block the caller
    fn execute(&self, task: Box<dyn FnOnce() + Send>);
}

/// Marshals parsed responses and errors onto the delivery context.
///
/// For a given request at most one non-intermediate delivery ever runs, and
/// when an intermediate delivery fires the terminal one follows strictly
/// after it on the same context.
pub trait ResponseDelivery: Send + Sync {
    /// Deliver a parsed response
    fn post_response(&self, request: SharedRequest, response: ErasedResponse) {
        self.post_response_with(request, response, None);
    }

    /// Deliver a parsed response, then run `on_complete` on the delivery
    /// context after the listener returns
    fn post_response_with(
        &self,
        request: SharedRequest,
        response: ErasedResponse,
        on_complete: Option<Box<dyn FnOnce() + Send>>,
    );

    /// Deliver a terminal error
    fn post_error(&self, request: SharedRequest, error: RequestError);
}

/// [`ResponseDelivery`] over an injected [`Executor`].
pub struct ExecutorDelivery {
    executor: Arc<dyn Executor>,
}

impl fmt::Debug for ExecutorDelivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutorDelivery").finish_non_exhaustive()
    }
}

impl ExecutorDelivery {
    /// Wrap an executor
    pub fn new(executor: Arc<dyn Executor>) -> Self {
        Self { executor }
    }
}

impl ResponseDelivery for ExecutorDelivery {
    fn post_response_with(
        &self,
        request: SharedRequest,
        response: ErasedResponse,
        on_complete: Option<Box<dyn FnOnce() + Send>>,
    ) {
        request.add_marker("post-response");
        self.executor
            .execute(Box::new(move || deliver(request, Ok(response), on_complete)));
    }

    fn post_error(&self, request: SharedRequest, error: RequestError) {
        request.add_marker("post-error");
        self.executor
            .execute(Box::new(move || deliver(request, Err(error), None)));
    }
}

/// The delivery task body, run on the delivery context.
///
/// Cancellation is re-checked here: the request may have been canceled
/// between enqueue and execution, in which case no listener runs.
fn deliver(
    request: SharedRequest,
    outcome: Result<ErasedResponse, RequestError>,
    on_complete: Option<Box<dyn FnOnce() + Send>>,
) {
    if request.is_canceled() {
        request.finish("canceled-at-delivery");
        return;
    }
    match outcome {
        Ok(response) => {
            let intermediate = response.intermediate;
            request.deliver_response(response);
            if intermediate {
                request.add_marker("intermediate-response");
            } else {
                request.finish("done");
            }
        }
        Err(error) => {
            request.deliver_error(error);
            request.finish("done");
        }
    }
    if let Some(hook) = on_complete {
        hook();
    }
}

/// A delivery context backed by a single worker thread draining a channel.
///
/// Tasks run strictly in submission order. The worker exits when the
/// executor is dropped; tasks still queued at that point run first.
#[derive(Debug)]
pub struct SerialExecutor {
    sender: Option<Sender<Box<dyn FnOnce() + Send>>>,
    worker: Option<thread::JoinHandle<()>>,
}

impl SerialExecutor {
    /// Spawn the delivery thread
    pub fn spawn() -> io::Result<Self> {
        let (sender, receiver) = unbounded::<Box<dyn FnOnce() + Send>>();
        let worker = thread::Builder::new()
            .name("response-delivery".into())
            .spawn(move || {
                for task in receiver {
                    task();
                }
            })?;
        Ok(Self { sender: Some(sender), worker: Some(worker) })
    }
}

impl Executor for SerialExecutor {
    fn execute(&self, task: Box<dyn FnOnce() + Send>) {
        if let Some(sender) = &self.sender {
            if sender.send(task).is_err() {
                warn!("delivery thread is gone, dropping task");
            }
        }
    }
}

impl Drop for SerialExecutor {
    fn drop(&mut self) {
        drop(self.sender.take());
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}
