//! Application boundary: the [`Service`] trait and the worker pool that
//! runs it off the I/O tasks.

use std::any::Any;
use std::sync::Arc;

use anyhow::Context;
use tokio::sync::Semaphore;

use crate::http::request::Request;
use crate::http::response::Response;
use crate::websocket::WebSocketHandler;

/// Turns a request into a response.
///
/// `call` runs on a blocking worker thread, so it may do file I/O or other
/// slow work. `websocket_handler` is consulted on the I/O task for upgrade
/// requests and should only look up a route.
pub trait Service: Send + Sync + 'static {
    fn call(&self, request: &Request) -> anyhow::Result<Response>;

    fn websocket_handler(&self, _request: &Request) -> Option<Arc<dyn WebSocketHandler>> {
        None
    }
}

impl<F> Service for F
where
    F: Fn(&Request) -> anyhow::Result<Response> + Send + Sync + 'static,
{
    fn call(&self, request: &Request) -> anyhow::Result<Response> {
        self(request)
    }
}

/// Bounded pool for handler execution.
///
/// Each job holds a semaphore permit while it runs on tokio's blocking
/// threads, so at most `size` handlers execute at once.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    size: usize,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            permits: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Jobs currently running.
    pub fn active(&self) -> usize {
        self.size - self.permits.available_permits()
    }

    /// Runs `job` on a worker. A panic inside the job comes back as an
    /// error carrying the panic message.
    pub async fn run<F, T>(&self, job: F) -> anyhow::Result<T>
    where
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let _permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .context("worker pool closed")?;

        match tokio::task::spawn_blocking(job).await {
            Ok(result) => result,
            Err(e) if e.is_panic() => Err(anyhow::anyhow!(
                "handler panicked: {}",
                panic_message(e.into_panic())
            )),
            Err(e) => Err(anyhow::anyhow!("handler task cancelled: {e}")),
        }
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        let threads = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self::new(threads)
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
