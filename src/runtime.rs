//! Tokio runtime for the dispatcher's per-flow tasks.
//!
//! Collaborator callbacks (tun filter hooks, forwarder requests, netmap
//! updates) arrive on whatever thread the collaborator runs them from, so
//! flow tasks are spawned onto a lazily-initialized global multi-thread
//! runtime instead of assuming an ambient reactor.

use std::future::Future;

use once_cell::sync::Lazy;
use tokio::task::JoinHandle;

static RUNTIME: Lazy<tokio::runtime::Runtime> = Lazy::new(|| {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("meshstack")
        .build()
        .expect("failed to create tokio runtime")
});

/// Returns a reference to the global Tokio runtime.
pub fn runtime() -> &'static tokio::runtime::Runtime {
    &RUNTIME
}

/// Spawn a future onto the global runtime from any thread.
pub fn spawn<F>(fut: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    RUNTIME.spawn(fut)
}
