//! Helpers for spawning pipeline tasks.

use std::future::Future;

use tokio::task::{AbortHandle, JoinHandle, JoinSet};
use tracing::{Instrument as _, Span};

/// Spawns a new asynchronous task attached to the current `tracing` span.
#[track_caller]
pub fn spawn_traced<F, T>(f: F) -> JoinHandle<T>
where
    F: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn(f.in_current_span())
}

/// Spawns a new asynchronous task attached to the given `tracing` span.
pub fn spawn_in_span<F, T>(span: Span, f: F) -> JoinHandle<T>
where
    F: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn(f.instrument(span))
}

/// Traced spawning for [`JoinSet`].
pub trait JoinSetExt<T> {
    /// Spawns a new asynchronous task into the set, attached to the given `tracing` span.
    fn spawn_in_span<F>(&mut self, span: Span, f: F) -> AbortHandle
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static;
}

impl<T> JoinSetExt<T> for JoinSet<T> {
    fn spawn_in_span<F>(&mut self, span: Span, f: F) -> AbortHandle
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        self.spawn(f.instrument(span))
    }
}
