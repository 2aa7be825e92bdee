//! Cancellation scopes.
//!
//! A [`Scope`] pairs a node in a cancellation-token tree with a task group.
//! Cancelling a scope cancels every scope derived from it with
//! [`Scope::child`]. [`Scope::shutdown`] cancels, waits until every task
//! spawned in the group has finished and returns the errors those tasks
//! produced, in completion order.
//!
//! The tree for one connection looks like:
//!
//! ```text
//! client root
//! ├── run() call            (stream readers, exit waiter)
//! └── tunnel                (accept loop, dispatcher)
//!     └── accepted conn     (forwarder, copy directions)
//! ```

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::error::{Error, Result};

/// Cloneable handle for spawning tasks into a scope's group.
///
/// Background tasks hold one of these so they can spawn further members
/// (the accept loop spawning forwarders) or report errors without being
/// the one that spawned them.
#[derive(Clone)]
pub struct TaskGroup {
    tracker: TaskTracker,
    errors: mpsc::UnboundedSender<Error>,
}

impl TaskGroup {
    /// Spawn a member task. An `Err` it returns, or a panic, is kept for
    /// `shutdown`.
    pub fn spawn<F>(&self, task: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let errors = self.errors.clone();
        self.tracker.spawn(async move {
            match AssertUnwindSafe(task).catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    let _ = errors.send(e);
                }
                Err(panic) => {
                    let _ = errors.send(Error::Panicked(panic_message(&*panic)));
                }
            }
        });
    }

    /// Record an error without spawning a task.
    pub fn report(&self, err: Error) {
        let _ = self.errors.send(err);
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// A cancellation token plus the tasks that must stop when it fires.
pub struct Scope {
    token: CancellationToken,
    group: TaskGroup,
    errors: mpsc::UnboundedReceiver<Error>,
}

impl Scope {
    /// Create a scope with no parent.
    pub fn root() -> Self {
        Self::with_token(CancellationToken::new())
    }

    /// Derive a scope that is cancelled whenever this one is.
    ///
    /// The child has its own task group; shutting the child down does not
    /// wait for the parent's tasks and does not cancel the parent.
    pub fn child(&self) -> Self {
        Self::with_token(self.token.child_token())
    }

    fn with_token(token: CancellationToken) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            token,
            group: TaskGroup {
                tracker: TaskTracker::new(),
                errors: tx,
            },
            errors: rx,
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn group(&self) -> TaskGroup {
        self.group.clone()
    }

    /// Spawn a member task into this scope's group.
    pub fn spawn<F>(&self, task: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        self.group.spawn(task);
    }

    /// Cancel this scope and everything derived from it. Idempotent.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Cancel, wait for every member task, and collect their errors.
    pub async fn shutdown(&mut self) -> Vec<Error> {
        self.token.cancel();
        self.group.tracker.close();
        self.group.tracker.wait().await;

        let mut errs = Vec::new();
        while let Ok(err) = self.errors.try_recv() {
            errs.push(err);
        }
        errs
    }
}

impl Drop for Scope {
    fn drop(&mut self) {
        // Tasks of a dropped scope must not keep running unobserved
        self.token.cancel();
    }
}
