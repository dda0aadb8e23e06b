//! Cooperative cancellation.
//!
//! A `CancelToken` is threaded through every suspension point of a send attempt. Canceling it
//! wakes every task waiting in [`CancelToken::cancelled`], and cancels every child token.
//!
//! Nothing is ever sent on the inner channel: closing it is the broadcast.

use std::error::Error as StdError;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use async_channel::{Receiver, Sender};

#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

struct Inner {
    canceled: AtomicBool,
    sender: Sender<()>,
    receiver: Receiver<()>,
    children: Mutex<Vec<Weak<Inner>>>,
}

impl Inner {
    fn cancel(&self) {
        if self.canceled.swap(true, Ordering::AcqRel) {
            return;
        }
        self.sender.close();

        let children = std::mem::take(&mut *self.children.lock().expect("cancel token poisoned"));
        for child in children.iter().filter_map(Weak::upgrade) {
            child.cancel();
        }
    }
}

impl CancelToken {
    pub fn new() -> Self {
        let (sender, receiver) = async_channel::bounded(1);
        Self {
            inner: Arc::new(Inner {
                canceled: AtomicBool::new(false),
                sender,
                receiver,
                children: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.inner.cancel();
    }

    pub fn is_canceled(&self) -> bool {
        self.inner.canceled.load(Ordering::Acquire)
    }

    /// Resolves once the token is canceled.
    pub async fn cancelled(&self) {
        if self.is_canceled() {
            return;
        }
        // recv only returns once the channel is closed
        let _ = self.inner.receiver.recv().await;
    }

    /// A token that is canceled together with `self`, but can also be canceled on its own.
    pub fn child(&self) -> CancelToken {
        let child = CancelToken::new();

        let mut children = self.inner.children.lock().expect("cancel token poisoned");
        if self.is_canceled() {
            drop(children);
            child.cancel();
            return child;
        }
        children.retain(|weak| weak.strong_count() > 0);
        children.push(Arc::downgrade(&child.inner));

        child
    }

    /// Run `fut` unless cancellation comes first.
    pub async fn guard<F>(&self, fut: F) -> Result<F::Output, Canceled>
    where
        F: Future,
    {
        futures_lite::future::or(async { Ok(fut.await) }, async {
            self.cancelled().await;
            Err(Canceled::new())
        })
        .await
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelToken")
            .field("canceled", &self.is_canceled())
            .finish()
    }
}

/// An operation was abandoned because its token was canceled.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Canceled {
    _private: (),
}

impl Canceled {
    pub(crate) fn new() -> Self {
        Canceled { _private: () }
    }
}

impl StdError for Canceled {}

impl fmt::Display for Canceled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        "operation was canceled".fmt(f)
    }
}
