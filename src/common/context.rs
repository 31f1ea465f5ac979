// Cancellation Context
//
// A hierarchical cancellation token. Every flow derives one cancelable
// context from its caller's; canceling a context cancels everything derived
// from it. The `done()` channel never carries a value, it only becomes
// disconnected on cancellation, so it can sit in a `crossbeam::select!` next
// to real data channels.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;

struct ContextInner {
    canceled: AtomicBool,
    done_tx: Mutex<Option<Sender<()>>>,
    done_rx: Receiver<()>,
    children: Mutex<Vec<Weak<ContextInner>>>,
}

impl ContextInner {
    fn new() -> Self {
        let (done_tx, done_rx) = channel::bounded(0);
        ContextInner {
            canceled: AtomicBool::new(false),
            done_tx: Mutex::new(Some(done_tx)),
            done_rx,
            children: Mutex::new(Vec::new()),
        }
    }

    fn cancel(&self) {
        if self.canceled.swap(true, Ordering::SeqCst) {
            return;
        }
        // Dropping the only sender disconnects every done() receiver.
        self.done_tx.lock().take();

        let children = std::mem::take(&mut *self.children.lock());
        for child in children {
            if let Some(child) = child.upgrade() {
                child.cancel();
            }
        }
    }
}

/// Cancellation scope handed to every task of a flow
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

impl Context {
    /// A root context that is never canceled
    pub fn background() -> Self {
        Context {
            inner: Arc::new(ContextInner::new()),
        }
    }

    /// Derive a child context together with the handle that cancels it.
    ///
    /// The child is canceled when either the handle fires or this context is
    /// canceled.
    pub fn with_cancel(&self) -> (Context, CancelHandle) {
        let child = Arc::new(ContextInner::new());
        {
            let mut children = self.inner.children.lock();
            children.retain(|c| c.strong_count() > 0);
            children.push(Arc::downgrade(&child));
        }
        // The parent may have been canceled while we were registering.
        if self.is_canceled() {
            child.cancel();
        }

        let handle = CancelHandle {
            inner: Arc::clone(&child),
        };
        (Context { inner: child }, handle)
    }

    pub fn is_canceled(&self) -> bool {
        self.inner.canceled.load(Ordering::SeqCst)
    }

    /// Channel that becomes disconnected once the context is canceled
    pub fn done(&self) -> &Receiver<()> {
        &self.inner.done_rx
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("canceled", &self.is_canceled())
            .finish()
    }
}

/// Cancels the context it was created with. Safe to fire multiple times.
#[derive(Clone)]
pub struct CancelHandle {
    inner: Arc<ContextInner>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.inner.cancel();
    }
}

impl fmt::Debug for CancelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelHandle")
            .field("canceled", &self.inner.canceled.load(Ordering::SeqCst))
            .finish()
    }
}
