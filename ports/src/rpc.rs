//! RPC tracking records and cancellation tokens.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::ThreadId;

use crate::notify::NotifyLink;
use crate::port::Port;

/// A cooperative cancellation token. Blocking waits in the runtime
/// (condvar waits, `begin_rpc`'s admission loop) honor this and return
/// [`crate::Error::Interrupted`] instead of actually killing the thread;
/// user code may also poll it directly inside a long-running demuxer.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        CancelToken(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn check(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Clear and report the previous state; used by `end_rpc` to reset a
    /// thread's token before its next RPC, and by `self_interrupted`.
    pub fn take(&self) -> bool {
        self.0.swap(false, Ordering::AcqRel)
    }
}

/// Per-in-progress-RPC bookkeeping. One is created by the dispatcher for
/// every message and lives for the duration of `begin_rpc`..`end_rpc`.
pub struct RpcTracker {
    pub(crate) owner_thread: ThreadId,
    pub(crate) msg_id: i32,
    pub(crate) port: Port,
    pub(crate) cancel: CancelToken,
    pub(crate) notify_links: std::sync::Mutex<Vec<NotifyLink>>,
}

impl std::fmt::Debug for RpcTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcTracker")
            .field("owner_thread", &self.owner_thread)
            .field("msg_id", &self.msg_id)
            .field("port", &self.port.name())
            .finish()
    }
}

impl RpcTracker {
    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn port(&self) -> &Port {
        &self.port
    }

    pub fn msg_id(&self) -> i32 {
        self.msg_id
    }
}

impl PartialEq for RpcTracker {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self, other)
    }
}
impl Eq for RpcTracker {}
