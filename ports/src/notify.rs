//! Notification subscriptions: the bipartite graph between in-progress
//! RPCs and the (port, kind) pairs they've asked to be woken by.
//!
//! One [`NotifySub`] exists per distinct `(watched right, kind)` pair
//! actually being waited on; it is allocated the first time an RPC asks to
//! be interrupted by it, and freed once the last subscriber detaches in
//! `end_rpc`. Each subscribing RPC carries a [`NotifyLink`] recording which
//! subscription(s) it is attached to, so `end_rpc` can unwind the
//! attachment without a second lookup.

use crate::kernel::{KernelRight, NotifyKind};

/// A link from an [`crate::rpc::RpcTracker`] to the subscription it is
/// waiting on. A single RPC may attach to the same subscription more than
/// once (e.g. two nested calls both waiting on the same dead-name), hence
/// the `pending` count: each attach bumps it, each firing or detach
/// decrements it, and the backing [`NotifySub`] is only dropped once no
/// RPC references it.
#[derive(Clone)]
pub struct NotifyLink {
    pub(crate) watched: KernelRight,
    pub(crate) kind: NotifyKind,
}

/// Runtime-owned bookkeeping for one `(watched, kind)` pair. Stored in the
/// runtime's main state, keyed by `(watched, kind)`.
pub(crate) struct NotifySub {
    /// True once a kernel notification has been armed and not yet fired;
    /// re-arming while one is in flight is a no-op (idempotent per spec).
    pub(crate) armed: bool,
    /// `(subscriber, pending count)`; a subscriber may appear once, with a
    /// pending count greater than one if it attached more than once.
    pub(crate) subscribers: Vec<(std::sync::Arc<crate::rpc::RpcTracker>, u32)>,
}

impl NotifySub {
    pub(crate) fn new() -> Self {
        NotifySub { armed: false, subscribers: Vec::new() }
    }
}
