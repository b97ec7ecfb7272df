//! The port object: a reference-counted handle wrapping one receive right
//! plus user state, tagged with a class and contained in a bucket.

use std::any::Any;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::bucket::PortBucket;
use crate::class::PortClass;
use crate::name::PortName;

pub(crate) struct PortShared {
    pub(crate) name: PortName,
    pub(crate) class: Arc<PortClass>,
    pub(crate) bucket: Arc<PortBucket>,
    pub(crate) hard: AtomicUsize,
    pub(crate) weak: AtomicUsize,
    /// Set once `hard` has reached zero and `clean_routine` has run.
    /// Lets a later `deref_weak` tell whether it's the one that should
    /// schedule the port for deferred reclaim.
    pub(crate) finalized: AtomicBool,
    pub(crate) cancel_threshold: AtomicU64,
    pub(crate) mscount: AtomicU64,
    pub(crate) user: Box<dyn Any + Send + Sync>,
}

/// A capability-object handle. Cheap to clone (an `Arc` bump); the object
/// it points to outlives every clone thanks to the deferred-reclaim scheme
/// in [`crate::reclaim`], which is what makes the payload-based lookup in
/// [`crate::dispatch`] safe.
#[derive(Clone)]
pub struct Port(pub(crate) Arc<PortShared>);

impl Port {
    pub fn name(&self) -> PortName {
        self.0.name
    }

    pub fn class(&self) -> &Arc<PortClass> {
        &self.0.class
    }

    pub fn bucket(&self) -> &Arc<PortBucket> {
        &self.0.bucket
    }

    /// The user payload supplied at creation, downcast to its concrete
    /// type. Panics if `T` doesn't match what the port was created with,
    /// the same contract as a mistyped `void *` cast in the original.
    pub fn downcast_ref<T: 'static>(&self) -> &T {
        self.0.user.downcast_ref::<T>().expect("port payload type mismatch")
    }

    pub fn try_downcast_ref<T: 'static>(&self) -> Option<&T> {
        self.0.user.downcast_ref::<T>()
    }

    pub fn hard_count(&self) -> usize {
        self.0.hard.load(Ordering::Acquire)
    }

    pub fn weak_count(&self) -> usize {
        self.0.weak.load(Ordering::Acquire)
    }

    pub fn mscount(&self) -> u64 {
        self.0.mscount.load(Ordering::Acquire)
    }

    pub fn cancel_threshold(&self) -> u64 {
        self.0.cancel_threshold.load(Ordering::Acquire)
    }

    /// Raise the cancel threshold to at least `seqno`, the way
    /// `interrupt_operation` records "every RPC with a sequence number up
    /// to here should treat itself as cancelled".
    pub(crate) fn bump_cancel_threshold(&self, seqno: u64) {
        self.0.cancel_threshold.fetch_max(seqno, Ordering::AcqRel);
    }

    /// The opaque, in-process protected payload for this port: the address
    /// behind its `Arc`. Valid as a [`crate::kernel::MsgTarget::Payload`]
    /// for as long as the port is in the global index or pinned by the
    /// deferred-reclaim scheme.
    pub(crate) fn protected_payload(&self) -> NonZeroUsize {
        NonZeroUsize::new(Arc::as_ptr(&self.0) as usize).expect("Arc pointer is never null")
    }

    /// Recover a `Port` from a protected payload without going through the
    /// index. Safety: `payload` must have come from
    /// [`Port::protected_payload`] on a port whose backing allocation is
    /// still pinned (guaranteed by the bucket's epoch scheme not having
    /// reclaimed it yet); the caller is responsible for then checking
    /// liveness (`port_right != Dead`) before trusting the result.
    pub(crate) unsafe fn from_raw_payload(payload: NonZeroUsize) -> Port {
        let ptr = payload.get() as *const PortShared;
        Arc::increment_strong_count(ptr);
        Port(Arc::from_raw(ptr))
    }

    pub(crate) fn ptr_eq(&self, other: &Port) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl PartialEq for Port {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}
impl Eq for Port {}

impl std::fmt::Debug for Port {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Port")
            .field("name", &self.0.name)
            .field("hard", &self.hard_count())
            .field("weak", &self.weak_count())
            .finish()
    }
}
