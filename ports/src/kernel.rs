//! Abstraction over the kernel IPC transport.
//!
//! The runtime is written against Mach's vocabulary (receive rights,
//! make-send counts, dead-name/no-senders notifications) but never talks to
//! a specific kernel ABI directly. Everything the runtime needs from "the
//! kernel" is expressed as the [`Kernel`] trait, so the wire format and the
//! actual `mach_msg` transport stay outside this crate's concern, matching
//! the non-goal of reproducing Mach's exact message layout.
//!
//! [`SimKernel`] is a minimal in-process stand-in used by tests and by
//! collaborators (see the `trivfs`/`netfs`/`pfinet` crates) that don't run
//! under a real microkernel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Mutex;

use crate::error::{Error, Result};

/// A kernel-level receive-right identity, opaque to the runtime beyond
/// equality and the `Dead`/`Null` sentinels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KernelRight(u64);

impl KernelRight {
    pub const NULL: KernelRight = KernelRight(0);

    fn is_null(self) -> bool {
        self.0 == 0
    }
}

/// The kinds of notification the runtime registers interest in and reacts
/// to. `PortDeleted`, `PortDestroyed`, `MsgAccepted` and `SendOnce` are
/// forwarded to user callbacks unchanged; only `DeadName` and `NoSenders`
/// are interpreted by the runtime itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotifyKind {
    DeadName,
    NoSenders,
    PortDeleted,
    PortDestroyed,
    MsgAccepted,
    SendOnce,
}

/// Where an incoming message's target should be found: by a protected
/// payload (an in-process pointer, recovered without hashing) or by the
/// kernel port name (falls back to a hash lookup).
#[derive(Debug, Clone, Copy)]
pub enum MsgTarget {
    Payload(std::num::NonZeroUsize),
    Name(crate::name::PortName),
    /// A synthetic dead-name/no-senders notification for `right`'s own
    /// receive right, injected by whatever stands in for the kernel's
    /// notification-delivery path. Real Mach delivers these as ordinary
    /// messages to the requesting port; this variant exists because this
    /// crate's `Message` has no header field to carry the watched right
    /// otherwise.
    Notify(KernelRight),
}

/// A message as delivered by a bucket's portset. The runtime only inspects
/// the header fields it needs (target, message id, sequence number); the
/// rest of the buffer is opaque and handed to the user demuxer untouched.
#[derive(Debug, Clone)]
pub struct Message {
    pub target: MsgTarget,
    pub msg_id: i32,
    pub seqno: u64,
    pub body: Vec<u8>,
}

/// Everything the runtime needs from the kernel side of a receive right.
pub trait Kernel: Send + Sync {
    /// Allocate a fresh receive right.
    fn allocate_receive_right(&self) -> Result<KernelRight>;

    /// Drop a receive right (the mirror of `mach_port_mod_refs(-1)`).
    fn deallocate_receive_right(&self, right: KernelRight);

    /// Query whether a right (adopted from outside, e.g. `import_port`)
    /// currently has outstanding send rights, and its make-send count.
    fn receive_status(&self, right: KernelRight) -> Result<ReceiveStatus>;

    /// Arm (or re-arm) a notification of `kind` on `right`, to be delivered
    /// back to `right` itself, valid as of `sync` (typically the current
    /// make-send count).
    fn request_notification(&self, right: KernelRight, kind: NotifyKind, sync: u64) -> Result<()>;

    /// Cancel a previously armed notification of `kind` on `right`.
    fn cancel_notification(&self, right: KernelRight, kind: NotifyKind);

    /// Associate an opaque payload word with `right` so that a later
    /// message to it carries the payload instead of (or in addition to)
    /// the port name. Best-effort: a kernel without payload support is a
    /// silent no-op.
    fn set_protected_payload(&self, right: KernelRight, payload: usize);
    fn clear_protected_payload(&self, right: KernelRight);

    /// Add/remove `right` from a portset (`None` removes it from whatever
    /// set it is in, mirroring `mach_port_move_member(..., MACH_PORT_NULL)`).
    fn move_member(&self, right: KernelRight, portset: Option<PortSetId>);

    /// Drop the extra reference the kernel hands back alongside a dead-name
    /// notification. Distinct from `deallocate_receive_right`: `name` here
    /// is a send-right peer's name, not one of our own receive rights.
    fn deallocate_dead_name(&self, name: KernelRight);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ReceiveStatus {
    pub has_send_rights: bool,
    pub mscount: u64,
}

/// Identity of a bucket's portset, as seen by the [`Kernel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortSetId(pub u64);

/// A minimal in-process kernel, used for tests and for collaborators that
/// run without a real microkernel underneath. Notifications are delivered
/// by directly enqueuing a [`Message`] onto the owning portset the next
/// time someone asks for one; there is no real asynchronous kernel thread.
pub struct SimKernel {
    next_right: AtomicU64,
    next_portset: AtomicU64,
    state: Mutex<SimState>,
}

#[derive(Default)]
struct SimState {
    rights: HashMap<KernelRight, RightState>,
    portsets: HashMap<PortSetId, Sender<Message>>,
}

struct RightState {
    has_send_rights: bool,
    mscount: u64,
    payload: Option<usize>,
    member_of: Option<PortSetId>,
}

impl Default for SimKernel {
    fn default() -> Self {
        Self::new()
    }
}

impl SimKernel {
    pub fn new() -> Self {
        SimKernel {
            next_right: AtomicU64::new(1),
            next_portset: AtomicU64::new(1),
            state: Mutex::new(SimState::default()),
        }
    }

    /// Create a fresh portset and its receiving end, for a bucket to poll.
    pub fn create_portset(&self) -> (PortSetId, Receiver<Message>) {
        let id = PortSetId(self.next_portset.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::channel();
        self.state.lock().unwrap().portsets.insert(id, tx);
        (id, rx)
    }

    /// Test/collaborator hook: simulate a client acquiring a send right,
    /// bumping the make-send count the way a real `mach_port_insert_right`
    /// would.
    pub fn simulate_make_send(&self, right: KernelRight) -> u64 {
        let mut st = self.state.lock().unwrap();
        let r = st.rights.entry(right).or_insert(RightState {
            has_send_rights: false,
            mscount: 0,
            payload: None,
            member_of: None,
        });
        r.has_send_rights = true;
        r.mscount += 1;
        r.mscount
    }

    /// Test/collaborator hook: inject a message addressed by name into a
    /// bucket's portset, the way the kernel would deliver a client's send.
    pub fn deliver(&self, portset: PortSetId, target: crate::name::PortName, msg_id: i32, seqno: u64, body: Vec<u8>) {
        let st = self.state.lock().unwrap();
        if let Some(tx) = st.portsets.get(&portset) {
            let _ = tx.send(Message { target: MsgTarget::Name(target), msg_id, seqno, body });
        }
    }

    /// Test/collaborator hook: inject a message using a port's protected
    /// payload, if one was set, falling back to name-based delivery
    /// otherwise.
    pub fn deliver_payload_or_name(
        &self,
        portset: PortSetId,
        right: KernelRight,
        target: crate::name::PortName,
        msg_id: i32,
        seqno: u64,
        body: Vec<u8>,
    ) {
        let payload = self
            .state
            .lock()
            .unwrap()
            .rights
            .get(&right)
            .and_then(|r| r.payload);
        let target = match payload.and_then(std::num::NonZeroUsize::new) {
            Some(p) => MsgTarget::Payload(p),
            None => MsgTarget::Name(target),
        };
        let st = self.state.lock().unwrap();
        if let Some(tx) = st.portsets.get(&portset) {
            let _ = tx.send(Message { target, msg_id, seqno, body });
        }
    }
}

impl SimKernel {
    /// Test hook: inject a synthetic notification message, as if the
    /// kernel had just fired one requested via `request_notification`.
    pub fn deliver_notify(&self, portset: PortSetId, right: KernelRight, kind: NotifyKind, seqno: u64) {
        let msg_id = match kind {
            NotifyKind::DeadName => -1,
            NotifyKind::NoSenders => -2,
            _ => return,
        };
        let st = self.state.lock().unwrap();
        if let Some(tx) = st.portsets.get(&portset) {
            let _ = tx.send(Message { target: MsgTarget::Notify(right), msg_id, seqno, body: Vec::new() });
        }
    }
}

impl Kernel for SimKernel {
    fn allocate_receive_right(&self) -> Result<KernelRight> {
        let id = self.next_right.fetch_add(1, Ordering::Relaxed);
        let right = KernelRight(id);
        self.state.lock().unwrap().rights.insert(
            right,
            RightState { has_send_rights: false, mscount: 0, payload: None, member_of: None },
        );
        Ok(right)
    }

    fn deallocate_receive_right(&self, right: KernelRight) {
        if right.is_null() {
            return;
        }
        self.state.lock().unwrap().rights.remove(&right);
    }

    fn receive_status(&self, right: KernelRight) -> Result<ReceiveStatus> {
        let st = self.state.lock().unwrap();
        match st.rights.get(&right) {
            Some(r) => Ok(ReceiveStatus { has_send_rights: r.has_send_rights, mscount: r.mscount }),
            None => Err(Error::ExternalIpc("unknown receive right".into())),
        }
    }

    fn request_notification(&self, right: KernelRight, _kind: NotifyKind, sync: u64) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        if let Some(r) = st.rights.get_mut(&right) {
            r.mscount = r.mscount.max(sync);
            Ok(())
        } else {
            Err(Error::ExternalIpc("unknown receive right".into()))
        }
    }

    fn cancel_notification(&self, _right: KernelRight, _kind: NotifyKind) {}

    fn set_protected_payload(&self, right: KernelRight, payload: usize) {
        if let Some(r) = self.state.lock().unwrap().rights.get_mut(&right) {
            r.payload = Some(payload);
        }
    }

    fn clear_protected_payload(&self, right: KernelRight) {
        if let Some(r) = self.state.lock().unwrap().rights.get_mut(&right) {
            r.payload = None;
        }
    }

    fn move_member(&self, right: KernelRight, portset: Option<PortSetId>) {
        if let Some(r) = self.state.lock().unwrap().rights.get_mut(&right) {
            r.member_of = portset;
        }
    }

    fn deallocate_dead_name(&self, _name: KernelRight) {
        // SimKernel never materializes foreign dead names as tracked
        // rights, so there is nothing to release.
    }
}
