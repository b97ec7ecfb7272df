//! The runtime: port/class/bucket creation, reference counting, RPC
//! admission and inhibition, and notification bookkeeping.
//!
//! Grounded throughout in the `libports` sources under
//! `begin-rpc.c`/`end-rpc.c`, `destroy-right.c`, `inhibit-port-rpcs.c`,
//! `interrupt-rpcs.c`, `notify-dead-name.c`/`notify-no-senders.c`, and the
//! reference-counting family (`port-deref.c`, `reallocate-port.c`,
//! `transfer-right.c`, `claim-right.c`). A single process may host more
//! than one [`Runtime`]; the original's file-scope globals (`_ports_lock`,
//! `_ports_htable`, ...) become one `Runtime` instance's fields.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Condvar, Mutex, RwLock};

use spin::Mutex as SpinMutex;

use crate::bucket::{BucketId, PortBucket};
use crate::class::{ClassBuilder, ClassId, PortClass};
use crate::error::{Error, Result};
use crate::indices::Indices;
use crate::kernel::{Kernel, KernelRight, NotifyKind, ReceiveStatus};
use crate::name::PortName;
use crate::notify::{NotifyLink, NotifySub};
use crate::port::{Port, PortShared};
use crate::reclaim::Threadpool;
use crate::rpc::{CancelToken, RpcTracker};

thread_local! {
    static CURRENT_RPC: RefCell<Option<Arc<RpcTracker>>> = const { RefCell::new(None) };
}

struct PortState {
    kernel_right: KernelRight,
    live: bool,
    inhibited: bool,
    /// Mirrors the `HasSendRights` flag: true once `get_right` has handed
    /// out at least one send right and no matching no-senders notification
    /// has fired yet. While true, the runtime holds one hard reference on
    /// the port's behalf.
    has_send_rights: bool,
    active_rpcs: Vec<Arc<RpcTracker>>,
}

impl PortState {
    fn new(kernel_right: KernelRight) -> Self {
        PortState {
            kernel_right,
            live: true,
            inhibited: false,
            has_send_rights: false,
            active_rpcs: Vec::new(),
        }
    }
}

#[derive(Default)]
struct ScopeState {
    inhibited: bool,
    active_rpcs: Vec<Arc<RpcTracker>>,
}

impl ScopeState {
    /// Active RPCs in this scope other than the calling thread's own, if
    /// it has one here. `inhibit_*` must never wait on its own caller —
    /// an inhibit initiated from inside an RPC handler has to be able to
    /// return once every *other* RPC has drained.
    fn active_excluding(&self, exclude: Option<&Arc<RpcTracker>>) -> usize {
        match exclude {
            Some(mine) => self.active_rpcs.iter().filter(|r| !Arc::ptr_eq(r, mine)).count(),
            None => self.active_rpcs.len(),
        }
    }
}

#[derive(Default)]
struct MainState {
    global: ScopeState,
    buckets: HashMap<BucketId, ScopeState>,
    classes: HashMap<ClassId, ScopeState>,
    ports: HashMap<PortName, PortState>,
    notify_subs: HashMap<(KernelRight, NotifyKind), NotifySub>,
}

/// Owns every port, class and bucket created through it, plus the
/// coordination state (the "main latch") that the C original kept in
/// process-wide globals.
pub struct Runtime {
    kernel: Arc<dyn Kernel>,
    main: Mutex<MainState>,
    cond: Condvar,
    indices: RwLock<Indices>,
    interrupted: SpinMutex<Vec<Arc<RpcTracker>>>,
}

impl Runtime {
    pub fn new(kernel: Arc<dyn Kernel>) -> Arc<Runtime> {
        Arc::new(Runtime {
            kernel,
            main: Mutex::new(MainState::default()),
            cond: Condvar::new(),
            indices: RwLock::new(Indices::default()),
            interrupted: SpinMutex::new(Vec::new()),
        })
    }

    pub fn kernel(&self) -> &Arc<dyn Kernel> {
        &self.kernel
    }

    // ---- class / bucket creation -----------------------------------

    pub fn create_class(&self) -> ClassBuilder {
        ClassBuilder::new()
    }

    /// Create a bucket backed by a concrete portset id and receiver,
    /// obtained from whatever kernel-specific mechanism (e.g.
    /// [`crate::kernel::SimKernel::create_portset`]) the caller is using.
    /// `ports_create_bucket` in the original does this implicitly because
    /// it only ever talks to one concrete kernel; the [`Kernel`] trait has
    /// no portset-creation method since portset identity and message
    /// delivery are transport-specific.
    pub fn create_bucket_with(
        self: &Arc<Self>,
        portset: crate::kernel::PortSetId,
        receiver: std::sync::mpsc::Receiver<crate::kernel::Message>,
    ) -> Arc<PortBucket> {
        static NEXT: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(1);
        let id = BucketId(NEXT.fetch_add(1, Ordering::Relaxed));
        self.main.lock().unwrap().buckets.insert(id, ScopeState::default());
        Arc::new(PortBucket {
            id,
            portset,
            receiver: Mutex::new(receiver),
            threadpool: Threadpool::new(),
        })
    }

    // ---- port creation ------------------------------------------------

    /// Allocate a fresh receive right, install it into `bucket`'s index
    /// under `class`, and hand back a hard reference. Mirrors
    /// `ports_create_port`.
    pub fn create_port<T: std::any::Any + Send + Sync>(
        &self,
        class: &Arc<PortClass>,
        bucket: &Arc<PortBucket>,
        user: T,
    ) -> Result<Port> {
        let right = self.kernel.allocate_receive_right()?;
        let port = self.install(class, bucket, right, Box::new(user));
        self.kernel.move_member(right, Some(bucket.portset));
        Ok(port)
    }

    /// Like [`Runtime::create_port`] but does not install into any
    /// bucket's portset membership; used for ports that are waited on only
    /// indirectly (e.g. a reply port). Mirrors `ports_create_port_noinstall`.
    pub fn create_port_noinstall<T: std::any::Any + Send + Sync>(
        &self,
        class: &Arc<PortClass>,
        bucket: &Arc<PortBucket>,
        user: T,
    ) -> Result<Port> {
        let right = self.kernel.allocate_receive_right()?;
        Ok(self.install(class, bucket, right, Box::new(user)))
    }

    /// Adopt a receive right this process did not allocate itself, the way
    /// a translator imports a right handed to it by its parent. Mirrors
    /// `ports_import_port`.
    pub fn import_port<T: std::any::Any + Send + Sync>(
        &self,
        class: &Arc<PortClass>,
        bucket: &Arc<PortBucket>,
        right: KernelRight,
        user: T,
    ) -> Result<Port> {
        let status = self.kernel.receive_status(right)?;
        let port = self.install(class, bucket, right, Box::new(user));
        port.0.mscount.store(status.mscount, Ordering::Release);
        self.kernel.move_member(right, Some(bucket.portset));
        Ok(port)
    }

    fn install(
        &self,
        class: &Arc<PortClass>,
        bucket: &Arc<PortBucket>,
        right: KernelRight,
        user: Box<dyn std::any::Any + Send + Sync>,
    ) -> Port {
        let name = PortName::fresh();
        let shared = PortShared {
            name,
            class: class.clone(),
            bucket: bucket.clone(),
            hard: std::sync::atomic::AtomicUsize::new(1),
            weak: std::sync::atomic::AtomicUsize::new(0),
            finalized: std::sync::atomic::AtomicBool::new(false),
            cancel_threshold: std::sync::atomic::AtomicU64::new(0),
            mscount: std::sync::atomic::AtomicU64::new(0),
            user,
        };
        let port = Port(Arc::new(shared));
        {
            let mut main = self.main.lock().unwrap();
            main.ports.insert(name, PortState::new(right));
            main.classes.entry(class.id()).or_default();
        }
        self.indices.write().unwrap().insert(bucket.id(), port.clone());
        // Arm the protected payload immediately so the §4.1 fast path is
        // reachable from the port's first message, not just after a later
        // `reallocate_port`/`transfer_right`; matches those operations'
        // own "set the protected payload to the new pointer" behavior.
        self.kernel.set_protected_payload(right, port.protected_payload().get());
        port
    }

    pub fn lookup(&self, name: PortName) -> Result<Port> {
        self.indices.read().unwrap().lookup(name).ok_or(Error::BadName)
    }

    // ---- reference counting -------------------------------------------

    pub fn port_ref(&self, port: &Port) {
        port.0.hard.fetch_add(1, Ordering::AcqRel);
    }

    /// Drop one hard reference; when the last one goes, the right is
    /// deallocated and the port unindexed. If a weak reference is still
    /// outstanding, the class's `drop_weak` callback runs so the weak
    /// holder can let go; actual deferred reclaim then waits for that
    /// weak reference to drop too. Mirrors `ports_port_deref`.
    pub fn port_deref(&self, port: Port) {
        if port.0.hard.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }
        self.finalize(&port);
        port.0.finalized.store(true, Ordering::Release);
        if port.weak_count() > 0 {
            if let Some(f) = &port.class().drop_weak {
                f(&port);
            }
        }
        if port.weak_count() == 0 {
            let bucket = port.bucket().clone();
            bucket.threadpool.defer(port);
        }
    }

    pub fn port_ref_weak(&self, port: &Port) {
        port.0.weak.fetch_add(1, Ordering::AcqRel);
    }

    /// Trade one hard reference for one weak reference. Used by class
    /// code that wants to keep observing a port without keeping it alive
    /// on its own.
    pub fn demote(&self, port: Port) {
        port.0.weak.fetch_add(1, Ordering::AcqRel);
        self.port_deref(port);
    }

    /// Drop one weak reference. When this is the one that brings `weak`
    /// to zero and `hard` had already reached zero, the port is now fully
    /// unreferenced and goes to the bucket's deferred-reclaim list.
    pub fn port_deref_weak(&self, port: Port) {
        if port.0.weak.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }
        if port.0.finalized.load(Ordering::Acquire) {
            let bucket = port.bucket().clone();
            bucket.threadpool.defer(port);
        }
    }

    /// Take a hard reference from a bare payload recovered off a message,
    /// without going through the hashed index. Safety mirrors
    /// [`Port::from_raw_payload`]; liveness is checked against the main
    /// state before the reference is trusted.
    pub fn unsafe_ref(&self, payload: std::num::NonZeroUsize) -> Option<Port> {
        let port = unsafe { Port::from_raw_payload(payload) };
        let main = self.main.lock().unwrap();
        match main.ports.get(&port.name()) {
            Some(st) if st.live => {
                drop(main);
                self.port_ref(&port);
                Some(port)
            }
            _ => None,
        }
    }

    /// Run final release for a port whose hard count just hit zero:
    /// tear down the receive right if `destroy_right` hasn't already done
    /// so, then invoke `clean_routine` exactly once, with the port already
    /// unreachable through either index. Mirrors the "remove receive
    /// right if still present and invoke clean_routine" half of
    /// `complete-deallocate.c`.
    fn finalize(&self, port: &Port) {
        let mut main = self.main.lock().unwrap();
        let was_live = main.ports.get(&port.name()).map(|st| st.live).unwrap_or(false);
        if was_live {
            if let Some(st) = main.ports.get_mut(&port.name()) {
                st.live = false;
                self.kernel.deallocate_receive_right(st.kernel_right);
            }
        }
        main.ports.remove(&port.name());
        drop(main);
        self.indices.write().unwrap().remove(port.bucket().id(), port.name());
        if let Some(f) = &port.class().clean {
            f(port);
        }
        self.cond.notify_all();
    }

    // ---- right lifecycle management ------------------------------------

    /// Force a port dead regardless of outstanding references, the way a
    /// translator tears down a control port on shutdown: drops the
    /// receive right and unindexes immediately, but defers
    /// `clean_routine` to whenever the hard count actually reaches zero
    /// (it may not be zero yet — other hard references can still be
    /// outstanding). If the port had outstanding send rights, the hard
    /// reference the library was holding on their behalf would otherwise
    /// never be released now that no no-senders notification can ever
    /// fire for a right that's already gone; that release is pushed
    /// through the bucket's quiescence scheme instead of run inline, since
    /// a concurrent dispatcher thread may still be mid-dereference of this
    /// port's payload. Mirrors `ports_destroy_right` and the
    /// `_ports_port_deref_deferred` call it makes when `PORT_HAS_SENDRIGHTS`.
    pub fn destroy_right(&self, port: &Port) {
        let mut main = self.main.lock().unwrap();
        let Some(st) = main.ports.get_mut(&port.name()) else { return };
        if !st.live {
            return;
        }
        st.live = false;
        let had_send_rights = std::mem::replace(&mut st.has_send_rights, false);
        let kernel_right = st.kernel_right;
        drop(main);
        if had_send_rights {
            self.kernel.clear_protected_payload(kernel_right);
        }
        self.kernel.deallocate_receive_right(kernel_right);
        self.indices.write().unwrap().remove(port.bucket().id(), port.name());
        if had_send_rights {
            port.bucket().threadpool.defer_deref(port.clone());
        }
        self.cond.notify_all();
    }

    /// Unlink the port from this runtime's indices without tearing down
    /// the receive right, handing the caller sole ownership. If the port
    /// had outstanding send rights, the hard reference the library was
    /// holding on their behalf is decremented here rather than waited on
    /// via a future no-senders notification: that reference is now the
    /// caller's to manage. Per §9's open-question resolution, this
    /// decrement-on-claim behavior is treated as authoritative rather than
    /// "fixed" to add a reference instead. Mirrors `ports_claim_right`.
    pub fn claim_right(&self, port: &Port) {
        let mut main = self.main.lock().unwrap();
        let had_send_rights = main
            .ports
            .get_mut(&port.name())
            .map(|st| std::mem::replace(&mut st.has_send_rights, false))
            .unwrap_or(false);
        drop(main);
        self.indices.write().unwrap().remove(port.bucket().id(), port.name());
        if had_send_rights {
            port.0.hard.fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// Replace a port's underlying receive right with a freshly allocated
    /// one, keeping its name and identity. Resets `cancel_threshold` and
    /// `mscount` to zero and, if the old right had outstanding send
    /// rights, drops the library's hard reference for them — the new
    /// right starts with none. Mirrors `ports_reallocate_port`.
    pub fn reallocate_port(&self, port: &Port) -> Result<()> {
        let right = self.kernel.allocate_receive_right()?;
        let had_send_rights = {
            let mut main = self.main.lock().unwrap();
            let Some(st) = main.ports.get_mut(&port.name()) else {
                self.kernel.deallocate_receive_right(right);
                return Err(Error::BadHandle);
            };
            self.kernel.deallocate_receive_right(st.kernel_right);
            st.kernel_right = right;
            std::mem::replace(&mut st.has_send_rights, false)
        };
        port.0.cancel_threshold.store(0, Ordering::Release);
        port.0.mscount.store(0, Ordering::Release);
        self.kernel.move_member(right, Some(port.bucket().portset));
        self.kernel.set_protected_payload(right, port.protected_payload().get());
        if had_send_rights {
            self.port_deref(port.clone());
        }
        Ok(())
    }

    /// Like [`Runtime::reallocate_port`] but adopts a right supplied by the
    /// caller, along with that right's current send-rights/make-send-count
    /// status, instead of allocating a fresh empty one. Mirrors
    /// `ports_reallocate_from_external`.
    pub fn reallocate_from_external(&self, port: &Port, right: KernelRight) -> Result<()> {
        let status = self.kernel.receive_status(right)?;
        let had_send_rights = {
            let mut main = self.main.lock().unwrap();
            let Some(st) = main.ports.get_mut(&port.name()) else { return Err(Error::BadHandle) };
            self.kernel.deallocate_receive_right(st.kernel_right);
            st.kernel_right = right;
            std::mem::replace(&mut st.has_send_rights, status.has_send_rights)
        };
        port.0.cancel_threshold.store(0, Ordering::Release);
        port.0.mscount.store(status.mscount, Ordering::Release);
        self.kernel.move_member(right, Some(port.bucket().portset));
        self.kernel.set_protected_payload(right, port.protected_payload().get());
        match (had_send_rights, status.has_send_rights) {
            (false, true) => self.port_ref(port),
            (true, false) => self.port_deref(port.clone()),
            _ => {}
        }
        Ok(())
    }

    /// Move the receive right out of `from` and into `to`, adjusting both
    /// objects' hard references to reflect whether each had send rights
    /// before and after the move, carrying over `cancel_threshold` and
    /// `mscount`, and destroying any right `to` already held. `from` is
    /// left with a dead right and drops out of both indices; any lookup
    /// that used to resolve to `from`'s name now resolves to `to` instead,
    /// the way a Mach port name whose receive right moved to a different
    /// `port_info` starts returning that `port_info` on lookup. Mirrors
    /// `ports_transfer_right`.
    pub fn transfer_right(&self, to: &Port, from: &Port) {
        let mut main = self.main.lock().unwrap();

        let moved_right = main.ports.get_mut(&from.name()).and_then(|fst| {
            if !fst.live {
                return None;
            }
            fst.live = false;
            let right = fst.kernel_right;
            let from_had_send_rights = std::mem::replace(&mut fst.has_send_rights, false);
            Some((right, from_had_send_rights))
        });

        let Some((right, from_had_send_rights)) = moved_right else { return };

        let to_had_send_rights = main
            .ports
            .get(&to.name())
            .map(|st| (st.live, st.has_send_rights, st.kernel_right))
            .map(|(live, has_send, old_right)| {
                if live {
                    self.kernel.deallocate_receive_right(old_right);
                }
                has_send
            })
            .unwrap_or(false);

        if let Some(tst) = main.ports.get_mut(&to.name()) {
            tst.kernel_right = right;
            tst.live = true;
            tst.has_send_rights = from_had_send_rights;
        }
        drop(main);

        to.0.cancel_threshold.store(from.cancel_threshold(), Ordering::Release);
        to.0.mscount.store(from.mscount(), Ordering::Release);

        if to_had_send_rights && !from_had_send_rights {
            self.port_deref(to.clone());
        } else if !to_had_send_rights && from_had_send_rights {
            self.port_ref(to);
        }
        if from_had_send_rights {
            self.port_deref(from.clone());
        }

        let mut indices = self.indices.write().unwrap();
        indices.remove(from.bucket().id(), from.name());
        indices.remove(to.bucket().id(), to.name());
        indices.insert(to.bucket().id(), to.clone());
        indices.insert_alias(from.bucket().id(), from.name(), to.clone());
        drop(indices);

        self.kernel.set_protected_payload(right, to.protected_payload().get());
        if to.bucket().id() != from.bucket().id() {
            self.kernel.move_member(right, Some(to.bucket().portset));
        }
    }

    /// Hand back the port's kernel name for emission as a send right,
    /// arming a no-senders notification the first time. Mirrors
    /// `ports_get_right`/`get-right.c`.
    pub fn get_right(&self, port: &Port) -> Result<KernelRight> {
        let mut main = self.main.lock().unwrap();
        let st = main.ports.get_mut(&port.name()).ok_or(Error::BadHandle)?;
        if !st.live {
            return Err(Error::BadHandle);
        }
        let right = st.kernel_right;
        let mscount = port.0.mscount.fetch_add(1, Ordering::AcqRel) + 1;
        let needs_arm = !st.has_send_rights;
        if needs_arm {
            st.has_send_rights = true;
        }
        drop(main);
        if needs_arm {
            self.port_ref(port);
            if self.kernel.request_notification(right, NotifyKind::NoSenders, mscount).is_err() {
                // Arming failed: back out the flag and reference so a
                // later get_right can retry cleanly.
                let mut main = self.main.lock().unwrap();
                if let Some(st) = main.ports.get_mut(&port.name()) {
                    st.has_send_rights = false;
                }
                drop(main);
                self.port_deref(port.clone());
            }
        }
        Ok(right)
    }

    // ---- RPC admission --------------------------------------------------

    /// Block until `msg_id` on `port` is admissible under every active
    /// inhibition scope (global, bucket, class, port), then record the RPC
    /// as in progress. Mirrors `ports_begin_rpc`.
    pub fn begin_rpc(&self, port: &Port, msg_id: i32) -> Result<Arc<RpcTracker>> {
        let uninhibitable = port.class().is_uninhibitable(msg_id);
        let tracker = Arc::new(RpcTracker {
            owner_thread: std::thread::current().id(),
            msg_id,
            port: port.clone(),
            cancel: CancelToken::new(),
            notify_links: std::sync::Mutex::new(Vec::new()),
        });

        let mut main = self.main.lock().unwrap();
        loop {
            if !main.ports.get(&port.name()).is_some_and(|st| st.live) {
                return Err(Error::NotSupported);
            }
            if tracker.cancel.check() {
                return Err(Error::Interrupted);
            }
            let blocked = !uninhibitable
                && (main.global.inhibited
                    || main.buckets.get(&port.bucket().id()).is_some_and(|s| s.inhibited)
                    || main.classes.get(&port.class().id()).is_some_and(|s| s.inhibited)
                    || main.ports.get(&port.name()).is_some_and(|s| s.inhibited));
            if !blocked {
                break;
            }
            main = self.cond.wait(main).unwrap();
        }

        main.global.active_rpcs.push(tracker.clone());
        main.buckets.entry(port.bucket().id()).or_default().active_rpcs.push(tracker.clone());
        main.classes.entry(port.class().id()).or_default().active_rpcs.push(tracker.clone());
        if let Some(st) = main.ports.get_mut(&port.name()) {
            st.active_rpcs.push(tracker.clone());
        }
        drop(main);

        CURRENT_RPC.with(|c| *c.borrow_mut() = Some(tracker.clone()));
        Ok(tracker)
    }

    /// Unwind everything [`Runtime::begin_rpc`] recorded, release any
    /// notification subscriptions the RPC attached along the way, and wake
    /// anyone waiting for this scope to drain. Mirrors `ports_end_rpc`.
    pub fn end_rpc(&self, tracker: &Arc<RpcTracker>) {
        let mut main = self.main.lock().unwrap();
        main.global.active_rpcs.retain(|r| !Arc::ptr_eq(r, tracker));
        if let Some(s) = main.buckets.get_mut(&tracker.port.bucket().id()) {
            s.active_rpcs.retain(|r| !Arc::ptr_eq(r, tracker));
        }
        if let Some(s) = main.classes.get_mut(&tracker.port.class().id()) {
            s.active_rpcs.retain(|r| !Arc::ptr_eq(r, tracker));
        }
        if let Some(st) = main.ports.get_mut(&tracker.port.name()) {
            st.active_rpcs.retain(|r| !Arc::ptr_eq(r, tracker));
        }
        let links: Vec<NotifyLink> = std::mem::take(&mut *tracker.notify_links.lock().unwrap());
        for link in links {
            if let Some(sub) = main.notify_subs.get_mut(&(link.watched, link.kind)) {
                sub.subscribers.retain(|(r, _)| !Arc::ptr_eq(r, tracker));
                if sub.subscribers.is_empty() {
                    self.kernel.cancel_notification(link.watched, link.kind);
                    main.notify_subs.remove(&(link.watched, link.kind));
                }
            }
        }
        drop(main);
        self.cond.notify_all();
        CURRENT_RPC.with(|c| *c.borrow_mut() = None);
        self.interrupted.lock().retain(|r| !Arc::ptr_eq(r, tracker));
    }

    // ---- inhibition -------------------------------------------------------

    /// Cancel every in-progress RPC in `victims` except the calling
    /// thread's own, mirroring the "inhibit cancels everyone but the
    /// caller" composition rule (so an inhibit can be issued from inside
    /// a handler). Returns the count still running afterward (which is
    /// always either 0, or 1 if the caller's own RPC is in this scope).
    fn cancel_others(&self, victims: &[Arc<RpcTracker>]) {
        let mine = CURRENT_RPC.with(|c| c.borrow().clone());
        let mut set = self.interrupted.lock();
        for v in victims {
            if mine.as_ref().is_some_and(|m| Arc::ptr_eq(m, v)) {
                continue;
            }
            v.cancel.cancel();
            if !set.iter().any(|r| Arc::ptr_eq(r, v)) {
                set.push(v.clone());
            }
        }
    }

    /// Wait for every RPC currently in progress globally (other than the
    /// caller's own, if any) to finish, then block admission of new ones
    /// until [`Runtime::resume_global_rpcs`]. Mirrors
    /// `ports_inhibit_all_rpcs`.
    pub fn inhibit_global_rpcs(&self) -> Result<()> {
        let mut main = self.main.lock().unwrap();
        if main.global.inhibited {
            return Err(Error::Busy);
        }
        main.global.inhibited = true;
        self.cancel_others(&main.global.active_rpcs.clone());
        let mine = CURRENT_RPC.with(|c| c.borrow().clone());
        while main.global.active_excluding(mine.as_ref()) > 0 {
            main = self.cond.wait(main).unwrap();
        }
        Ok(())
    }

    pub fn resume_global_rpcs(&self) {
        let mut main = self.main.lock().unwrap();
        main.global.inhibited = false;
        drop(main);
        self.cond.notify_all();
    }

    /// Mirrors `ports_inhibit_bucket_rpcs`.
    pub fn inhibit_bucket_rpcs(&self, bucket: &Arc<PortBucket>) -> Result<()> {
        let mut main = self.main.lock().unwrap();
        let entry = main.buckets.entry(bucket.id()).or_default();
        if entry.inhibited {
            return Err(Error::Busy);
        }
        entry.inhibited = true;
        self.cancel_others(&entry.active_rpcs.clone());
        let mine = CURRENT_RPC.with(|c| c.borrow().clone());
        loop {
            let active = main.buckets.get(&bucket.id()).map(|s| s.active_excluding(mine.as_ref())).unwrap_or(0);
            if active == 0 {
                break;
            }
            main = self.cond.wait(main).unwrap();
        }
        Ok(())
    }

    pub fn resume_bucket_rpcs(&self, bucket: &Arc<PortBucket>) {
        let mut main = self.main.lock().unwrap();
        if let Some(s) = main.buckets.get_mut(&bucket.id()) {
            s.inhibited = false;
        }
        drop(main);
        self.cond.notify_all();
    }

    /// Mirrors `ports_inhibit_class_rpcs`.
    pub fn inhibit_class_rpcs(&self, class: &Arc<PortClass>) -> Result<()> {
        let mut main = self.main.lock().unwrap();
        let entry = main.classes.entry(class.id()).or_default();
        if entry.inhibited {
            return Err(Error::Busy);
        }
        entry.inhibited = true;
        self.cancel_others(&entry.active_rpcs.clone());
        let mine = CURRENT_RPC.with(|c| c.borrow().clone());
        loop {
            let active = main.classes.get(&class.id()).map(|s| s.active_excluding(mine.as_ref())).unwrap_or(0);
            if active == 0 {
                break;
            }
            main = self.cond.wait(main).unwrap();
        }
        Ok(())
    }

    pub fn resume_class_rpcs(&self, class: &Arc<PortClass>) {
        let mut main = self.main.lock().unwrap();
        if let Some(s) = main.classes.get_mut(&class.id()) {
            s.inhibited = false;
        }
        drop(main);
        self.cond.notify_all();
    }

    /// Mirrors `ports_inhibit_port_rpcs`.
    pub fn inhibit_port_rpcs(&self, port: &Port) -> Result<()> {
        let mut main = self.main.lock().unwrap();
        match main.ports.get(&port.name()) {
            Some(st) if st.inhibited => return Err(Error::Busy),
            None => return Err(Error::BadHandle),
            _ => {}
        }
        let st = main.ports.get_mut(&port.name()).unwrap();
        st.inhibited = true;
        self.cancel_others(&st.active_rpcs.clone());
        let mine = CURRENT_RPC.with(|c| c.borrow().clone());
        loop {
            let active = main
                .ports
                .get(&port.name())
                .map(|s| s.active_rpcs.iter().filter(|r| !mine.as_ref().is_some_and(|m| Arc::ptr_eq(m, r))).count())
                .unwrap_or(0);
            if active == 0 {
                break;
            }
            main = self.cond.wait(main).unwrap();
        }
        Ok(())
    }

    pub fn resume_port_rpcs(&self, port: &Port) {
        let mut main = self.main.lock().unwrap();
        if let Some(s) = main.ports.get_mut(&port.name()) {
            s.inhibited = false;
        }
        drop(main);
        self.cond.notify_all();
    }

    // ---- cancellation -----------------------------------------------------

    /// Cancel every RPC currently in progress against `port`. Mirrors
    /// `ports_interrupt_rpcs`.
    pub fn interrupt_rpcs(&self, port: &Port) {
        let main = self.main.lock().unwrap();
        let victims: Vec<Arc<RpcTracker>> =
            main.ports.get(&port.name()).map(|s| s.active_rpcs.clone()).unwrap_or_default();
        drop(main);
        let mut set = self.interrupted.lock();
        for v in &victims {
            v.cancel.cancel();
            if !set.iter().any(|r| Arc::ptr_eq(r, v)) {
                set.push(v.clone());
            }
        }
        drop(set);
        self.cond.notify_all();
    }

    /// True if the calling thread's own in-progress RPC has been marked
    /// cancelled. Mirrors `ports_self_interrupted`.
    pub fn self_interrupted(&self) -> bool {
        CURRENT_RPC.with(|c| c.borrow().as_ref().is_some_and(|r| r.cancel.check()))
    }

    /// Arm a watch so that the calling thread's in-progress RPC is
    /// cancelled when `kind` fires on `watched`. Mirrors
    /// `ports_interrupt_self_on_notification`/`interrupt_on_notify`.
    pub fn interrupt_self_on_notification(&self, watched: KernelRight, kind: NotifyKind) -> Result<()> {
        let tracker = CURRENT_RPC.with(|c| c.borrow().clone()).ok_or(Error::NotSupported)?;
        self.interrupt_rpc_on_notification(&tracker, watched, kind)
    }

    /// Arm a watch for an arbitrary tracked RPC (not necessarily the
    /// calling thread's). Mirrors `ports_interrupt_rpc_on_notification`.
    pub fn interrupt_rpc_on_notification(
        &self,
        tracker: &Arc<RpcTracker>,
        watched: KernelRight,
        kind: NotifyKind,
    ) -> Result<()> {
        let mut main = self.main.lock().unwrap();
        let key = (watched, kind);
        let sync = tracker.port.mscount();
        let needs_arm = !main.notify_subs.contains_key(&key);
        let sub = main.notify_subs.entry(key).or_insert_with(NotifySub::new);
        match sub.subscribers.iter_mut().find(|(r, _)| Arc::ptr_eq(r, tracker)) {
            Some((_, pending)) => *pending += 1,
            None => sub.subscribers.push((tracker.clone(), 1)),
        }
        let sub_armed = sub.armed;
        drop(main);
        if needs_arm || !sub_armed {
            self.kernel.request_notification(watched, kind, sync)?;
            self.main.lock().unwrap().notify_subs.get_mut(&key).unwrap().armed = true;
        }
        tracker.notify_links.lock().unwrap().push(NotifyLink { watched, kind });
        Ok(())
    }

    /// Called by the dispatcher when a notification message of `kind` for
    /// `watched` is delivered: cancels every RPC still owed one against it.
    /// The subscription record survives the firing — only a subscriber
    /// whose `pending` count is already exhausted is left alone, and the
    /// record itself is only ever removed by `end_rpc`'s teardown, not by
    /// firing. Mirrors `ports_interrupt_notified_rpcs`, which decrements
    /// `req->pending` per outstanding request and leaves the `ports_notify`
    /// list node in place; only `_ports_remove_notified_rpc` (driven from
    /// RPC teardown) unlinks a request.
    pub fn interrupt_notified_rpcs(&self, watched: KernelRight, kind: NotifyKind) {
        let mut main = self.main.lock().unwrap();
        let Some(sub) = main.notify_subs.get_mut(&(watched, kind)) else { return };
        sub.armed = false;
        let mut fired = Vec::new();
        for (tracker, pending) in sub.subscribers.iter_mut() {
            if *pending > 0 {
                *pending -= 1;
                fired.push(tracker.clone());
            }
        }
        drop(main);
        let mut set = self.interrupted.lock();
        for tracker in &fired {
            tracker.cancel.cancel();
            if !set.iter().any(|r| Arc::ptr_eq(r, tracker)) {
                set.push(tracker.clone());
            }
        }
        drop(set);
        self.cond.notify_all();
    }

    // ---- notification handlers ---------------------------------------

    /// Handle a `no-senders` notification for `right`, delivered with
    /// make-send count `c`. Per `notify-no-senders.c`: if `c` is at least
    /// the port's current `mscount`, no send right was fabricated after
    /// this notification was armed, so `HasSendRights` really is false
    /// now — clear it, interrupt anyone waiting on this event or on the
    /// port directly, and release the hard reference `get_right` took.
    /// Otherwise the notification is stale; re-arm at the current count.
    pub fn handle_no_senders(&self, right: KernelRight, c: u64) {
        let name = {
            let main = self.main.lock().unwrap();
            main.ports.iter().find(|(_, s)| s.kernel_right == right).map(|(n, _)| *n)
        };
        let Some(name) = name else { return };
        let Ok(port) = self.lookup(name) else { return };

        let mscount = port.mscount();
        if c < mscount {
            let _ = self.kernel.request_notification(right, NotifyKind::NoSenders, mscount);
            return;
        }

        {
            let mut main = self.main.lock().unwrap();
            if let Some(st) = main.ports.get_mut(&name) {
                st.has_send_rights = false;
            }
        }
        self.interrupt_notified_rpcs(right, NotifyKind::NoSenders);
        self.interrupt_rpcs(&port);
        self.port_deref(port);
    }

    /// Handle a `dead-name` notification for `watched`: wake every RPC
    /// registered to care, then release the kernel's extra reference on
    /// the name. Mirrors `dead-name.c`/`notify-dead-name.c`.
    pub fn handle_dead_name(&self, watched: KernelRight) {
        self.interrupt_notified_rpcs(watched, NotifyKind::DeadName);
        self.kernel.deallocate_dead_name(watched);
    }

    // ---- introspection ------------------------------------------------

    pub fn bucket_iterate(&self, bucket: &Arc<PortBucket>, mut f: impl FnMut(&Port)) {
        for port in self.indices.read().unwrap().bucket_ports(bucket.id()) {
            f(&port);
        }
    }

    pub fn count_bucket(&self, bucket: &Arc<PortBucket>) -> usize {
        self.indices.read().unwrap().bucket_count(bucket.id())
    }

    /// Visit every live port of `class`, across every bucket. Mirrors
    /// `ports_class_iterate`.
    pub fn class_iterate(&self, class: &Arc<PortClass>, mut f: impl FnMut(&Port)) {
        let indices = self.indices.read().unwrap();
        for port in indices.all_ports() {
            if port.class().id() == class.id() {
                f(port);
            }
        }
    }

    pub fn count_class(&self, class: &Arc<PortClass>) -> usize {
        self.indices.read().unwrap().all_ports().filter(|p| p.class().id() == class.id()).count()
    }

    /// Query the kernel's live view of `port`'s send-rights/make-send-count
    /// status, without emitting a new send right or arming a notification.
    /// Mirrors the introspection `reallocate_from_external` performs on an
    /// externally-supplied right, exposed here for tests and callers that
    /// just want to observe current state.
    pub fn receive_status(&self, port: &Port) -> Result<ReceiveStatus> {
        let right = {
            let main = self.main.lock().unwrap();
            let st = main.ports.get(&port.name()).ok_or(Error::BadHandle)?;
            if !st.live {
                return Err(Error::BadHandle);
            }
            st.kernel_right
        };
        self.kernel.receive_status(right)
    }
}
