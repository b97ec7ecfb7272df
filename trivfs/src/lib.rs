//! Translator scaffolding: turns a filesystem-like port into RPC dispatch
//! against user callbacks, on top of [`ports`].
//!
//! Mirrors the shape described for libtrivfs in the port runtime's
//! external-interfaces section: a translator opens a receive right, calls
//! `startup` against its parent filesystem, creates one control-port class
//! and one protid-port class sharing a bucket, and runs the multithreaded
//! dispatcher with a composite demuxer. The concrete parent-filesystem RPC
//! (`fsys_startup` in the original) is represented here as a trait rather
//! than a wire call, consistent with the port runtime treating IPC
//! transport as abstracted.

use std::sync::Arc;

use ports::{
    BucketId, ChainDemuxer, DemuxOutcome, Demuxer, Message, Port, PortBucket, PortClass,
    PortName, Result, Runtime,
};

/// Message id reserved for "go away" (the translator is being asked to
/// detach and exit), dispatched against control ports.
pub const FS_GOAWAY_MSG_ID: i32 = 100;
/// Message id for a protid re-authentication request, dispatched against
/// protid ports. Shared with [`pfinet`](../pfinet)'s reauthenticate path
/// in spirit, though each crate wires its own handler.
pub const IO_REAUTHENTICATE_MSG_ID: i32 = 101;

/// User-supplied translator behavior. A real filesystem translator
/// implements this to answer shutdown requests and reauthentication.
pub trait TrivfsServer: Send + Sync {
    /// Mirrors the `fs_goaway` RPC: `flags` carries the caller's shutdown
    /// preference (e.g. force vs. graceful); returning an error refuses
    /// the shutdown.
    fn goaway(&self, flags: u32) -> Result<()>;

    /// Mirrors reauthenticating a protid against a newly supplied uid/gid
    /// set, returning the identity that should be recorded against it.
    fn reauthenticate(&self, protid: &ProtidState, new_uid: u32) -> Result<u32> {
        let _ = protid;
        Ok(new_uid)
    }
}

/// Stands in for the parent filesystem a translator registers itself
/// with via `fsys_startup`.
pub trait ParentFilesystem: Send + Sync {
    fn register_control(&self, control: PortName) -> Result<()>;
}

/// User state attached to the control port: one per translator instance.
pub struct ControlState {
    pub server: Arc<dyn TrivfsServer>,
}

/// User state attached to a protid port: one per client open.
pub struct ProtidState {
    pub control: Port,
    pub uid: u32,
}

/// A running translator: owns its bucket, its two classes, and the single
/// control port every protid refers back to.
pub struct Trivfs {
    pub runtime: Arc<Runtime>,
    pub bucket: Arc<PortBucket>,
    pub control_class: Arc<PortClass>,
    pub protid_class: Arc<PortClass>,
    pub control: Port,
}

impl Trivfs {
    /// Mirrors `trivfs_startup`: allocate the control port, register it
    /// with the parent, and prepare the protid class new opens will use.
    pub fn startup(
        runtime: Arc<Runtime>,
        bucket: Arc<PortBucket>,
        server: Arc<dyn TrivfsServer>,
        parent: &dyn ParentFilesystem,
    ) -> Result<Trivfs> {
        let control_class = Arc::new(runtime.create_class().build());
        let protid_class = Arc::new(runtime.create_class().build());
        let control = runtime.create_port(&control_class, &bucket, ControlState { server })?;
        parent.register_control(control.name())?;
        Ok(Trivfs { runtime, bucket, control_class, protid_class, control })
    }

    /// Mirrors opening a new protid against the running translator's
    /// control port: bumps the control port's hard count so the protid
    /// keeps it alive.
    pub fn new_protid(&self, uid: u32) -> Result<Port> {
        self.runtime.port_ref(&self.control);
        self.runtime.create_port(
            &self.protid_class,
            &self.bucket,
            ProtidState { control: self.control.clone(), uid },
        )
    }

    pub fn bucket_id(&self) -> BucketId {
        self.bucket.id()
    }

    /// Build the demuxer the dispatch loop should run: control-port and
    /// protid-port operations chained together, the way a real translator
    /// chains the filesystem-generic dispatch table with its own.
    pub fn demuxer(&self) -> Arc<dyn Demuxer> {
        Arc::new(ChainDemuxer(vec![
            Arc::new(ControlDemuxer { control_class: self.control_class.clone() }),
            Arc::new(ProtidDemuxer { protid_class: self.protid_class.clone() }),
        ]))
    }
}

struct ControlDemuxer {
    control_class: Arc<PortClass>,
}

impl Demuxer for ControlDemuxer {
    fn dispatch(&self, port: &Port, msg: &Message, rt: &Runtime) -> DemuxOutcome {
        if port.class().id() != self.control_class.id() || msg.msg_id != FS_GOAWAY_MSG_ID {
            return DemuxOutcome::NotMine;
        }
        let flags = msg.body.first().copied().unwrap_or(0) as u32;
        let state = port.downcast_ref::<ControlState>();
        match state.server.goaway(flags) {
            Ok(()) => {
                rt.destroy_right(port);
                DemuxOutcome::Handled(Some(vec![0]))
            }
            Err(e) => {
                log::warn!("goaway refused: {e}");
                DemuxOutcome::Handled(Some(vec![1]))
            }
        }
    }
}

struct ProtidDemuxer {
    protid_class: Arc<PortClass>,
}

impl Demuxer for ProtidDemuxer {
    fn dispatch(&self, port: &Port, msg: &Message, _rt: &Runtime) -> DemuxOutcome {
        if port.class().id() != self.protid_class.id() || msg.msg_id != IO_REAUTHENTICATE_MSG_ID {
            return DemuxOutcome::NotMine;
        }
        let state = port.downcast_ref::<ProtidState>();
        let new_uid = msg.body.first().copied().unwrap_or(0) as u32;
        let control_state = state.control.downcast_ref::<ControlState>();
        match control_state.server.reauthenticate(state, new_uid) {
            Ok(uid) => DemuxOutcome::Handled(Some(vec![uid as u8])),
            Err(e) => {
                log::warn!("reauthenticate failed: {e}");
                DemuxOutcome::Handled(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    struct NoopServer {
        went_away: AtomicBool,
    }
    impl TrivfsServer for NoopServer {
        fn goaway(&self, _flags: u32) -> Result<()> {
            self.went_away.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FakeParent {
        registered: Mutex<Option<PortName>>,
    }
    impl ParentFilesystem for FakeParent {
        fn register_control(&self, control: PortName) -> Result<()> {
            *self.registered.lock().unwrap() = Some(control);
            Ok(())
        }
    }

    fn setup() -> (Trivfs, Arc<ports::SimKernel>) {
        let _ = env_logger::builder().is_test(true).try_init();
        let kernel = Arc::new(ports::SimKernel::new());
        let runtime = Runtime::new(kernel.clone());
        let (portset, rx) = kernel.create_portset();
        let bucket = runtime.create_bucket_with(portset, rx);
        let server = Arc::new(NoopServer { went_away: AtomicBool::new(false) });
        let parent = FakeParent { registered: Mutex::new(None) };
        let trivfs = Trivfs::startup(runtime, bucket, server, &parent).unwrap();
        assert!(parent.registered.lock().unwrap().is_some());
        (trivfs, kernel)
    }

    #[test]
    fn startup_registers_control_with_parent() {
        let (trivfs, _kernel) = setup();
        assert_eq!(trivfs.runtime.lookup(trivfs.control.name()).unwrap(), trivfs.control);
    }

    #[test]
    fn new_protid_keeps_control_alive() {
        let (trivfs, _kernel) = setup();
        let before = trivfs.control.hard_count();
        let protid = trivfs.new_protid(1000).unwrap();
        assert_eq!(trivfs.control.hard_count(), before + 1);
        assert_eq!(protid.downcast_ref::<ProtidState>().uid, 1000);
    }
}
