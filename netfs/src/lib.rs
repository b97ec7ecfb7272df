//! Network-filesystem translator scaffolding: adds a node cache and
//! per-node protid dispatch on top of [`trivfs`]'s control/protid pair.
//!
//! Mirrors libnetfs's relationship to libtrivfs: a netfs translator is a
//! trivfs translator whose protids are bound to a specific remote node
//! rather than just the control port, and which keeps a cache mapping the
//! remote filesystem's own node identifiers to the local [`ports::Port`]
//! standing in for them so repeated lookups of the same node return the
//! same object.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use ports::{ChainDemuxer, DemuxOutcome, Demuxer, Message, Port, PortBucket, PortClass, Result, Runtime};
use trivfs::{ParentFilesystem, Trivfs, TrivfsServer};

/// Message id for a directory-lookup RPC: maps a remote node id to a
/// local node port, creating or reusing it from the node cache.
pub const DIR_LOOKUP_MSG_ID: i32 = 200;

/// A remote filesystem's own identifier for a node (e.g. an NFS file
/// handle or inode number), opaque to this crate.
pub type RemoteNodeId = u64;

/// User-supplied behavior for fetching node attributes from the remote
/// filesystem the translator is proxying.
pub trait NetfsServer: Send + Sync {
    fn stat(&self, node: RemoteNodeId) -> Result<NodeAttr>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NodeAttr {
    pub size: u64,
    pub readonly: bool,
}

/// User state attached to a node port.
pub struct NodeState {
    pub remote: RemoteNodeId,
    pub attr: NodeAttr,
}

/// User state attached to a netfs protid: which node it was opened
/// against.
pub struct NetfsProtidState {
    pub node: Port,
}

/// A running netfs-style translator.
pub struct Netfs {
    pub trivfs: Trivfs,
    pub node_class: Arc<PortClass>,
    server: Arc<dyn NetfsServer>,
    cache: Mutex<HashMap<RemoteNodeId, Port>>,
}

impl Netfs {
    pub fn startup(
        runtime: Arc<Runtime>,
        bucket: Arc<PortBucket>,
        fs_server: Arc<dyn TrivfsServer>,
        net_server: Arc<dyn NetfsServer>,
        parent: &dyn ParentFilesystem,
    ) -> Result<Netfs> {
        let node_class = Arc::new(runtime.create_class().build());
        let trivfs = Trivfs::startup(runtime, bucket, fs_server, parent)?;
        Ok(Netfs { trivfs, node_class, server: net_server, cache: Mutex::new(HashMap::new()) })
    }

    /// Look up (or create and cache) the local node port standing in for
    /// `remote`. Mirrors `netfs_make_node`/the node-cache half of
    /// `netfs_get_filemap`-style lookups.
    pub fn node_for(&self, remote: RemoteNodeId) -> Result<Port> {
        let mut cache = self.cache.lock().unwrap();
        if let Some(port) = cache.get(&remote) {
            log::debug!("node cache hit for remote node {remote}");
            self.trivfs.runtime.port_ref(port);
            return Ok(port.clone());
        }
        log::debug!("node cache miss for remote node {remote}, fetching attributes");
        let attr = self.server.stat(remote)?;
        let port = self.trivfs.runtime.create_port(
            &self.node_class,
            &self.trivfs.bucket,
            NodeState { remote, attr },
        )?;
        cache.insert(remote, port.clone());
        Ok(port)
    }

    /// Drop a node from the cache once its last protid has gone away.
    /// Mirrors a class `clean_routine` that would otherwise do this on
    /// final deref; exposed here as an explicit call because this crate's
    /// node class doesn't register one (the cache itself is the only
    /// other owner, and it removes its own entry).
    pub fn evict(&self, remote: RemoteNodeId) {
        if self.cache.lock().unwrap().remove(&remote).is_some() {
            log::debug!("evicted node cache entry for remote node {remote}");
        }
    }

    pub fn demuxer(&self) -> Arc<dyn Demuxer> {
        Arc::new(ChainDemuxer(vec![
            self.trivfs.demuxer(),
            Arc::new(NodeDemuxer { node_class: self.node_class.clone() }),
        ]))
    }
}

struct NodeDemuxer {
    node_class: Arc<PortClass>,
}

impl Demuxer for NodeDemuxer {
    fn dispatch(&self, port: &Port, msg: &Message, _rt: &Runtime) -> DemuxOutcome {
        if port.class().id() != self.node_class.id() || msg.msg_id != DIR_LOOKUP_MSG_ID {
            return DemuxOutcome::NotMine;
        }
        let state = port.downcast_ref::<NodeState>();
        let mut reply = Vec::with_capacity(9);
        reply.extend_from_slice(&state.attr.size.to_le_bytes());
        reply.push(state.attr.readonly as u8);
        DemuxOutcome::Handled(Some(reply))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    struct Fs;
    impl TrivfsServer for Fs {
        fn goaway(&self, _flags: u32) -> Result<()> {
            Ok(())
        }
    }

    struct Remote;
    impl NetfsServer for Remote {
        fn stat(&self, node: RemoteNodeId) -> Result<NodeAttr> {
            Ok(NodeAttr { size: node * 10, readonly: node % 2 == 0 })
        }
    }

    struct FakeParent {
        registered: StdMutex<Option<ports::PortName>>,
    }
    impl ParentFilesystem for FakeParent {
        fn register_control(&self, control: ports::PortName) -> Result<()> {
            *self.registered.lock().unwrap() = Some(control);
            Ok(())
        }
    }

    fn setup() -> Netfs {
        let _ = env_logger::builder().is_test(true).try_init();
        let kernel = Arc::new(ports::SimKernel::new());
        let runtime = Runtime::new(kernel.clone());
        let (portset, rx) = kernel.create_portset();
        let bucket = runtime.create_bucket_with(portset, rx);
        let parent = FakeParent { registered: StdMutex::new(None) };
        Netfs::startup(runtime, bucket, Arc::new(Fs), Arc::new(Remote), &parent).unwrap()
    }

    #[test]
    fn repeated_lookup_returns_same_node() {
        let netfs = setup();
        let a = netfs.node_for(42).unwrap();
        let b = netfs.node_for(42).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.downcast_ref::<NodeState>().attr.size, 420);
    }

    #[test]
    fn distinct_remotes_get_distinct_nodes() {
        let netfs = setup();
        let a = netfs.node_for(1).unwrap();
        let b = netfs.node_for(2).unwrap();
        assert_ne!(a, b);
    }
}
