//! The global and per-bucket hash indices, behind one reader/writer latch.
//!
//! Lookups take the reader side (concurrent with each other); creation,
//! destruction, reallocation and transfer take the writer side. The global
//! and bucket maps are always mutated together so that they never disagree
//! about which ports are live.

use std::collections::HashMap;

use crate::bucket::BucketId;
use crate::name::PortName;
use crate::port::Port;

#[derive(Default)]
pub(crate) struct Indices {
    global: HashMap<PortName, Port>,
    buckets: HashMap<BucketId, HashMap<PortName, Port>>,
}

impl Indices {
    pub(crate) fn lookup(&self, name: PortName) -> Option<Port> {
        self.global.get(&name).cloned()
    }

    pub(crate) fn insert(&mut self, bucket: BucketId, port: Port) {
        let name = port.name();
        self.insert_alias(bucket, name, port);
    }

    /// Index `port` under `name` even if it differs from `port.name()`.
    /// Used by `transfer_right` to make the moved-from port's former
    /// identity resolve to the port it was transferred into.
    pub(crate) fn insert_alias(&mut self, bucket: BucketId, name: PortName, port: Port) {
        self.global.insert(name, port.clone());
        self.buckets.entry(bucket).or_default().insert(name, port);
    }

    pub(crate) fn remove(&mut self, bucket: BucketId, name: PortName) -> Option<Port> {
        let removed = self.global.remove(&name);
        if let Some(map) = self.buckets.get_mut(&bucket) {
            map.remove(&name);
        }
        removed
    }

    pub(crate) fn bucket_ports(&self, bucket: BucketId) -> Vec<Port> {
        self.buckets.get(&bucket).map(|m| m.values().cloned().collect()).unwrap_or_default()
    }

    pub(crate) fn bucket_count(&self, bucket: BucketId) -> usize {
        self.buckets.get(&bucket).map(|m| m.len()).unwrap_or(0)
    }

    pub(crate) fn all_ports(&self) -> impl Iterator<Item = &Port> {
        self.global.values()
    }
}
