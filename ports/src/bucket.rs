//! Port buckets: a polling set, a per-bucket index, and threadpool epoch
//! state shared by every port installed into it.

use std::sync::mpsc::Receiver;
use std::sync::Mutex;

use crate::kernel::{Message, PortSetId};
use crate::reclaim::Threadpool;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BucketId(pub(crate) u64);

/// A group of ports sharing a portset, an index, and a thread pool.
pub struct PortBucket {
    pub(crate) id: BucketId,
    pub(crate) portset: PortSetId,
    pub(crate) receiver: Mutex<Receiver<Message>>,
    pub(crate) threadpool: Threadpool,
}

impl PortBucket {
    pub fn id(&self) -> BucketId {
        self.id
    }

    pub fn portset(&self) -> PortSetId {
        self.portset
    }
}
