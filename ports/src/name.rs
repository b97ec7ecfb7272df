//! Port names: the numeric identity a capability has within the indices.

use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_PORT_NAME: AtomicU64 = AtomicU64::new(1);

/// The name under which a port is keyed in the global and bucket indices.
/// Distinct from the kernel's own [`KernelRight`](crate::kernel::KernelRight):
/// the name survives `reallocate_port`/`transfer_right`, the underlying
/// kernel right does not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PortName(u64);

impl PortName {
    pub(crate) fn fresh() -> Self {
        PortName(NEXT_PORT_NAME.fetch_add(1, Ordering::Relaxed))
    }

    pub fn id(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for PortName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "port#{}", self.0)
    }
}
