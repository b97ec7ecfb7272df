//! Networking-translator collaborator: socket and address port classes on
//! top of [`ports`].
//!
//! Scoped per the external-interfaces section to exactly what the port
//! runtime sees of pfinet: one global lock serializing socket-table
//! mutation, a socket port class, an address port class, and a
//! reauthenticate operation that rebuilds a port's identity while keeping
//! its underlying socket. The IPv4/IPv6/routing/device stack itself is
//! explicitly out of scope; [`SocketHandle`] is an opaque stand-in for
//! whatever a real stack would hang off it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use ports::{Port, PortBucket, PortClass, Result, Runtime};

/// Opaque identity of an underlying socket; a real implementation would
/// be a handle into the protocol stack's own connection table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SocketHandle(u64);

static NEXT_SOCKET: AtomicU64 = AtomicU64::new(1);

impl SocketHandle {
    fn fresh() -> Self {
        SocketHandle(NEXT_SOCKET.fetch_add(1, Ordering::Relaxed))
    }
}

/// User state attached to a socket port.
pub struct SocketState {
    pub handle: SocketHandle,
}

/// User state attached to an address port (the result of binding or
/// accepting, carrying a socket-independent peer/local address).
pub struct AddressState {
    pub bytes: Vec<u8>,
}

/// The collaborator's process-wide state: one lock serializing the socket
/// table, matching pfinet's single big lock around the whole networking
/// stack rather than per-socket locking.
pub struct Pfinet {
    pub runtime: Arc<Runtime>,
    pub bucket: Arc<PortBucket>,
    pub socket_class: Arc<PortClass>,
    pub address_class: Arc<PortClass>,
    sockets: Mutex<HashMap<SocketHandle, Port>>,
}

impl Pfinet {
    pub fn new(runtime: Arc<Runtime>, bucket: Arc<PortBucket>) -> Pfinet {
        let socket_class = Arc::new(runtime.create_class().build());
        let address_class = Arc::new(runtime.create_class().build());
        Pfinet { runtime, bucket, socket_class, address_class, sockets: Mutex::new(HashMap::new()) }
    }

    /// Create a fresh socket port, under the single global lock.
    pub fn socket(&self) -> Result<Port> {
        let handle = SocketHandle::fresh();
        let port = self.runtime.create_port(&self.socket_class, &self.bucket, SocketState { handle })?;
        self.sockets.lock().unwrap().insert(handle, port.clone());
        log::debug!("opened socket {handle:?}");
        Ok(port)
    }

    pub fn bind(&self, socket: &Port, address: Vec<u8>) -> Result<Port> {
        debug_assert_eq!(socket.class().id(), self.socket_class.id());
        self.runtime.create_port(&self.address_class, &self.bucket, AddressState { bytes: address })
    }

    /// Mirrors `S_io_reauthenticate`: rebuild a port with the same
    /// underlying socket but a fresh identity, the way pfinet hands a
    /// client a new protid after a credentials change without touching
    /// the connection itself.
    pub fn reauthenticate(&self, socket: &Port) -> Result<Port> {
        let handle = socket.downcast_ref::<SocketState>().handle;
        let fresh = self.runtime.create_port(&self.socket_class, &self.bucket, SocketState { handle })?;
        {
            let mut sockets = self.sockets.lock().unwrap();
            sockets.insert(handle, fresh.clone());
        }
        self.runtime.destroy_right(socket);
        log::debug!("reauthenticated socket {handle:?} onto a fresh identity");
        Ok(fresh)
    }

    pub fn socket_count(&self) -> usize {
        self.sockets.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> Pfinet {
        let _ = env_logger::builder().is_test(true).try_init();
        let kernel = Arc::new(ports::SimKernel::new());
        let runtime = Runtime::new(kernel.clone());
        let (portset, rx) = kernel.create_portset();
        let bucket = runtime.create_bucket_with(portset, rx);
        Pfinet::new(runtime, bucket)
    }

    #[test]
    fn socket_and_bind_produce_distinct_ports() {
        let pfinet = setup();
        let socket = pfinet.socket().unwrap();
        let addr = pfinet.bind(&socket, vec![127, 0, 0, 1]).unwrap();
        assert_ne!(socket, addr);
        assert_eq!(addr.downcast_ref::<AddressState>().bytes, vec![127, 0, 0, 1]);
    }

    #[test]
    fn reauthenticate_preserves_socket_handle_but_not_identity() {
        let pfinet = setup();
        let socket = pfinet.socket().unwrap();
        let handle = socket.downcast_ref::<SocketState>().handle;
        let fresh = pfinet.reauthenticate(&socket).unwrap();
        assert_ne!(socket, fresh);
        assert_eq!(fresh.downcast_ref::<SocketState>().handle, handle);
        assert_eq!(pfinet.socket_count(), 1);
    }
}
