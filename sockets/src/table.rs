// Resource table and handle-based socket context
//
// Callers outside the crate (a component host, a syscall layer) refer to
// sockets, streams, pollables and networks by 32-bit handles. A handle to
// a disposed resource must fail here, at the boundary, rather than reach
// the socket state machine.

use alloc::vec::Vec;
use core::fmt;

use crate::error::ErrorCode;
use crate::host::Host;
use crate::network::{IpAddressFamily, IpSocketAddress, Network};
use crate::poll::{self, Pollable};
use crate::streams::{InputStream, OutputStream};
use crate::tcp::{self, ShutdownType, TcpSocket};

// ---------------------------------------------------------------------------
// Resource Table: generic handle-based resource container
// ---------------------------------------------------------------------------

/// Type tag used to verify handle → resource type mapping at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceType {
    TcpSocket,
    InputStream,
    OutputStream,
    Pollable,
    Network,
}

/// Concrete storage for each resource kind.
pub enum ResourceData {
    TcpSocket(TcpSocket),
    InputStream(InputStream),
    OutputStream(OutputStream),
    Pollable(Pollable),
    Network(Network),
}

impl ResourceData {
    pub fn resource_type(&self) -> ResourceType {
        match self {
            ResourceData::TcpSocket(_) => ResourceType::TcpSocket,
            ResourceData::InputStream(_) => ResourceType::InputStream,
            ResourceData::OutputStream(_) => ResourceType::OutputStream,
            ResourceData::Pollable(_) => ResourceType::Pollable,
            ResourceData::Network(_) => ResourceType::Network,
        }
    }
}

impl fmt::Debug for ResourceData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceData::TcpSocket(s) => write!(f, "ResourceData::TcpSocket({:?})", s.state()),
            ResourceData::InputStream(_) => write!(f, "ResourceData::InputStream"),
            ResourceData::OutputStream(_) => write!(f, "ResourceData::OutputStream"),
            ResourceData::Pollable(p) => write!(f, "ResourceData::Pollable({:?})", p),
            ResourceData::Network(n) => write!(f, "ResourceData::Network({})", n.id()),
        }
    }
}

/// A handle that uniquely identifies a resource.
///
/// The handle encodes both an index (lower 24 bits) and a generation
/// (upper 8 bits) to detect use-after-free.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceHandle(u32);

impl ResourceHandle {
    const INDEX_MASK: u32 = 0x00FF_FFFF;
    const MAX_GENERATION: u32 = 0xFF;

    fn new(index: u32, generation: u32) -> Self {
        Self((generation & 0xFF) << 24 | (index & Self::INDEX_MASK))
    }

    fn index(self) -> usize {
        (self.0 & Self::INDEX_MASK) as usize
    }

    fn generation(self) -> u32 {
        (self.0 >> 24) & 0xFF
    }

    pub fn as_u32(self) -> u32 {
        self.0
    }

    pub fn from_u32(v: u32) -> Self {
        Self(v)
    }
}

/// Error type for resource table operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceError {
    /// The handle does not correspond to any live resource.
    InvalidHandle,
    /// The handle points to a resource of a different type.
    TypeMismatch {
        expected: ResourceType,
        actual: ResourceType,
    },
    /// All 2^24 slots are in use.
    TableFull,
}

impl fmt::Display for ResourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceError::InvalidHandle => f.write_str("invalid resource handle"),
            ResourceError::TypeMismatch { expected, actual } => {
                write!(f, "expected {:?} resource, found {:?}", expected, actual)
            }
            ResourceError::TableFull => f.write_str("resource table full"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for ResourceError {}

/// A slot keeps its generation after the resource is gone so that the
/// next occupant gets a different one.
struct Slot {
    generation: u32,
    data: Option<ResourceData>,
}

/// Generic, handle-based resource container.
///
/// O(1) allocation via a free list, O(1) lookup and O(1) removal.
#[derive(Default)]
pub struct ResourceTable {
    slots: Vec<Slot>,
    free_list: Vec<u32>,
}

impl ResourceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a resource and return its handle.
    pub fn push(&mut self, data: ResourceData) -> Result<ResourceHandle, ResourceError> {
        if let Some(index) = self.free_list.pop() {
            let slot = &mut self.slots[index as usize];
            slot.generation += 1;
            slot.data = Some(data);
            return Ok(ResourceHandle::new(index, slot.generation));
        }
        let index = self.slots.len() as u32;
        if index > ResourceHandle::INDEX_MASK {
            return Err(ResourceError::TableFull);
        }
        self.slots.push(Slot {
            generation: 0,
            data: Some(data),
        });
        Ok(ResourceHandle::new(index, 0))
    }

    fn slot(&self, handle: ResourceHandle) -> Result<&ResourceData, ResourceError> {
        self.slots
            .get(handle.index())
            .filter(|slot| slot.generation == handle.generation())
            .and_then(|slot| slot.data.as_ref())
            .ok_or(ResourceError::InvalidHandle)
    }

    fn slot_mut(&mut self, handle: ResourceHandle) -> Result<&mut ResourceData, ResourceError> {
        self.slots
            .get_mut(handle.index())
            .filter(|slot| slot.generation == handle.generation())
            .and_then(|slot| slot.data.as_mut())
            .ok_or(ResourceError::InvalidHandle)
    }

    /// Get a reference to the resource data, verifying the type.
    pub fn get(
        &self,
        handle: ResourceHandle,
        expected: ResourceType,
    ) -> Result<&ResourceData, ResourceError> {
        let data = self.slot(handle)?;
        check_type(data, expected)?;
        Ok(data)
    }

    /// Get a mutable reference to the resource data, verifying the type.
    pub fn get_mut(
        &mut self,
        handle: ResourceHandle,
        expected: ResourceType,
    ) -> Result<&mut ResourceData, ResourceError> {
        let data = self.slot_mut(handle)?;
        check_type(data, expected)?;
        Ok(data)
    }

    /// Remove a resource of any type and return its data.
    pub fn delete(&mut self, handle: ResourceHandle) -> Result<ResourceData, ResourceError> {
        self.slot(handle)?;
        let data = self.slots[handle.index()]
            .data
            .take()
            .ok_or(ResourceError::InvalidHandle)?;
        // A slot at the last generation is retired instead of wrapping.
        if handle.generation() < ResourceHandle::MAX_GENERATION {
            self.free_list.push(handle.index() as u32);
        }
        Ok(data)
    }

    /// Remove a resource after checking its type.
    pub fn delete_typed(
        &mut self,
        handle: ResourceHandle,
        expected: ResourceType,
    ) -> Result<ResourceData, ResourceError> {
        self.get(handle, expected)?;
        self.delete(handle)
    }

    /// Number of live resources.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.data.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn resource_type(&self, handle: ResourceHandle) -> Result<ResourceType, ResourceError> {
        self.slot(handle).map(ResourceData::resource_type)
    }
}

fn check_type(data: &ResourceData, expected: ResourceType) -> Result<(), ResourceError> {
    let actual = data.resource_type();
    if actual != expected {
        return Err(ResourceError::TypeMismatch { expected, actual });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// SocketsCtx
// ---------------------------------------------------------------------------

/// Failure of a handle-based socket call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallError {
    /// The handle itself was bad.
    Resource(ResourceError),
    /// The socket operation failed.
    Socket(ErrorCode),
}

impl From<ResourceError> for CallError {
    fn from(err: ResourceError) -> Self {
        CallError::Resource(err)
    }
}

impl From<ErrorCode> for CallError {
    fn from(code: ErrorCode) -> Self {
        CallError::Socket(code)
    }
}

impl fmt::Display for CallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallError::Resource(err) => write!(f, "{}", err),
            CallError::Socket(code) => write!(f, "{}", code),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for CallError {}

/// Socket operations addressed by handle.
pub struct SocketsCtx {
    host: Host,
    network: Network,
    table: ResourceTable,
}

macro_rules! expect_resource {
    ($data:expr, $variant:ident) => {
        match $data {
            ResourceData::$variant(inner) => inner,
            other => {
                return Err(ResourceError::TypeMismatch {
                    expected: ResourceType::$variant,
                    actual: other.resource_type(),
                }
                .into())
            }
        }
    };
}

impl SocketsCtx {
    pub fn new(host: Host) -> Self {
        Self {
            host,
            network: Network::new(),
            table: ResourceTable::new(),
        }
    }

    pub fn host(&self) -> &Host {
        &self.host
    }

    pub fn table(&self) -> &ResourceTable {
        &self.table
    }

    /// A handle to this context's network capability.
    pub fn instance_network(&mut self) -> Result<ResourceHandle, ResourceError> {
        self.table.push(ResourceData::Network(self.network))
    }

    pub fn create_tcp_socket(&mut self, family: IpAddressFamily) -> Result<ResourceHandle, CallError> {
        let socket = tcp::create_tcp_socket(&self.host, family)?;
        Ok(self.table.push(ResourceData::TcpSocket(socket))?)
    }

    fn network(&self, handle: ResourceHandle) -> Result<Network, CallError> {
        let data = self.table.get(handle, ResourceType::Network)?;
        Ok(*expect_resource!(data, Network))
    }

    /// Run `f` on the socket behind `handle`.
    pub fn with_tcp_socket<R>(
        &mut self,
        handle: ResourceHandle,
        f: impl FnOnce(&mut TcpSocket) -> R,
    ) -> Result<R, ResourceError> {
        let data = self.table.get_mut(handle, ResourceType::TcpSocket)?;
        Ok(f(expect_resource!(data, TcpSocket)))
    }

    fn socket_call<R>(
        &mut self,
        handle: ResourceHandle,
        f: impl FnOnce(&mut TcpSocket) -> Result<R, ErrorCode>,
    ) -> Result<R, CallError> {
        Ok(self.with_tcp_socket(handle, f)??)
    }

    pub fn with_input_stream<R>(
        &mut self,
        handle: ResourceHandle,
        f: impl FnOnce(&mut InputStream) -> R,
    ) -> Result<R, ResourceError> {
        let data = self.table.get_mut(handle, ResourceType::InputStream)?;
        Ok(f(expect_resource!(data, InputStream)))
    }

    pub fn with_output_stream<R>(
        &mut self,
        handle: ResourceHandle,
        f: impl FnOnce(&mut OutputStream) -> R,
    ) -> Result<R, ResourceError> {
        let data = self.table.get_mut(handle, ResourceType::OutputStream)?;
        Ok(f(expect_resource!(data, OutputStream)))
    }

    pub fn start_bind(
        &mut self,
        socket: ResourceHandle,
        network: ResourceHandle,
        local: IpSocketAddress,
    ) -> Result<(), CallError> {
        let network = self.network(network)?;
        self.socket_call(socket, |s| s.start_bind(&network, local))
    }

    pub fn finish_bind(&mut self, socket: ResourceHandle) -> Result<(), CallError> {
        self.socket_call(socket, TcpSocket::finish_bind)
    }

    pub fn start_connect(
        &mut self,
        socket: ResourceHandle,
        network: ResourceHandle,
        remote: IpSocketAddress,
    ) -> Result<(), CallError> {
        let network = self.network(network)?;
        self.socket_call(socket, |s| s.start_connect(&network, remote))
    }

    /// Returns `(input stream, output stream)` handles.
    pub fn finish_connect(
        &mut self,
        socket: ResourceHandle,
    ) -> Result<(ResourceHandle, ResourceHandle), CallError> {
        let (input, output) = self.socket_call(socket, TcpSocket::finish_connect)?;
        let input = self.table.push(ResourceData::InputStream(input))?;
        let output = self.table.push(ResourceData::OutputStream(output))?;
        Ok((input, output))
    }

    pub fn start_listen(&mut self, socket: ResourceHandle) -> Result<(), CallError> {
        self.socket_call(socket, TcpSocket::start_listen)
    }

    pub fn finish_listen(&mut self, socket: ResourceHandle) -> Result<(), CallError> {
        self.socket_call(socket, TcpSocket::finish_listen)
    }

    /// Returns `(socket, input stream, output stream)` handles.
    pub fn accept(
        &mut self,
        socket: ResourceHandle,
    ) -> Result<(ResourceHandle, ResourceHandle, ResourceHandle), CallError> {
        let (accepted, input, output) = self.socket_call(socket, TcpSocket::accept)?;
        let accepted = self.table.push(ResourceData::TcpSocket(accepted))?;
        let input = self.table.push(ResourceData::InputStream(input))?;
        let output = self.table.push(ResourceData::OutputStream(output))?;
        Ok((accepted, input, output))
    }

    pub fn shutdown(&mut self, socket: ResourceHandle, kind: ShutdownType) -> Result<(), CallError> {
        self.socket_call(socket, |s| s.shutdown(kind))
    }

    pub fn subscribe(&mut self, socket: ResourceHandle) -> Result<ResourceHandle, CallError> {
        let pollable = self.with_tcp_socket(socket, |s| s.subscribe())?;
        Ok(self.table.push(ResourceData::Pollable(pollable))?)
    }

    /// Indices of the ready pollables among `handles`.
    pub fn poll(&self, handles: &[ResourceHandle]) -> Result<Vec<u32>, ResourceError> {
        let mut pollables = Vec::with_capacity(handles.len());
        for &handle in handles {
            let data = self.table.get(handle, ResourceType::Pollable)?;
            pollables.push(expect_resource!(data, Pollable));
        }
        Ok(poll::poll_list(&pollables))
    }

    /// Dispose of a socket. The handle is dead afterwards.
    pub fn drop_tcp_socket(&mut self, socket: ResourceHandle) -> Result<(), ResourceError> {
        let data = self.table.delete_typed(socket, ResourceType::TcpSocket)?;
        if let ResourceData::TcpSocket(socket) = data {
            socket.dispose();
        }
        Ok(())
    }

    /// Drop a resource of any kind.
    pub fn drop_resource(&mut self, handle: ResourceHandle) -> Result<(), ResourceError> {
        match self.table.delete(handle)? {
            ResourceData::TcpSocket(socket) => socket.dispose(),
            other => log::trace!("[KPIO Sockets] dropped {:?}", other),
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
