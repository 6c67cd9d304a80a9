//! Deterministic in-memory host network.
//!
//! All sockets created from one [`LoopbackNetwork`] share a port space,
//! a routing table of listeners and a simulated clock. Connections are a
//! pair of bounded pipes. Nothing here blocks: latency is expressed in
//! ticks and `finish*` calls report `would-block` until the clock has
//! advanced far enough.

use alloc::collections::{BTreeMap, VecDeque};
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use spin::Mutex;

use crate::config::LoopbackConfig;
use crate::error::ErrorCode;
use crate::host::AcceptOutcome;
use crate::network::{IpAddress, IpAddressFamily, IpSocketAddress};
use crate::options::{OptionValue, SocketOption, TcpOptions};
use crate::streams::{
    InputSource, InputStream, OutputSink, OutputStream, ShutdownFlags, StreamControl, StreamError,
};

// ---------------------------------------------------------------------------
// Pipes
// ---------------------------------------------------------------------------

pub(crate) type SharedPipe = Arc<Mutex<Pipe>>;

/// One direction of a loopback connection.
#[derive(Debug)]
pub(crate) struct Pipe {
    buffer: VecDeque<u8>,
    capacity: usize,
    writer_closed: bool,
    reader_closed: bool,
    reset: bool,
}

impl Pipe {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            buffer: VecDeque::new(),
            capacity,
            writer_closed: false,
            reader_closed: false,
            reset: false,
        }
    }

    fn shared(capacity: usize) -> SharedPipe {
        Arc::new(Mutex::new(Self::new(capacity)))
    }

    fn reset_error() -> StreamError {
        StreamError::LastOperationFailed(String::from("connection reset"))
    }

    pub(crate) fn read(&mut self, len: usize) -> Result<Vec<u8>, StreamError> {
        if self.reset {
            return Err(Self::reset_error());
        }
        if self.buffer.is_empty() {
            return if self.writer_closed {
                Err(StreamError::Closed)
            } else {
                Ok(Vec::new())
            };
        }
        let n = len.min(self.buffer.len());
        Ok(self.buffer.drain(..n).collect())
    }

    pub(crate) fn skip(&mut self, len: usize) -> Result<u64, StreamError> {
        self.read(len).map(|data| data.len() as u64)
    }

    pub(crate) fn is_readable(&self) -> bool {
        self.reset || self.writer_closed || !self.buffer.is_empty()
    }

    pub(crate) fn space(&self) -> Result<usize, StreamError> {
        if self.reset {
            return Err(Self::reset_error());
        }
        if self.reader_closed {
            return Err(StreamError::LastOperationFailed(String::from("broken pipe")));
        }
        Ok(self.capacity.saturating_sub(self.buffer.len()))
    }

    pub(crate) fn write(&mut self, bytes: &[u8]) -> Result<(), StreamError> {
        if bytes.len() > self.space()? {
            return Err(StreamError::LastOperationFailed(String::from(
                "write exceeds permitted budget",
            )));
        }
        self.buffer.extend(bytes.iter().copied());
        Ok(())
    }

    fn close_writer(&mut self) {
        self.writer_closed = true;
    }

    /// Unread data is discarded; the peer's writes fail from now on.
    fn close_reader(&mut self) {
        self.reader_closed = true;
        self.buffer.clear();
    }

    fn reset(&mut self) {
        self.reset = true;
        self.buffer.clear();
    }

    fn is_reset(&self) -> bool {
        self.reset
    }
}

/// Both directions of a connection, seen from one endpoint.
#[derive(Debug, Clone)]
struct Connection {
    inbound: SharedPipe,
    outbound: SharedPipe,
}

impl Connection {
    /// Returns `(client side, server side)`.
    fn pair(client_receive: usize, server_receive: usize) -> (Connection, Connection) {
        let to_client = Pipe::shared(client_receive);
        let to_server = Pipe::shared(server_receive);
        let client = Connection {
            inbound: to_client.clone(),
            outbound: to_server.clone(),
        };
        let server = Connection {
            inbound: to_server,
            outbound: to_client,
        };
        (client, server)
    }

    fn reset(&self) {
        self.inbound.lock().reset();
        self.outbound.lock().reset();
    }

    fn is_reset(&self) -> bool {
        self.inbound.lock().is_reset()
    }

    fn close(&self) {
        self.outbound.lock().close_writer();
        self.inbound.lock().close_reader();
    }
}

// ---------------------------------------------------------------------------
// Shared network state
// ---------------------------------------------------------------------------

type SocketId = u64;

/// A connection waiting in a listener's accept queue.
struct Incoming {
    client: IpSocketAddress,
    /// The address the client dialed.
    target: IpSocketAddress,
    server: Connection,
    ready_at: u64,
}

struct Listener {
    family: IpAddressFamily,
    backlog: u32,
    receive_buffer: u64,
    queue: VecDeque<Incoming>,
}

struct LoopbackState {
    config: LoopbackConfig,
    tick: u64,
    open_sockets: u32,
    next_socket_id: SocketId,
    /// Offset into the ephemeral range where the next search starts.
    next_ephemeral: u32,
    /// Claimed local addresses. An unspecified address claims the port on
    /// every interface of its family.
    ports: BTreeMap<IpSocketAddress, SocketId>,
    /// Listening addresses, same keys as `ports`.
    routes: BTreeMap<IpSocketAddress, SocketId>,
    listeners: BTreeMap<SocketId, Listener>,
}

impl LoopbackState {
    fn allocate_socket(&mut self) -> Result<SocketId, ErrorCode> {
        if self.open_sockets >= self.config.max_sockets {
            return Err(ErrorCode::NewSocketLimit);
        }
        self.open_sockets += 1;
        let id = self.next_socket_id;
        self.next_socket_id += 1;
        Ok(id)
    }

    fn release_socket(&mut self) {
        self.open_sockets = self.open_sockets.saturating_sub(1);
    }

    /// Whether `address:port` overlaps an existing claim.
    fn is_taken(&self, address: IpAddress, port: u16) -> bool {
        self.ports.keys().any(|claim| {
            claim.port == port
                && claim.address.family() == address.family()
                && (claim.address == address
                    || claim.address.is_unspecified()
                    || address.is_unspecified())
        })
    }

    fn ephemeral_port(&mut self, claims: &[IpAddress]) -> Result<u16, ErrorCode> {
        let count = self.config.ephemeral_port_count();
        for step in 0..count {
            let offset = (self.next_ephemeral + step) % count;
            let port = self.config.ephemeral_port_start as u32 + offset;
            let port = port as u16;
            if !claims.iter().any(|address| self.is_taken(*address, port)) {
                self.next_ephemeral = (offset + 1) % count;
                return Ok(port);
            }
        }
        Err(ErrorCode::EphemeralPortsExhausted)
    }

    /// The listener `target` reaches: an exact route first, then one
    /// listening on the unspecified address of the family.
    fn route_to(&self, target: IpSocketAddress) -> Option<SocketId> {
        let wildcard = IpSocketAddress::new(IpAddress::unspecified(target.family()), target.port);
        self.routes
            .get(&target)
            .or_else(|| self.routes.get(&wildcard))
            .copied()
    }

    fn release_ports(&mut self, id: SocketId) {
        self.ports.retain(|_, owner| *owner != id);
        self.routes.retain(|_, owner| *owner != id);
    }

    fn is_listener_ready(&self, id: SocketId) -> bool {
        match self.listeners.get(&id) {
            Some(listener) => listener.queue.front().is_some_and(|incoming| {
                incoming.ready_at <= self.tick || incoming.server.is_reset()
            }),
            None => true,
        }
    }
}

/// Shared handle to an in-memory network. Clones refer to the same network.
#[derive(Clone)]
pub struct LoopbackNetwork {
    inner: Arc<Mutex<LoopbackState>>,
}

impl LoopbackNetwork {
    pub fn new(config: LoopbackConfig) -> Self {
        log::debug!(
            "[KPIO Sockets] loopback network with {} interfaces, ephemeral ports {}..={}",
            config.interfaces.len(),
            config.ephemeral_port_start,
            config.ephemeral_port_end
        );
        Self {
            inner: Arc::new(Mutex::new(LoopbackState {
                config,
                tick: 0,
                open_sockets: 0,
                next_socket_id: 1,
                next_ephemeral: 0,
                ports: BTreeMap::new(),
                routes: BTreeMap::new(),
                listeners: BTreeMap::new(),
            })),
        }
    }

    /// Advance the simulated clock by one tick.
    pub fn tick(&self) -> u64 {
        self.advance(1)
    }

    /// Advance the simulated clock by `ticks`.
    pub fn advance(&self, ticks: u64) -> u64 {
        let mut state = self.inner.lock();
        state.tick = state.tick.saturating_add(ticks);
        state.tick
    }

    pub fn now(&self) -> u64 {
        self.inner.lock().tick
    }

    pub(crate) fn advance_to(&self, tick: u64) {
        let mut state = self.inner.lock();
        if state.tick < tick {
            state.tick = tick;
        }
    }

    /// Number of sockets currently open on this network.
    pub fn open_sockets(&self) -> u32 {
        self.inner.lock().open_sockets
    }

    pub fn config(&self) -> LoopbackConfig {
        self.inner.lock().config.clone()
    }

    pub(crate) fn is_listener_ready(&self, id: SocketId) -> bool {
        self.inner.lock().is_listener_ready(id)
    }

    /// Earliest tick at which the listener's queue head can be accepted.
    pub(crate) fn listener_wakeup(&self, id: SocketId) -> Option<u64> {
        let state = self.inner.lock();
        state
            .listeners
            .get(&id)
            .and_then(|listener| listener.queue.front())
            .map(|incoming| incoming.ready_at)
    }

    pub(crate) fn create(&self, family: IpAddressFamily) -> Result<LoopbackSocket, ErrorCode> {
        let mut state = self.inner.lock();
        if !state.config.tcp {
            return Err(ErrorCode::NotSupported);
        }
        if family == IpAddressFamily::Ipv6 && !state.config.ipv6 {
            return Err(ErrorCode::AddressFamilyNotSupported);
        }
        let id = state.allocate_socket()?;
        let ipv6_only = family == IpAddressFamily::Ipv6 && !state.config.dual_stack;
        let buffer = state.config.round_buffer_size(state.config.default_buffer_size);
        drop(state);
        Ok(LoopbackSocket::new(self.clone(), id, family, ipv6_only, buffer))
    }
}

// ---------------------------------------------------------------------------
// Sockets
// ---------------------------------------------------------------------------

enum ConnectAttempt {
    Failed(ErrorCode),
    InFlight {
        remote: IpSocketAddress,
        client: Connection,
    },
}

/// A socket living on a [`LoopbackNetwork`].
pub(crate) struct LoopbackSocket {
    net: LoopbackNetwork,
    id: SocketId,
    family: IpAddressFamily,
    ipv6_only: bool,
    receive_buffer: u64,
    local: Option<IpSocketAddress>,
    remote: Option<IpSocketAddress>,
    ready_at: u64,
    attempt: Option<ConnectAttempt>,
    connection: Option<Connection>,
    listening: bool,
}

/// IPv4-mapped IPv6 addresses are routed as the IPv4 address they carry.
fn route_address(address: IpSocketAddress) -> IpSocketAddress {
    match address.address {
        IpAddress::Ipv6(segments) if address.address.is_ipv4_mapped() => {
            let [hi, lo] = [segments[6], segments[7]];
            IpSocketAddress::new(
                IpAddress::Ipv4((hi >> 8) as u8, hi as u8, (lo >> 8) as u8, lo as u8),
                address.port,
            )
        }
        _ => address,
    }
}

/// Present an IPv4 peer to an IPv6 socket as `::ffff:a.b.c.d`.
fn present_to(family: IpAddressFamily, address: IpSocketAddress) -> IpSocketAddress {
    match (family, address.address) {
        (IpAddressFamily::Ipv6, IpAddress::Ipv4(a, b, c, d)) => IpSocketAddress::new(
            IpAddress::Ipv6([
                0,
                0,
                0,
                0,
                0,
                0xffff,
                u16::from_be_bytes([a, b]),
                u16::from_be_bytes([c, d]),
            ]),
            address.port,
        ),
        _ => address,
    }
}

impl LoopbackSocket {
    fn new(
        net: LoopbackNetwork,
        id: SocketId,
        family: IpAddressFamily,
        ipv6_only: bool,
        receive_buffer: u64,
    ) -> Self {
        Self {
            net,
            id,
            family,
            ipv6_only,
            receive_buffer,
            local: None,
            remote: None,
            ready_at: 0,
            attempt: None,
            connection: None,
            listening: false,
        }
    }

    pub(crate) fn initial_options(&self) -> TcpOptions {
        TcpOptions::new(self.ipv6_only, self.receive_buffer)
    }

    pub(crate) fn network(&self) -> &LoopbackNetwork {
        &self.net
    }

    pub(crate) fn id(&self) -> SocketId {
        self.id
    }

    pub(crate) fn ready_at(&self) -> u64 {
        self.ready_at
    }

    /// Start the clock for a bind.
    pub(crate) fn begin_bind(&mut self) {
        let state = self.net.inner.lock();
        self.ready_at = state.tick + state.config.bind_latency_ticks as u64;
    }

    /// Claim a local address. Returns the concrete address reported to
    /// the caller; the claim itself may be a wildcard.
    fn reserve(
        &self,
        state: &mut LoopbackState,
        requested: IpSocketAddress,
    ) -> Result<IpSocketAddress, ErrorCode> {
        let routed = route_address(requested);
        if routed.family() != self.family && (self.ipv6_only || !state.config.dual_stack) {
            return Err(ErrorCode::AddressNotBindable);
        }
        let (claims, address) = if routed.address.is_unspecified() {
            let address = state
                .config
                .interface_for(routed.family())
                .ok_or(ErrorCode::AddressNotBindable)?;
            let mut claims = vec![routed.address];
            if routed.family() == IpAddressFamily::Ipv6 && !self.ipv6_only && state.config.dual_stack {
                claims.push(IpAddress::unspecified(IpAddressFamily::Ipv4));
            }
            (claims, address)
        } else if state.config.is_local(&routed.address) {
            (vec![routed.address], routed.address)
        } else {
            return Err(ErrorCode::AddressNotBindable);
        };

        let port = if routed.port == 0 {
            state.ephemeral_port(&claims)?
        } else if claims.iter().any(|claim| state.is_taken(*claim, routed.port)) {
            return Err(ErrorCode::AddressInUse);
        } else {
            routed.port
        };
        for claim in claims {
            state.ports.insert(IpSocketAddress::new(claim, port), self.id);
        }
        Ok(present_to(self.family, IpSocketAddress::new(address, port)))
    }

    pub(crate) fn bind(&mut self, requested: IpSocketAddress) -> Result<IpSocketAddress, ErrorCode> {
        let net = self.net.clone();
        let mut state = net.inner.lock();
        if state.tick < self.ready_at {
            return Err(ErrorCode::WouldBlock);
        }
        let local = self.reserve(&mut state, requested)?;
        log::debug!("[KPIO Sockets] loopback socket {} bound to {}", self.id, local);
        self.local = Some(local);
        Ok(local)
    }

    /// Initiate a connection. Routing happens now; the outcome is
    /// reported by [`poll_connect`](Self::poll_connect) once the connect
    /// latency has elapsed.
    pub(crate) fn start_connect(&mut self, remote: IpSocketAddress) -> Result<(), ErrorCode> {
        let net = self.net.clone();
        let mut state = net.inner.lock();
        self.ready_at = state.tick + state.config.connect_latency_ticks as u64;
        let target = route_address(remote);

        let local = match self.local {
            Some(local) => local,
            None => {
                let any = IpSocketAddress::unspecified(target.family());
                let local = self.reserve(&mut state, any)?;
                self.local = Some(local);
                local
            }
        };

        let outcome = Self::route(&mut state, local, target, self.receive_buffer, self.ready_at);
        self.attempt = Some(match outcome {
            Ok(client) => ConnectAttempt::InFlight { remote, client },
            Err(code) => {
                log::debug!(
                    "[KPIO Sockets] loopback connect {} -> {} fails with {}",
                    local,
                    remote,
                    code
                );
                ConnectAttempt::Failed(code)
            }
        });
        Ok(())
    }

    fn route(
        state: &mut LoopbackState,
        local: IpSocketAddress,
        target: IpSocketAddress,
        receive_buffer: u64,
        ready_at: u64,
    ) -> Result<Connection, ErrorCode> {
        if state.config.filtered.contains(&target.address) {
            return Err(ErrorCode::Timeout);
        }
        if !state.config.is_local(&target.address)
            || route_address(local).family() != target.family()
        {
            return Err(ErrorCode::RemoteUnreachable);
        }
        let listener_id = state.route_to(target).ok_or(ErrorCode::ConnectionRefused)?;
        let listener = state
            .listeners
            .get_mut(&listener_id)
            .ok_or(ErrorCode::ConnectionRefused)?;
        if listener.queue.len() >= listener.backlog as usize {
            return Err(ErrorCode::ConnectionRefused);
        }
        let (client, server) = Connection::pair(receive_buffer as usize, listener.receive_buffer as usize);
        listener.queue.push_back(Incoming {
            client: route_address(local),
            target,
            server,
            ready_at,
        });
        Ok(client)
    }

    pub(crate) fn poll_connect(&mut self) -> Result<(IpSocketAddress, IpSocketAddress), ErrorCode> {
        if self.net.now() < self.ready_at {
            return Err(ErrorCode::WouldBlock);
        }
        match self.attempt.take() {
            Some(ConnectAttempt::InFlight { remote, client }) => {
                if client.is_reset() {
                    return Err(ErrorCode::ConnectionReset);
                }
                let local = self.local.ok_or(ErrorCode::NotBound)?;
                self.remote = Some(remote);
                self.connection = Some(client);
                Ok((local, remote))
            }
            Some(ConnectAttempt::Failed(code)) => Err(code),
            None => Err(ErrorCode::NotInProgress),
        }
    }

    pub(crate) fn listen(&mut self, backlog: u32) -> Result<(), ErrorCode> {
        let local = self.local.ok_or(ErrorCode::NotBound)?;
        let mut state = self.net.inner.lock();
        let claims: Vec<IpSocketAddress> = state
            .ports
            .iter()
            .filter(|(_, owner)| **owner == self.id)
            .map(|(claim, _)| *claim)
            .collect();
        for claim in claims {
            state.routes.insert(claim, self.id);
        }
        state.listeners.insert(
            self.id,
            Listener {
                family: self.family,
                backlog,
                receive_buffer: self.receive_buffer,
                queue: VecDeque::new(),
            },
        );
        self.listening = true;
        log::debug!(
            "[KPIO Sockets] loopback socket {} listening on {} (backlog {})",
            self.id,
            local,
            backlog
        );
        Ok(())
    }

    pub(crate) fn accept(&mut self) -> Result<AcceptOutcome<LoopbackSocket>, ErrorCode> {
        let mut state = self.net.inner.lock();
        let tick = state.tick;
        let listener = state
            .listeners
            .get_mut(&self.id)
            .ok_or(ErrorCode::NotListening)?;
        let head = listener
            .queue
            .front()
            .map(|incoming| (incoming.server.is_reset(), incoming.ready_at <= tick));
        match head {
            Some((true, _)) => {
                listener.queue.pop_front();
                return Ok(AcceptOutcome::Transient);
            }
            Some((false, true)) => {}
            _ => return Ok(AcceptOutcome::Empty),
        }
        let Some(incoming) = listener.queue.pop_front() else {
            return Ok(AcceptOutcome::Empty);
        };
        let local = present_to(listener.family, incoming.target);

        let id = match state.allocate_socket() {
            Ok(id) => id,
            Err(code) => {
                if let Some(listener) = state.listeners.get_mut(&self.id) {
                    listener.queue.push_front(incoming);
                }
                return Err(code);
            }
        };
        drop(state);

        let mut socket = LoopbackSocket::new(
            self.net.clone(),
            id,
            self.family,
            self.ipv6_only,
            self.receive_buffer,
        );
        socket.local = Some(local);
        socket.remote = Some(present_to(self.family, incoming.client));
        socket.connection = Some(incoming.server);
        log::debug!(
            "[KPIO Sockets] loopback socket {} accepted {:?} as socket {}",
            self.id,
            socket.remote,
            id
        );
        Ok(AcceptOutcome::Accepted(socket))
    }

    pub(crate) fn local_address(&self) -> Result<IpSocketAddress, ErrorCode> {
        self.local.ok_or(ErrorCode::NotBound)
    }

    pub(crate) fn remote_address(&self) -> Result<IpSocketAddress, ErrorCode> {
        self.remote.ok_or(ErrorCode::NotConnected)
    }

    pub(crate) fn streams(&self, control: StreamControl) -> Result<(InputStream, OutputStream), ErrorCode> {
        let connection = self.connection.as_ref().ok_or(ErrorCode::NotConnected)?;
        Ok((
            InputStream::new(control.clone(), InputSource::Loopback(connection.inbound.clone())),
            OutputStream::new(control, OutputSink::Loopback(connection.outbound.clone())),
        ))
    }

    pub(crate) fn shutdown(&self, flags: ShutdownFlags) {
        if let Some(connection) = &self.connection {
            if flags.contains(ShutdownFlags::RECEIVE) {
                connection.inbound.lock().close_reader();
            }
            if flags.contains(ShutdownFlags::SEND) {
                connection.outbound.lock().close_writer();
            }
        }
    }

    pub(crate) fn apply(&mut self, option: SocketOption, value: OptionValue) -> Result<OptionValue, ErrorCode> {
        let mut state = self.net.inner.lock();
        let effective = match (option, value) {
            (SocketOption::Ipv6Only, OptionValue::Bool(v)) => {
                if !v && !state.config.dual_stack {
                    return Err(ErrorCode::NotSupported);
                }
                self.ipv6_only = v;
                value
            }
            (SocketOption::ListenBacklogSize, OptionValue::U32(v)) => {
                if let Some(listener) = state.listeners.get_mut(&self.id) {
                    listener.backlog = v;
                }
                value
            }
            (SocketOption::UnicastHopLimit, OptionValue::U32(v)) => OptionValue::U32(v.clamp(1, 255)),
            (SocketOption::ReceiveBufferSize, OptionValue::U64(v)) => {
                let rounded = state.config.round_buffer_size(v);
                self.receive_buffer = rounded;
                OptionValue::U64(rounded)
            }
            (SocketOption::SendBufferSize, OptionValue::U64(v)) => {
                OptionValue::U64(state.config.round_buffer_size(v))
            }
            (SocketOption::KeepAlive | SocketOption::NoDelay, OptionValue::Bool(_)) => value,
            _ => return Err(ErrorCode::NotSupported),
        };
        Ok(effective)
    }
}

impl Drop for LoopbackSocket {
    fn drop(&mut self) {
        let mut state = self.net.inner.lock();
        state.release_ports(self.id);
        if let Some(listener) = state.listeners.remove(&self.id) {
            for incoming in listener.queue {
                incoming.server.reset();
            }
        }
        state.release_socket();
        drop(state);

        if let Some(ConnectAttempt::InFlight { client, .. }) = self.attempt.take() {
            client.reset();
        }
        if let Some(connection) = self.connection.take() {
            connection.close();
        }
        log::trace!("[KPIO Sockets] loopback socket {} released", self.id);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
