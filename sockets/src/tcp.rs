// TCP sockets (wasi:sockets/tcp)
//
// Blocking operations are split into `start_*` and `finish_*`. The start
// half validates everything it can synchronously and records a pending
// operation; the finish half polls the host and either completes,
// reports `would-block` (pending operation kept), or fails.

use core::fmt;

use crate::error::ErrorCode;
use crate::host::{AcceptOutcome, Host, HostSocket, Interest};
use crate::network::{IpAddressFamily, IpSocketAddress, Network};
use crate::options::{self, check_settable, OptionValue, SocketOption, TcpOptions};
use crate::poll::Pollable;
use crate::streams::{InputStream, OutputStream, ShutdownFlags, StreamControl};

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Lifecycle state of a TCP socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TcpState {
    Unbound,
    Binding,
    Bound,
    Connecting,
    Connected,
    Listening,
    /// Terminal. Reached when a connect or listen fails.
    Closed,
}

/// The two-phase operation currently in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingOperation {
    Bind,
    Connect,
    Listen,
}

#[derive(Debug, Clone, Copy)]
enum Pending {
    Bind {
        local: IpSocketAddress,
    },
    Connect {
        remote: IpSocketAddress,
        /// A host failure at start time, reported by `finish_connect`.
        deferred: Option<ErrorCode>,
    },
    Listen,
}

impl Pending {
    fn operation(&self) -> PendingOperation {
        match self {
            Pending::Bind { .. } => PendingOperation::Bind,
            Pending::Connect { .. } => PendingOperation::Connect,
            Pending::Listen => PendingOperation::Listen,
        }
    }
}

/// Which direction(s) `shutdown` closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownType {
    Receive,
    Send,
    Both,
}

impl From<ShutdownType> for ShutdownFlags {
    fn from(kind: ShutdownType) -> Self {
        match kind {
            ShutdownType::Receive => ShutdownFlags::RECEIVE,
            ShutdownType::Send => ShutdownFlags::SEND,
            ShutdownType::Both => ShutdownFlags::all(),
        }
    }
}

/// A freshly established connection: the socket plus its stream pair.
pub type Connection = (TcpSocket, InputStream, OutputStream);

// ---------------------------------------------------------------------------
// TcpSocket
// ---------------------------------------------------------------------------

/// A non-blocking TCP socket.
pub struct TcpSocket {
    family: IpAddressFamily,
    state: TcpState,
    local_address: Option<IpSocketAddress>,
    remote_address: Option<IpSocketAddress>,
    network: Option<Network>,
    pending: Option<Pending>,
    options: TcpOptions,
    host: HostSocket,
    control: Option<StreamControl>,
}

/// Create a new socket in the `Unbound` state.
///
/// Fails with `not-supported`, `address-family-not-supported` or
/// `new-socket-limit` depending on what the host can provide.
pub fn create_tcp_socket(host: &Host, family: IpAddressFamily) -> Result<TcpSocket, ErrorCode> {
    let socket = host.create(family)?;
    log::debug!("[KPIO Sockets] create_tcp_socket({:?})", family);
    Ok(TcpSocket::from_host(socket, family))
}

impl TcpSocket {
    fn from_host(host: HostSocket, family: IpAddressFamily) -> Self {
        Self {
            family,
            state: TcpState::Unbound,
            local_address: None,
            remote_address: None,
            network: None,
            pending: None,
            options: host.initial_options(),
            host,
            control: None,
        }
    }

    pub fn state(&self) -> TcpState {
        self.state
    }

    pub fn address_family(&self) -> IpAddressFamily {
        self.family
    }

    pub fn pending_operation(&self) -> Option<PendingOperation> {
        self.pending.map(|p| p.operation())
    }

    pub fn is_listening(&self) -> bool {
        self.state == TcpState::Listening
    }

    pub fn network(&self) -> Option<Network> {
        self.network
    }

    pub fn local_address(&self) -> Result<IpSocketAddress, ErrorCode> {
        self.local_address.ok_or(ErrorCode::NotBound)
    }

    pub fn remote_address(&self) -> Result<IpSocketAddress, ErrorCode> {
        match self.state {
            TcpState::Connected => self.remote_address.ok_or(ErrorCode::NotConnected),
            _ => Err(ErrorCode::NotConnected),
        }
    }

    fn ensure_idle(&self) -> Result<(), ErrorCode> {
        match self.pending {
            Some(_) => Err(ErrorCode::ConcurrencyConflict),
            None => Ok(()),
        }
    }

    /// Family check shared by bind and connect. IPv4-mapped addresses are
    /// only usable on an IPv6 socket that accepts IPv4 traffic.
    fn check_family(&self, address: &IpSocketAddress) -> Result<(), ErrorCode> {
        if address.family() != self.family {
            return Err(ErrorCode::AddressFamilyMismatch);
        }
        if address.address.is_ipv4_mapped() && self.options.ipv6_only {
            return Err(ErrorCode::AddressFamilyMismatch);
        }
        Ok(())
    }

    fn check_network(&self, network: &Network) -> Result<(), ErrorCode> {
        match self.network {
            Some(attached) if attached != *network => Err(ErrorCode::AlreadyAttached),
            _ => Ok(()),
        }
    }

    // ----- Bind -----

    pub fn start_bind(&mut self, network: &Network, local: IpSocketAddress) -> Result<(), ErrorCode> {
        self.ensure_idle()?;
        if self.state != TcpState::Unbound {
            return Err(ErrorCode::AlreadyBound);
        }
        self.check_family(&local)?;
        self.check_network(network)?;

        self.network = Some(*network);
        self.host.begin_bind();
        self.pending = Some(Pending::Bind { local });
        self.state = TcpState::Binding;
        log::debug!("[KPIO Sockets] start_bind({})", local);
        Ok(())
    }

    pub fn finish_bind(&mut self) -> Result<(), ErrorCode> {
        let Some(Pending::Bind { local }) = self.pending else {
            return Err(ErrorCode::NotInProgress);
        };
        match self.host.bind(local) {
            Ok(bound) => {
                self.pending = None;
                self.local_address = Some(bound);
                self.state = TcpState::Bound;
                log::debug!("[KPIO Sockets] bound to {}", bound);
                Ok(())
            }
            Err(ErrorCode::WouldBlock) => Err(ErrorCode::WouldBlock),
            Err(code) => {
                self.pending = None;
                self.state = TcpState::Unbound;
                log::debug!("[KPIO Sockets] bind to {} failed: {}", local, code);
                Err(code)
            }
        }
    }

    // ----- Connect -----

    pub fn start_connect(&mut self, network: &Network, remote: IpSocketAddress) -> Result<(), ErrorCode> {
        self.ensure_idle()?;
        if !remote.is_valid_remote() {
            return Err(ErrorCode::InvalidRemoteAddress);
        }
        match self.state {
            TcpState::Connected => return Err(ErrorCode::AlreadyConnected),
            TcpState::Listening => return Err(ErrorCode::AlreadyListening),
            TcpState::Closed => return Err(ErrorCode::NotSupported),
            TcpState::Unbound | TcpState::Bound => {}
            TcpState::Binding | TcpState::Connecting => return Err(ErrorCode::ConcurrencyConflict),
        }
        self.check_family(&remote)?;
        self.check_network(network)?;

        self.network = Some(*network);
        let deferred = self.host.start_connect(remote).err();
        self.pending = Some(Pending::Connect { remote, deferred });
        self.state = TcpState::Connecting;
        log::debug!("[KPIO Sockets] start_connect({})", remote);
        Ok(())
    }

    pub fn finish_connect(&mut self) -> Result<(InputStream, OutputStream), ErrorCode> {
        let Some(Pending::Connect { remote, deferred }) = self.pending else {
            return Err(ErrorCode::NotInProgress);
        };
        let outcome = match deferred {
            Some(code) => Err(code),
            None => self.host.poll_connect(),
        };
        let (local, peer) = match outcome {
            Ok(addresses) => addresses,
            Err(ErrorCode::WouldBlock) => return Err(ErrorCode::WouldBlock),
            Err(code) => return Err(self.fail_connect(remote, code)),
        };

        let control = StreamControl::new();
        let streams = match self.host.streams(control.clone()) {
            Ok(streams) => streams,
            Err(code) => return Err(self.fail_connect(remote, code)),
        };
        self.pending = None;
        self.local_address = Some(local);
        self.remote_address = Some(peer);
        self.control = Some(control);
        self.state = TcpState::Connected;
        log::debug!("[KPIO Sockets] connected {} -> {}", local, peer);
        Ok(streams)
    }

    fn fail_connect(&mut self, remote: IpSocketAddress, code: ErrorCode) -> ErrorCode {
        self.pending = None;
        self.state = TcpState::Closed;
        log::debug!("[KPIO Sockets] connect to {} failed: {}", remote, code);
        code
    }

    // ----- Listen -----

    pub fn start_listen(&mut self) -> Result<(), ErrorCode> {
        self.ensure_idle()?;
        match self.state {
            TcpState::Bound => {}
            TcpState::Unbound | TcpState::Closed => return Err(ErrorCode::NotBound),
            TcpState::Connected => return Err(ErrorCode::AlreadyConnected),
            TcpState::Listening => return Err(ErrorCode::AlreadyListening),
            TcpState::Binding | TcpState::Connecting => return Err(ErrorCode::ConcurrencyConflict),
        }
        self.pending = Some(Pending::Listen);
        log::debug!("[KPIO Sockets] start_listen");
        Ok(())
    }

    pub fn finish_listen(&mut self) -> Result<(), ErrorCode> {
        let Some(Pending::Listen) = self.pending else {
            return Err(ErrorCode::NotInProgress);
        };
        match self.host.listen(self.options.listen_backlog_size) {
            Ok(()) => {
                self.pending = None;
                self.state = TcpState::Listening;
                log::debug!(
                    "[KPIO Sockets] listening (backlog {})",
                    self.options.listen_backlog_size
                );
                Ok(())
            }
            Err(ErrorCode::WouldBlock) => Err(ErrorCode::WouldBlock),
            Err(code) => {
                self.pending = None;
                self.state = TcpState::Closed;
                log::debug!("[KPIO Sockets] listen failed: {}", code);
                Err(code)
            }
        }
    }

    // ----- Accept / shutdown -----

    /// Take one inbound connection.
    ///
    /// Connections that died while queued are skipped; the caller only
    /// ever sees a connection, `would-block` or a hard error.
    pub fn accept(&mut self) -> Result<Connection, ErrorCode> {
        if self.state != TcpState::Listening {
            return Err(ErrorCode::NotListening);
        }
        let host = loop {
            match self.host.accept()? {
                AcceptOutcome::Accepted(host) => break host,
                AcceptOutcome::Empty => return Err(ErrorCode::WouldBlock),
                AcceptOutcome::Transient => {
                    log::trace!("[KPIO Sockets] skipping dead inbound connection");
                }
            }
        };

        let mut socket = TcpSocket::from_host(host, self.family);
        socket.options.ipv6_only = self.options.ipv6_only;
        socket.options.listen_backlog_size = self.options.listen_backlog_size;
        for (option, value) in self.options.inherited() {
            match socket.host.apply(option, value) {
                Ok(effective) => socket.options.store(option, effective),
                Err(code) => log::warn!(
                    "[KPIO Sockets] accepted socket did not take {:?}: {}",
                    option,
                    code
                ),
            }
        }

        let control = StreamControl::new();
        let (input, output) = socket.host.streams(control.clone())?;
        socket.local_address = Some(socket.host.local_address()?);
        socket.remote_address = Some(socket.host.remote_address()?);
        socket.network = self.network;
        socket.control = Some(control);
        socket.state = TcpState::Connected;
        log::debug!(
            "[KPIO Sockets] accepted {:?} on {:?}",
            socket.remote_address,
            self.local_address
        );
        Ok((socket, input, output))
    }

    pub fn shutdown(&mut self, kind: ShutdownType) -> Result<(), ErrorCode> {
        if self.state != TcpState::Connected {
            return Err(ErrorCode::NotConnected);
        }
        let flags = ShutdownFlags::from(kind);
        if let Some(control) = &self.control {
            control.shut(flags);
        }
        self.host.shutdown(flags);
        log::debug!("[KPIO Sockets] shutdown({:?})", kind);
        Ok(())
    }

    /// Readiness of the pending connect or of the accept queue.
    pub fn subscribe(&self) -> Pollable {
        match (self.state, self.pending) {
            (TcpState::Connecting, Some(Pending::Connect { deferred: None, .. })) => {
                self.host.subscribe(Interest::Connect)
            }
            (TcpState::Listening, _) => self.host.subscribe(Interest::Accept),
            _ => Pollable::immediate(),
        }
    }

    /// Release the socket. A pending operation is abandoned.
    pub fn dispose(self) {
        log::debug!(
            "[KPIO Sockets] dispose {:?} socket ({:?})",
            self.state,
            self.pending_operation()
        );
    }

    // ----- Options -----

    fn set_option(&mut self, option: SocketOption, value: OptionValue) -> Result<(), ErrorCode> {
        check_settable(option, self.family, self.state, self.pending.is_some())?;
        let effective = self.host.apply(option, value)?;
        self.options.store(option, effective);
        Ok(())
    }

    pub fn options(&self) -> &TcpOptions {
        &self.options
    }

    pub fn ipv6_only(&self) -> Result<bool, ErrorCode> {
        match self.family {
            IpAddressFamily::Ipv6 => Ok(self.options.ipv6_only),
            IpAddressFamily::Ipv4 => Err(ErrorCode::Ipv6OnlyOperation),
        }
    }

    pub fn set_ipv6_only(&mut self, value: bool) -> Result<(), ErrorCode> {
        self.set_option(SocketOption::Ipv6Only, OptionValue::Bool(value))
    }

    pub fn listen_backlog_size(&self) -> u32 {
        self.options.listen_backlog_size
    }

    /// Clamped into `1..=i32::MAX`. While listening the host is asked to
    /// resize its queue too.
    pub fn set_listen_backlog_size(&mut self, value: u64) -> Result<(), ErrorCode> {
        let value = options::clamp_backlog(value);
        self.set_option(SocketOption::ListenBacklogSize, OptionValue::U32(value))
    }

    pub fn keep_alive(&self) -> bool {
        self.options.keep_alive
    }

    pub fn set_keep_alive(&mut self, value: bool) -> Result<(), ErrorCode> {
        self.set_option(SocketOption::KeepAlive, OptionValue::Bool(value))
    }

    pub fn no_delay(&self) -> bool {
        self.options.no_delay
    }

    pub fn set_no_delay(&mut self, value: bool) -> Result<(), ErrorCode> {
        self.set_option(SocketOption::NoDelay, OptionValue::Bool(value))
    }

    pub fn unicast_hop_limit(&self) -> u8 {
        self.options.unicast_hop_limit
    }

    /// A hop limit of zero is raised to one.
    pub fn set_unicast_hop_limit(&mut self, value: u8) -> Result<(), ErrorCode> {
        let value = value.max(1) as u32;
        self.set_option(SocketOption::UnicastHopLimit, OptionValue::U32(value))
    }

    pub fn receive_buffer_size(&self) -> u64 {
        self.options.receive_buffer_size
    }

    pub fn set_receive_buffer_size(&mut self, value: u64) -> Result<(), ErrorCode> {
        self.set_option(SocketOption::ReceiveBufferSize, OptionValue::U64(value))
    }

    pub fn send_buffer_size(&self) -> u64 {
        self.options.send_buffer_size
    }

    pub fn set_send_buffer_size(&mut self, value: u64) -> Result<(), ErrorCode> {
        self.set_option(SocketOption::SendBufferSize, OptionValue::U64(value))
    }
}

impl fmt::Debug for TcpSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpSocket")
            .field("family", &self.family)
            .field("state", &self.state)
            .field("local_address", &self.local_address)
            .field("remote_address", &self.remote_address)
            .field("pending", &self.pending_operation())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
