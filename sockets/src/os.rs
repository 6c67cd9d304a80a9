//! Operating-system host backend.
//!
//! Every socket is a non-blocking `socket2::Socket`. Nothing here waits:
//! connect completion and accept readiness are observed with `poll(2)`
//! and a zero timeout, except when a caller explicitly blocks on a
//! [`Pollable`](crate::poll::Pollable).

use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use std::io::{self, Read};
use std::net::{Shutdown, SocketAddr};
use std::os::fd::AsRawFd;

use socket2::{Domain, Protocol, SockAddr, Socket, Type};

use crate::config::DEFAULT_BUFFER_SIZE;
use crate::error::{map_io_error, ErrorCode, HostCall};
use crate::host::AcceptOutcome;
use crate::network::{IpAddress, IpAddressFamily, IpSocketAddress};
use crate::options::{OptionValue, SocketOption, TcpOptions};
use crate::streams::{
    InputSource, InputStream, OutputSink, OutputStream, ShutdownFlags, StreamControl, StreamError,
};

/// Largest chunk handed out by a single stream read.
const MAX_READ: usize = 64 * 1024;

#[cfg(any(target_os = "linux", target_os = "android"))]
const SEND_FLAGS: libc::c_int = libc::MSG_NOSIGNAL;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const SEND_FLAGS: libc::c_int = 0;

/// Factory for OS-backed sockets.
#[derive(Debug, Clone, Default)]
pub struct OsHost {
    _private: (),
}

impl OsHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn create(&self, family: IpAddressFamily) -> Result<OsSocket, ErrorCode> {
        let domain = match family {
            IpAddressFamily::Ipv4 => Domain::IPV4,
            IpAddressFamily::Ipv6 => Domain::IPV6,
        };
        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))
            .map_err(|err| map_io_error(HostCall::Create, &err))?;
        socket
            .set_nonblocking(true)
            .map_err(|err| map_io_error(HostCall::Create, &err))?;
        log::debug!(
            "[KPIO Sockets] os socket fd={} ({:?})",
            socket.as_raw_fd(),
            family
        );
        Ok(OsSocket::new(socket, family))
    }
}

pub(crate) struct OsSocket {
    socket: Arc<Socket>,
    family: IpAddressFamily,
    listening: bool,
    connected: bool,
}

fn to_sock_addr(addr: IpSocketAddress) -> SockAddr {
    SockAddr::from(SocketAddr::from(addr))
}

fn from_sock_addr(addr: &SockAddr) -> Option<IpSocketAddress> {
    addr.as_socket().map(IpSocketAddress::from)
}

/// A wildcard bind is reported as the family's loopback address.
fn concrete(family: IpAddressFamily, bound: IpSocketAddress) -> IpSocketAddress {
    if !bound.address.is_unspecified() {
        return bound;
    }
    let address = match family {
        IpAddressFamily::Ipv4 => IpAddress::localhost_v4(),
        IpAddressFamily::Ipv6 => IpAddress::localhost_v6(),
    };
    IpSocketAddress::new(address, bound.port)
}

fn is_in_progress(err: &io::Error) -> bool {
    err.raw_os_error() == Some(libc::EINPROGRESS) || err.kind() == io::ErrorKind::WouldBlock
}

/// Errors after which `accept` should simply be tried again.
fn is_transient_accept_error(err: &io::Error) -> bool {
    let Some(code) = err.raw_os_error() else {
        return false;
    };
    #[cfg(any(target_os = "linux", target_os = "android"))]
    if code == libc::ENONET {
        return true;
    }
    matches!(
        code,
        libc::ECONNABORTED
            | libc::EINTR
            | libc::EPROTO
            | libc::ECONNRESET
            | libc::ENETDOWN
            | libc::ENETUNREACH
            | libc::EHOSTDOWN
            | libc::EHOSTUNREACH
            | libc::ENOPROTOOPT
            | libc::EOPNOTSUPP
    )
}

impl OsSocket {
    fn new(socket: Socket, family: IpAddressFamily) -> Self {
        Self {
            socket: Arc::new(socket),
            family,
            listening: false,
            connected: false,
        }
    }

    pub(crate) fn shared(&self) -> Arc<Socket> {
        self.socket.clone()
    }

    pub(crate) fn initial_options(&self) -> TcpOptions {
        let ipv6_only = match self.family {
            IpAddressFamily::Ipv6 => self.socket.only_v6().unwrap_or(false),
            IpAddressFamily::Ipv4 => false,
        };
        let receive = self
            .socket
            .recv_buffer_size()
            .map(|n| n as u64)
            .unwrap_or(DEFAULT_BUFFER_SIZE);
        let mut options = TcpOptions::new(ipv6_only, receive);
        options.send_buffer_size = self
            .socket
            .send_buffer_size()
            .map(|n| n as u64)
            .unwrap_or(DEFAULT_BUFFER_SIZE);
        options.unicast_hop_limit = match self.family {
            IpAddressFamily::Ipv4 => self.socket.ttl().ok(),
            IpAddressFamily::Ipv6 => self.socket.unicast_hops_v6().ok(),
        }
        .map_or(options.unicast_hop_limit, |hops| hops.clamp(1, 255) as u8);
        options
    }

    pub(crate) fn bind(&mut self, local: IpSocketAddress) -> Result<IpSocketAddress, ErrorCode> {
        let call = HostCall::Bind {
            ephemeral: local.port == 0,
        };
        if let Err(err) = self.socket.set_reuse_address(local.port > 0) {
            log::debug!("[KPIO Sockets] SO_REUSEADDR not applied: {}", err);
        }
        self.socket
            .bind(&to_sock_addr(local))
            .map_err(|err| map_io_error(call, &err))?;
        self.local_address().map(|bound| concrete(self.family, bound))
    }

    pub(crate) fn start_connect(&mut self, remote: IpSocketAddress) -> Result<(), ErrorCode> {
        match self.socket.connect(&to_sock_addr(remote)) {
            Ok(()) => Ok(()),
            Err(err) if is_in_progress(&err) => Ok(()),
            Err(err) => Err(map_io_error(HostCall::Connect, &err)),
        }
    }

    pub(crate) fn poll_connect(&mut self) -> Result<(IpSocketAddress, IpSocketAddress), ErrorCode> {
        if !poll_fd(&self.socket, libc::POLLOUT, 0) {
            return Err(ErrorCode::WouldBlock);
        }
        if let Some(err) = self
            .socket
            .take_error()
            .map_err(|err| map_io_error(HostCall::Connect, &err))?
        {
            return Err(map_io_error(HostCall::Connect, &err));
        }
        let remote = match self.socket.peer_addr() {
            Ok(addr) => from_sock_addr(&addr).ok_or(ErrorCode::NotConnected)?,
            Err(err) if err.raw_os_error() == Some(libc::ENOTCONN) => {
                return Err(ErrorCode::WouldBlock)
            }
            Err(err) => return Err(map_io_error(HostCall::Connect, &err)),
        };
        self.connected = true;
        Ok((self.local_address()?, remote))
    }

    pub(crate) fn listen(&mut self, backlog: u32) -> Result<(), ErrorCode> {
        self.socket
            .listen(backlog.min(i32::MAX as u32) as i32)
            .map_err(|err| map_io_error(HostCall::Listen, &err))?;
        self.listening = true;
        Ok(())
    }

    pub(crate) fn accept(&mut self) -> Result<AcceptOutcome<OsSocket>, ErrorCode> {
        match self.socket.accept() {
            Ok((socket, peer)) => {
                socket
                    .set_nonblocking(true)
                    .map_err(|err| map_io_error(HostCall::Accept, &err))?;
                log::debug!(
                    "[KPIO Sockets] os accept fd={} from {:?}",
                    socket.as_raw_fd(),
                    peer.as_socket()
                );
                let mut accepted = OsSocket::new(socket, self.family);
                accepted.connected = true;
                Ok(AcceptOutcome::Accepted(accepted))
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(AcceptOutcome::Empty),
            Err(err) if is_transient_accept_error(&err) => {
                log::trace!("[KPIO Sockets] transient accept failure: {}", err);
                Ok(AcceptOutcome::Transient)
            }
            Err(err) => Err(map_io_error(HostCall::Accept, &err)),
        }
    }

    pub(crate) fn local_address(&self) -> Result<IpSocketAddress, ErrorCode> {
        let addr = self
            .socket
            .local_addr()
            .map_err(|err| map_io_error(HostCall::Bind { ephemeral: false }, &err))?;
        from_sock_addr(&addr).ok_or(ErrorCode::NotBound)
    }

    pub(crate) fn remote_address(&self) -> Result<IpSocketAddress, ErrorCode> {
        let addr = self.socket.peer_addr().map_err(|_| ErrorCode::NotConnected)?;
        from_sock_addr(&addr).ok_or(ErrorCode::NotConnected)
    }

    pub(crate) fn streams(&self, control: StreamControl) -> Result<(InputStream, OutputStream), ErrorCode> {
        Ok((
            InputStream::new(control.clone(), InputSource::Os(self.socket.clone())),
            OutputStream::new(
                control,
                OutputSink::Os {
                    socket: self.socket.clone(),
                    pending: Vec::new(),
                },
            ),
        ))
    }

    pub(crate) fn shutdown(&self, flags: ShutdownFlags) {
        let how = if flags == ShutdownFlags::all() {
            Shutdown::Both
        } else if flags.contains(ShutdownFlags::RECEIVE) {
            Shutdown::Read
        } else {
            Shutdown::Write
        };
        if let Err(err) = self.socket.shutdown(how) {
            log::debug!("[KPIO Sockets] shutdown({:?}) failed: {}", how, err);
        }
    }

    pub(crate) fn apply(&mut self, option: SocketOption, value: OptionValue) -> Result<OptionValue, ErrorCode> {
        let map = |err: io::Error| map_io_error(HostCall::SetOption, &err);
        let socket = &self.socket;
        let effective = match (option, value) {
            (SocketOption::Ipv6Only, OptionValue::Bool(v)) => {
                socket.set_only_v6(v).map_err(map)?;
                OptionValue::Bool(socket.only_v6().map_err(map)?)
            }
            (SocketOption::ListenBacklogSize, OptionValue::U32(v)) => {
                if self.listening {
                    // Not every platform accepts a second listen(2).
                    if let Err(err) = socket.listen(v.min(i32::MAX as u32) as i32) {
                        log::debug!("[KPIO Sockets] backlog update ignored: {}", err);
                    }
                }
                value
            }
            (SocketOption::KeepAlive, OptionValue::Bool(v)) => {
                socket.set_keepalive(v).map_err(map)?;
                OptionValue::Bool(socket.keepalive().map_err(map)?)
            }
            (SocketOption::NoDelay, OptionValue::Bool(v)) => {
                socket.set_nodelay(v).map_err(map)?;
                OptionValue::Bool(socket.nodelay().map_err(map)?)
            }
            (SocketOption::UnicastHopLimit, OptionValue::U32(v)) => match self.family {
                IpAddressFamily::Ipv4 => {
                    socket.set_ttl(v).map_err(map)?;
                    OptionValue::U32(socket.ttl().map_err(map)?)
                }
                IpAddressFamily::Ipv6 => {
                    socket.set_unicast_hops_v6(v).map_err(map)?;
                    OptionValue::U32(socket.unicast_hops_v6().map_err(map)?)
                }
            },
            (SocketOption::ReceiveBufferSize, OptionValue::U64(v)) => {
                socket.set_recv_buffer_size(v.min(i32::MAX as u64) as usize).map_err(map)?;
                OptionValue::U64(socket.recv_buffer_size().map_err(map)? as u64)
            }
            (SocketOption::SendBufferSize, OptionValue::U64(v)) => {
                socket.set_send_buffer_size(v.min(i32::MAX as u64) as usize).map_err(map)?;
                OptionValue::U64(socket.send_buffer_size().map_err(map)? as u64)
            }
            _ => return Err(ErrorCode::NotSupported),
        };
        Ok(effective)
    }
}

impl Drop for OsSocket {
    fn drop(&mut self) {
        // Streams may still hold the descriptor; make the peer see the close.
        if self.connected {
            let _ = self.socket.shutdown(Shutdown::Both);
        }
        log::trace!("[KPIO Sockets] os socket fd={} released", self.socket.as_raw_fd());
    }
}

// ---------------------------------------------------------------------------
// Stream I/O helpers
// ---------------------------------------------------------------------------

pub(crate) fn read(socket: &Socket, len: usize) -> Result<Vec<u8>, StreamError> {
    if len == 0 {
        return Ok(Vec::new());
    }
    let mut buf = vec![0u8; len.min(MAX_READ)];
    let mut reader = socket;
    loop {
        return match reader.read(&mut buf) {
            Ok(0) => Err(StreamError::Closed),
            Ok(n) => {
                buf.truncate(n);
                Ok(buf)
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(Vec::new()),
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => Err(StreamError::LastOperationFailed(err.to_string())),
        };
    }
}

/// Push as much of `pending` to the socket as it takes without blocking.
pub(crate) fn drain(socket: &Socket, pending: &mut Vec<u8>) -> Result<(), StreamError> {
    while !pending.is_empty() {
        match socket.send_with_flags(pending, SEND_FLAGS) {
            Ok(0) => {
                return Err(StreamError::LastOperationFailed(String::from(
                    "socket accepted no data",
                )))
            }
            Ok(n) => {
                pending.drain(..n);
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(StreamError::LastOperationFailed(err.to_string())),
        }
    }
    Ok(())
}

/// `poll(2)` one socket. A negative `timeout_ms` waits indefinitely.
///
/// Error and hang-up conditions count as ready so the caller goes on to
/// observe them through the regular call.
pub(crate) fn poll_fd(socket: &Socket, events: libc::c_short, timeout_ms: libc::c_int) -> bool {
    let mut fd = libc::pollfd {
        fd: socket.as_raw_fd(),
        events,
        revents: 0,
    };
    loop {
        // SAFETY: `fd` is a single valid pollfd that outlives the call.
        let n = unsafe { libc::poll(&mut fd, 1, timeout_ms) };
        if n >= 0 {
            return n > 0 && fd.revents & (events | libc::POLLERR | libc::POLLHUP) != 0;
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            log::warn!("[KPIO Sockets] poll failed: {}", err);
            return true;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
