//! Host backends.
//!
//! A [`Host`] produces the low-level sockets a [`TcpSocket`](crate::tcp::TcpSocket)
//! drives. Backends are dispatched through enums rather than trait
//! objects, the same way the stream and pollable resources are.

use crate::config::LoopbackConfig;
use crate::error::ErrorCode;
use crate::loopback::{LoopbackNetwork, LoopbackSocket};
use crate::network::{IpAddressFamily, IpSocketAddress};
use crate::options::{OptionValue, SocketOption, TcpOptions};
use crate::poll::{Pollable, PollableState};
use crate::streams::{InputStream, OutputStream, ShutdownFlags, StreamControl};

#[cfg(all(feature = "std", unix))]
use crate::os::{OsHost, OsSocket};

/// Result of asking a listening host socket for a connection.
pub(crate) enum AcceptOutcome<S> {
    Accepted(S),
    /// Nothing queued.
    Empty,
    /// A queued connection died before it could be taken; try again.
    Transient,
}

/// What a pollable on a socket waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Interest {
    Connect,
    Accept,
}

/// A network stack sockets can be created on.
#[derive(Clone)]
pub enum Host {
    /// Deterministic in-memory network.
    Loopback(LoopbackNetwork),
    /// The operating system's network stack.
    #[cfg(all(feature = "std", unix))]
    Os(OsHost),
}

impl Host {
    /// A fresh, private loopback network.
    pub fn loopback(config: LoopbackConfig) -> Self {
        Host::Loopback(LoopbackNetwork::new(config))
    }

    #[cfg(all(feature = "std", unix))]
    pub fn os() -> Self {
        Host::Os(OsHost::new())
    }

    /// The loopback network behind this host, if any.
    pub fn as_loopback(&self) -> Option<&LoopbackNetwork> {
        match self {
            Host::Loopback(net) => Some(net),
            #[cfg(all(feature = "std", unix))]
            Host::Os(_) => None,
        }
    }

    pub(crate) fn create(&self, family: IpAddressFamily) -> Result<HostSocket, ErrorCode> {
        match self {
            Host::Loopback(net) => net.create(family).map(HostSocket::Loopback),
            #[cfg(all(feature = "std", unix))]
            Host::Os(os) => os.create(family).map(HostSocket::Os),
        }
    }
}

impl From<LoopbackNetwork> for Host {
    fn from(net: LoopbackNetwork) -> Self {
        Host::Loopback(net)
    }
}

// ---------------------------------------------------------------------------
// HostSocket dispatch
// ---------------------------------------------------------------------------

pub(crate) enum HostSocket {
    Loopback(LoopbackSocket),
    #[cfg(all(feature = "std", unix))]
    Os(OsSocket),
}

macro_rules! dispatch {
    ($self:expr, $socket:ident => $body:expr) => {
        match $self {
            HostSocket::Loopback($socket) => $body,
            #[cfg(all(feature = "std", unix))]
            HostSocket::Os($socket) => $body,
        }
    };
}

impl HostSocket {
    pub(crate) fn initial_options(&self) -> TcpOptions {
        dispatch!(self, s => s.initial_options())
    }

    pub(crate) fn begin_bind(&mut self) {
        match self {
            HostSocket::Loopback(s) => s.begin_bind(),
            #[cfg(all(feature = "std", unix))]
            HostSocket::Os(_) => {}
        }
    }

    pub(crate) fn bind(&mut self, local: IpSocketAddress) -> Result<IpSocketAddress, ErrorCode> {
        dispatch!(self, s => s.bind(local))
    }

    pub(crate) fn start_connect(&mut self, remote: IpSocketAddress) -> Result<(), ErrorCode> {
        dispatch!(self, s => s.start_connect(remote))
    }

    /// `(local, remote)` once the connection is established.
    pub(crate) fn poll_connect(&mut self) -> Result<(IpSocketAddress, IpSocketAddress), ErrorCode> {
        dispatch!(self, s => s.poll_connect())
    }

    pub(crate) fn listen(&mut self, backlog: u32) -> Result<(), ErrorCode> {
        dispatch!(self, s => s.listen(backlog))
    }

    pub(crate) fn accept(&mut self) -> Result<AcceptOutcome<HostSocket>, ErrorCode> {
        let outcome = match self {
            HostSocket::Loopback(s) => match s.accept()? {
                AcceptOutcome::Accepted(socket) => AcceptOutcome::Accepted(HostSocket::Loopback(socket)),
                AcceptOutcome::Empty => AcceptOutcome::Empty,
                AcceptOutcome::Transient => AcceptOutcome::Transient,
            },
            #[cfg(all(feature = "std", unix))]
            HostSocket::Os(s) => match s.accept()? {
                AcceptOutcome::Accepted(socket) => AcceptOutcome::Accepted(HostSocket::Os(socket)),
                AcceptOutcome::Empty => AcceptOutcome::Empty,
                AcceptOutcome::Transient => AcceptOutcome::Transient,
            },
        };
        Ok(outcome)
    }

    pub(crate) fn local_address(&self) -> Result<IpSocketAddress, ErrorCode> {
        dispatch!(self, s => s.local_address())
    }

    pub(crate) fn remote_address(&self) -> Result<IpSocketAddress, ErrorCode> {
        dispatch!(self, s => s.remote_address())
    }

    pub(crate) fn streams(&self, control: StreamControl) -> Result<(InputStream, OutputStream), ErrorCode> {
        dispatch!(self, s => s.streams(control))
    }

    pub(crate) fn shutdown(&self, flags: ShutdownFlags) {
        dispatch!(self, s => s.shutdown(flags))
    }

    /// Apply an option on the host and return the effective value.
    pub(crate) fn apply(&mut self, option: SocketOption, value: OptionValue) -> Result<OptionValue, ErrorCode> {
        dispatch!(self, s => s.apply(option, value))
    }

    pub(crate) fn subscribe(&self, interest: Interest) -> Pollable {
        let state = match self {
            HostSocket::Loopback(s) => match interest {
                Interest::Connect => PollableState::LoopbackTick {
                    net: s.network().clone(),
                    ready_at: s.ready_at(),
                },
                Interest::Accept => PollableState::LoopbackListener {
                    net: s.network().clone(),
                    id: s.id(),
                },
            },
            #[cfg(all(feature = "std", unix))]
            HostSocket::Os(s) => PollableState::Os {
                socket: s.shared(),
                events: match interest {
                    Interest::Connect => libc::POLLOUT,
                    Interest::Accept => libc::POLLIN,
                },
            },
        };
        Pollable::new(state)
    }
}
