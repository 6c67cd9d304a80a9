//! Portable socket error codes and the host error mapper.
//!
//! Every failure a caller can observe is one of the [`ErrorCode`] kinds.
//! Host-specific codes (errno values from the OS backend) are translated
//! here and never leak past this module.

use core::fmt;

/// Closed set of socket error kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// The host does not support the operation (EOPNOTSUPP).
    NotSupported,
    /// The requested address family is unavailable on this host (EAFNOSUPPORT).
    AddressFamilyNotSupported,
    /// A system limit prevents creating another socket (EMFILE, ENFILE).
    NewSocketLimit,
    /// The address does not belong to the socket's family.
    AddressFamilyMismatch,
    /// The socket is already bound.
    AlreadyBound,
    /// The socket is already attached to a different network.
    AlreadyAttached,
    /// The socket is already in the Connected state (EISCONN).
    AlreadyConnected,
    /// The socket is already in the Listening state.
    AlreadyListening,
    /// The socket is not bound to any local address.
    NotBound,
    /// The socket is not in the Listening state.
    NotListening,
    /// The socket is not in the Connected state (ENOTCONN).
    NotConnected,
    /// No operation of the requested kind is in progress.
    NotInProgress,
    /// The operation cannot complete yet; retry later (EWOULDBLOCK, EAGAIN).
    WouldBlock,
    /// Another bind, connect or listen is already in progress (EALREADY).
    ConcurrencyConflict,
    /// No ephemeral ports are available.
    EphemeralPortsExhausted,
    /// The address is already in use (EADDRINUSE).
    AddressInUse,
    /// The address cannot be bound on this network (EADDRNOTAVAIL).
    AddressNotBindable,
    /// The remote address is a wildcard address or has port 0.
    InvalidRemoteAddress,
    /// The connection attempt timed out (ETIMEDOUT).
    Timeout,
    /// The connection was forcefully rejected (ECONNREFUSED).
    ConnectionRefused,
    /// The connection was reset (ECONNRESET).
    ConnectionReset,
    /// The remote address is not reachable (EHOSTUNREACH, ENETUNREACH, ...).
    RemoteUnreachable,
    /// The operation only applies to IPv6 sockets.
    Ipv6OnlyOperation,
}

impl ErrorCode {
    /// The kebab-case name used on the wire.
    pub const fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::NotSupported => "not-supported",
            ErrorCode::AddressFamilyNotSupported => "address-family-not-supported",
            ErrorCode::NewSocketLimit => "new-socket-limit",
            ErrorCode::AddressFamilyMismatch => "address-family-mismatch",
            ErrorCode::AlreadyBound => "already-bound",
            ErrorCode::AlreadyAttached => "already-attached",
            ErrorCode::AlreadyConnected => "already-connected",
            ErrorCode::AlreadyListening => "already-listening",
            ErrorCode::NotBound => "not-bound",
            ErrorCode::NotListening => "not-listening",
            ErrorCode::NotConnected => "not-connected",
            ErrorCode::NotInProgress => "not-in-progress",
            ErrorCode::WouldBlock => "would-block",
            ErrorCode::ConcurrencyConflict => "concurrency-conflict",
            ErrorCode::EphemeralPortsExhausted => "ephemeral-ports-exhausted",
            ErrorCode::AddressInUse => "address-in-use",
            ErrorCode::AddressNotBindable => "address-not-bindable",
            ErrorCode::InvalidRemoteAddress => "invalid-remote-address",
            ErrorCode::Timeout => "timeout",
            ErrorCode::ConnectionRefused => "connection-refused",
            ErrorCode::ConnectionReset => "connection-reset",
            ErrorCode::RemoteUnreachable => "remote-unreachable",
            ErrorCode::Ipv6OnlyOperation => "ipv6-only-operation",
        }
    }

    /// Whether the caller should retry the same `finish*` call later.
    pub fn is_would_block(&self) -> bool {
        matches!(self, ErrorCode::WouldBlock)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(feature = "std")]
impl std::error::Error for ErrorCode {}

// ---------------------------------------------------------------------------
// Error mapper (OS backend)
// ---------------------------------------------------------------------------

/// The host call an OS error came out of.
///
/// The same errno means different things depending on the call: EADDRINUSE
/// from an explicit bind is `address-in-use`, but from a bind to port 0 or
/// from the implicit bind inside `connect` it means the ephemeral range is
/// exhausted.
#[cfg(all(feature = "std", unix))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HostCall {
    Create,
    Bind { ephemeral: bool },
    Connect,
    Listen,
    Accept,
    SetOption,
}

#[cfg(all(feature = "std", unix))]
impl HostCall {
    /// Kind reported for errno values with no specific mapping.
    fn fallback(self) -> ErrorCode {
        match self {
            HostCall::Create | HostCall::SetOption | HostCall::Listen | HostCall::Accept => {
                ErrorCode::NotSupported
            }
            HostCall::Bind { .. } => ErrorCode::AddressNotBindable,
            HostCall::Connect => ErrorCode::ConnectionRefused,
        }
    }
}

/// Translate an OS error into the portable vocabulary.
#[cfg(all(feature = "std", unix))]
pub(crate) fn map_io_error(call: HostCall, err: &std::io::Error) -> ErrorCode {
    if let Some(code) = err.raw_os_error() {
        if let Some(mapped) = map_errno(call, code) {
            return mapped;
        }
    }
    if err.kind() == std::io::ErrorKind::WouldBlock {
        return ErrorCode::WouldBlock;
    }
    let fallback = call.fallback();
    log::warn!(
        "[KPIO Sockets] unmapped host error during {:?}: {} -> {}",
        call,
        err,
        fallback
    );
    fallback
}

#[cfg(all(feature = "std", unix))]
fn map_errno(call: HostCall, code: i32) -> Option<ErrorCode> {
    let mapped = match code {
        libc::EWOULDBLOCK | libc::EINPROGRESS | libc::EINTR => ErrorCode::WouldBlock,
        libc::EALREADY => ErrorCode::ConcurrencyConflict,
        libc::EOPNOTSUPP | libc::EPROTONOSUPPORT => ErrorCode::NotSupported,
        libc::EAFNOSUPPORT => match call {
            HostCall::Create => ErrorCode::AddressFamilyNotSupported,
            _ => ErrorCode::AddressFamilyMismatch,
        },
        libc::EMFILE | libc::ENFILE => ErrorCode::NewSocketLimit,
        libc::ENOBUFS | libc::ENOMEM => match call {
            HostCall::Create => ErrorCode::NewSocketLimit,
            HostCall::Bind { .. } | HostCall::Connect => ErrorCode::EphemeralPortsExhausted,
            _ => return None,
        },
        libc::EADDRINUSE => match call {
            HostCall::Bind { ephemeral: false } => ErrorCode::AddressInUse,
            _ => ErrorCode::EphemeralPortsExhausted,
        },
        libc::EADDRNOTAVAIL => match call {
            HostCall::Connect => ErrorCode::EphemeralPortsExhausted,
            _ => ErrorCode::AddressNotBindable,
        },
        libc::EISCONN => ErrorCode::AlreadyConnected,
        libc::ENOTCONN => ErrorCode::NotConnected,
        libc::EDESTADDRREQ => ErrorCode::NotBound,
        libc::ETIMEDOUT => ErrorCode::Timeout,
        libc::ECONNREFUSED => ErrorCode::ConnectionRefused,
        libc::ECONNRESET | libc::ECONNABORTED | libc::EPIPE => ErrorCode::ConnectionReset,
        libc::EHOSTUNREACH | libc::EHOSTDOWN | libc::ENETUNREACH | libc::ENETDOWN => {
            ErrorCode::RemoteUnreachable
        }
        _ => return None,
    };
    Some(mapped)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_code_names() {
        assert_eq!(ErrorCode::ConcurrencyConflict.as_str(), "concurrency-conflict");
        assert_eq!(ErrorCode::Ipv6OnlyOperation.as_str(), "ipv6-only-operation");
        assert_eq!(alloc::format!("{}", ErrorCode::NotInProgress), "not-in-progress");
    }

    #[test]
    fn would_block_predicate() {
        assert!(ErrorCode::WouldBlock.is_would_block());
        assert!(!ErrorCode::Timeout.is_would_block());
    }

    #[cfg(all(feature = "std", unix))]
    mod os {
        use super::super::*;
        use std::io;

        fn errno(code: i32) -> io::Error {
            io::Error::from_raw_os_error(code)
        }

        #[test]
        fn addr_in_use_depends_on_port() {
            let err = errno(libc::EADDRINUSE);
            assert_eq!(
                map_io_error(HostCall::Bind { ephemeral: false }, &err),
                ErrorCode::AddressInUse
            );
            assert_eq!(
                map_io_error(HostCall::Bind { ephemeral: true }, &err),
                ErrorCode::EphemeralPortsExhausted
            );
            assert_eq!(
                map_io_error(HostCall::Connect, &err),
                ErrorCode::EphemeralPortsExhausted
            );
        }

        #[test]
        fn connect_failures() {
            assert_eq!(
                map_io_error(HostCall::Connect, &errno(libc::ECONNREFUSED)),
                ErrorCode::ConnectionRefused
            );
            assert_eq!(
                map_io_error(HostCall::Connect, &errno(libc::ETIMEDOUT)),
                ErrorCode::Timeout
            );
            assert_eq!(
                map_io_error(HostCall::Connect, &errno(libc::ENETUNREACH)),
                ErrorCode::RemoteUnreachable
            );
            assert_eq!(
                map_io_error(HostCall::Connect, &errno(libc::EINPROGRESS)),
                ErrorCode::WouldBlock
            );
        }

        #[test]
        fn creation_limits() {
            assert_eq!(
                map_io_error(HostCall::Create, &errno(libc::EMFILE)),
                ErrorCode::NewSocketLimit
            );
            assert_eq!(
                map_io_error(HostCall::Create, &errno(libc::EAFNOSUPPORT)),
                ErrorCode::AddressFamilyNotSupported
            );
        }

        #[test]
        fn unknown_errno_uses_fallback() {
            let err = errno(libc::EBADF);
            assert_eq!(map_io_error(HostCall::Listen, &err), ErrorCode::NotSupported);
            assert_eq!(
                map_io_error(HostCall::Bind { ephemeral: false }, &err),
                ErrorCode::AddressNotBindable
            );
        }

        #[test]
        fn unknown_accept_error_is_not_would_block() {
            let err = errno(libc::EBADF);
            assert_eq!(map_io_error(HostCall::Accept, &err), ErrorCode::NotSupported);
            assert_eq!(
                map_io_error(HostCall::Accept, &errno(libc::EAGAIN)),
                ErrorCode::WouldBlock
            );
        }
    }
}
