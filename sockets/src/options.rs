//! TCP socket options.
//!
//! Which setter is legal in which lifecycle state is kept as data in
//! [`OPTION_RULES`] rather than spread across the setters, so the whole
//! matrix can be read (and tested) in one place.

use bitflags::bitflags;

use crate::error::ErrorCode;
use crate::network::IpAddressFamily;
use crate::tcp::TcpState;

/// Listen queue size used until `set_listen_backlog_size` is called.
pub const DEFAULT_TCP_BACKLOG: u32 = 128;
/// Smallest backlog accepted; smaller values are clamped up.
pub const MIN_TCP_BACKLOG: u32 = 1;
/// Largest backlog accepted; hosts will most likely limit it further.
pub const MAX_TCP_BACKLOG: u32 = i32::MAX as u32;
/// Initial unicast hop limit (IP_TTL / IPV6_UNICAST_HOPS).
pub const DEFAULT_HOP_LIMIT: u8 = 64;

bitflags! {
    /// A set of lifecycle states.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct StateSet: u8 {
        const UNBOUND = 1 << 0;
        const BINDING = 1 << 1;
        const BOUND = 1 << 2;
        const CONNECTING = 1 << 3;
        const CONNECTED = 1 << 4;
        const LISTENING = 1 << 5;
        const CLOSED = 1 << 6;
    }
}

impl StateSet {
    pub const fn of(state: TcpState) -> Self {
        match state {
            TcpState::Unbound => StateSet::UNBOUND,
            TcpState::Binding => StateSet::BINDING,
            TcpState::Bound => StateSet::BOUND,
            TcpState::Connecting => StateSet::CONNECTING,
            TcpState::Connected => StateSet::CONNECTED,
            TcpState::Listening => StateSet::LISTENING,
            TcpState::Closed => StateSet::CLOSED,
        }
    }
}

/// Socket tunables with a setter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketOption {
    /// IPV6_V6ONLY.
    Ipv6Only,
    ListenBacklogSize,
    /// SO_KEEPALIVE.
    KeepAlive,
    /// TCP_NODELAY.
    NoDelay,
    /// IP_TTL / IPV6_UNICAST_HOPS.
    UnicastHopLimit,
    /// SO_RCVBUF.
    ReceiveBufferSize,
    /// SO_SNDBUF.
    SendBufferSize,
}

/// Setter legality for one option.
#[derive(Debug, Clone, Copy)]
pub struct OptionRule {
    pub option: SocketOption,
    /// States in which the setter may be called.
    pub settable_in: StateSet,
    /// Only meaningful on IPv6 sockets.
    pub ipv6_only: bool,
}

const ANY_STATE: StateSet = StateSet::all().difference(StateSet::CLOSED);
const NOT_ESTABLISHED: StateSet = StateSet::UNBOUND
    .union(StateSet::BINDING)
    .union(StateSet::BOUND)
    .union(StateSet::CONNECTING);

pub const OPTION_RULES: [OptionRule; 7] = [
    OptionRule {
        option: SocketOption::Ipv6Only,
        settable_in: StateSet::UNBOUND,
        ipv6_only: true,
    },
    OptionRule {
        option: SocketOption::ListenBacklogSize,
        settable_in: ANY_STATE,
        ipv6_only: false,
    },
    OptionRule {
        option: SocketOption::KeepAlive,
        settable_in: ANY_STATE,
        ipv6_only: false,
    },
    OptionRule {
        option: SocketOption::NoDelay,
        settable_in: ANY_STATE,
        ipv6_only: false,
    },
    OptionRule {
        option: SocketOption::UnicastHopLimit,
        settable_in: NOT_ESTABLISHED,
        ipv6_only: false,
    },
    OptionRule {
        option: SocketOption::ReceiveBufferSize,
        settable_in: NOT_ESTABLISHED,
        ipv6_only: false,
    },
    OptionRule {
        option: SocketOption::SendBufferSize,
        settable_in: NOT_ESTABLISHED,
        ipv6_only: false,
    },
];

pub fn rule(option: SocketOption) -> &'static OptionRule {
    // Every option has exactly one row.
    let mut i = 0;
    while OPTION_RULES[i].option as u8 != option as u8 {
        i += 1;
    }
    &OPTION_RULES[i]
}

/// Check whether `option` may be set right now.
pub fn check_settable(
    option: SocketOption,
    family: IpAddressFamily,
    state: TcpState,
    pending: bool,
) -> Result<(), ErrorCode> {
    let rule = rule(option);
    if rule.ipv6_only && family != IpAddressFamily::Ipv6 {
        return Err(ErrorCode::Ipv6OnlyOperation);
    }
    if pending {
        return Err(ErrorCode::ConcurrencyConflict);
    }
    if rule.settable_in.contains(StateSet::of(state)) {
        return Ok(());
    }
    Err(match state {
        TcpState::Connected => ErrorCode::AlreadyConnected,
        TcpState::Listening => ErrorCode::AlreadyListening,
        TcpState::Closed => ErrorCode::NotSupported,
        TcpState::Unbound | TcpState::Binding | TcpState::Bound | TcpState::Connecting => {
            ErrorCode::AlreadyBound
        }
    })
}

/// A value handed to the host when an option is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionValue {
    Bool(bool),
    U32(u32),
    U64(u64),
}

/// Snapshot of a socket's current tunables.
///
/// Values are the ones the host reported back after applying them, which
/// for buffer sizes may differ from what the caller asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpOptions {
    pub ipv6_only: bool,
    pub listen_backlog_size: u32,
    pub keep_alive: bool,
    pub no_delay: bool,
    pub unicast_hop_limit: u8,
    pub receive_buffer_size: u64,
    pub send_buffer_size: u64,
}

impl TcpOptions {
    pub fn new(ipv6_only: bool, buffer_size: u64) -> Self {
        Self {
            ipv6_only,
            listen_backlog_size: DEFAULT_TCP_BACKLOG,
            keep_alive: false,
            no_delay: false,
            unicast_hop_limit: DEFAULT_HOP_LIMIT,
            receive_buffer_size: buffer_size,
            send_buffer_size: buffer_size,
        }
    }

    /// Record an effective value reported by the host.
    pub fn store(&mut self, option: SocketOption, value: OptionValue) {
        match (option, value) {
            (SocketOption::Ipv6Only, OptionValue::Bool(v)) => self.ipv6_only = v,
            (SocketOption::KeepAlive, OptionValue::Bool(v)) => self.keep_alive = v,
            (SocketOption::NoDelay, OptionValue::Bool(v)) => self.no_delay = v,
            (SocketOption::ListenBacklogSize, OptionValue::U32(v)) => {
                self.listen_backlog_size = v
            }
            (SocketOption::UnicastHopLimit, OptionValue::U32(v)) => {
                self.unicast_hop_limit = v.min(u8::MAX as u32) as u8
            }
            (SocketOption::ReceiveBufferSize, OptionValue::U64(v)) => {
                self.receive_buffer_size = v
            }
            (SocketOption::SendBufferSize, OptionValue::U64(v)) => self.send_buffer_size = v,
            (option, value) => {
                log::warn!(
                    "[KPIO Sockets] ignoring {:?} for option {:?}",
                    value,
                    option
                );
            }
        }
    }

    /// Options an accepted connection takes over from its listener.
    pub fn inherited(&self) -> [(SocketOption, OptionValue); 5] {
        [
            (SocketOption::KeepAlive, OptionValue::Bool(self.keep_alive)),
            (SocketOption::NoDelay, OptionValue::Bool(self.no_delay)),
            (
                SocketOption::UnicastHopLimit,
                OptionValue::U32(self.unicast_hop_limit as u32),
            ),
            (
                SocketOption::ReceiveBufferSize,
                OptionValue::U64(self.receive_buffer_size),
            ),
            (
                SocketOption::SendBufferSize,
                OptionValue::U64(self.send_buffer_size),
            ),
        ]
    }
}

/// Clamp a requested backlog into the accepted range.
pub fn clamp_backlog(value: u64) -> u32 {
    value
        .try_into()
        .unwrap_or(MAX_TCP_BACKLOG)
        .clamp(MIN_TCP_BACKLOG, MAX_TCP_BACKLOG)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
