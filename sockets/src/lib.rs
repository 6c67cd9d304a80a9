//! KPIO Sockets
//!
//! Non-blocking TCP sockets with a two-phase `start_*` / `finish_*`
//! lifecycle, following the `wasi:sockets/tcp` model. Nothing in this
//! crate blocks the calling thread; callers subscribe to a [`Pollable`]
//! to learn when a pending operation can be finished.
//!
//! # Architecture
//!
//! - `tcp`: socket state machine (bind, connect, listen, accept, shutdown)
//! - `options`: option snapshot and the per-state setter legality table
//! - `error`: portable error codes and the host errno mapper
//! - `network`: IP addresses, socket addresses, network capability
//! - `streams`: input/output byte streams of an established connection
//! - `poll`: readiness pollables
//! - `host`: backend selection (`Host`) and dispatch
//! - `loopback`: deterministic in-memory network
//! - `os`: operating-system backend via `socket2` (feature `std`, unix)
//! - `table`: handle-based resource table and `SocketsCtx`
//! - `config`: loopback host configuration
//!
//! # Example
//!
//! ```
//! use kpio_sockets::{create_tcp_socket, Host, IpAddressFamily, IpSocketAddress, LoopbackConfig, Network};
//!
//! let host = Host::loopback(LoopbackConfig::default());
//! let network = Network::new();
//! let mut socket = create_tcp_socket(&host, IpAddressFamily::Ipv4).unwrap();
//! socket
//!     .start_bind(&network, IpSocketAddress::unspecified(IpAddressFamily::Ipv4))
//!     .unwrap();
//! socket.finish_bind().unwrap();
//! socket.start_listen().unwrap();
//! socket.finish_listen().unwrap();
//! assert!(socket.is_listening());
//! ```

#![cfg_attr(not(feature = "std"), no_std)]

extern crate alloc;

pub mod config;
pub mod error;
pub mod host;
pub mod loopback;
pub mod network;
pub mod options;
pub mod poll;
pub mod streams;
pub mod table;
pub mod tcp;

#[cfg(all(feature = "std", unix))]
pub mod os;

pub use config::LoopbackConfig;
pub use error::ErrorCode;
pub use host::Host;
pub use loopback::LoopbackNetwork;
pub use network::{IpAddress, IpAddressFamily, IpSocketAddress, Network};
pub use options::{SocketOption, TcpOptions, DEFAULT_TCP_BACKLOG};
pub use poll::{poll_list, Pollable};
pub use streams::{InputStream, OutputStream, StreamError};
pub use table::{CallError, ResourceError, ResourceHandle, SocketsCtx};
pub use tcp::{create_tcp_socket, PendingOperation, ShutdownType, TcpSocket, TcpState};

#[cfg(all(feature = "std", unix))]
pub use os::OsHost;
