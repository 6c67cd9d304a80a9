//! Socket Lifecycle Tests
//!
//! End-to-end scenarios on the loopback host: the start/finish protocol,
//! branch exclusivity, option gating and stream behaviour after shutdown.

use kpio_sockets::{
    create_tcp_socket, poll_list, ErrorCode, Host, IpAddress, IpAddressFamily, IpSocketAddress,
    LoopbackConfig, Network, PendingOperation, ShutdownType, StreamError, TcpSocket, TcpState,
};

fn loopback() -> Host {
    Host::loopback(LoopbackConfig::default())
}

fn unspecified(family: IpAddressFamily) -> IpSocketAddress {
    IpSocketAddress::unspecified(family)
}

fn listen_on_any(host: &Host, network: &Network, family: IpAddressFamily) -> TcpSocket {
    let mut socket = create_tcp_socket(host, family).unwrap();
    socket.start_bind(network, unspecified(family)).unwrap();
    socket.finish_bind().unwrap();
    socket.start_listen().unwrap();
    socket.finish_listen().unwrap();
    socket
}

// ========================================
// Two-phase protocol
// ========================================

#[test]
fn test_bind_listen_scenario() {
    let host = loopback();
    let network = Network::new();
    let mut socket = create_tcp_socket(&host, IpAddressFamily::Ipv4).unwrap();

    socket
        .start_bind(&network, unspecified(IpAddressFamily::Ipv4))
        .unwrap();
    assert_eq!(socket.state(), TcpState::Binding);
    socket.finish_bind().unwrap();
    let local = socket.local_address().unwrap();
    assert_ne!(local.port, 0);
    assert!(!local.address.is_unspecified());

    socket.start_listen().unwrap();
    assert_eq!(socket.pending_operation(), Some(PendingOperation::Listen));
    socket.finish_listen().unwrap();
    assert_eq!(socket.state(), TcpState::Listening);

    assert_eq!(
        socket.start_bind(&network, unspecified(IpAddressFamily::Ipv4)),
        Err(ErrorCode::AlreadyBound)
    );
}

#[test]
fn test_ipv6_unspecified_bind_is_concrete() {
    let host = loopback();
    let network = Network::new();
    let mut socket = create_tcp_socket(&host, IpAddressFamily::Ipv6).unwrap();
    socket
        .start_bind(&network, unspecified(IpAddressFamily::Ipv6))
        .unwrap();
    socket.finish_bind().unwrap();
    let local = socket.local_address().unwrap();
    assert_eq!(local.address, IpAddress::localhost_v6());
    assert_ne!(local.port, 0);
}

#[test]
fn test_finish_bind_before_start() {
    let mut socket = create_tcp_socket(&loopback(), IpAddressFamily::Ipv4).unwrap();
    assert_eq!(socket.finish_bind(), Err(ErrorCode::NotInProgress));
}

#[test]
fn test_start_while_pending_is_conflict() {
    let host = loopback();
    let network = Network::new();
    let server = listen_on_any(&host, &network, IpAddressFamily::Ipv4);
    let target = server.local_address().unwrap();

    let mut socket = create_tcp_socket(&host, IpAddressFamily::Ipv4).unwrap();
    socket.start_connect(&network, target).unwrap();
    assert_eq!(
        socket.start_connect(&network, target),
        Err(ErrorCode::ConcurrencyConflict)
    );
    assert_eq!(
        socket.start_bind(&network, unspecified(IpAddressFamily::Ipv4)),
        Err(ErrorCode::ConcurrencyConflict)
    );
    assert_eq!(socket.start_listen(), Err(ErrorCode::ConcurrencyConflict));
    assert_eq!(
        socket.set_send_buffer_size(4096),
        Err(ErrorCode::ConcurrencyConflict)
    );
    assert!(socket.finish_connect().is_ok());
}

#[test]
fn test_invalid_remote_regardless_of_family() {
    let host = loopback();
    let network = Network::new();
    let mut socket = create_tcp_socket(&host, IpAddressFamily::Ipv4).unwrap();
    let cases = [
        IpSocketAddress::new(IpAddress::localhost_v4(), 0),
        IpSocketAddress::new(IpAddress::unspecified(IpAddressFamily::Ipv4), 80),
        IpSocketAddress::new(IpAddress::localhost_v6(), 0),
        IpSocketAddress::new(IpAddress::unspecified(IpAddressFamily::Ipv6), 443),
    ];
    for remote in cases {
        assert_eq!(
            socket.start_connect(&network, remote),
            Err(ErrorCode::InvalidRemoteAddress),
            "{}",
            remote
        );
    }
}

#[test]
fn test_listen_needs_bind_but_connect_does_not() {
    let host = loopback();
    let network = Network::new();
    let server = listen_on_any(&host, &network, IpAddressFamily::Ipv4);

    let mut unbound = create_tcp_socket(&host, IpAddressFamily::Ipv4).unwrap();
    assert_eq!(unbound.start_listen(), Err(ErrorCode::NotBound));
    assert_eq!(unbound.state(), TcpState::Unbound);

    unbound
        .start_connect(&network, server.local_address().unwrap())
        .unwrap();
    unbound.finish_connect().unwrap();
    assert_eq!(unbound.state(), TcpState::Connected);
    assert_ne!(unbound.local_address().unwrap().port, 0);
}

// ========================================
// Branch exclusivity
// ========================================

#[test]
fn test_connected_and_listening_are_exclusive() {
    let host = loopback();
    let network = Network::new();
    let mut server = listen_on_any(&host, &network, IpAddressFamily::Ipv4);
    let target = server.local_address().unwrap();

    let mut client = create_tcp_socket(&host, IpAddressFamily::Ipv4).unwrap();
    client.start_connect(&network, target).unwrap();
    client.finish_connect().unwrap();
    let (mut accepted, _input, _output) = server.accept().unwrap();

    for socket in [&mut client, &mut accepted] {
        assert_eq!(socket.start_listen(), Err(ErrorCode::AlreadyConnected));
        assert_eq!(socket.state(), TcpState::Connected);
        assert!(!socket.is_listening());
    }
    assert_eq!(
        server.start_connect(&network, target),
        Err(ErrorCode::AlreadyListening)
    );
    assert!(server.is_listening());
}

// ========================================
// Connect failures
// ========================================

#[test]
fn test_connect_failures_on_loopback() {
    let config = LoopbackConfig {
        filtered: vec![IpAddress::Ipv4(127, 0, 0, 2)],
        ..LoopbackConfig::default()
    };
    let host = Host::loopback(config);
    let network = Network::new();
    let cases = [
        (IpAddress::Ipv4(127, 0, 0, 1), ErrorCode::ConnectionRefused),
        (IpAddress::Ipv4(127, 0, 0, 2), ErrorCode::Timeout),
        (IpAddress::Ipv4(203, 0, 113, 5), ErrorCode::RemoteUnreachable),
    ];
    for (address, expected) in cases {
        let mut socket = create_tcp_socket(&host, IpAddressFamily::Ipv4).unwrap();
        socket
            .start_connect(&network, IpSocketAddress::new(address, 5555))
            .unwrap();
        assert_eq!(socket.finish_connect().err(), Some(expected));
        assert_eq!(socket.state(), TcpState::Closed);
    }
}

#[test]
fn test_ephemeral_exhaustion_reported_by_finish_connect() {
    let config = LoopbackConfig {
        ephemeral_port_start: 60000,
        ephemeral_port_end: 60000,
        ..LoopbackConfig::default()
    };
    let host = Host::loopback(config);
    let network = Network::new();
    let server = listen_on_any(&host, &network, IpAddressFamily::Ipv4);
    let target = server.local_address().unwrap();

    let mut client = create_tcp_socket(&host, IpAddressFamily::Ipv4).unwrap();
    client.start_connect(&network, target).unwrap();
    assert_eq!(
        client.finish_connect().err(),
        Some(ErrorCode::EphemeralPortsExhausted)
    );
}

// ========================================
// Addressing
// ========================================

fn listen_on(host: &Host, network: &Network, local: IpSocketAddress) -> TcpSocket {
    let mut socket = create_tcp_socket(host, local.family()).unwrap();
    socket.start_bind(network, local).unwrap();
    socket.finish_bind().unwrap();
    socket.start_listen().unwrap();
    socket.finish_listen().unwrap();
    socket
}

#[test]
fn test_listeners_on_distinct_loopback_addresses() {
    let host = loopback();
    let network = Network::new();
    let first = IpSocketAddress::new(IpAddress::Ipv4(127, 0, 0, 1), 7200);
    let second = IpSocketAddress::new(IpAddress::Ipv4(127, 0, 0, 2), 7200);
    let mut a = listen_on(&host, &network, first);
    let mut b = listen_on(&host, &network, second);
    assert_eq!(b.local_address().unwrap(), second);

    let mut client = create_tcp_socket(&host, IpAddressFamily::Ipv4).unwrap();
    client.start_connect(&network, second).unwrap();
    client.finish_connect().unwrap();
    assert_eq!(a.accept().err(), Some(ErrorCode::WouldBlock));
    let (accepted, _input, _output) = b.accept().unwrap();
    assert_eq!(accepted.local_address().unwrap(), second);

    let mut stray = create_tcp_socket(&host, IpAddressFamily::Ipv4).unwrap();
    stray
        .start_connect(&network, IpSocketAddress::new(IpAddress::Ipv4(127, 0, 0, 3), 7200))
        .unwrap();
    assert_eq!(
        stray.finish_connect().err(),
        Some(ErrorCode::ConnectionRefused)
    );
}

#[test]
fn test_dual_stack_listener_accepts_ipv4_client() {
    let host = loopback();
    let network = Network::new();
    let any_v6 = IpSocketAddress::new(IpAddress::unspecified(IpAddressFamily::Ipv6), 7100);
    let mut server = create_tcp_socket(&host, IpAddressFamily::Ipv6).unwrap();
    assert_eq!(server.ipv6_only(), Ok(false));
    server.start_bind(&network, any_v6).unwrap();
    server.finish_bind().unwrap();
    server.start_listen().unwrap();
    server.finish_listen().unwrap();

    let mut client = create_tcp_socket(&host, IpAddressFamily::Ipv4).unwrap();
    client
        .start_connect(&network, IpSocketAddress::new(IpAddress::localhost_v4(), 7100))
        .unwrap();
    let (_input, mut output) = client.finish_connect().unwrap();

    let (accepted, mut peer_in, _peer_out) = server.accept().unwrap();
    assert_eq!(accepted.address_family(), IpAddressFamily::Ipv6);
    assert!(accepted.remote_address().unwrap().address.is_ipv4_mapped());
    output.write(b"v4").unwrap();
    assert_eq!(peer_in.read(8).unwrap(), b"v4");
}

// ========================================
// Polling
// ========================================

#[test]
fn test_poll_until_connected() {
    let config = LoopbackConfig {
        connect_latency_ticks: 10,
        ..LoopbackConfig::default()
    };
    let host = Host::loopback(config);
    let network = Network::new();
    let mut server = listen_on_any(&host, &network, IpAddressFamily::Ipv4);
    let mut client = create_tcp_socket(&host, IpAddressFamily::Ipv4).unwrap();
    client
        .start_connect(&network, server.local_address().unwrap())
        .unwrap();

    let connect_ready = client.subscribe();
    let accept_ready = server.subscribe();
    assert!(poll_list(&[&connect_ready, &accept_ready]).is_empty());
    assert_eq!(server.accept().err(), Some(ErrorCode::WouldBlock));

    let net = host.as_loopback().unwrap();
    let mut rounds = 0;
    while client.finish_connect().err() == Some(ErrorCode::WouldBlock) {
        net.tick();
        rounds += 1;
    }
    assert_eq!(rounds, 10);
    assert_eq!(client.state(), TcpState::Connected);
    assert_eq!(poll_list(&[&connect_ready, &accept_ready]), vec![0, 1]);
    assert!(server.accept().is_ok());
}

// ========================================
// Streams and shutdown
// ========================================

#[test]
fn test_shutdown_both() {
    let host = loopback();
    let network = Network::new();
    let mut server = listen_on_any(&host, &network, IpAddressFamily::Ipv6);
    let mut client = create_tcp_socket(&host, IpAddressFamily::Ipv6).unwrap();
    client
        .start_connect(&network, server.local_address().unwrap())
        .unwrap();
    let (mut input, mut output) = client.finish_connect().unwrap();
    let (_peer, mut peer_in, mut peer_out) = server.accept().unwrap();

    output.write(b"hello").unwrap();
    assert_eq!(peer_in.read(64).unwrap(), b"hello");
    peer_out.write(b"discarded").unwrap();

    client.shutdown(ShutdownType::Both).unwrap();
    assert_eq!(client.state(), TcpState::Connected);
    assert_eq!(input.read(64), Err(StreamError::Closed));
    assert!(output.write(b"late").is_err());
    assert!(output.check_write().is_err());
}

#[test]
fn test_shutdown_send_signals_end_of_stream() {
    let host = loopback();
    let network = Network::new();
    let mut server = listen_on_any(&host, &network, IpAddressFamily::Ipv4);
    let mut client = create_tcp_socket(&host, IpAddressFamily::Ipv4).unwrap();
    client
        .start_connect(&network, server.local_address().unwrap())
        .unwrap();
    let (_input, mut output) = client.finish_connect().unwrap();
    let (_peer, mut peer_in, _peer_out) = server.accept().unwrap();

    output.write(b"last words").unwrap();
    client.shutdown(ShutdownType::Send).unwrap();
    assert_eq!(peer_in.read(64).unwrap(), b"last words");
    assert_eq!(peer_in.read(64), Err(StreamError::Closed));
}

#[test]
fn test_shutdown_requires_connection() {
    let mut socket = create_tcp_socket(&loopback(), IpAddressFamily::Ipv4).unwrap();
    assert_eq!(
        socket.shutdown(ShutdownType::Receive),
        Err(ErrorCode::NotConnected)
    );
}

// ========================================
// Options
// ========================================

#[test]
fn test_receive_buffer_readback_is_deterministic() {
    let host = loopback();
    let mut a = create_tcp_socket(&host, IpAddressFamily::Ipv4).unwrap();
    let mut b = create_tcp_socket(&host, IpAddressFamily::Ipv4).unwrap();
    for value in [1u64, 3000, 70_000, 1 << 40] {
        a.set_receive_buffer_size(value).unwrap();
        b.set_receive_buffer_size(value).unwrap();
        let first = a.receive_buffer_size();
        a.set_receive_buffer_size(value).unwrap();
        assert_eq!(a.receive_buffer_size(), first);
        assert_eq!(b.receive_buffer_size(), first);
        assert!(first > 0);
    }
}

#[test]
fn test_ipv6_only_frozen_after_bind() {
    let host = loopback();
    let network = Network::new();
    let mut socket = create_tcp_socket(&host, IpAddressFamily::Ipv6).unwrap();
    socket.set_ipv6_only(true).unwrap();
    assert_eq!(socket.ipv6_only(), Ok(true));
    socket
        .start_bind(&network, unspecified(IpAddressFamily::Ipv6))
        .unwrap();
    socket.finish_bind().unwrap();
    assert_eq!(socket.set_ipv6_only(false), Err(ErrorCode::AlreadyBound));
}

#[test]
fn test_dual_stack_unavailable() {
    let config = LoopbackConfig {
        dual_stack: false,
        ..LoopbackConfig::default()
    };
    let host = Host::loopback(config);
    let mut socket = create_tcp_socket(&host, IpAddressFamily::Ipv6).unwrap();
    assert_eq!(socket.ipv6_only(), Ok(true));
    assert_eq!(socket.set_ipv6_only(false), Err(ErrorCode::NotSupported));
}

#[test]
fn test_toggles_while_connected() {
    let host = loopback();
    let network = Network::new();
    let mut server = listen_on_any(&host, &network, IpAddressFamily::Ipv4);
    let mut client = create_tcp_socket(&host, IpAddressFamily::Ipv4).unwrap();
    client
        .start_connect(&network, server.local_address().unwrap())
        .unwrap();
    client.finish_connect().unwrap();

    client.set_keep_alive(true).unwrap();
    client.set_no_delay(true).unwrap();
    assert!(client.keep_alive() && client.no_delay());
    assert_eq!(
        client.set_unicast_hop_limit(5),
        Err(ErrorCode::AlreadyConnected)
    );
    server.set_listen_backlog_size(1).unwrap();
    assert_eq!(server.listen_backlog_size(), 1);
    assert_eq!(
        server.set_send_buffer_size(1024),
        Err(ErrorCode::AlreadyListening)
    );
}

// ========================================
// Creation
// ========================================

#[test]
fn test_creation_errors() {
    let no_tcp = Host::loopback(LoopbackConfig {
        tcp: false,
        ..LoopbackConfig::default()
    });
    assert_eq!(
        create_tcp_socket(&no_tcp, IpAddressFamily::Ipv4).err(),
        Some(ErrorCode::NotSupported)
    );

    let no_v6 = Host::loopback(LoopbackConfig {
        ipv6: false,
        ..LoopbackConfig::default()
    });
    assert_eq!(
        create_tcp_socket(&no_v6, IpAddressFamily::Ipv6).err(),
        Some(ErrorCode::AddressFamilyNotSupported)
    );

    let tiny = Host::loopback(LoopbackConfig {
        max_sockets: 2,
        ..LoopbackConfig::default()
    });
    let _a = create_tcp_socket(&tiny, IpAddressFamily::Ipv4).unwrap();
    let _b = create_tcp_socket(&tiny, IpAddressFamily::Ipv4).unwrap();
    assert_eq!(
        create_tcp_socket(&tiny, IpAddressFamily::Ipv4).err(),
        Some(ErrorCode::NewSocketLimit)
    );
}
