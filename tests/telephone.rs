mod common;

use std::net::SocketAddr;

use common::{error_reply, Console};
use mobile_adapter::adapter::{AdapterConfig, DEFAULT_P2P_PORT};
use mobile_adapter::board::SocketKind;
use mobile_adapter::commands::{ConnectionState, Line, Slot, CALL_CONNECTION_ID};
use mobile_adapter::serial::{Command, Packet};

fn dial_data(number: &[u8]) -> Vec<u8> {
    let mut data = vec![0x00];
    data.extend_from_slice(number);
    data
}

fn peer_addr(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}

fn in_call() -> Console {
    let mut console = Console::new();
    console.begin_session();
    console.backend.reachable.insert(peer_addr(DEFAULT_P2P_PORT));
    let reply = console
        .request(Command::DialTelephone, &dial_data(b"127000000001"))
        .unwrap();
    assert_eq!(reply, Packet::empty(Command::DialTelephone));
    console
}

#[test]
fn test_dial_peer() {
    let mut console = in_call();
    assert_eq!(console.adapter.connection_state(), ConnectionState::Call);
    assert_eq!(console.adapter.commands().line(), Line::Peer);
    assert_eq!(
        console.backend.sockets[&0].peer,
        Some(peer_addr(DEFAULT_P2P_PORT))
    );

    let reply = console.request(Command::TelephoneStatus, &[]).unwrap();
    assert_eq!(reply.data()[0], 0x04);
}

#[test]
fn test_dial_uses_configured_port() {
    let mut console = Console::with_config(AdapterConfig {
        p2p_port: 5000,
        ..AdapterConfig::default()
    });
    console.begin_session();
    console.backend.reachable.insert(peer_addr(5000));
    let reply = console
        .request(Command::DialTelephone, &dial_data(b"127000000001"))
        .unwrap();
    assert_eq!(reply, Packet::empty(Command::DialTelephone));
}

#[test]
fn test_dial_failures() {
    let mut console = Console::new();
    console.begin_session();

    let reply = console
        .request(Command::DialTelephone, &dial_data(b"127000000001"))
        .unwrap();
    assert_eq!(reply, error_reply(Command::DialTelephone, 3));
    assert_eq!(console.adapter.commands().slot(0), Some(Slot::Free));
    assert_eq!(
        console.adapter.connection_state(),
        ConnectionState::Disconnected
    );

    let reply = console
        .request(Command::DialTelephone, &dial_data(b"5551234"))
        .unwrap();
    assert_eq!(reply, error_reply(Command::DialTelephone, 3));

    let reply = console.request(Command::DialTelephone, &[0x00]).unwrap();
    assert_eq!(reply, error_reply(Command::DialTelephone, 2));
}

#[test]
fn test_dial_while_in_call() {
    let mut console = in_call();
    let reply = console
        .request(Command::DialTelephone, &dial_data(b"#9677"))
        .unwrap();
    assert_eq!(reply, error_reply(Command::DialTelephone, 1));
}

#[test]
fn test_call_handshake_then_exchange() {
    let mut console = in_call();
    console.backend.queue_inbound(0, b"early");

    // The first transfers of a call only send
    let reply = console
        .request(Command::TransferData, &[CALL_CONNECTION_ID, 0x01, 0x02])
        .unwrap();
    assert_eq!(reply, Packet::new(Command::TransferData, &[CALL_CONNECTION_ID]));
    let reply = console
        .request(Command::TransferData, &[CALL_CONNECTION_ID])
        .unwrap();
    assert_eq!(reply.data(), &[CALL_CONNECTION_ID]);
    assert_eq!(console.adapter.commands().call_packets_sent(), 2);
    assert_eq!(console.backend.sent, vec![(0, vec![0x01, 0x02])]);

    let reply = console
        .request(Command::TransferData, &[CALL_CONNECTION_ID, 0x03])
        .unwrap();
    let mut expected = vec![CALL_CONNECTION_ID];
    expected.extend_from_slice(b"early");
    assert_eq!(reply.data(), expected.as_slice());
    assert_eq!(console.backend.sent.len(), 2);
}

#[test]
fn test_hang_up_closes_call_socket() {
    let mut console = in_call();
    let reply = console.request(Command::HangUpTelephone, &[]).unwrap();
    assert_eq!(reply, Packet::empty(Command::HangUpTelephone));
    assert!(!console.backend.is_open(0));
    assert_eq!(
        console.adapter.connection_state(),
        ConnectionState::Disconnected
    );
}

#[test]
fn test_peer_hangs_up() {
    let mut console = in_call();
    console.backend.hung_up.insert(0);

    let reply = console
        .request(Command::TransferData, &[CALL_CONNECTION_ID, 0x10])
        .unwrap();
    assert_eq!(
        reply,
        Packet::new(Command::TransferDataEnd, &[CALL_CONNECTION_ID])
    );
    assert_eq!(
        console.adapter.connection_state(),
        ConnectionState::Disconnected
    );
    assert!(!console.backend.is_open(0));
}

#[test]
fn test_close_connection_refused_during_call() {
    let mut console = in_call();
    let reply = console
        .request(Command::CloseTcpConnection, &[0])
        .unwrap();
    assert_eq!(reply, error_reply(Command::CloseTcpConnection, 1));

    assert_eq!(console.adapter.connection_state(), ConnectionState::Call);
    assert_eq!(console.adapter.commands().line(), Line::Peer);
    assert_eq!(
        console.adapter.commands().slot(0),
        Some(Slot::Open(SocketKind::Tcp))
    );
    assert!(console.backend.is_open(0));

    let reply = console.request(Command::TelephoneStatus, &[]).unwrap();
    assert_eq!(reply.data()[0], 0x04);
}

#[test]
fn test_console_ends_call() {
    let mut console = in_call();
    let reply = console
        .request(Command::TransferDataEnd, &[CALL_CONNECTION_ID])
        .unwrap();
    assert_eq!(
        reply,
        Packet::new(Command::TransferDataEnd, &[CALL_CONNECTION_ID])
    );
    assert_eq!(
        console.adapter.connection_state(),
        ConnectionState::Disconnected
    );
    assert!(!console.backend.is_open(0));
}

#[test]
fn test_wait_for_call() {
    let mut console = Console::new();
    console.begin_session();

    let reply = console
        .request(Command::WaitForTelephoneCall, &[])
        .unwrap();
    assert_eq!(reply, error_reply(Command::WaitForTelephoneCall, 0));
    assert_eq!(console.adapter.commands().slot(0), Some(Slot::Listening));
    let socket = console.backend.sockets[&0].clone();
    assert!(socket.listening);
    assert_eq!(socket.bind_port, DEFAULT_P2P_PORT);

    // Still the same listener on the next attempt
    console.backend.callers = 1;
    let reply = console
        .request(Command::WaitForTelephoneCall, &[])
        .unwrap();
    assert_eq!(reply, Packet::empty(Command::WaitForTelephoneCall));
    assert!(console.backend.closed.is_empty());
    assert_eq!(console.adapter.connection_state(), ConnectionState::Call);
    assert_eq!(console.adapter.commands().line(), Line::Peer);

    // An answered call exchanges data like a dialed one
    console
        .request(Command::TransferData, &[CALL_CONNECTION_ID])
        .unwrap();
    console
        .request(Command::TransferData, &[CALL_CONNECTION_ID])
        .unwrap();
    console.backend.queue_inbound(0, &[0x42]);
    let reply = console
        .request(Command::TransferData, &[CALL_CONNECTION_ID])
        .unwrap();
    assert_eq!(reply.data(), &[CALL_CONNECTION_ID, 0x42]);
}

#[test]
fn test_wait_for_call_listen_failure() {
    let mut console = Console::new();
    console.begin_session();
    console.backend.fail_open = true;
    let reply = console
        .request(Command::WaitForTelephoneCall, &[])
        .unwrap();
    assert_eq!(reply, error_reply(Command::WaitForTelephoneCall, 3));
    assert_eq!(console.adapter.commands().slot(0), Some(Slot::Free));
}

#[test]
fn test_stop_waiting_closes_listener() {
    let mut console = Console::new();
    console.begin_session();
    console
        .request(Command::WaitForTelephoneCall, &[])
        .unwrap();
    assert!(console.backend.is_open(0));

    console.request(Command::EndSession, &[]).unwrap();
    assert!(!console.backend.is_open(0));
}
