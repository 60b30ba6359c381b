// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 embus contributors

//! End-to-end REQ/REP over TCP loopback.

use embus::{Device, DeviceOption, Error, Mode, MonitorKind, TransportPreference, NO_PEER};
use std::time::Duration;

const RECV_TIMEOUT: Option<Duration> = Some(Duration::from_secs(5));

fn tcp_device() -> Device {
    let dev = Device::new();
    dev.set_option(DeviceOption::Transport(TransportPreference::TcpOnly));
    dev
}

#[test]
fn req_rep_roundtrip() {
    let server = tcp_device();
    let rep = server.plug(Mode::Rep).unwrap();
    let port = rep.bind(0).unwrap();
    assert_ne!(port, 0);

    let client = tcp_device();
    let req = client.plug(Mode::Req).unwrap();
    req.connect(&format!("127.0.0.1:{port}")).unwrap();
    assert_ne!(req.peer_id(), NO_PEER);

    req.send(&req.message(b"ping".to_vec())).unwrap();

    let question = rep.recv(RECV_TIMEOUT).unwrap();
    assert_eq!(question.payload(), b"ping");
    assert_eq!(question.mode(), Mode::Req);
    assert_ne!(question.peer(), NO_PEER);

    let answer = rep.message(b"pong".to_vec());
    answer.set_peer(question.peer());
    rep.send(&answer).unwrap();

    let reply = req.recv(RECV_TIMEOUT).unwrap();
    assert_eq!(reply.payload(), b"pong");
    assert_eq!(reply.mode(), Mode::Rep);

    client.close();
    server.close();
}

#[test]
fn rep_to_unknown_peer_fails() {
    let server = tcp_device();
    let rep = server.plug(Mode::Rep).unwrap();
    rep.bind(0).unwrap();

    let msg = rep.message(b"orphan".to_vec());
    assert!(matches!(rep.send(&msg), Err(Error::UnknownPeer(NO_PEER))));
    msg.set_peer(12345);
    assert!(matches!(rep.send(&msg), Err(Error::UnknownPeer(12345))));

    server.close();
}

#[test]
fn monitor_reports_lifecycle() {
    let server = tcp_device();
    server.set_option(DeviceOption::Monitor(true));
    let rep = server.plug(Mode::Rep).unwrap();
    let port = rep.bind(0).unwrap();

    let client = tcp_device();
    let req = client.plug(Mode::Req).unwrap();
    req.connect(&format!("127.0.0.1:{port}")).unwrap();

    let accept = server.monitor(RECV_TIMEOUT).unwrap();
    assert_eq!(accept.kind, MonitorKind::Accept);
    assert_ne!(accept.peer, NO_PEER);

    client.close();

    let closed = server.monitor(RECV_TIMEOUT).unwrap();
    assert_eq!(closed.kind, MonitorKind::Closed);
    assert_eq!(closed.peer, accept.peer);

    server.close();
}

#[test]
fn send_addition_rides_monitor_events() {
    let client = tcp_device();
    client.set_option(DeviceOption::Monitor(true));

    let server = tcp_device();
    let rep = server.plug(Mode::Rep).unwrap();
    let port = rep.bind(0).unwrap();

    let req = client.plug(Mode::Req).unwrap();
    req.connect(&format!("127.0.0.1:{port}")).unwrap();

    // First event on the client is its own Connect.
    let connect = client.monitor(RECV_TIMEOUT).unwrap();
    assert_eq!(connect.kind, MonitorKind::Connect);

    let msg = req.message(b"tagged".to_vec());
    msg.set_addition(0xfeed_beef);
    req.send(&msg).unwrap();

    let sent = client.monitor(RECV_TIMEOUT).unwrap();
    assert_eq!(sent.kind, MonitorKind::SndSucc);
    assert_eq!(sent.addition, 0xfeed_beef);

    client.close();
    server.close();
}

#[test]
fn second_bind_fails() {
    let server = tcp_device();
    let rep = server.plug(Mode::Rep).unwrap();
    rep.bind(0).unwrap();
    assert!(matches!(rep.bind(0), Err(Error::AlreadyBound)));
    server.close();
}

#[test]
fn control_close_kicks_peer() {
    let server = tcp_device();
    server.set_option(DeviceOption::Control(true));
    server.set_option(DeviceOption::Monitor(true));
    let rep = server.plug(Mode::Rep).unwrap();
    let port = rep.bind(0).unwrap();

    let client = tcp_device();
    let req = client.plug(Mode::Req).unwrap();
    req.connect(&format!("127.0.0.1:{port}")).unwrap();

    let accept = server.monitor(RECV_TIMEOUT).unwrap();
    assert_eq!(accept.kind, MonitorKind::Accept);

    rep.control(accept.peer, embus::Control::Close).unwrap();

    let closed = server.monitor(RECV_TIMEOUT).unwrap();
    assert_eq!(closed.kind, MonitorKind::Closed);
    assert_eq!(closed.peer, accept.peer);

    client.close();
    server.close();
}
