// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 embus contributors

//! Background reconnect after a server restart. The client never calls
//! `connect` again; the runtime sweeper re-establishes the link.

use embus::{Device, DeviceOption, Mode, MonitorKind, TransportPreference};
use std::time::{Duration, Instant};

const RECV_TIMEOUT: Option<Duration> = Some(Duration::from_secs(5));

fn tcp_device() -> Device {
    let dev = Device::new();
    dev.set_option(DeviceOption::Transport(TransportPreference::TcpOnly));
    dev
}

fn bind_rep(port: u16) -> (Device, embus::Plug, u16) {
    let dev = tcp_device();
    let rep = dev.plug(Mode::Rep).unwrap();
    let actual = rep.bind(port).unwrap();
    (dev, rep, actual)
}

#[test]
fn client_survives_server_restart() {
    let (server, rep, port) = bind_rep(0);

    let client = tcp_device();
    client.set_option(DeviceOption::Monitor(true));
    let req = client.plug(Mode::Req).unwrap();
    req.connect(&format!("127.0.0.1:{port}")).unwrap();

    req.send(&req.message(b"before".to_vec())).unwrap();
    assert_eq!(rep.recv(RECV_TIMEOUT).unwrap().payload(), b"before");

    // Connect event from the initial login.
    assert_eq!(
        client.monitor(RECV_TIMEOUT).unwrap().kind,
        MonitorKind::Connect
    );
    // The successful send.
    assert_eq!(
        client.monitor(RECV_TIMEOUT).unwrap().kind,
        MonitorKind::SndSucc
    );

    // Kill the server; the client should notice and start retrying.
    drop(rep);
    server.close();
    assert_eq!(
        client.monitor(Some(Duration::from_secs(10))).unwrap().kind,
        MonitorKind::Closed
    );

    // Restart on the same port.
    let (server2, rep2, _) = bind_rep(port);

    // The link comes back without another connect(); sends fail until
    // the background reconnect lands.
    let deadline = Instant::now() + Duration::from_secs(15);
    loop {
        let msg = req.message(b"after".to_vec());
        match req.send(&msg) {
            Ok(()) => break,
            Err(_) => {
                assert!(Instant::now() < deadline, "link never recovered");
                std::thread::sleep(Duration::from_millis(100));
            }
        }
    }
    assert_eq!(rep2.recv(RECV_TIMEOUT).unwrap().payload(), b"after");

    client.close();
    server2.close();
}

#[test]
fn send_while_down_reports_not_connected() {
    let (server, _rep, port) = bind_rep(0);

    let client = tcp_device();
    let req = client.plug(Mode::Req).unwrap();
    req.connect(&format!("127.0.0.1:{port}")).unwrap();
    server.close();

    // Wait for the client side to notice the dead link. A send racing
    // the teardown may report SendFailed instead; keep trying until the
    // link state itself says NotConnected.
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        match req.send(&req.message(b"x".to_vec())) {
            Err(embus::Error::NotConnected) => break,
            _ => {
                assert!(Instant::now() < deadline, "dead link never noticed");
                std::thread::sleep(Duration::from_millis(50));
            }
        }
    }

    client.close();
}
