// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 embus contributors

//! End-to-end messaging over the shared-memory transport. Each test
//! uses its own port so segments never collide.

#![cfg(target_os = "linux")]

use embus::{Device, DeviceOption, Mode, MonitorKind, TransportPreference};
use std::time::{Duration, Instant};

const RECV_TIMEOUT: Option<Duration> = Some(Duration::from_secs(5));

fn shm_device() -> Device {
    let dev = Device::new();
    dev.set_option(DeviceOption::Transport(TransportPreference::ShmOnly));
    dev
}

#[test]
fn req_rep_roundtrip_over_shm() {
    let port = 47611;
    let server = shm_device();
    let rep = server.plug(Mode::Rep).unwrap();
    assert_eq!(rep.bind(port).unwrap(), port);

    let client = shm_device();
    let req = client.plug(Mode::Req).unwrap();
    req.connect(&format!("127.0.0.1:{port}")).unwrap();

    req.send(&req.message(b"ping".to_vec())).unwrap();

    let question = rep.recv(RECV_TIMEOUT).unwrap();
    assert_eq!(question.payload(), b"ping");
    assert_eq!(question.mode(), Mode::Req);

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
fn multi_fragment_payload_over_shm() {
    let port = 47613;
    let server = shm_device();
    let rep = server.plug(Mode::Rep).unwrap();
    rep.bind(port).unwrap();

    let client = shm_device();
    let req = client.plug(Mode::Req).unwrap();
    req.connect(&format!("127.0.0.1:{port}")).unwrap();

    // Well past one 8175-byte shm chunk.
    let payload: Vec<u8> = (0..20_000usize).map(|i| (i % 251) as u8).collect();
    req.send(&req.message(payload.clone())).unwrap();

    let got = rep.recv(RECV_TIMEOUT).unwrap();
    assert_eq!(got.payload(), payload.as_slice());

    client.close();
    server.close();
}

#[test]
fn pub_fans_out_to_local_subscribers() {
    let port = 47617;
    let publisher = shm_device();
    publisher.set_option(DeviceOption::Monitor(true));
    let pb = publisher.plug(Mode::Pub).unwrap();
    pb.bind(port).unwrap();

    let mut subs = Vec::new();
    for _ in 0..3 {
        let dev = shm_device();
        let sub = dev.plug(Mode::Sub).unwrap();
        sub.connect(&format!("127.0.0.1:{port}")).unwrap();
        subs.push((dev, sub));
    }
    for _ in 0..3 {
        assert_eq!(
            publisher.monitor(RECV_TIMEOUT).unwrap().kind,
            MonitorKind::Accept
        );
    }

    pb.send(&pb.message(b"fan-out".to_vec())).unwrap();
    for (_, sub) in &subs {
        let msg = sub.recv(RECV_TIMEOUT).unwrap();
        assert_eq!(msg.payload(), b"fan-out");
        assert_eq!(msg.mode(), Mode::Pub);
    }

    for (dev, _) in &subs {
        dev.close();
    }
    publisher.close();
}

#[test]
fn client_survives_server_restart() {
    let port = 47625;
    let server = shm_device();
    let rep = server.plug(Mode::Rep).unwrap();
    rep.bind(port).unwrap();

    let client = shm_device();
    let req = client.plug(Mode::Req).unwrap();
    req.connect(&format!("127.0.0.1:{port}")).unwrap();
    req.send(&req.message(b"before".to_vec())).unwrap();
    assert_eq!(rep.recv(RECV_TIMEOUT).unwrap().payload(), b"before");

    // Restart: the new server creates a fresh segment under the same
    // name, so the client has to reattach, not just log in again.
    server.close();
    let server = shm_device();
    let rep = server.plug(Mode::Rep).unwrap();
    rep.bind(port).unwrap();

    // Reconnect attempts are paced at one per liveness interval.
    let deadline = Instant::now() + Duration::from_secs(30);
    loop {
        match req.send(&req.message(b"after".to_vec())) {
            Ok(()) => break,
            Err(e) => {
                assert!(Instant::now() < deadline, "client never reconnected: {e}");
                std::thread::sleep(Duration::from_millis(200));
            }
        }
    }
    let got = rep.recv(Some(Duration::from_secs(10))).unwrap();
    assert_eq!(got.payload(), b"after");

    client.close();
    server.close();
}

#[test]
fn client_close_logs_out() {
    let port = 47621;
    let server = shm_device();
    server.set_option(DeviceOption::Monitor(true));
    let rep = server.plug(Mode::Rep).unwrap();
    rep.bind(port).unwrap();

    let client = shm_device();
    let req = client.plug(Mode::Req).unwrap();
    req.connect(&format!("127.0.0.1:{port}")).unwrap();

    assert_eq!(
        server.monitor(RECV_TIMEOUT).unwrap().kind,
        MonitorKind::Accept
    );
    client.close();
    assert_eq!(
        server.monitor(RECV_TIMEOUT).unwrap().kind,
        MonitorKind::Closed
    );

    server.close();
}
