//! Loss recovery, restart, timeout and duplicate-delivery tests.

use std::cell::Cell;

use super::*;

fn recovery_config() -> Config {
    Config {
        round_trip_bytes: 10_000,
        ping_intervals: 3,
        timeout_intervals: 50,
        timer_interval: Duration::from_millis(1),
        ..Config::default()
    }
}

/// A transport pair sharing a hand-stepped clock.
fn mocked_pair(
    net: &TestNet,
) -> (
    HomaTransport<SimDriver>,
    HomaTransport<SimDriver>,
    Arc<Mock>,
) {
    let (clock, mock) = mock_clock();
    let client = HomaTransport::with_clock(net.driver(1), 1, recovery_config(), clock.clone());
    let server = HomaTransport::with_clock(net.driver(2), 2, recovery_config(), clock);
    server.set_handler(|req| async move { req.into_payload() });
    (client, server, mock)
}

/// A dropped DATA packet is recovered: after enough silent intervals the
/// receiver asks for the lowest missing range and the sender answers with a
/// RETRANSMISSION-flagged packet.
#[test]
fn loss_recovery() {
    init_logging();
    let net = TestNet::new(1500);
    let (client, server, mock) = mocked_pair(&net);

    // Lose the middle packet of a three-packet request, once.
    let mut dropped = false;
    net.drop_when(move |r| {
        let hit = !dropped
            && r.is(PacketOpcode::Data)
            && r.offset == 1500
            && r.flags & RETRANSMISSION == 0;
        dropped |= hit;
        hit
    });

    let sess = client.get_session(2);
    let payload = random_payload(4500);
    let (notifier, slot) = notifier();
    sess.send_request(payload.clone(), Vec::new(), notifier);

    // The transfer stalls on the gap.
    run(&[&client, &server], 50);
    assert!(slot.borrow().is_none());

    // Silent intervals accumulate until the receiver requests the range.
    for _ in 0..5 {
        tick(&mock, Duration::from_millis(1));
        run(&[&client, &server], 10);
    }
    assert!(run_until(&[&client, &server], || slot.borrow().is_some(), 1000));
    assert_eq!(slot.borrow().clone().unwrap(), Ok(payload));

    let trace = net.trace();
    assert!(trace.iter().any(|r| r.is(PacketOpcode::Resend)
        && r.flags & FROM_CLIENT == 0
        && r.offset == 1500
        && r.aux == 1500));
    assert!(trace.iter().any(|r| r.is(PacketOpcode::Data)
        && r.offset == 1500
        && r.flags & RETRANSMISSION != 0));
}

/// A RESEND issued twice for the same gap produces the same retransmission
/// without corrupting the transfer.
#[test]
fn repeated_resend_is_idempotent() {
    let net = TestNet::new(1500);
    let (client, server, mock) = mocked_pair(&net);

    // Lose the middle packet twice: the first gap RESEND is answered with a
    // retransmission that is also lost, forcing a second identical RESEND.
    let mut losses = 0;
    net.drop_when(move |r| {
        let hit = losses < 2 && r.is(PacketOpcode::Data) && r.offset == 1500;
        losses += usize::from(hit);
        hit
    });

    let sess = client.get_session(2);
    let payload = random_payload(4500);
    let (notifier, slot) = notifier();
    sess.send_request(payload.clone(), Vec::new(), notifier);
    run(&[&client, &server], 50);

    for _ in 0..10 {
        tick(&mock, Duration::from_millis(1));
        run(&[&client, &server], 10);
    }
    assert!(run_until(&[&client, &server], || slot.borrow().is_some(), 1000));
    assert_eq!(slot.borrow().clone().unwrap(), Ok(payload));

    let resends: Vec<_> = net
        .trace()
        .iter()
        .filter(|r| r.is(PacketOpcode::Resend) && r.flags & FROM_CLIENT == 0)
        .map(|r| (r.offset, r.aux))
        .collect();
    assert!(resends.len() >= 2);
    assert!(resends.iter().all(|&gap| gap == (1500, 1500)));
}

/// A server with no record of the RPC answers RESEND with RESTART; the
/// client resets its transmit state and resends the request from scratch.
#[test]
fn restart_recovery() {
    let net = TestNet::new(1500);
    let (client, server, mock) = mocked_pair(&net);

    // Black-hole the entire request until the client notices.
    let blocked = Rc::new(Cell::new(true));
    net.drop_when({
        let blocked = blocked.clone();
        move |r| {
            blocked.get()
                && (r.is(PacketOpcode::Data) || r.is(PacketOpcode::AllData))
                && r.flags & FROM_CLIENT != 0
        }
    });

    let sess = client.get_session(2);
    let payload = random_payload(5000);
    let (notifier, slot) = notifier();
    sess.send_request(payload.clone(), Vec::new(), notifier);
    run(&[&client, &server], 10);

    // Client pings, server knows nothing and demands a restart.
    for _ in 0..4 {
        tick(&mock, Duration::from_millis(1));
        run(&[&client, &server], 10);
    }
    assert!(net.trace().iter().any(|r| r.is(PacketOpcode::Resend)
        && r.flags & FROM_CLIENT == 0
        && r.flags & RESTART != 0));

    blocked.set(false);
    assert!(run_until(&[&client, &server], || slot.borrow().is_some(), 2000));
    assert_eq!(slot.borrow().clone().unwrap(), Ok(payload));

    // The first byte went out twice: once into the void, once after the
    // restart.
    let first_packets = net
        .trace()
        .iter()
        .filter(|r| r.is(PacketOpcode::Data) && r.offset == 0 && r.flags & FROM_CLIENT != 0)
        .count();
    assert!(first_packets >= 2);
}

/// A silent peer eventually fails the RPC with TIMEOUT and the transport
/// forgets it.
#[test]
fn client_timeout() {
    let net = TestNet::new(1500);
    let (clock, mock) = mock_clock();
    let config = Config {
        ping_intervals: 2,
        timeout_intervals: 5,
        timer_interval: Duration::from_millis(1),
        ..Config::default()
    };
    let client = HomaTransport::with_clock(net.driver(1), 1, config, clock);

    // Nobody serves address 9.
    let sess = client.get_session(9);
    let (notifier, slot) = notifier();
    sess.send_request(random_payload(400), Vec::new(), notifier);
    run(&[&client], 5);

    for _ in 0..6 {
        tick(&mock, Duration::from_millis(1));
        run(&[&client], 2);
    }
    assert_eq!(slot.borrow().clone().unwrap(), Err(RpcError::Timeout));
    assert_eq!(client.outstanding_client_rpcs(), 0);
}

/// A per-session timeout overrides the transport-wide default.
#[test]
fn session_timeout_override() {
    let net = TestNet::new(1500);
    let (clock, mock) = mock_clock();
    let config = Config {
        ping_intervals: 2,
        timeout_intervals: 1000,
        timer_interval: Duration::from_millis(1),
        ..Config::default()
    };
    let client = HomaTransport::with_clock(net.driver(1), 1, config, clock);

    let sess = client.get_session_with_timeout(9, Duration::from_millis(4));
    let (notifier, slot) = notifier();
    sess.send_request(random_payload(400), Vec::new(), notifier);
    run(&[&client], 5);

    for _ in 0..5 {
        tick(&mock, Duration::from_millis(1));
        run(&[&client], 2);
    }
    assert_eq!(slot.borrow().clone().unwrap(), Err(RpcError::Timeout));
}

/// Every packet delivered twice: duplicate DATA and GRANT packets are
/// absorbed without corrupting either message.
#[test]
fn duplicate_delivery() {
    let net = TestNet::new(1000);
    let config = Config {
        round_trip_bytes: 10_000,
        ..Config::default()
    };
    let client = HomaTransport::new(net.driver(1), 1, config.clone());
    let server = echo_server(&net, 2, 2, config);
    net.duplicate_when(|_| true);

    let sess = client.get_session(2);
    let payload = random_payload(35_000);
    let (notifier, slot) = notifier();
    sess.send_request(payload.clone(), Vec::new(), notifier);

    assert!(run_until(&[&client, &server], || slot.borrow().is_some(), 10_000));
    assert_eq!(slot.borrow().clone().unwrap(), Ok(payload));
}

/// An ABORT packet makes the server drop its half-received request state.
#[test]
fn abort_reaches_server() {
    let net = TestNet::new(1000);
    let config = Config {
        round_trip_bytes: 2_000,
        ..Config::default()
    };
    let client = HomaTransport::new(net.driver(1), 1, config.clone());
    let server = HomaTransport::new(net.driver(2), 2, config);
    server.set_handler(|req| async move { req.into_payload() });

    let sess = client.get_session(2);
    let (notifier, slot) = notifier();
    let sequence = sess.send_request(random_payload(40_000), Vec::new(), notifier);
    run(&[&client, &server], 10);
    assert_eq!(server.incoming_server_rpcs(), 1);

    sess.cancel_request(sequence);
    run(&[&client, &server], 10);
    assert_eq!(slot.borrow().clone().unwrap(), Err(RpcError::Cancelled));
    assert_eq!(server.incoming_server_rpcs(), 0);
}
