//! Tests for grant-paced messages and the receiver-side scheduler.

use super::*;

fn paced_config() -> Config {
    Config {
        round_trip_bytes: 10_000,
        ..Config::default()
    }
}

/// With a 10k unscheduled allowance and 10k grant increment, a 35k message
/// draws exactly three GRANTs (20k, 30k, 35k), and the final GRANT precedes
/// the final DATA packet.
#[test]
fn grant_paced_send() {
    let net = TestNet::new(1000);
    let client = HomaTransport::new(net.driver(1), 1, paced_config());
    let server = HomaTransport::new(net.driver(2), 2, paced_config());
    server.set_handler(|_req| async move { b"done".to_vec() });

    let sess = client.get_session(2);
    let payload = random_payload(35_000);
    let (notifier, slot) = notifier();
    sess.send_request(payload, Vec::new(), notifier);

    assert!(run_until(&[&client, &server], || slot.borrow().is_some(), 5000));
    assert_eq!(slot.borrow().clone().unwrap(), Ok(b"done".to_vec()));

    let rpc_id = RpcId::new(1, 1);
    assert_eq!(net.grants_to(rpc_id, false), vec![20_000, 30_000, 35_000]);

    // The message is fully granted before its last packet is transmitted.
    let trace = net.trace();
    let last_grant = trace
        .iter()
        .position(|r| r.is(PacketOpcode::Grant) && r.offset == 35_000)
        .unwrap();
    let last_data = trace
        .iter()
        .position(|r| r.is(PacketOpcode::Data) && r.offset == 34_000)
        .unwrap();
    assert!(last_grant < last_data);

    // As the sole active message it is granted the top scheduled priority,
    // and the GRANT packets themselves travel at the control priority.
    for grant in trace.iter().filter(|r| r.is(PacketOpcode::Grant)) {
        assert_eq!(grant.embedded_priority, 3);
        assert_eq!(grant.priority, 7);
    }
}

/// A message exactly equal to the unscheduled allowance never needs a GRANT.
#[test]
fn message_exactly_unscheduled() {
    let net = TestNet::new(1000);
    let client = HomaTransport::new(net.driver(1), 1, paced_config());
    let server = echo_server(&net, 2, 2, paced_config());

    let sess = client.get_session(2);
    let payload = random_payload(10_000);
    let (notifier, slot) = notifier();
    sess.send_request(payload.clone(), Vec::new(), notifier);

    assert!(run_until(&[&client, &server], || slot.borrow().is_some(), 5000));
    assert_eq!(slot.borrow().clone().unwrap(), Ok(payload));
    assert!(!net
        .trace()
        .iter()
        .any(|r| r.is(PacketOpcode::Grant) && r.flags & FROM_CLIENT == 0));
}

/// A message one increment past the allowance completes with exactly one
/// GRANT.
#[test]
fn single_grant_completes() {
    let net = TestNet::new(1000);
    let client = HomaTransport::new(net.driver(1), 1, paced_config());
    let server = HomaTransport::new(net.driver(2), 2, paced_config());
    server.set_handler(|_req| async move { b"done".to_vec() });

    let sess = client.get_session(2);
    let (notifier, slot) = notifier();
    sess.send_request(random_payload(15_000), Vec::new(), notifier);

    assert!(run_until(&[&client, &server], || slot.borrow().is_some(), 5000));
    assert_eq!(net.grants_to(RpcId::new(1, 1), false), vec![15_000]);
}

/// SRPT preemption with an overcommitment degree of one: a short message
/// arriving mid-transfer demotes the long one and monopolizes the grants
/// until it is fully granted.
#[test]
fn srpt_preemption() {
    let config = Config {
        round_trip_bytes: 2_000,
        max_granted_messages: 1,
        ..Config::default()
    };
    let net = TestNet::new(1000);
    let client_a = HomaTransport::new(net.driver(1), 1, config.clone());
    let client_b = HomaTransport::new(net.driver(2), 2, config.clone());
    let server = HomaTransport::new(net.driver(3), 3, config);
    server.set_handler(|_req| async move { b"done".to_vec() });

    // The long message arrives first and becomes active.
    let sess_a = client_a.get_session(3);
    let (notifier_a, slot_a) = notifier();
    sess_a.send_request(random_payload(40_000), Vec::new(), notifier_a);
    run(&[&client_a, &server], 5);
    assert_eq!(server.active_message_count(), 1);

    let sess_b = client_b.get_session(3);
    let (notifier_b, slot_b) = notifier();
    sess_b.send_request(random_payload(10_000), Vec::new(), notifier_b);

    let all = [&client_a, &client_b, &server];
    assert!(run_until(&all, || slot_b.borrow().is_some(), 5000));
    // The short message wins while the long one waits.
    assert!(slot_a.borrow().is_none());

    let a_id = RpcId::new(1, 1);
    let b_id = RpcId::new(2, 1);
    let trace = net.trace();
    let first_b_grant = trace
        .iter()
        .position(|r| r.is(PacketOpcode::Grant) && r.rpc_id == b_id)
        .expect("the short message must receive grants");
    let last_b_grant = trace
        .iter()
        .rposition(|r| r.is(PacketOpcode::Grant) && r.rpc_id == b_id)
        .unwrap();
    assert!(trace[first_b_grant..=last_b_grant]
        .iter()
        .filter(|r| r.is(PacketOpcode::Grant))
        .all(|r| r.rpc_id == b_id));

    // The long message resumes afterwards and completes.
    assert!(run_until(&all, || slot_a.borrow().is_some(), 20_000));
    assert!(net
        .trace()
        .iter()
        .skip(last_b_grant)
        .any(|r| r.is(PacketOpcode::Grant) && r.rpc_id == a_id));
}

/// With D + 1 concurrent senders exactly D are active; the extra message
/// waits in the inactive list and is promoted when a slot frees up.
#[test]
fn overcommitment_boundary() {
    let config = Config {
        round_trip_bytes: 2_000,
        max_granted_messages: 2,
        ..Config::default()
    };
    let net = TestNet::new(1000);
    let clients: Vec<HomaTransport<SimDriver>> = (1..=3)
        .map(|i| HomaTransport::new(net.driver(i as u16), i, config.clone()))
        .collect();
    let server = HomaTransport::new(net.driver(9), 9, config);
    server.set_handler(|_req| async move { b"done".to_vec() });

    let mut slots = Vec::new();
    for client in &clients {
        let sess = client.get_session(9);
        let (notifier, slot) = notifier();
        sess.send_request(random_payload(30_000), Vec::new(), notifier);
        slots.push(slot);
    }

    let all: Vec<&HomaTransport<SimDriver>> = clients.iter().chain(Some(&server)).collect();
    assert!(run_until(
        &all,
        || server.active_message_count() == 2 && server.inactive_message_count() == 1,
        5000
    ));

    // Promotion on completion lets every sender finish.
    assert!(run_until(
        &all,
        || slots.iter().all(|s| s.borrow().is_some()),
        20_000
    ));
    for slot in &slots {
        assert_eq!(slot.borrow().clone().unwrap(), Ok(b"done".to_vec()));
    }
}
