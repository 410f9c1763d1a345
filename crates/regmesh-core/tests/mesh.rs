//! Multi-node protocol scenarios over the simulated air.

use regmesh_core::{
    Completion, MeshConfig, Node, Packet, PacketType, RadioConfig, Radio, Register, RxStatus,
    SetOutcome, SharedAir, SimRadio, Status, PACKET_SIZE,
};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

type StatusSlot = Arc<Mutex<Option<Status>>>;

fn make_node(air: &SharedAir, unique_id: u16) -> Node<SimRadio> {
    let mut node = Node::with_unique_id(air.attach(), MeshConfig::fast(), unique_id);
    node.initialize(&RadioConfig::default()).unwrap();
    node
}

fn capture() -> (StatusSlot, Completion<SimRadio>) {
    let slot: StatusSlot = Arc::new(Mutex::new(None));
    let out = Arc::clone(&slot);
    let completion = Completion::callback(move |_, status| {
        *out.lock().unwrap() = Some(status);
    });
    (slot, completion)
}

/// Poll every node until the slot fills or the deadline passes.
fn pump_until_status(
    nodes: &mut [&mut Node<SimRadio>],
    slot: &StatusSlot,
    timeout: Duration,
) -> Option<Status> {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        for node in nodes.iter_mut() {
            node.update().unwrap();
        }
        if let Some(status) = *slot.lock().unwrap() {
            return Some(status);
        }
        thread::sleep(Duration::from_micros(100));
    }
    None
}

/// Poll every node for a fixed interval.
fn pump(nodes: &mut [&mut Node<SimRadio>], duration: Duration) {
    let deadline = Instant::now() + duration;
    while Instant::now() < deadline {
        for node in nodes.iter_mut() {
            node.update().unwrap();
        }
        thread::sleep(Duration::from_micros(100));
    }
}

#[test]
fn test_simultaneous_joiners_resolve_by_unique_id() {
    let air = SharedAir::new();
    let mut high = make_node(&air, 0x7000);
    let mut low = make_node(&air, 0x2000);

    let (high_slot, high_done) = capture();
    let (low_slot, low_done) = capture();
    high.join(1, high_done).unwrap();
    low.join(1, low_done).unwrap();

    let status = pump_until_status(&mut [&mut high, &mut low], &low_slot, Duration::from_secs(2));
    assert_eq!(status, Some(Status::Ok));
    pump_until_status(&mut [&mut high, &mut low], &high_slot, Duration::from_secs(2));

    assert_eq!(high.node_id(), 1, "higher unique id keeps the contested id");
    assert_eq!(low.node_id(), 2, "lower unique id steps to the next id");
    assert!(high.on_mesh() && low.on_mesh());
}

#[test]
fn test_join_fails_with_mesh_full_at_the_top_of_the_id_space() {
    let air = SharedAir::new();
    let mut winner = make_node(&air, 0x9000);
    let mut loser = make_node(&air, 0x1000);

    let (_, winner_done) = capture();
    let (loser_slot, loser_done) = capture();
    winner.join(255, winner_done).unwrap();
    loser.join(255, loser_done).unwrap();

    let status = pump_until_status(
        &mut [&mut winner, &mut loser],
        &loser_slot,
        Duration::from_secs(2),
    );
    assert_eq!(status, Some(Status::MeshFull));
    assert_eq!(loser.state(), regmesh_core::State::NotJoined);
    assert_eq!(loser.node_id(), 0);
}

#[test]
fn test_established_nodes_resolve_an_id_collision() {
    let air = SharedAir::new();
    let partition_a = RadioConfig {
        mesh_id: 1,
        ..RadioConfig::default()
    };
    let partition_b = RadioConfig {
        mesh_id: 2,
        ..RadioConfig::default()
    };

    // two nodes establish id 1 out of earshot of each other
    let mut keeper = Node::with_unique_id(air.attach(), MeshConfig::fast(), 0x9000);
    keeper.initialize(&partition_a).unwrap();
    keeper.join_blocking(1).unwrap();

    let mut mover = Node::with_unique_id(air.attach(), MeshConfig::fast(), 0x3000);
    mover.initialize(&partition_b).unwrap();
    mover.join_blocking(1).unwrap();

    // the partitions merge; the mover's next transmission draws a
    // conflict notice and, holding the lower unique id, it must move
    mover.initialize(&partition_a).unwrap();
    let (slot, done) = capture();
    mover.ping(done).unwrap();

    let status = pump_until_status(&mut [&mut keeper, &mut mover], &slot, Duration::from_secs(2));
    assert_eq!(status, Some(Status::Ok));
    assert_eq!(keeper.node_id(), 1);
    assert_eq!(mover.node_id(), 2);
    // the interrupted ping resumed under the new id and heard the keeper
    assert!(mover.presence().contains(1));
}

#[test]
fn test_ping_collects_exactly_the_nodes_that_answered() {
    let air = SharedAir::new();
    let mut pinger = make_node(&air, 0x1111);
    let mut peer_three = make_node(&air, 0x2222);
    let mut peer_seven = make_node(&air, 0x3333);

    pinger.join_blocking(1).unwrap();
    peer_three.join_blocking(3).unwrap();
    peer_seven.join_blocking(7).unwrap();

    let (slot, done) = capture();
    pinger.ping(done).unwrap();
    let status = pump_until_status(
        &mut [&mut pinger, &mut peer_three, &mut peer_seven],
        &slot,
        Duration::from_secs(2),
    );

    assert_eq!(status, Some(Status::Ok));
    assert_eq!(pinger.presence().ids(), vec![3, 7]);
}

#[test]
fn test_replayed_requests_produce_one_logical_response() {
    let air = SharedAir::new();
    let mut server = make_node(&air, 0x4444);
    server
        .add_register(Register::with_value("a", b"1").unwrap())
        .unwrap();
    server
        .add_register(Register::with_value("b", b"2").unwrap())
        .unwrap();
    server.join_blocking(9).unwrap();

    // a bare radio injects the same request three times
    let mut tester = air.attach();
    tester.initialize(&RadioConfig::default()).unwrap();
    tester.listen(PACKET_SIZE);
    let mut request = Packet::with_header(PacketType::GetNumRegisters, 9, 99, 0x4242);
    request.set_target(9);
    for _ in 0..3 {
        tester.write(request.as_bytes()).unwrap();
    }

    let mut response_seqs = HashSet::new();
    let mut responses = 0;
    let deadline = Instant::now() + Duration::from_millis(200);
    while Instant::now() < deadline {
        server.update().unwrap();
        while tester.check_rx_waiting() == RxStatus::DataWaiting {
            let mut buf = [0u8; PACKET_SIZE];
            tester.read(&mut buf).unwrap();
            tester.listen(PACKET_SIZE);
            let pkt = Packet::from_bytes(&buf).unwrap();
            if pkt.packet_type() == Some(PacketType::NumRegisters) {
                assert_eq!(pkt.register_count(), 2);
                response_seqs.insert(pkt.seq());
                responses += 1;
            }
        }
        thread::sleep(Duration::from_micros(100));
    }

    assert!(responses >= 1, "the request deserves an answer");
    assert_eq!(
        response_seqs.len(),
        1,
        "replays and re-emissions must share one sequence number"
    );
}

#[test]
fn test_unanswered_requests_retransmit_verbatim() {
    let air = SharedAir::new();
    let mut monitor = air.attach();
    monitor.initialize(&RadioConfig::default()).unwrap();
    monitor.listen(PACKET_SIZE);

    let mut client = make_node(&air, 0x6700);
    client.join_blocking(2).unwrap();

    // the claim is re-broadcast for as long as the accept window runs
    let mut claims = 0;
    while monitor.check_rx_waiting() == RxStatus::DataWaiting {
        let mut buf = [0u8; PACKET_SIZE];
        monitor.read(&mut buf).unwrap();
        monitor.listen(PACKET_SIZE);
        let pkt = Packet::from_bytes(&buf).unwrap();
        if pkt.packet_type() == Some(PacketType::Join) {
            claims += 1;
        }
    }
    assert!(claims >= 2, "expected repeated join claims, saw {}", claims);

    // nobody serves id 9, so the request stays unanswered and must be
    // re-sent bit for bit until the operation gives up
    let (slot, done) = capture();
    client.get_num_registers(9, None, done).unwrap();

    let mut copies: Vec<[u8; PACKET_SIZE]> = Vec::new();
    let deadline = Instant::now() + Duration::from_millis(500);
    while Instant::now() < deadline && slot.lock().unwrap().is_none() {
        client.update().unwrap();
        while monitor.check_rx_waiting() == RxStatus::DataWaiting {
            let mut buf = [0u8; PACKET_SIZE];
            monitor.read(&mut buf).unwrap();
            monitor.listen(PACKET_SIZE);
            let pkt = Packet::from_bytes(&buf).unwrap();
            if pkt.packet_type() == Some(PacketType::GetNumRegisters) {
                copies.push(buf);
            }
        }
        thread::sleep(Duration::from_micros(100));
    }

    let outcome = *slot.lock().unwrap();
    assert_eq!(outcome, Some(Status::Timeout));
    assert!(copies.len() >= 2, "expected retransmits, saw {}", copies.len());
    for copy in &copies[1..] {
        assert_eq!(copy, &copies[0], "retransmits must repeat the request verbatim");
    }
}

#[test]
fn test_relays_re_emit_foreign_frames_with_the_hop_bumped() {
    let air = SharedAir::new();
    let mut relay = make_node(&air, 0x5555);
    relay.join_blocking(4).unwrap();

    let mut tester = air.attach();
    tester.initialize(&RadioConfig::default()).unwrap();
    tester.listen(PACKET_SIZE);
    let ping = Packet::with_header(PacketType::Ping, 2, 50, 0x5050);
    tester.write(ping.as_bytes()).unwrap();

    let mut saw_relay = false;
    let mut saw_pong = false;
    let deadline = Instant::now() + Duration::from_millis(200);
    while Instant::now() < deadline && !(saw_relay && saw_pong) {
        relay.update().unwrap();
        while tester.check_rx_waiting() == RxStatus::DataWaiting {
            let mut buf = [0u8; PACKET_SIZE];
            tester.read(&mut buf).unwrap();
            tester.listen(PACKET_SIZE);
            let pkt = Packet::from_bytes(&buf).unwrap();
            match pkt.packet_type() {
                Some(PacketType::Ping) => {
                    assert_eq!(pkt.sender(), 50, "relays keep the original sender");
                    assert_eq!(pkt.unique_id(), 0x5050);
                    assert_eq!(pkt.seq(), 2);
                    assert_eq!(pkt.hop(), 1, "one relay adds one hop");
                    saw_relay = true;
                }
                Some(PacketType::Pong) => {
                    assert_eq!(pkt.sender(), 4);
                    saw_pong = true;
                }
                _ => {}
            }
        }
        thread::sleep(Duration::from_micros(100));
    }

    assert!(saw_pong, "the ping deserved a pong");
    assert!(saw_relay, "the ping should also have been relayed");
}

#[test]
fn test_frames_at_the_hop_ceiling_are_answered_but_not_relayed() {
    let air = SharedAir::new();
    let mut relay = make_node(&air, 0x5656);
    relay.join_blocking(4).unwrap();

    let mut tester = air.attach();
    tester.initialize(&RadioConfig::default()).unwrap();
    tester.listen(PACKET_SIZE);
    let mut ping = Packet::with_header(PacketType::Ping, 6, 50, 0x5050);
    ping.set_hop(15);
    tester.write(ping.as_bytes()).unwrap();

    let mut saw_pong = false;
    let deadline = Instant::now() + Duration::from_millis(150);
    while Instant::now() < deadline {
        relay.update().unwrap();
        while tester.check_rx_waiting() == RxStatus::DataWaiting {
            let mut buf = [0u8; PACKET_SIZE];
            tester.read(&mut buf).unwrap();
            tester.listen(PACKET_SIZE);
            let pkt = Packet::from_bytes(&buf).unwrap();
            match pkt.packet_type() {
                Some(PacketType::Ping) => {
                    panic!("a frame at the hop ceiling must not be relayed")
                }
                Some(PacketType::Pong) => saw_pong = true,
                _ => {}
            }
        }
        thread::sleep(Duration::from_micros(100));
    }
    assert!(saw_pong, "the ping itself still deserves an answer");
}

#[test]
fn test_unknown_type_frames_are_dropped_not_relayed() {
    let air = SharedAir::new();
    let mut relay = make_node(&air, 0x5757);
    relay.join_blocking(4).unwrap();

    let mut tester = air.attach();
    tester.initialize(&RadioConfig::default()).unwrap();
    tester.listen(PACKET_SIZE);

    // a plausible header under a type byte the protocol does not define
    let mut frame = [0u8; PACKET_SIZE];
    frame.copy_from_slice(Packet::with_header(PacketType::Ping, 2, 50, 0x5050).as_bytes());
    frame[0] = 0x3F;
    tester.write(&frame).unwrap();

    let deadline = Instant::now() + Duration::from_millis(150);
    while Instant::now() < deadline {
        relay.update().unwrap();
        while tester.check_rx_waiting() == RxStatus::DataWaiting {
            let mut buf = [0u8; PACKET_SIZE];
            tester.read(&mut buf).unwrap();
            tester.listen(PACKET_SIZE);
            assert_ne!(buf[0], 0x3F, "undefined frame types must not be relayed");
        }
        thread::sleep(Duration::from_micros(100));
    }

    // the node shrugged the garbage off and still answers real traffic
    let ping = Packet::with_header(PacketType::Ping, 3, 50, 0x5050);
    tester.write(ping.as_bytes()).unwrap();
    let mut saw_pong = false;
    let deadline = Instant::now() + Duration::from_millis(150);
    while Instant::now() < deadline && !saw_pong {
        relay.update().unwrap();
        while tester.check_rx_waiting() == RxStatus::DataWaiting {
            let mut buf = [0u8; PACKET_SIZE];
            tester.read(&mut buf).unwrap();
            tester.listen(PACKET_SIZE);
            let pkt = Packet::from_bytes(&buf).unwrap();
            if pkt.packet_type() == Some(PacketType::Pong) {
                saw_pong = true;
            }
        }
        thread::sleep(Duration::from_micros(100));
    }
    assert!(saw_pong, "well-formed frames still deserve answers");
}

#[test]
fn test_get_register_fetches_a_value_by_name_alone() {
    let air = SharedAir::new();
    let mut server = make_node(&air, 0x6001);
    server
        .add_register(Register::with_value("temp", b"21.5").unwrap())
        .unwrap();
    server.join_blocking(1).unwrap();

    let mut client = make_node(&air, 0x6002);
    client.join_blocking(2).unwrap();

    let (slot, done) = capture();
    client
        .get_register(Register::named("temp").unwrap(), done)
        .unwrap();
    let status = pump_until_status(&mut [&mut server, &mut client], &slot, Duration::from_secs(2));

    assert_eq!(status, Some(Status::Ok));
    assert_eq!(client.op_register().name_str(), Some("temp"));
    assert_eq!(client.op_register().value_bytes(), b"21.5");
}

#[test]
fn test_get_register_serves_a_lazily_computed_value() {
    let air = SharedAir::new();
    let mut server = make_node(&air, 0x6101);
    let reads = Arc::new(Mutex::new(0u32));
    let counter = Arc::clone(&reads);
    server
        .add_register(
            Register::named("uptime")
                .unwrap()
                .on_get(Box::new(move |reg| {
                    *counter.lock().unwrap() += 1;
                    let _ = reg.set_value(b"120s");
                })),
        )
        .unwrap();
    server.join_blocking(1).unwrap();

    let mut client = make_node(&air, 0x6102);
    client.join_blocking(2).unwrap();

    let (slot, done) = capture();
    client
        .get_register(Register::named("uptime").unwrap(), done)
        .unwrap();
    let status = pump_until_status(&mut [&mut server, &mut client], &slot, Duration::from_secs(2));

    assert_eq!(status, Some(Status::Ok));
    assert_eq!(client.op_register().value_bytes(), b"120s");
    assert_eq!(
        *reads.lock().unwrap(),
        1,
        "re-emitted responses reuse the first computed value"
    );
}

#[test]
fn test_set_register_writes_through_to_the_serving_node() {
    let air = SharedAir::new();
    let mut server = make_node(&air, 0x6201);
    server
        .add_register(Register::with_value("mode", b"auto").unwrap())
        .unwrap();
    server.join_blocking(1).unwrap();

    let mut client = make_node(&air, 0x6202);
    client.join_blocking(2).unwrap();

    let (slot, done) = capture();
    client
        .set_register(Register::with_value("mode", b"eco").unwrap(), done)
        .unwrap();
    let status = pump_until_status(&mut [&mut server, &mut client], &slot, Duration::from_secs(2));

    assert_eq!(status, Some(Status::Ok));
    let index = server.find_register(b"mode").unwrap();
    assert_eq!(server.registers()[index].value_bytes(), b"eco");
}

#[test]
fn test_rejected_set_carries_the_reason_back_to_the_writer() {
    let air = SharedAir::new();
    let mut server = make_node(&air, 0x6301);
    server
        .add_register(
            Register::with_value("mode", b"auto")
                .unwrap()
                .on_set(Box::new(|reg, proposed| {
                    if proposed == b"off" {
                        reg.set_error("mode may not be disabled");
                        SetOutcome::Reject
                    } else {
                        SetOutcome::Accept
                    }
                })),
        )
        .unwrap();
    server.join_blocking(1).unwrap();

    let mut client = make_node(&air, 0x6302);
    client.join_blocking(2).unwrap();

    let (slot, done) = capture();
    client
        .set_register(Register::with_value("mode", b"off").unwrap(), done)
        .unwrap();
    let status = pump_until_status(&mut [&mut server, &mut client], &slot, Duration::from_secs(2));

    assert_eq!(status, Some(Status::InvalidRegisterValue));
    assert!(client.op_register().has_error());
    assert_eq!(
        client.op_register().error_str(),
        Some("mode may not be disabled")
    );

    let index = server.find_register(b"mode").unwrap();
    assert_eq!(
        server.registers()[index].value_bytes(),
        b"auto",
        "a rejected write leaves the value alone"
    );
    assert!(
        !server.registers()[index].has_error(),
        "the serving register's error flag is cleared once the ack is away"
    );
}

#[test]
fn test_register_enumeration_walks_count_and_names() {
    let air = SharedAir::new();
    let mut server = make_node(&air, 0x6401);
    server
        .add_register(Register::with_value("alpha", b"1").unwrap())
        .unwrap();
    server
        .add_register(Register::with_value("beta", b"2").unwrap())
        .unwrap();
    server.join_blocking(5).unwrap();
    let server_unique = server.unique_id();

    let mut client = make_node(&air, 0x6402);
    client.join_blocking(2).unwrap();

    let (slot, done) = capture();
    client.get_num_registers(5, None, done).unwrap();
    let status = pump_until_status(&mut [&mut server, &mut client], &slot, Duration::from_secs(2));
    assert_eq!(status, Some(Status::Ok));
    let result = client.num_registers_result().unwrap();
    assert_eq!(result.count, 2);
    assert_eq!(result.node_id, 5);
    assert_eq!(result.unique_id, server_unique);

    let (slot, done) = capture();
    client
        .get_register_name(5, 1, Some(server_unique), done)
        .unwrap();
    let status = pump_until_status(&mut [&mut server, &mut client], &slot, Duration::from_secs(2));
    assert_eq!(status, Some(Status::Ok));
    assert_eq!(client.op_register().name_str(), Some("beta"));

    let (slot, done) = capture();
    client.get_register_name(5, 9, None, done).unwrap();
    let status = pump_until_status(&mut [&mut server, &mut client], &slot, Duration::from_secs(2));
    assert_eq!(status, Some(Status::InvalidRegisterIndex));
}

#[test]
fn test_stale_name_replies_for_another_index_are_discarded() {
    let air = SharedAir::new();
    let mut client = make_node(&air, 0x6600);
    client.join_blocking(2).unwrap();

    let mut impostor = air.attach();
    impostor.initialize(&RadioConfig::default()).unwrap();

    let (slot, done) = capture();
    client.get_register_name(9, 2, None, done).unwrap();

    // a lingering repeat for index 1 lands ahead of the reply that matches
    let mut stale = Packet::with_header(PacketType::RegisterName, 3, 9, 0x7777);
    stale.set_register_index(1);
    assert!(stale.encode_register(&Register::named("stale").unwrap(), false));
    impostor.write(stale.as_bytes()).unwrap();

    let mut wanted = Packet::with_header(PacketType::RegisterName, 4, 9, 0x7777);
    wanted.set_register_index(2);
    assert!(wanted.encode_register(&Register::named("wanted").unwrap(), false));
    impostor.write(wanted.as_bytes()).unwrap();

    let status = pump_until_status(&mut [&mut client], &slot, Duration::from_secs(2));
    assert_eq!(status, Some(Status::Ok));
    assert_eq!(client.op_register().name_str(), Some("wanted"));
}

#[test]
fn test_broadcasts_reach_listeners_once_per_distinct_value() {
    let air = SharedAir::new();
    let mut talker = make_node(&air, 0x6501);
    talker.join_blocking(1).unwrap();

    let mut listener = make_node(&air, 0x6502);
    listener.join_blocking(2).unwrap();

    let heard: Arc<Mutex<Vec<(String, Vec<u8>)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&heard);
    listener.broadcast_listen(Some(Box::new(move |_, reg| {
        sink.lock().unwrap().push((
            reg.name_str().unwrap_or_default().to_string(),
            reg.value_bytes().to_vec(),
        ));
    })));

    talker
        .broadcast(&Register::with_value("alert", b"1").unwrap())
        .unwrap();
    // long enough for every re-emission of the same value to arrive
    pump(&mut [&mut talker, &mut listener], Duration::from_millis(60));

    talker
        .broadcast(&Register::with_value("alert", b"2").unwrap())
        .unwrap();
    pump(&mut [&mut talker, &mut listener], Duration::from_millis(60));

    let log = heard.lock().unwrap();
    assert_eq!(
        log.as_slice(),
        &[
            ("alert".to_string(), b"1".to_vec()),
            ("alert".to_string(), b"2".to_vec()),
        ],
        "repeats of one value collapse to a single delivery"
    );
}

#[test]
fn test_operation_interrupted_by_a_conflict_resumes_and_completes() {
    let air = SharedAir::new();
    let partition_a = RadioConfig {
        mesh_id: 1,
        ..RadioConfig::default()
    };
    let partition_b = RadioConfig {
        mesh_id: 2,
        ..RadioConfig::default()
    };

    // the keeper serves the only copy of "deep" and owns id 1 with the
    // higher unique id
    let mut keeper = Node::with_unique_id(air.attach(), MeshConfig::fast(), 0x9000);
    keeper.initialize(&partition_a).unwrap();
    keeper
        .add_register(Register::with_value("deep", b"value").unwrap())
        .unwrap();
    keeper.join_blocking(1).unwrap();

    let mut mover = Node::with_unique_id(air.attach(), MeshConfig::fast(), 0x3000);
    mover.initialize(&partition_b).unwrap();
    mover.join_blocking(1).unwrap();

    // partitions merge; the mover's read can only succeed after it
    // loses the id tiebreak, rejoins as 2 and replays the request
    mover.initialize(&partition_a).unwrap();
    let (slot, done) = capture();
    mover
        .get_register(Register::named("deep").unwrap(), done)
        .unwrap();

    let status = pump_until_status(&mut [&mut keeper, &mut mover], &slot, Duration::from_secs(2));
    assert_eq!(status, Some(Status::Ok));
    assert_eq!(mover.node_id(), 2);
    assert_eq!(mover.op_register().value_bytes(), b"value");
}
