use super::*;
use crate::forwarder::{ForwardingTable, RouterHandle, SharedTable};
use crate::packet::Protocol;
use std::collections::HashSet;
use std::sync::{Mutex, PoisonError};
use tokio::sync::mpsc;

fn addr(s: &str) -> OverlayAddr {
    s.parse().unwrap()
}

fn prefix(s: &str) -> Prefix {
    s.parse().unwrap()
}

/// A router core wired to hand-held channel ends, so tests can inject
/// protocol packets and observe everything the router sends.
struct Rig {
    core: RouterCore,
    /// Packets the router handed to the forwarder, with their out links.
    sent: mpsc::Receiver<(Packet, usize)>,
    /// Injects packets as if the forwarder delivered them.
    inbound: mpsc::Sender<(Packet, usize)>,
    table: SharedTable,
}

fn make_rig(my_ip: &str, prefixes: &[&str], peers: &[(&str, f64)], en_fa: bool) -> Rig {
    let (from_rtr_tx, from_rtr_rx) = mpsc::channel(crate::QUEUE_CAPACITY);
    let (to_rtr_tx, to_rtr_rx) = mpsc::channel(crate::QUEUE_CAPACITY);
    let table: SharedTable = Arc::new(Mutex::new(ForwardingTable::new()));

    let handle = RouterHandle {
        from_rtr: from_rtr_tx,
        to_rtr: to_rtr_rx,
        table: table.clone(),
        debug: 0,
        t0: Instant::now(),
    };

    let neighbors: Vec<NeighborInfo> = peers
        .iter()
        .map(|(ip, delay)| NeighborInfo {
            overlay_ip: addr(ip),
            host_ip: "127.0.0.1".parse().unwrap(),
            delay: *delay,
        })
        .collect();

    let core = RouterCore::new(
        addr(my_ip),
        handle,
        prefixes.iter().map(|p| prefix(p)).collect(),
        &neighbors,
        0,
        en_fa,
    );

    Rig {
        core,
        sent: from_rtr_rx,
        inbound: to_rtr_tx,
        table,
    }
}

impl Rig {
    fn drain(&mut self) -> Vec<(Packet, usize)> {
        let mut out = Vec::new();
        while let Ok(pair) = self.sent.try_recv() {
            out.push(pair);
        }
        out
    }

    async fn inject(&mut self, msg: ControlMsg, src: &str, link: usize) {
        let packet = Packet::control(addr(src), self.core.my_ip, msg.to_payload());
        self.inbound.send((packet, link)).await.unwrap();
        self.core.handle_incoming().await;
    }

    fn fwd_lookup(&self, ip: &str) -> Option<usize> {
        self.table
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .lookup(addr(ip))
    }
}

fn parse(packet: &Packet) -> ControlMsg {
    ControlMsg::parse(&packet.payload).expect("router sent an unparseable payload")
}

// ---------------------------------------------------------------------------
// hello rounds and liveness
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_hello_round_probes_every_link() {
    let mut rig = make_rig("1.1.0.1", &[], &[("1.2.0.1", 0.01), ("1.3.0.1", 0.05)], false);
    rig.core.now = 5.0;

    rig.core.send_hellos().await;

    let sent = rig.drain();
    assert_eq!(sent.len(), 2);
    for (i, (packet, link)) in sent.iter().enumerate() {
        assert_eq!(*link, i);
        assert_eq!(packet.protocol, Protocol::Control);
        assert_eq!(packet.dest, rig.core.links[i].peer_ip);
        assert_eq!(parse(packet), ControlMsg::Hello { timestamp: 5.0 });
    }
    assert!(rig.core.links.iter().all(|l| !l.got_reply));
}

#[tokio::test]
async fn test_silent_link_counts_down_and_invalidates_routes() {
    let mut rig = make_rig("1.1.0.1", &[], &[("1.2.0.1", 0.01), ("1.3.0.1", 0.05)], true);
    rig.core.routes.add(Route {
        pfx: prefix("1.2.0.0/16"),
        timestamp: 0.5,
        cost: 0.01,
        path: vec![addr("1.1.0.1"), addr("1.2.0.1")],
        out_link: 0,
        valid: true,
    });

    // round 1 clears the initial got_reply; rounds 2..4 count 3 -> 2 -> 1 -> 0
    for round in 1..=4 {
        rig.core.now = round as f64;
        rig.core.send_hellos().await;
        // link 1 keeps answering
        rig.core.links[1].got_reply = true;
    }

    assert!(rig.core.links[0].is_down());
    assert_eq!(rig.core.links[1].hello_state, HELLO_STATE_UP);
    let route = rig.core.routes.lookup(&prefix("1.2.0.0/16")).unwrap();
    assert!(!route.valid);

    // the failure advert went to the surviving link only
    let fadverts: Vec<_> = rig
        .drain()
        .into_iter()
        .filter(|(p, _)| matches!(parse(p), ControlMsg::LinkFailure { .. }))
        .collect();
    assert_eq!(fadverts.len(), 1);
    let (packet, link) = &fadverts[0];
    assert_eq!(*link, 1);
    match parse(packet) {
        ControlMsg::LinkFailure { from, to, path, .. } => {
            assert_eq!(from, addr("1.1.0.1"));
            assert_eq!(to, addr("1.2.0.1"));
            assert_eq!(path, vec![addr("1.1.0.1")]);
        }
        other => panic!("expected fadvert, got {:?}", other),
    }
}

#[tokio::test]
async fn test_hello_is_echoed_with_original_timestamp() {
    let mut rig = make_rig("1.1.0.1", &[], &[("1.2.0.1", 0.01)], false);
    rig.core.now = 7.0;

    rig.inject(ControlMsg::Hello { timestamp: 6.25 }, "1.2.0.1", 0)
        .await;

    let sent = rig.drain();
    assert_eq!(sent.len(), 1);
    let (packet, link) = &sent[0];
    assert_eq!(*link, 0);
    assert_eq!(packet.dest, addr("1.2.0.1"));
    assert_eq!(parse(packet), ControlMsg::HelloReply { timestamp: 6.25 });
}

#[tokio::test]
async fn test_hello_reply_applies_ewma() {
    // hello sent at 10.000, reply processed at 10.040: sample 0.020,
    // cost 0.1*0.020 + 0.9*0.10 = 0.092
    let mut rig = make_rig("1.1.0.1", &[], &[("1.2.0.1", 0.10)], false);
    rig.core.links[0].got_reply = false;
    rig.core.links[0].hello_state = 1;
    rig.core.now = 10.040;

    rig.inject(ControlMsg::HelloReply { timestamp: 10.0 }, "1.2.0.1", 0)
        .await;

    let link = &rig.core.links[0];
    assert!((link.cost - 0.092).abs() < 1e-9);
    assert!(link.got_reply);
    assert_eq!(link.hello_state, HELLO_STATE_UP);
    assert!(rig.drain().is_empty());
}

// ---------------------------------------------------------------------------
// advertisement handling
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_advert_installs_route_and_forwarding_entry() {
    let mut rig = make_rig("1.1.0.1", &[], &[("1.2.0.1", 0.01), ("1.3.0.1", 0.05)], false);
    rig.core.now = 5.0;

    rig.inject(
        ControlMsg::Advert {
            prefix: prefix("1.2.0.0/16"),
            timestamp: 4.0,
            cost: 0.0,
            path: vec![addr("1.2.0.1")],
        },
        "1.2.0.1",
        0,
    )
    .await;

    let route = rig.core.routes.lookup(&prefix("1.2.0.0/16")).unwrap();
    assert!(route.valid);
    assert_eq!(route.out_link, 0);
    assert_eq!(route.path, vec![addr("1.1.0.1"), addr("1.2.0.1")]);
    assert!((route.cost - 0.01).abs() < 1e-12);
    assert_eq!(route.timestamp, 5.0);

    assert_eq!(rig.fwd_lookup("1.2.9.9"), Some(0));

    // split horizon: re-advertised only toward 1.3.0.1
    let sent = rig.drain();
    assert_eq!(sent.len(), 1);
    let (packet, link) = &sent[0];
    assert_eq!(*link, 1);
    assert_eq!(packet.dest, addr("1.3.0.1"));
    match parse(packet) {
        ControlMsg::Advert { prefix: p, cost, path, .. } => {
            assert_eq!(p, prefix("1.2.0.0/16"));
            assert!((cost - 0.01).abs() < 1e-9);
            assert_eq!(path, vec![addr("1.1.0.1"), addr("1.2.0.1")]);
        }
        other => panic!("expected advert, got {:?}", other),
    }
}

#[tokio::test]
async fn test_looped_advert_is_dropped() {
    let mut rig = make_rig("1.1.0.1", &[], &[("1.2.0.1", 0.01)], false);

    rig.inject(
        ControlMsg::Advert {
            prefix: prefix("1.4.0.0/16"),
            timestamp: 1.0,
            cost: 0.0,
            path: vec![addr("1.2.0.1"), addr("1.1.0.1"), addr("1.4.0.1")],
        },
        "1.2.0.1",
        0,
    )
    .await;

    assert!(rig.core.routes.is_empty());
    assert!(rig.drain().is_empty());
}

#[tokio::test]
async fn test_advert_on_dead_link_is_dropped() {
    let mut rig = make_rig("1.1.0.1", &[], &[("1.2.0.1", 0.01)], false);
    rig.core.links[0].hello_state = 0;

    rig.inject(
        ControlMsg::Advert {
            prefix: prefix("1.2.0.0/16"),
            timestamp: 1.0,
            cost: 0.0,
            path: vec![addr("1.2.0.1")],
        },
        "1.2.0.1",
        0,
    )
    .await;

    assert!(rig.core.routes.is_empty());
    assert!(rig.drain().is_empty());
}

#[tokio::test]
async fn test_split_horizon_spares_only_the_sender() {
    let mut rig = make_rig(
        "1.1.0.1",
        &[],
        &[("1.2.0.1", 0.01), ("1.3.0.1", 0.01), ("1.4.0.1", 0.01)],
        false,
    );
    rig.core.now = 2.0;

    rig.inject(
        ControlMsg::Advert {
            prefix: prefix("1.2.0.0/16"),
            timestamp: 1.0,
            cost: 0.0,
            path: vec![addr("1.2.0.1")],
        },
        "1.2.0.1",
        0,
    )
    .await;

    let links: Vec<usize> = rig.drain().into_iter().map(|(_, link)| link).collect();
    assert_eq!(links, vec![1, 2]);
}

#[tokio::test]
async fn test_cheaper_route_replaces_and_moves_link() {
    let mut rig = make_rig("1.1.0.1", &[], &[("1.2.0.1", 0.10), ("1.3.0.1", 0.01)], false);
    rig.core.now = 5.0;

    rig.inject(
        ControlMsg::Advert {
            prefix: prefix("1.4.0.0/16"),
            timestamp: 4.0,
            cost: 0.0,
            path: vec![addr("1.2.0.1"), addr("1.4.0.1")],
        },
        "1.2.0.1",
        0,
    )
    .await;
    assert_eq!(rig.fwd_lookup("1.4.9.9"), Some(0));
    rig.drain();

    // a much cheaper path through 1.3.0.1 arrives
    rig.core.now = 6.0;
    rig.inject(
        ControlMsg::Advert {
            prefix: prefix("1.4.0.0/16"),
            timestamp: 5.5,
            cost: 0.0,
            path: vec![addr("1.3.0.1"), addr("1.4.0.1")],
        },
        "1.3.0.1",
        1,
    )
    .await;

    let route = rig.core.routes.lookup(&prefix("1.4.0.0/16")).unwrap();
    assert_eq!(route.out_link, 1);
    assert_eq!(
        route.path,
        vec![addr("1.1.0.1"), addr("1.3.0.1"), addr("1.4.0.1")]
    );
    assert_eq!(rig.fwd_lookup("1.4.9.9"), Some(1));

    // the improvement is re-advertised away from its sender
    let sent = rig.drain();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].1, 0);
}

#[tokio::test]
async fn test_marginal_route_is_ignored_silently() {
    let mut rig = make_rig("1.1.0.1", &[], &[("1.2.0.1", 0.10), ("1.3.0.1", 0.095)], false);
    rig.core.now = 5.0;

    rig.inject(
        ControlMsg::Advert {
            prefix: prefix("1.4.0.0/16"),
            timestamp: 4.0,
            cost: 0.0,
            path: vec![addr("1.2.0.1"), addr("1.4.0.1")],
        },
        "1.2.0.1",
        0,
    )
    .await;
    rig.drain();

    // 0.095 is not <= 0.9 * 0.10 and not 20s newer: keep the old route
    rig.core.now = 6.0;
    rig.inject(
        ControlMsg::Advert {
            prefix: prefix("1.4.0.0/16"),
            timestamp: 5.5,
            cost: 0.0,
            path: vec![addr("1.3.0.1"), addr("1.4.0.1")],
        },
        "1.3.0.1",
        1,
    )
    .await;

    let route = rig.core.routes.lookup(&prefix("1.4.0.0/16")).unwrap();
    assert_eq!(route.out_link, 0);
    assert_eq!(rig.fwd_lookup("1.4.9.9"), Some(0));
    assert!(rig.drain().is_empty());
}

#[tokio::test]
async fn test_periodic_adverts_go_everywhere() {
    let mut rig = make_rig(
        "1.1.0.1",
        &["1.1.0.0/16", "10.0.0.0/8"],
        &[("1.2.0.1", 0.01), ("1.3.0.1", 0.05)],
        false,
    );
    rig.core.now = 10.0;

    rig.core.send_adverts().await;

    // two prefixes on two links, no split horizon for local prefixes
    let sent = rig.drain();
    assert_eq!(sent.len(), 4);
    for (packet, _) in &sent {
        match parse(packet) {
            ControlMsg::Advert { cost, path, .. } => {
                assert_eq!(cost, 0.0);
                assert_eq!(path, vec![addr("1.1.0.1")]);
            }
            other => panic!("expected advert, got {:?}", other),
        }
    }
}

// ---------------------------------------------------------------------------
// failure advertisements
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_fadvert_invalidates_and_relays() {
    let mut rig = make_rig("1.1.0.1", &[], &[("1.2.0.1", 0.01), ("1.3.0.1", 0.05)], false);
    rig.core.routes.add(Route {
        pfx: prefix("1.4.0.0/16"),
        timestamp: 1.0,
        cost: 0.05,
        path: vec![addr("1.1.0.1"), addr("1.2.0.1"), addr("1.4.0.1")],
        out_link: 0,
        valid: true,
    });
    rig.core.now = 9.0;

    rig.inject(
        ControlMsg::LinkFailure {
            from: addr("1.2.0.1"),
            to: addr("1.4.0.1"),
            timestamp: 8.5,
            path: vec![addr("1.2.0.1")],
        },
        "1.2.0.1",
        0,
    )
    .await;

    assert!(!rig.core.routes.lookup(&prefix("1.4.0.0/16")).unwrap().valid);

    // relayed with ourselves prepended, away from the sender, re-stamped
    let sent = rig.drain();
    assert_eq!(sent.len(), 1);
    let (packet, link) = &sent[0];
    assert_eq!(*link, 1);
    match parse(packet) {
        ControlMsg::LinkFailure {
            from,
            to,
            timestamp,
            path,
        } => {
            assert_eq!(from, addr("1.2.0.1"));
            assert_eq!(to, addr("1.4.0.1"));
            assert_eq!(timestamp, 9.0);
            assert_eq!(path, vec![addr("1.1.0.1"), addr("1.2.0.1")]);
        }
        other => panic!("expected fadvert, got {:?}", other),
    }
}

#[tokio::test]
async fn test_fadvert_without_matching_routes_is_not_relayed() {
    let mut rig = make_rig("1.1.0.1", &[], &[("1.2.0.1", 0.01), ("1.3.0.1", 0.05)], false);

    rig.inject(
        ControlMsg::LinkFailure {
            from: addr("9.9.0.1"),
            to: addr("9.9.0.2"),
            timestamp: 1.0,
            path: vec![addr("1.2.0.1")],
        },
        "1.2.0.1",
        0,
    )
    .await;

    assert!(rig.drain().is_empty());
}

#[tokio::test]
async fn test_looped_fadvert_is_dropped() {
    let mut rig = make_rig("1.1.0.1", &[], &[("1.2.0.1", 0.01)], false);
    rig.core.routes.add(Route {
        pfx: prefix("1.4.0.0/16"),
        timestamp: 1.0,
        cost: 0.05,
        path: vec![addr("1.1.0.1"), addr("1.2.0.1"), addr("1.4.0.1")],
        out_link: 0,
        valid: true,
    });

    rig.inject(
        ControlMsg::LinkFailure {
            from: addr("1.2.0.1"),
            to: addr("1.4.0.1"),
            timestamp: 1.0,
            path: vec![addr("1.2.0.1"), addr("1.1.0.1")],
        },
        "1.2.0.1",
        0,
    )
    .await;

    // loop: not even the invalidation happens
    assert!(rig.core.routes.lookup(&prefix("1.4.0.0/16")).unwrap().valid);
    assert!(rig.drain().is_empty());
}

// ---------------------------------------------------------------------------
// multi-router convergence over a simulated wire
// ---------------------------------------------------------------------------

/// Delivers every queued packet along the active edges until the network
/// is quiescent. An edge maps (node, out link) to (node, in link);
/// packets on severed edges are dropped.
async fn pump(nodes: &mut [Rig], edges: &[((usize, usize), (usize, usize))]) {
    loop {
        let mut deliveries = Vec::new();
        for (i, node) in nodes.iter_mut().enumerate() {
            while let Ok((packet, out_link)) = node.sent.try_recv() {
                let hop = edges
                    .iter()
                    .find(|(src, _)| *src == (i, out_link))
                    .map(|&(_, dst)| dst);
                if let Some((dst, in_link)) = hop {
                    deliveries.push((dst, packet, in_link));
                }
            }
        }
        if deliveries.is_empty() {
            break;
        }
        for (dst, packet, in_link) in deliveries {
            nodes[dst].inbound.send((packet, in_link)).await.unwrap();
        }
        for node in nodes.iter_mut() {
            while node.core.fwdr.incoming_pkt() {
                node.core.handle_incoming().await;
            }
        }
    }
}

/// Advance the whole network through one virtual second: hello round on
/// every node, periodic adverts when due, then full packet exchange.
async fn tick(nodes: &mut [Rig], edges: &[((usize, usize), (usize, usize))], t: u32) {
    for node in nodes.iter_mut() {
        node.core.now = t as f64;
    }
    for node in nodes.iter_mut() {
        node.core.send_hellos().await;
    }
    if t % 10 == 0 {
        for node in nodes.iter_mut() {
            node.core.send_adverts().await;
        }
    }
    pump(nodes, edges).await;
}

fn assert_route_invariants(rig: &Rig) {
    for route in rig.core.routes.iter() {
        assert_eq!(route.path[0], rig.core.my_ip, "path must start at the router");
        let unique: HashSet<_> = route.path.iter().collect();
        assert_eq!(unique.len(), route.path.len(), "path contains a loop");
        assert!(route.cost >= 0.0);
    }
}

#[tokio::test]
async fn test_three_router_chain_converges() {
    // A (1.1.0.1) -- B (1.2.0.1) -- C (1.3.0.1)
    let mut nodes = vec![
        make_rig("1.1.0.1", &["1.1.0.0/16"], &[("1.2.0.1", 0.01)], true),
        make_rig(
            "1.2.0.1",
            &["1.2.0.0/16"],
            &[("1.1.0.1", 0.01), ("1.3.0.1", 0.02)],
            true,
        ),
        make_rig("1.3.0.1", &["1.3.0.0/16"], &[("1.2.0.1", 0.02)], true),
    ];
    let edges = [
        ((0, 0), (1, 0)),
        ((1, 0), (0, 0)),
        ((1, 1), (2, 0)),
        ((2, 0), (1, 1)),
    ];

    for t in 1..=12 {
        tick(&mut nodes, &edges, t).await;
    }

    // every router has a valid route to every remote prefix
    let a_to_b = nodes[0].core.routes.lookup(&prefix("1.2.0.0/16")).unwrap();
    assert!(a_to_b.valid);
    assert_eq!(a_to_b.path, vec![addr("1.1.0.1"), addr("1.2.0.1")]);

    let a_to_c = nodes[0].core.routes.lookup(&prefix("1.3.0.0/16")).unwrap();
    assert!(a_to_c.valid);
    assert_eq!(
        a_to_c.path,
        vec![addr("1.1.0.1"), addr("1.2.0.1"), addr("1.3.0.1")]
    );

    let c_to_a = nodes[2].core.routes.lookup(&prefix("1.1.0.0/16")).unwrap();
    assert!(c_to_a.valid);
    assert_eq!(
        c_to_a.path,
        vec![addr("1.3.0.1"), addr("1.2.0.1"), addr("1.1.0.1")]
    );

    assert!(nodes[1].core.routes.lookup(&prefix("1.1.0.0/16")).unwrap().valid);
    assert!(nodes[1].core.routes.lookup(&prefix("1.3.0.0/16")).unwrap().valid);

    // forwarding tables agree with the routes
    assert_eq!(nodes[0].fwd_lookup("1.3.9.9"), Some(0));
    assert_eq!(nodes[1].fwd_lookup("1.1.9.9"), Some(0));
    assert_eq!(nodes[1].fwd_lookup("1.3.9.9"), Some(1));
    assert_eq!(nodes[2].fwd_lookup("1.1.9.9"), Some(0));

    for node in &nodes {
        assert_route_invariants(node);
    }
}

#[tokio::test]
async fn test_link_failure_propagates_through_the_chain() {
    let mut nodes = vec![
        make_rig("1.1.0.1", &["1.1.0.0/16"], &[("1.2.0.1", 0.01)], true),
        make_rig(
            "1.2.0.1",
            &["1.2.0.0/16"],
            &[("1.1.0.1", 0.01), ("1.3.0.1", 0.02)],
            true,
        ),
        make_rig("1.3.0.1", &["1.3.0.0/16"], &[("1.2.0.1", 0.02)], true),
    ];
    let full = [
        ((0, 0), (1, 0)),
        ((1, 0), (0, 0)),
        ((1, 1), (2, 0)),
        ((2, 0), (1, 1)),
    ];

    for t in 1..=12 {
        tick(&mut nodes, &full, t).await;
    }
    assert!(nodes[2].core.routes.lookup(&prefix("1.1.0.0/16")).unwrap().valid);

    // sever A -- B; three silent hello rounds take the link down on both
    let severed = [((1, 1), (2, 0)), ((2, 0), (1, 1))];
    for t in 13..=17 {
        tick(&mut nodes, &severed, t).await;
    }

    assert!(nodes[0].core.links[0].is_down());
    assert!(nodes[1].core.links[0].is_down());
    assert!(!nodes[1].core.links[1].is_down());

    // both endpoints invalidated their routes through the dead link
    for pfx in ["1.2.0.0/16", "1.3.0.0/16"] {
        assert!(!nodes[0].core.routes.lookup(&prefix(pfx)).unwrap().valid);
    }
    assert!(!nodes[1].core.routes.lookup(&prefix("1.1.0.0/16")).unwrap().valid);

    // B's failure advertisement reached C, whose path crossed B -> A
    assert!(!nodes[2].core.routes.lookup(&prefix("1.1.0.0/16")).unwrap().valid);
    assert!(nodes[2].core.routes.lookup(&prefix("1.2.0.0/16")).unwrap().valid);

    for node in &nodes {
        assert_route_invariants(node);
    }
}
