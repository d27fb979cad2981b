use std::collections::HashSet;

use punch_core::wire::Status;
use punch_services::{ClientError, NegotiatorClient};

use crate::fault::*;
use crate::*;

// ══════════════════════════════════════════════════════════════════════════════
//  Registration
// ══════════════════════════════════════════════════════════════════════════════

/// The acknowledgment echoes the name and the reported private address, and
/// carries the source address the negotiator observed.
#[tokio::test]
async fn test_registration_ack_carries_observed_address() {
    let negotiator = Negotiator::spawn().await.unwrap();
    let mut alice = RawPeer::connect(negotiator.addr).await.unwrap();

    let reported = SocketAddrV4::new(Ipv4Addr::new(192, 168, 1, 20), 4000);
    alice
        .send(&Request::Registration {
            name: "alice".into(),
            local_addr: reported,
        })
        .await
        .unwrap();

    let Reply::Peer(ack) = alice.recv().await.unwrap() else {
        panic!("expected a PeerRecord acknowledgment");
    };
    assert_eq!(ack.name(), "alice");
    assert_eq!(ack.local_addr(), reported);
    assert_eq!(ack.remote_addr(), alice.local);
}

/// A second registration under the same name replaces the first, and offers
/// go to the newer connection.
#[tokio::test]
async fn test_reregistration_relays_latest_record() {
    let negotiator = Negotiator::spawn().await.unwrap();
    let mut first = RawPeer::connect(negotiator.addr).await.unwrap();
    let mut second = RawPeer::connect(negotiator.addr).await.unwrap();
    let mut bob = RawPeer::connect(negotiator.addr).await.unwrap();

    first.register("alice").await.unwrap();
    second.register("alice").await.unwrap();
    bob.register("bob").await.unwrap();

    let reply = bob.request("alice", "bob").await.unwrap();
    let Reply::Peer(alice) = reply else {
        panic!("expected alice's record, got {reply:?}");
    };
    assert_eq!(alice.local_addr(), second.local);

    let Reply::Peer(offer) = second.recv().await.unwrap() else {
        panic!("expected an offer on the newer connection");
    };
    assert_eq!(offer.name(), "bob");
    assert!(first.recv_quiet().await.unwrap().is_none());
}

// ══════════════════════════════════════════════════════════════════════════════
//  Connection requests
// ══════════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn test_unknown_target_gets_status_one() {
    let negotiator = Negotiator::spawn().await.unwrap();
    let mut alice = RawPeer::connect(negotiator.addr).await.unwrap();
    let mut bob = RawPeer::connect(negotiator.addr).await.unwrap();
    alice.register("alice").await.unwrap();
    bob.register("bob").await.unwrap();

    let reply = bob.request("carol", "bob").await.unwrap();
    assert_eq!(reply, Reply::Status(Status::TargetNotFound));

    // Nothing relayed anywhere.
    assert!(alice.recv_quiet().await.unwrap().is_none());
    assert!(bob.recv_quiet().await.unwrap().is_none());
}

#[tokio::test]
async fn test_unregistered_requester_gets_status_two() {
    let negotiator = Negotiator::spawn().await.unwrap();
    let mut alice = RawPeer::connect(negotiator.addr).await.unwrap();
    let mut stranger = RawPeer::connect(negotiator.addr).await.unwrap();
    alice.register("alice").await.unwrap();

    let reply = stranger.request("alice", "ghost").await.unwrap();
    assert_eq!(reply, Reply::Status(Status::RequesterNotRegistered));
    assert!(alice.recv_quiet().await.unwrap().is_none());
}

/// A requests B: A gets B's record, B gets A's, each exactly once.
#[tokio::test]
async fn test_introduction_relays_exactly_once_each_way() {
    let negotiator = Negotiator::spawn().await.unwrap();
    let mut alice = RawPeer::connect(negotiator.addr).await.unwrap();
    let mut bob = RawPeer::connect(negotiator.addr).await.unwrap();
    let alice_record = alice.register("alice").await.unwrap();
    let bob_record = bob.register("bob").await.unwrap();

    let reply = alice.request("bob", "alice").await.unwrap();
    assert_eq!(reply, Reply::Peer(bob_record));

    assert_eq!(bob.recv().await.unwrap(), Reply::Peer(alice_record));
    assert!(bob.recv_quiet().await.unwrap().is_none());
    assert!(alice.recv_quiet().await.unwrap().is_none());
}

/// Offers pushed by other connections do not get interleaved into a frame
/// the target is being sent.
#[tokio::test]
async fn test_many_requesters_one_target() {
    const N: usize = 16;
    let negotiator = Negotiator::spawn().await.unwrap();
    let mut target = RawPeer::connect(negotiator.addr).await.unwrap();
    target.register("target").await.unwrap();

    let mut tasks = Vec::new();
    for i in 0..N {
        let addr = negotiator.addr;
        tasks.push(tokio::spawn(async move {
            let name = format!("requester-{i}");
            let mut peer = RawPeer::connect(addr).await?;
            peer.register(&name).await?;
            let reply = peer.request("target", &name).await?;
            anyhow::ensure!(
                matches!(reply, Reply::Peer(ref r) if r.name() == "target"),
                "unexpected reply {reply:?}"
            );
            Ok::<_, anyhow::Error>(peer)
        }));
    }
    let mut requesters = Vec::new();
    for task in tasks {
        requesters.push(task.await.unwrap().unwrap());
    }

    let mut seen = HashSet::new();
    for _ in 0..N {
        let Reply::Peer(offer) = target.recv().await.unwrap() else {
            panic!("target received a status byte");
        };
        assert!(seen.insert(offer.name().to_string()), "duplicate offer");
    }
    assert_eq!(seen.len(), N);
    assert!(target.recv_quiet().await.unwrap().is_none());
    drop(requesters);
}

#[tokio::test]
async fn test_concurrent_clients_register_and_find_each_other() {
    const N: usize = 24;
    let negotiator = Negotiator::spawn().await.unwrap();

    let mut tasks = Vec::new();
    for i in 0..N {
        let addr = negotiator.addr;
        tasks.push(tokio::spawn(async move {
            let mut client = NegotiatorClient::connect(addr).await?;
            let record = client.register(&format!("peer-{i}")).await?;
            Ok::<_, ClientError>((client, record))
        }));
    }
    let mut clients = Vec::new();
    for task in tasks {
        clients.push(task.await.unwrap().unwrap());
    }

    // Everyone looks up their neighbour concurrently.
    let expected: Vec<_> = clients.iter().map(|(_, r)| r.clone()).collect();
    let mut lookups = Vec::new();
    for (i, (mut client, _)) in clients.into_iter().enumerate() {
        lookups.push(tokio::spawn(async move {
            let found = client.request_connection(&format!("peer-{}", (i + 1) % N)).await;
            (i, found, client)
        }));
    }
    // Keep every client connected until all lookups are in.
    let mut results = Vec::new();
    for lookup in lookups {
        results.push(lookup.await.unwrap());
    }
    for (i, found, _client) in results {
        assert_eq!(found.unwrap(), expected[(i + 1) % N]);
    }
}

#[tokio::test]
async fn test_client_surfaces_rejection() {
    let negotiator = Negotiator::spawn().await.unwrap();
    let mut client = NegotiatorClient::connect(negotiator.addr).await.unwrap();
    client.register("alice").await.unwrap();

    let err = client.request_connection("nobody").await.unwrap_err();
    assert!(matches!(err, ClientError::Rejected(Status::TargetNotFound)));

    // The connection is still usable after a rejection.
    let me = client.request_connection("alice").await.unwrap();
    assert_eq!(me.name(), "alice");
}

// ══════════════════════════════════════════════════════════════════════════════
//  Eviction and faults
// ══════════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn test_disconnect_evicts_registration() {
    let negotiator = Negotiator::spawn().await.unwrap();
    let mut alice = RawPeer::connect(negotiator.addr).await.unwrap();
    let mut bob = RawPeer::connect(negotiator.addr).await.unwrap();
    alice.register("alice").await.unwrap();
    bob.register("bob").await.unwrap();

    drop(alice);
    let n = &negotiator;
    wait_for_condition(STEP_TIMEOUT, || async move { !registered(n, "alice").await })
        .await
        .unwrap();

    let reply = bob.request("alice", "bob").await.unwrap();
    assert_eq!(reply, Reply::Status(Status::TargetNotFound));
}

/// The old connection closing must not evict a newer registration.
#[tokio::test]
async fn test_stale_disconnect_keeps_newer_registration() {
    let negotiator = Negotiator::spawn().await.unwrap();
    let mut first = RawPeer::connect(negotiator.addr).await.unwrap();
    let mut second = RawPeer::connect(negotiator.addr).await.unwrap();
    first.register("alice").await.unwrap();
    second.register("alice").await.unwrap();

    drop(first);
    tokio::time::sleep(QUIET_PERIOD).await;

    let entry = negotiator.registry.lookup("alice").await.expect("alice still registered");
    assert_eq!(entry.record.local_addr(), second.local);
}

#[tokio::test]
async fn test_garbage_frame_drops_only_that_connection() {
    let negotiator = Negotiator::spawn().await.unwrap();
    let mut alice = RawPeer::connect(negotiator.addr).await.unwrap();
    let mut mallory = RawPeer::connect(negotiator.addr).await.unwrap();
    alice.register("alice").await.unwrap();
    mallory.register("mallory").await.unwrap();

    send_garbage_frame(&mut mallory).await.unwrap();
    assert!(closed_by_negotiator(&mut mallory).await);
    let n = &negotiator;
    wait_for_condition(STEP_TIMEOUT, || async move { !registered(n, "mallory").await })
        .await
        .unwrap();

    // Everyone else is unaffected.
    let reply = alice.request("alice", "alice").await.unwrap();
    assert!(matches!(reply, Reply::Peer(_)));
}

#[tokio::test]
async fn test_oversized_frame_drops_connection() {
    let negotiator = Negotiator::spawn().await.unwrap();
    let mut mallory = RawPeer::connect(negotiator.addr).await.unwrap();
    send_oversized_header(&mut mallory).await.unwrap();
    assert!(closed_by_negotiator(&mut mallory).await);

    let mut alice = RawPeer::connect(negotiator.addr).await.unwrap();
    assert_eq!(alice.register("alice").await.unwrap().name(), "alice");
}
