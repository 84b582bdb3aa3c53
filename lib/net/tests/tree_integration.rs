// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Whole-tree integration tests over the in-memory transport: startup,
//! multicast/reduction flow, stateful filters, synchronization policies,
//! failure handling with orphan adoption, stream teardown, and shutdown.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Instant};

use arbor_net::filter::{FILTER_IDENTITY, FILTER_INT_SUM};
use arbor_net::{
    AdoptionPolicy, BackendMain, DuplexTransport, Filter, FilterContext, FilterOutput, LaunchSpec,
    Network, NetworkConfig, NetworkRecv, Packet, ProcessLauncher, Rank, RecvOutcome, SyncPolicy,
    TaskLauncher, TopologyEvent, Value,
};

const BALANCED: &str = "fe:5000:0:=>(cp:5001:1:=>(be:0:3,be:0:4),cp:5002:2:=>(be:0:5,be:0:6))";
const TAG_ECHO: i32 = 100;
const TAG_DIE: i32 = 101;

const WAIT: Duration = Duration::from_secs(10);

/// Reply `1` to every multicast; abort the endpoint on `TAG_DIE`.
fn echo_backend() -> BackendMain {
    Arc::new(|net| {
        Box::pin(async move {
            loop {
                match net.recv().await {
                    Ok(NetworkRecv::Delivered { stream, packet }) => {
                        if packet.tag() == TAG_DIE {
                            net.abort();
                            return;
                        }
                        if stream
                            .send(TAG_ECHO, "%d", &[Value::Int32(1)])
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }
                    _ => return,
                }
            }
        })
    })
}

async fn recv_int(stream: &arbor_net::Stream) -> i32 {
    let outcome = timeout(WAIT, stream.recv())
        .await
        .expect("recv timed out")
        .expect("recv failed");
    let pkt = outcome.into_packet().expect("stream closed unexpectedly");
    pkt.unpack("%d").expect("unpack")[0]
        .as_i32()
        .expect("int payload")
}

#[tokio::test]
async fn test_multicast_and_sum_reduction() {
    let transport = Arc::new(DuplexTransport::new());
    let launcher = Arc::new(TaskLauncher::new(
        transport.clone(),
        NetworkConfig::default(),
        echo_backend(),
    ));
    let net = Network::front_end(BALANCED, transport, launcher, NetworkConfig::default())
        .await
        .unwrap();

    let stream = net
        .new_stream(&[], FILTER_INT_SUM, SyncPolicy::WaitForAll, FILTER_IDENTITY)
        .await
        .unwrap();
    assert_eq!(stream.members().len(), 4);
    assert_eq!(stream.up_filter_id(), FILTER_INT_SUM);
    assert_eq!(stream.down_filter_id(), FILTER_IDENTITY);

    // Three full rounds; each one aggregates exactly one reply per back-end.
    for _ in 0..3 {
        stream
            .send(TAG_ECHO, "%d", &[Value::Int32(0)])
            .await
            .unwrap();
        assert_eq!(recv_int(&stream).await, 4);
    }

    net.shutdown().await.unwrap();
    assert!(net.is_shut_down());
}

#[tokio::test]
async fn test_stream_members_subset() {
    let transport = Arc::new(DuplexTransport::new());
    let launcher = Arc::new(TaskLauncher::new(
        transport.clone(),
        NetworkConfig::default(),
        echo_backend(),
    ));
    let net = Network::front_end(BALANCED, transport, launcher, NetworkConfig::default())
        .await
        .unwrap();

    // Only the two leaves under internal node 1 participate.
    let stream = net
        .new_stream(&[3, 4], FILTER_INT_SUM, SyncPolicy::WaitForAll, FILTER_IDENTITY)
        .await
        .unwrap();
    stream
        .send(TAG_ECHO, "%d", &[Value::Int32(0)])
        .await
        .unwrap();
    assert_eq!(recv_int(&stream).await, 2);

    net.shutdown().await.unwrap();
}

struct FibFilter {
    a: i64,
    b: i64,
}

impl Default for FibFilter {
    fn default() -> Self {
        Self { a: 0, b: 1 }
    }
}

impl Filter for FibFilter {
    fn filter(&mut self, packets: Vec<Packet>, ctx: &FilterContext) -> Result<FilterOutput> {
        let input = packets.into_iter().next().expect("one packet per round");
        let out = Packet::pack(
            input.stream_id(),
            input.tag(),
            ctx.rank,
            "%ld",
            &[Value::Int64(self.b)],
        )?;
        let next = self.a + self.b;
        self.a = self.b;
        self.b = next;
        Ok(FilterOutput::one(out))
    }
}

/// On each multicast, send `n` upstream packets back to back.
fn burst_backend(n: u32) -> BackendMain {
    Arc::new(move |net| {
        Box::pin(async move {
            loop {
                match net.recv().await {
                    Ok(NetworkRecv::Delivered { stream, .. }) => {
                        for i in 0..n {
                            if stream
                                .send(TAG_ECHO, "%d", &[Value::Int32(i as i32)])
                                .await
                                .is_err()
                            {
                                return;
                            }
                        }
                    }
                    _ => return,
                }
            }
        })
    })
}

#[tokio::test]
async fn test_stateful_filter_keeps_state_across_rounds() {
    let transport = Arc::new(DuplexTransport::new());
    let launcher = Arc::new(TaskLauncher::new(
        transport.clone(),
        NetworkConfig::default(),
        burst_backend(10),
    ));
    let net = Network::front_end(
        "fe:5000:0:=>(be:0:1)",
        transport,
        launcher,
        NetworkConfig::default(),
    )
    .await
    .unwrap();

    // The recurrence runs at the front-end only; everywhere else resolves to
    // the identity filter.
    let fib_id = net.register_filter(Arc::new(|| Box::<FibFilter>::default()));
    let assignment = format!("{fib_id} => 0 ; {FILTER_IDENTITY} => *");
    let stream = net
        .new_stream_with_assignments(&[1], &assignment, SyncPolicy::DontWait, "1")
        .await
        .unwrap();

    stream
        .send(TAG_ECHO, "%d", &[Value::Int32(0)])
        .await
        .unwrap();

    // One filter instance serves the whole stream, so the sequence continues
    // across the ten independent rounds.
    for want in [1i64, 1, 2, 3, 5, 8, 13, 21, 34, 55] {
        let outcome = timeout(WAIT, stream.recv()).await.unwrap().unwrap();
        let pkt = outcome.into_packet().unwrap();
        assert_eq!(pkt.unpack("%ld").unwrap()[0], Value::Int64(want));
    }

    net.shutdown().await.unwrap();
}

/// Only odd ranks answer; even ranks stay silent.
fn selective_echo() -> BackendMain {
    Arc::new(|net| {
        Box::pin(async move {
            loop {
                match net.recv().await {
                    Ok(NetworkRecv::Delivered { stream, .. }) => {
                        if net.local_rank() % 2 == 1
                            && stream
                                .send(TAG_ECHO, "%d", &[Value::Int32(1)])
                                .await
                                .is_err()
                        {
                            return;
                        }
                    }
                    _ => return,
                }
            }
        })
    })
}

#[tokio::test]
async fn test_timeout_policy_fires_partial_rounds() {
    let transport = Arc::new(DuplexTransport::new());
    let launcher = Arc::new(TaskLauncher::new(
        transport.clone(),
        NetworkConfig::default(),
        selective_echo(),
    ));
    let net = Network::front_end(BALANCED, transport, launcher, NetworkConfig::default())
        .await
        .unwrap();

    // Ranks 4 and 6 never reply; each intermediate deadline fires with what
    // it has, so the final aggregate counts only the two responders.
    let stream = net
        .new_stream(
            &[],
            FILTER_INT_SUM,
            SyncPolicy::Timeout { millis: 200 },
            FILTER_IDENTITY,
        )
        .await
        .unwrap();
    stream
        .send(TAG_ECHO, "%d", &[Value::Int32(0)])
        .await
        .unwrap();
    assert_eq!(recv_int(&stream).await, 2);

    net.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_backend_failure_shrinks_membership_and_wait_sets() {
    let transport = Arc::new(DuplexTransport::new());
    let launcher = Arc::new(TaskLauncher::new(
        transport.clone(),
        NetworkConfig::default(),
        echo_backend(),
    ));
    let net = Network::front_end(BALANCED, transport, launcher, NetworkConfig::default())
        .await
        .unwrap();
    let mut events = net.subscribe();

    let stream = net
        .new_stream(&[], FILTER_INT_SUM, SyncPolicy::WaitForAll, FILTER_IDENTITY)
        .await
        .unwrap();
    stream
        .send(TAG_ECHO, "%d", &[Value::Int32(0)])
        .await
        .unwrap();
    assert_eq!(recv_int(&stream).await, 4);

    // Crash rank 6 via a targeted control packet.
    let kill = net
        .new_stream(&[6], FILTER_IDENTITY, SyncPolicy::DontWait, FILTER_IDENTITY)
        .await
        .unwrap();
    kill.send(TAG_DIE, "%d", &[Value::Int32(0)]).await.unwrap();

    let deadline = Instant::now() + WAIT;
    loop {
        let event = timeout(deadline - Instant::now(), events.recv())
            .await
            .expect("no removal event")
            .expect("event channel closed");
        if let TopologyEvent::BackendsRemoved { ranks } = event {
            assert!(ranks.contains(&6));
            break;
        }
    }
    assert!(!stream.members().contains(&6));

    // The next round completes with the three survivors.
    stream
        .send(TAG_ECHO, "%d", &[Value::Int32(0)])
        .await
        .unwrap();
    assert_eq!(recv_int(&stream).await, 3);

    net.shutdown().await.unwrap();
}

struct NullLauncher;

#[async_trait]
impl ProcessLauncher for NullLauncher {
    async fn launch(&self, _spec: LaunchSpec) -> Result<()> {
        Ok(())
    }
}

fn spawn_echo(net: Network) {
    tokio::spawn(async move {
        loop {
            match net.recv().await {
                Ok(NetworkRecv::Delivered { stream, .. }) => {
                    if stream
                        .send(TAG_ECHO, "%d", &[Value::Int32(1)])
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
                _ => return,
            }
        }
    });
}

#[tokio::test]
async fn test_orphan_adoption_after_internal_failure() {
    let transport = Arc::new(DuplexTransport::new());
    let config =
        NetworkConfig::default().with_adoption_policy(AdoptionPolicy::SortedRoundRobin);

    // Bring the tree up by hand so the test keeps a handle to an internal
    // node it can crash.
    let fe_task = {
        let (t, c) = (transport.clone(), config.clone());
        tokio::spawn(async move {
            Network::front_end(BALANCED, t, Arc::new(NullLauncher), c).await
        })
    };
    sleep(Duration::from_millis(50)).await;

    let int1_task = {
        let (t, c) = (transport.clone(), config.clone());
        tokio::spawn(async move {
            Network::internal(
                "cp:5001:1:=>(be:0:3,be:0:4)",
                "fe",
                5000,
                t,
                Arc::new(NullLauncher),
                None,
                c,
            )
            .await
        })
    };
    let int2_task = {
        let (t, c) = (transport.clone(), config.clone());
        tokio::spawn(async move {
            Network::internal(
                "cp:5002:2:=>(be:0:5,be:0:6)",
                "fe",
                5000,
                t,
                Arc::new(NullLauncher),
                None,
                c,
            )
            .await
        })
    };
    sleep(Duration::from_millis(50)).await;

    for (rank, parent_port) in [(3u32, 5001u16), (4, 5001), (5, 5002), (6, 5002)] {
        let (t, c) = (transport.clone(), config.clone());
        let backend = timeout(
            WAIT,
            Network::back_end("be", rank, "cp", parent_port, t, None, c),
        )
        .await
        .expect("back-end attach timed out")
        .unwrap();
        spawn_echo(backend);
    }

    let internal1 = timeout(WAIT, int1_task).await.unwrap().unwrap().unwrap();
    let _internal2 = timeout(WAIT, int2_task).await.unwrap().unwrap().unwrap();
    let fe = timeout(WAIT, fe_task).await.unwrap().unwrap().unwrap();

    // Crash the internal node; its two leaves must find new parents.
    internal1.abort();

    let deadline = Instant::now() + WAIT;
    loop {
        let topo = fe.topology();
        let reattached = [3u32, 4].iter().all(|r| {
            topo.find_node(*r)
                .and_then(|n| n.parent())
                .map(|p| p == 0 || p == 2)
                .unwrap_or(false)
        });
        if reattached && !topo.contains(1) {
            break;
        }
        assert!(Instant::now() < deadline, "adoption did not complete");
        sleep(Duration::from_millis(20)).await;
    }

    // All four back-ends are reachable again through the repaired tree.
    let stream = fe
        .new_stream(&[], FILTER_INT_SUM, SyncPolicy::WaitForAll, FILTER_IDENTITY)
        .await
        .unwrap();
    assert_eq!(stream.members().len(), 4);
    stream
        .send(TAG_ECHO, "%d", &[Value::Int32(0)])
        .await
        .unwrap();
    assert_eq!(recv_int(&stream).await, 4);

    fe.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_lost_subtree_reported_to_root() {
    let transport = Arc::new(DuplexTransport::new());
    let config = NetworkConfig::default();
    // Leaves under internal node 1 will not try to find a new parent; the
    // root must still learn that they are gone for good.
    let leaf_config = NetworkConfig::default().with_recovery(false);

    let fe_task = {
        let (t, c) = (transport.clone(), config.clone());
        tokio::spawn(async move {
            Network::front_end(BALANCED, t, Arc::new(NullLauncher), c).await
        })
    };
    sleep(Duration::from_millis(50)).await;

    let int1_task = {
        let (t, c) = (transport.clone(), config.clone());
        tokio::spawn(async move {
            Network::internal(
                "cp:5001:1:=>(be:0:3,be:0:4)",
                "fe",
                5000,
                t,
                Arc::new(NullLauncher),
                None,
                c,
            )
            .await
        })
    };
    let int2_task = {
        let (t, c) = (transport.clone(), config.clone());
        tokio::spawn(async move {
            Network::internal(
                "cp:5002:2:=>(be:0:5,be:0:6)",
                "fe",
                5000,
                t,
                Arc::new(NullLauncher),
                None,
                c,
            )
            .await
        })
    };
    sleep(Duration::from_millis(50)).await;

    for (rank, parent_port, cfg) in [
        (3u32, 5001u16, leaf_config.clone()),
        (4, 5001, leaf_config.clone()),
        (5, 5002, config.clone()),
        (6, 5002, config.clone()),
    ] {
        let t = transport.clone();
        let backend = timeout(
            WAIT,
            Network::back_end("be", rank, "cp", parent_port, t, None, cfg),
        )
        .await
        .expect("back-end attach timed out")
        .unwrap();
        spawn_echo(backend);
    }

    let internal1 = timeout(WAIT, int1_task).await.unwrap().unwrap().unwrap();
    let _internal2 = timeout(WAIT, int2_task).await.unwrap().unwrap().unwrap();
    let fe = timeout(WAIT, fe_task).await.unwrap().unwrap().unwrap();
    let mut events = fe.subscribe();

    let stream = fe
        .new_stream(&[], FILTER_INT_SUM, SyncPolicy::WaitForAll, FILTER_IDENTITY)
        .await
        .unwrap();
    stream
        .send(TAG_ECHO, "%d", &[Value::Int32(0)])
        .await
        .unwrap();
    assert_eq!(recv_int(&stream).await, 4);

    internal1.abort();

    // The non-recovering leaves report their own removal straight to the
    // root; wait until it has heard about both.
    let mut gone = std::collections::BTreeSet::new();
    let deadline = Instant::now() + WAIT;
    while !(gone.contains(&3) && gone.contains(&4)) {
        let event = timeout(deadline - Instant::now(), events.recv())
            .await
            .expect("root never learned of the lost leaves")
            .expect("event channel closed");
        if let TopologyEvent::BackendsRemoved { ranks } = event {
            gone.extend(ranks);
        }
    }
    let topo = fe.topology();
    assert!(!topo.contains(3) && !topo.contains(4));
    assert_eq!(
        stream.members().into_iter().collect::<Vec<_>>(),
        vec![5, 6]
    );

    // The surviving half of the tree still completes full rounds.
    stream
        .send(TAG_ECHO, "%d", &[Value::Int32(0)])
        .await
        .unwrap();
    assert_eq!(recv_int(&stream).await, 2);

    fe.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_adoption_exhaustion_marks_subtree_failed() {
    let transport = Arc::new(DuplexTransport::new());
    let mut config = NetworkConfig::default();
    config.connect_timeout = Duration::from_secs(2);
    config.max_adoption_attempts = 2;

    let fe_task = {
        let (t, c) = (transport.clone(), config.clone());
        tokio::spawn(async move {
            Network::front_end(
                "fe:5000:0:=>(cp:5001:1:=>(be:0:2,be:0:3))",
                t,
                Arc::new(NullLauncher),
                c,
            )
            .await
        })
    };
    sleep(Duration::from_millis(50)).await;

    let int_task = {
        let (t, c) = (transport.clone(), config.clone());
        tokio::spawn(async move {
            Network::internal(
                "cp:5001:1:=>(be:0:2,be:0:3)",
                "fe",
                5000,
                t,
                Arc::new(NullLauncher),
                None,
                c,
            )
            .await
        })
    };
    sleep(Duration::from_millis(50)).await;

    let mut backends = Vec::new();
    for rank in [2u32, 3] {
        let (t, c) = (transport.clone(), config.clone());
        let backend = timeout(WAIT, Network::back_end("be", rank, "cp", 5001, t, None, c))
            .await
            .expect("back-end attach timed out")
            .unwrap();
        spawn_echo(backend.clone());
        backends.push(backend);
    }

    let internal = timeout(WAIT, int_task).await.unwrap().unwrap().unwrap();
    let fe = timeout(WAIT, fe_task).await.unwrap().unwrap().unwrap();

    let stream = fe
        .new_stream(&[], FILTER_INT_SUM, SyncPolicy::WaitForAll, FILTER_IDENTITY)
        .await
        .unwrap();
    stream
        .send(TAG_ECHO, "%d", &[Value::Int32(0)])
        .await
        .unwrap();
    assert_eq!(recv_int(&stream).await, 2);

    let mut events = backends[0].subscribe();

    // Kill the root first so the orphans' only adoption candidate is dead,
    // then their parent. Every attempt must fail and the retry bound must
    // end in a declared permanent failure.
    fe.abort();
    internal.abort();

    let deadline = Instant::now() + WAIT;
    loop {
        let event = timeout(deadline - Instant::now(), events.recv())
            .await
            .expect("orphan never declared itself failed")
            .expect("event channel closed");
        if let TopologyEvent::BackendsRemoved { ranks } = event {
            assert!(ranks.contains(&2));
            break;
        }
    }

    // The failed leaf has fully wound down: its endpoint reports closure
    // and its streams are closed.
    let outcome = timeout(WAIT, backends[0].recv()).await.unwrap().unwrap();
    assert!(matches!(outcome, NetworkRecv::Closed));
    if let Some(s) = backends[0].stream(stream.id()) {
        assert!(s.is_closed());
    }
}

/// Reply once, then leave the stream.
fn reply_once_then_close() -> BackendMain {
    Arc::new(|net| {
        Box::pin(async move {
            loop {
                match net.recv().await {
                    Ok(NetworkRecv::Delivered { stream, .. }) => {
                        let _ = stream.send(TAG_ECHO, "%d", &[Value::Int32(1)]).await;
                        let _ = stream.close().await;
                    }
                    _ => return,
                }
            }
        })
    })
}

#[tokio::test]
async fn test_recv_returns_closed_after_all_members_exit() {
    let transport = Arc::new(DuplexTransport::new());
    let launcher = Arc::new(TaskLauncher::new(
        transport.clone(),
        NetworkConfig::default(),
        reply_once_then_close(),
    ));
    let net = Network::front_end(
        "fe:5000:0:=>(be:0:1,be:0:2)",
        transport,
        launcher,
        NetworkConfig::default(),
    )
    .await
    .unwrap();

    let stream = net
        .new_stream(&[], FILTER_INT_SUM, SyncPolicy::WaitForAll, FILTER_IDENTITY)
        .await
        .unwrap();
    stream
        .send(TAG_ECHO, "%d", &[Value::Int32(0)])
        .await
        .unwrap();

    // Buffered data drains first, then closure is observed.
    assert_eq!(recv_int(&stream).await, 2);
    let outcome = timeout(WAIT, stream.recv()).await.unwrap().unwrap();
    assert!(outcome.is_closed());

    // Once closed, further receives report closure immediately rather than
    // blocking.
    let start = Instant::now();
    assert!(stream.recv().await.unwrap().is_closed());
    assert!(start.elapsed() < Duration::from_secs(1));

    net.shutdown().await.unwrap();
}

/// After the first multicast, watch that stream until it closes and report.
fn close_observer(done: mpsc::UnboundedSender<Rank>) -> BackendMain {
    Arc::new(move |net| {
        let done = done.clone();
        Box::pin(async move {
            if let Ok(NetworkRecv::Delivered { stream, .. }) = net.recv().await {
                loop {
                    match stream.recv().await {
                        Ok(RecvOutcome::Closed) => {
                            let _ = done.send(net.local_rank());
                            return;
                        }
                        Ok(_) => {}
                        Err(_) => return,
                    }
                }
            }
        })
    })
}

#[tokio::test]
async fn test_front_end_close_tears_down_stream_everywhere() {
    let (done_tx, mut done_rx) = mpsc::unbounded_channel();
    let transport = Arc::new(DuplexTransport::new());
    let launcher = Arc::new(TaskLauncher::new(
        transport.clone(),
        NetworkConfig::default(),
        close_observer(done_tx),
    ));
    let net = Network::front_end(
        "fe:5000:0:=>(be:0:1,be:0:2)",
        transport,
        launcher,
        NetworkConfig::default(),
    )
    .await
    .unwrap();

    let stream = net
        .new_stream(&[], FILTER_IDENTITY, SyncPolicy::DontWait, FILTER_IDENTITY)
        .await
        .unwrap();
    stream
        .send(TAG_ECHO, "%d", &[Value::Int32(0)])
        .await
        .unwrap();
    stream.close().await.unwrap();
    assert!(stream.is_closed());

    let mut observed = Vec::new();
    for _ in 0..2 {
        let rank = timeout(WAIT, done_rx.recv())
            .await
            .expect("back-end never observed the close")
            .unwrap();
        observed.push(rank);
    }
    observed.sort_unstable();
    assert_eq!(observed, vec![1, 2]);

    net.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_sum_reduction_over_loopback_tcp() {
    // Same flow as the duplex tests, over real sockets. Port 0 makes every
    // listener pick an ephemeral port; the corrected ports propagate through
    // the launch specs and the topology-sync push-down.
    let transport = Arc::new(arbor_net::TcpTransport::new(
        Duration::from_secs(5),
        1024 * 1024,
    ));
    let launcher = Arc::new(TaskLauncher::new(
        transport.clone(),
        NetworkConfig::default(),
        echo_backend(),
    ));
    let net = Network::front_end(
        "127.0.0.1:0:0:=>(127.0.0.1:0:1:=>(127.0.0.1:0:3,127.0.0.1:0:4),127.0.0.1:0:2)",
        transport,
        launcher,
        NetworkConfig::default(),
    )
    .await
    .unwrap();

    let stream = net
        .new_stream(&[], FILTER_INT_SUM, SyncPolicy::WaitForAll, FILTER_IDENTITY)
        .await
        .unwrap();
    stream
        .send(TAG_ECHO, "%d", &[Value::Int32(0)])
        .await
        .unwrap();
    assert_eq!(recv_int(&stream).await, 3);

    net.shutdown().await.unwrap();
}

fn shutdown_observer(done: mpsc::UnboundedSender<Rank>) -> BackendMain {
    Arc::new(move |net| {
        let done = done.clone();
        Box::pin(async move {
            loop {
                match net.recv().await {
                    Ok(NetworkRecv::Closed) | Err(_) => {
                        let _ = done.send(net.local_rank());
                        return;
                    }
                    Ok(_) => {}
                }
            }
        })
    })
}

#[tokio::test]
async fn test_shutdown_handshake_reaches_every_leaf() {
    let (done_tx, mut done_rx) = mpsc::unbounded_channel();
    let transport = Arc::new(DuplexTransport::new());
    let launcher = Arc::new(TaskLauncher::new(
        transport.clone(),
        NetworkConfig::default(),
        shutdown_observer(done_tx),
    ));
    let net = Network::front_end(BALANCED, transport, launcher, NetworkConfig::default())
        .await
        .unwrap();

    net.shutdown().await.unwrap();
    assert!(net.is_shut_down());

    let mut observed = Vec::new();
    for _ in 0..4 {
        let rank = timeout(WAIT, done_rx.recv())
            .await
            .expect("back-end never observed shutdown")
            .unwrap();
        observed.push(rank);
    }
    observed.sort_unstable();
    assert_eq!(observed, vec![3, 4, 5, 6]);
}
