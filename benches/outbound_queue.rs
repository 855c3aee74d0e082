//! Outbound path benchmark suite.
//!
//! Benchmarks the batching queue and the full send path:
//! - Backlog sizes: 1, 64, 1024
//! - Producer counts: 1, 4, 16
//! - Loopback echo and broadcast through a running engine
//!
//! Run with: cargo bench --bench outbound_queue
//! Results saved to: target/criterion/

use std::sync::Arc;

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use futures_util::{FutureExt, SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpStream;
use tokio::runtime::Runtime;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use wsengine::transport::OutboundQueue;
use wsengine::{Engine, SessionEvent};

// ============================================================================
// Benchmark Parameters
// ============================================================================

const BACKLOG_SIZES: &[usize] = &[1, 64, 1024];
const PRODUCER_COUNTS: &[usize] = &[1, 4, 16];
const MESSAGES_PER_PRODUCER: usize = 1_000;
const ECHO_ROUNDS: usize = 100;
const BROADCAST_SESSIONS: usize = 50;

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

// ============================================================================
// Benchmark: Drain Batch
// ============================================================================

fn bench_drain_batch(c: &mut Criterion) {
    let mut group = c.benchmark_group("drain_batch");

    for &size in BACKLOG_SIZES {
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::new("append_then_drain", size), &size, |b, &size| {
            let queue = OutboundQueue::new();
            let mut out = Vec::with_capacity(size);

            b.iter(|| {
                for i in 0..size {
                    queue.push(i);
                }
                out.clear();
                // A non-empty queue drains without suspending.
                queue.drain(&mut out).now_or_never()
            });
        });
    }

    group.finish();
}

// ============================================================================
// Benchmark: Concurrent Producers
// ============================================================================

fn bench_concurrent_producers(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    let mut group = c.benchmark_group("concurrent_producers");
    group.sample_size(20);

    for &producers in PRODUCER_COUNTS {
        group.throughput(Throughput::Elements((producers * MESSAGES_PER_PRODUCER) as u64));
        group.bench_with_input(
            BenchmarkId::new("producers", producers),
            &producers,
            |b, &producers| {
                b.to_async(&rt).iter(|| run_producers(producers));
            },
        );
    }

    group.finish();
}

async fn run_producers(producers: usize) -> usize {
    let queue = Arc::new(OutboundQueue::new());
    let total = producers * MESSAGES_PER_PRODUCER;

    for p in 0..producers {
        let queue = Arc::clone(&queue);
        tokio::spawn(async move {
            for i in 0..MESSAGES_PER_PRODUCER {
                queue.push((p, i));
            }
        });
    }

    let mut received = Vec::with_capacity(total);
    let mut batches = 0;
    while received.len() < total {
        queue.drain(&mut received).await;
        batches += 1;
    }

    batches
}

// ============================================================================
// Benchmark: Engine Round Trips
// ============================================================================

fn bench_engine(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    let engine = rt.block_on(async {
        let engine = Engine::builder()
            .addr("127.0.0.1")
            .port(0)
            .handler(|envelope| {
                if let SessionEvent::Message(value) = envelope.event {
                    envelope.session.send(value);
                }
            })
            .build()
            .expect("engine should build");
        engine.start().await.expect("engine should start");
        engine
    });

    let mut group = c.benchmark_group("engine");
    group.sample_size(20);

    let mut client = rt.block_on(connect(engine.port()));
    group.throughput(Throughput::Elements(ECHO_ROUNDS as u64));
    group.bench_function("echo_round_trips", |b| {
        b.iter(|| rt.block_on(echo_rounds(&mut client)));
    });

    drop(client);

    let mut clients = rt.block_on(async {
        let mut clients = Vec::with_capacity(BROADCAST_SESSIONS);
        for _ in 0..BROADCAST_SESSIONS {
            clients.push(connect(engine.port()).await);
        }
        while engine.session_count() != BROADCAST_SESSIONS {
            tokio::task::yield_now().await;
        }
        clients
    });
    group.throughput(Throughput::Elements(BROADCAST_SESSIONS as u64));
    group.bench_function("broadcast_50", |b| {
        b.iter(|| rt.block_on(broadcast_once(&engine, &mut clients)));
    });

    group.finish();
    rt.block_on(engine.stop());
}

async fn connect(port: u16) -> Client {
    let url = format!("ws://127.0.0.1:{port}/ws");
    let (client, _) = tokio_tungstenite::connect_async(url)
        .await
        .expect("client should connect");
    client
}

async fn echo_rounds(client: &mut Client) {
    let payload = br#"{"hello":"x"}"#.to_vec();

    for _ in 0..ECHO_ROUNDS {
        client
            .send(Message::binary(payload.clone()))
            .await
            .expect("send should succeed");
        next_binary(client).await;
    }
}

async fn broadcast_once(engine: &Engine, clients: &mut [Client]) {
    engine.broadcast(&json!({"event": "tick"}));

    for client in clients.iter_mut() {
        next_binary(client).await;
    }
}

async fn next_binary(client: &mut Client) {
    loop {
        match client.next().await {
            Some(Ok(Message::Binary(_))) => return,
            Some(Ok(_)) => continue,
            other => panic!("connection ended: {other:?}"),
        }
    }
}

criterion_group!(
    benches,
    bench_drain_batch,
    bench_concurrent_producers,
    bench_engine
);
criterion_main!(benches);
