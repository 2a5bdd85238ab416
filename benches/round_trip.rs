//! Round-trip benchmark suite.
//!
//! Benchmarks invocations through a local hub:
//! - Sequential calls with scalar arguments
//! - Concurrent batches: 10, 100
//! - Payload sizes: 1 KiB, 64 KiB
//!
//! Run with: cargo bench --bench round_trip
//! Results saved to: target/criterion/

use std::future::IntoFuture;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use futures_util::future::join_all;
use tokio::runtime::Runtime;
use wise_rpc::{Communicator, Hub, ObjectPrx, Servant};

// ============================================================================
// Benchmark Parameters
// ============================================================================

const BATCH_SIZES: &[usize] = &[10, 100];
const PAYLOAD_SIZES: &[usize] = &[1024, 64 * 1024];

// ============================================================================
// Setup
// ============================================================================

struct Fixture {
    _hub: Hub,
    _server: Communicator,
    client: Communicator,
    proxy: ObjectPrx,
}

async fn setup() -> Fixture {
    let hub = Hub::bind(IpAddr::V4(Ipv4Addr::LOCALHOST), 0)
        .await
        .expect("hub should bind");

    let server = Communicator::initialize("127.0.0.1", hub.port())
        .await
        .expect("server should initialize");
    let adapter = server
        .create_object_adapter("bench", "-w bench")
        .await
        .expect("adapter should be created");
    adapter
        .add(
            Servant::new()
                .with_method("add", |args| Ok(args.arg::<i64>(0)? + args.arg::<i64>(1)?))
                .with_method("echo", |args| args.arg::<String>(0)),
            "X",
        )
        .expect("servant should register");

    let client = Communicator::initialize("127.0.0.1", hub.port())
        .await
        .expect("client should initialize");
    let proxy = client
        .string_to_proxy("X -w bench")
        .await
        .expect("proxy should resolve");

    Fixture {
        _hub: hub,
        _server: server,
        client,
        proxy,
    }
}

// ============================================================================
// Benchmark: Sequential Calls
// ============================================================================

fn bench_sequential(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let fixture = rt.block_on(setup());

    let mut group = c.benchmark_group("sequential");
    group.measurement_time(Duration::from_secs(10));

    group.bench_function("add", |b| {
        b.to_async(&rt).iter(|| async {
            let sum: i64 = fixture
                .proxy
                .call("add", vec![2.into(), 3.into()])
                .await
                .unwrap();
            assert_eq!(sum, 5);
        });
    });

    group.finish();
    fixture.client.shutdown();
}

// ============================================================================
// Benchmark: Concurrent Batches
// ============================================================================

fn bench_concurrent(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let fixture = rt.block_on(setup());

    let mut group = c.benchmark_group("concurrent");
    group.sample_size(20);

    for &batch in BATCH_SIZES {
        group.throughput(Throughput::Elements(batch as u64));
        group.bench_with_input(BenchmarkId::new("add", batch), &batch, |b, &batch| {
            b.to_async(&rt).iter(|| async {
                let calls = (0..batch as i64)
                    .map(|n| fixture.proxy.invoke("add", vec![n.into(), 1.into()]).into_future());
                let results = join_all(calls).await;
                assert!(results.iter().all(Result::is_ok));
            });
        });
    }

    group.finish();
    fixture.client.shutdown();
}

// ============================================================================
// Benchmark: Payload Size
// ============================================================================

fn bench_payload(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let fixture = rt.block_on(setup());

    let mut group = c.benchmark_group("payload");
    group.sample_size(20);

    for &size in PAYLOAD_SIZES {
        let payload = "x".repeat(size);
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::new("echo", size), &payload, |b, payload| {
            b.to_async(&rt).iter(|| async {
                let echoed: String = fixture
                    .proxy
                    .call("echo", vec![payload.as_str().into()])
                    .await
                    .unwrap();
                assert_eq!(echoed.len(), payload.len());
            });
        });
    }

    group.finish();
    fixture.client.shutdown();
}

criterion_group!(benches, bench_sequential, bench_concurrent, bench_payload);
criterion_main!(benches);
