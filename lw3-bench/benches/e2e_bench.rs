//! End-to-end client-server benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use lw3_client::{Client, ConnectionConfig};
use lw3_server::{Server, ServerConfig};
use lw3_tree::{Method, Tree};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;

struct TestSetup {
    _server_handle: tokio::task::JoinHandle<()>,
    client: Client,
}

fn setup_server_and_client(rt: &Runtime) -> TestSetup {
    let tree = Tree::new();
    let node = tree.node("/MEDIA/VIDEO/XP").unwrap();
    node.set("Name", "crosspoint").unwrap();
    node.define_method("noop", Method::new()).unwrap();

    rt.block_on(async {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = Arc::new(Server::new(ServerConfig::new(addr), tree));
        let server_handle = tokio::spawn(async move {
            let _ = server.serve(listener).await;
        });

        let client = Client::new(ConnectionConfig::new("127.0.0.1", addr.port()));
        client.wait_connected(Duration::from_secs(5)).await.unwrap();
        TestSetup {
            _server_handle: server_handle,
            client,
        }
    })
}

fn bench_get_latency(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let setup = setup_server_and_client(&rt);

    let mut group = c.benchmark_group("e2e_get");
    group.throughput(Throughput::Elements(1));

    group.bench_function("get", |b| {
        b.to_async(&rt).iter(|| async {
            black_box(setup.client.get("/MEDIA/VIDEO/XP.Name").await.unwrap())
        });
    });

    group.finish();
}

fn bench_call_latency(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let setup = setup_server_and_client(&rt);

    let mut group = c.benchmark_group("e2e_call");
    group.throughput(Throughput::Elements(1));

    group.bench_function("call", |b| {
        b.to_async(&rt).iter(|| async {
            black_box(setup.client.call("/MEDIA/VIDEO/XP:noop", "").await.unwrap())
        });
    });

    group.finish();
}

fn bench_concurrent_gets(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let setup = setup_server_and_client(&rt);

    let mut group = c.benchmark_group("e2e_concurrent_get");

    for in_flight in [1, 8, 64] {
        group.throughput(Throughput::Elements(in_flight as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(in_flight),
            &in_flight,
            |b, &in_flight| {
                b.to_async(&rt).iter(|| async {
                    let requests =
                        (0..in_flight).map(|_| setup.client.get("/MEDIA/VIDEO/XP.Name"));
                    for result in futures::future::join_all(requests).await {
                        black_box(result.unwrap());
                    }
                });
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_get_latency,
    bench_call_latency,
    bench_concurrent_gets,
);

criterion_main!(benches);
