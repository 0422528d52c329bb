//! RPC registry lookup and dispatch overhead benchmarking.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use clusterbench::bench::BenchRpcServer;
use clusterbench::rpc::{make_payload, RpcInput, RpcRegistry, RpcRequest};
use clusterbench::ServiceId;

use criterion::{
    black_box, criterion_group, criterion_main, BenchmarkId, Criterion,
};

use tokio::runtime::Runtime;

static SIZES: [usize; 4] = [1, 10, 100, 1000];
static ROUTES: usize = 16;

#[derive(Clone, Copy)]
struct BenchId(pub usize, pub bool);

impl fmt::Display for BenchId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}@{}", self.0, if self.1 { "routed" } else { "global" })
    }
}

fn dispatch_bench_group(c: &mut Criterion) {
    let rt = match Runtime::new() {
        Ok(rt) => rt,
        Err(e) => panic!("failed to build runtime: {}", e),
    };

    let registry = RpcRegistry::new("bench");
    let service = ServiceId::new("dispatch");
    let server = Arc::new(BenchRpcServer::new("bench"));
    let _reg = registry.register(service.clone(), server.clone());
    let _routed_regs: Vec<_> = (0..ROUTES)
        .filter_map(|i| {
            registry
                .register_routed_at(
                    service.clone(),
                    format!("route-{}", i),
                    server.clone(),
                )
                .ok()
        })
        .collect();
    let invoker = registry.invoker();

    let mut group = c.benchmark_group("dispatch_bench");
    group
        .sample_size(50)
        .warm_up_time(Duration::from_millis(100))
        .measurement_time(Duration::from_secs(3));

    group.bench_function("lookup", |b| {
        b.iter(|| black_box(invoker.lookup(&service)));
    });

    for size in SIZES {
        for routed in [false, true] {
            let bench_id = BenchId(size, routed);
            group.bench_with_input(
                BenchmarkId::from_parameter(bench_id),
                &bench_id,
                |b, bench_id| {
                    let items = make_payload(bench_id.0);
                    b.to_async(&rt).iter(|| {
                        let input = RpcInput::Payload {
                            items: items.clone(),
                        };
                        let req = if bench_id.1 {
                            RpcRequest::routed("route-7", input)
                        } else {
                            RpcRequest::global(input)
                        };
                        invoker.invoke(&service, req)
                    });
                },
            );
        }
    }

    group.finish();
}

criterion_group!(benches, dispatch_bench_group);
criterion_main!(benches);
