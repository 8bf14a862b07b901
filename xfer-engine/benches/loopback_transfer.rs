use criterion::{
    black_box, criterion_group, criterion_main, BenchmarkId, Criterion,
    Throughput,
};
use std::time::Duration;
use xfer_engine::{
    BlockShape, Dataset, Dtype, LoopbackFabric, SessionId, TransferEngine,
    XferOp, XferStatus,
};

const BENCHMARK_TIME_LIMIT: Duration = Duration::from_secs(10);

fn bench_loopback_write(c: &mut Criterion) {
    let mut group = c.benchmark_group("loopback_write");
    group.measurement_time(BENCHMARK_TIME_LIMIT);

    let block_sizes = vec![("8", 8), ("64", 64), ("256", 256)];

    for (label, block_size) in block_sizes {
        let shape = BlockShape {
            num_layers: 4,
            block_size,
            hidden_dim: 128,
        };
        let fabric = LoopbackFabric::new();
        let creator = fabric.agent("creator-bench-0");
        let peer = fabric.agent("peer-bench-0");
        let source = Dataset::create(shape, Dtype::BFloat16, 8, 1.0);
        let target = Dataset::create(shape, Dtype::BFloat16, 8, 0.0);

        let local = creator.register(source.blocks()).unwrap().trim();
        let remote = peer.register(target.blocks()).unwrap().trim();
        let peer_name =
            creator.add_remote_agent(&peer.metadata().unwrap()).unwrap();
        let session = SessionId::for_pair(0);
        let handle = creator
            .initialize_transfer(
                XferOp::Write,
                &local,
                &remote,
                &peer_name,
                &session,
            )
            .unwrap();

        group.throughput(Throughput::Bytes(source.total_bytes() as u64));
        group.bench_with_input(
            BenchmarkId::new("block_size", label),
            &handle,
            |b, handle| {
                b.iter(|| {
                    let status = creator.execute(black_box(handle)).unwrap();
                    assert_eq!(status, XferStatus::Done);
                    while !peer
                        .poll_remote_done("creator-bench-0", &session)
                        .unwrap()
                    {}
                })
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_loopback_write);
criterion_main!(benches);
