use std::time::{Duration, Instant};

use criterion::{BenchmarkId, Criterion, Throughput};
use polyshuffle::{
    client::Submission,
    params::Params,
    protocol::{Deployment, simulate_batch},
};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use tokio::runtime::Runtime;

/// Benchmarks whole batches with all parties in memory, including the client side.
pub fn batch_benchmark(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut g = c.benchmark_group("batch");

    for (num_servers, msg_blocks, batch_size) in [(2, 1, 1_000), (3, 1, 1_000), (3, 8, 1_000)] {
        let params = Params::new(num_servers, msg_blocks, batch_size).expect("invalid parameters");
        let mut rng = ChaCha20Rng::seed_from_u64(42);
        let deployment = Deployment::generate(params, false, &mut rng).expect("key generation failed");
        let keys = deployment.server_keys();
        let submissions: Vec<Submission> = (0..batch_size)
            .map(|_| {
                let mut msg = vec![0; msg_blocks * 16];
                rng.fill(&mut msg[..]);
                Submission::new(&params, &msg, &keys, &mut rng).expect("sealing failed")
            })
            .collect();

        g.throughput(Throughput::Elements(batch_size as u64));
        let bench_id = BenchmarkId::new(
            format!("{num_servers} servers, {msg_blocks} blocks"),
            batch_size,
        );
        g.bench_function(bench_id, |b| {
            b.to_async(&rt).iter_custom(|iters| {
                let deployment = deployment.clone();
                let submissions = submissions.clone();
                let mut rng = rng.clone();
                async move {
                    let mut elapsed = Duration::default();
                    for _ in 0..iters {
                        let now = Instant::now();
                        simulate_batch(&deployment, submissions.clone(), &mut rng)
                            .await
                            .expect("batch failed");
                        elapsed += now.elapsed();
                    }
                    elapsed
                }
            })
        });
    }
}
