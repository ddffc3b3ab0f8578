use criterion::{BatchSize, Criterion, criterion_group, criterion_main};
use driftfield_core::{Ecosystem, EcosystemConfig};
use std::time::Duration;

fn bench_ecosystem_steps(c: &mut Criterion) {
    let mut group = c.benchmark_group("ecosystem_step");
    // Allow env overrides for longer local runs.
    let samples: usize = std::env::var("DF_BENCH_SAMPLES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(30);
    let warm: u64 = std::env::var("DF_BENCH_WARMUP_SECS")
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(2);
    let measure: u64 = std::env::var("DF_BENCH_MEASURE_SECS")
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(8);
    group.sample_size(samples);
    group.warm_up_time(Duration::from_secs(warm));
    group.measurement_time(Duration::from_secs(measure));

    let steps: usize = std::env::var("DF_BENCH_STEPS")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(64);
    let sizes: Vec<usize> = std::env::var("DF_BENCH_SIZES")
        .ok()
        .map(|s| {
            s.split(',')
                .filter_map(|t| t.trim().parse::<usize>().ok())
                .collect::<Vec<_>>()
        })
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| vec![120, 180, 240]);

    for &size in &sizes {
        group.bench_function(format!("steps{steps}_size{size}"), |b| {
            b.iter_batched(
                || {
                    let config = EcosystemConfig {
                        size,
                        rng_seed: Some(0xBEEF),
                        history_capacity: 1,
                        ..EcosystemConfig::default()
                    };
                    Ecosystem::new(config).expect("ecosystem")
                },
                |mut ecosystem| {
                    for _ in 0..steps {
                        ecosystem.step();
                    }
                },
                BatchSize::LargeInput,
            );
        });
    }
    group.finish();
}

criterion_group!(benches, bench_ecosystem_steps);
criterion_main!(benches);
