//! # Simulation Benchmarks
//!
//! Measures:
//! 1. Authoritative stepping for a full four-player room
//! 2. Building and replaying public-state instruction batches

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use serde_json::json;

use quadpong::core::{BoardSizes, DeterministicRng};
use quadpong::game::events::PlayerEvent;
use quadpong::game::server::{ServerSimConfig, ServerSimulator};
use quadpong::game::state::PlayerId;
use quadpong::replication::{Observed, Path, Replica};

fn running_sim(players: usize) -> ServerSimulator {
    let ids: Vec<PlayerId> = (0..players).map(|i| PlayerId::new(format!("p{i}"))).collect();
    let config = ServerSimConfig { round_countdown_ticks: 0, ..Default::default() };
    let mut sim = ServerSimulator::new(&ids, BoardSizes::default(), config, DeterministicRng::new(7));
    let _ = sim.start_match();
    sim
}

/// One second of play with inputs from every side
fn bench_server_step(c: &mut Criterion) {
    let mut group = c.benchmark_group("server_step");

    for players in [2usize, 4] {
        group.bench_with_input(BenchmarkId::new("60_ticks", players), &players, |b, &players| {
            b.iter_batched(
                || running_sim(players),
                |mut sim| {
                    for t in 0..60u64 {
                        let tick = sim.tick();
                        for index in 0..players {
                            let dir = if (t + index as u64) % 3 == 0 { -1 } else { 1 };
                            let _ = sim.queue_event(index, PlayerEvent::movement(t + 1, tick, dir));
                        }
                        black_box(sim.step().ok());
                    }
                    sim
                },
                criterion::BatchSize::SmallInput,
            );
        });
    }

    group.finish();
}

/// Log mutations on a lobby-sized document and replay them on a replica
fn bench_replication(c: &mut Criterion) {
    let mut group = c.benchmark_group("replication");

    for rooms in [10usize, 100] {
        group.bench_with_input(BenchmarkId::new("log_and_replay", rooms), &rooms, |b, &rooms| {
            b.iter(|| {
                let mut doc = Observed::new();
                let _ = doc.set(&Path::root().key("rooms"), json!({}));
                for i in 0..rooms {
                    let path = Path::root().key("rooms").key(format!("r{i}"));
                    let _ = doc.set(&path, json!({ "status": "waiting", "players": [] }));
                    let _ = doc.push(&path.clone().key("players"), json!(format!("p{i}")));
                    let _ = doc.set(&path.key("status"), json!("starting"));
                }

                let batch = Arc::new(doc.drain());
                let mut replica = Replica::new();
                replica.apply_state(1, None, json!({}));
                black_box(replica.apply_batch(&batch))
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_server_step, bench_replication);
criterion_main!(benches);
