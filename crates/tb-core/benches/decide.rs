use criterion::{black_box, criterion_group, criterion_main, Criterion};

use tb_core::{BlockDecisionEngine, DayKey, TrackedWebsite, TrackerConfig, TrackerState};

const NOW: i64 = 1_792_152_000_000;

fn build_state(sites: usize) -> TrackerState {
    let today = DayKey::for_timestamp(NOW, 0);
    let mut state = TrackerState::new();
    for i in 0..sites {
        state.blocked.add(&format!("blocked{i}.example.com")).ok();
    }
    let websites = (0..sites).map(|i| {
        let mut website = TrackedWebsite::new(format!("tracked{i}.example.org"), 60, &today);
        website.time_spent_minutes = (i % 61) as u32;
        website
    });
    state.budgets.replace_websites(websites);
    state
}

fn bench_decide(c: &mut Criterion) {
    let state = build_state(10_000);
    let engine = BlockDecisionEngine::new(&TrackerConfig::default());
    let hosts = [
        "www.blocked42.example.com",
        "cdn.static.tracked4242.example.org",
        "tracked59.example.org",
        "unrelated.host.net",
    ];

    let mut group = c.benchmark_group("decide");
    for host in hosts {
        group.bench_function(host, |b| {
            b.iter(|| engine.decide(black_box(&state), black_box(host), NOW))
        });
    }
    group.finish();
}

criterion_group!(benches, bench_decide);
criterion_main!(benches);
