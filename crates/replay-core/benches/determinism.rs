//! Benchmarks for replaying contract histories.
//!
//! Measures a cold fold (no checkpoints), a pure cache hit, and sort-key
//! ordering of a shuffled batch.

use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use serde_json::json;
use sha2::{Digest, Sha256};

use replay_core::executor::NativeRegistry;
use replay_core::loader::InMemoryLedger;
use replay_core::{
    BlockInfo, ContractDefinition, ContractSource, EvaluationOptions, Interaction,
    InteractionsSorter, LexicographicalSorter, StateEvaluator,
};

const INTERACTIONS: u64 = 500;

const COUNTER: &str = r#"
    fn handle(state, action) {
        if action.input.function == "add" {
            state.counter = state.counter + action.input.by;
            return { state: state };
        }
        throw "unknown function";
    }
"#;

fn ledger_id(seed: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(seed.as_bytes()))
}

fn interactions() -> Vec<Interaction> {
    (0..INTERACTIONS)
        .map(|i| {
            // Five interactions per block.
            let height = i / 5 + 1;
            Interaction::new(
                ledger_id(&format!("tx/{i}")),
                "bench",
                BlockInfo::new(height, ledger_id(&format!("block/{height}")), height),
                json!({"function": "add", "by": i % 7}).to_string(),
            )
        })
        .collect()
}

fn ledger() -> InMemoryLedger {
    let ledger = InMemoryLedger::new();
    ledger.deploy(ContractDefinition {
        contract_id: "counter".into(),
        source_id: ledger_id("counter-source"),
        source: ContractSource::script(COUNTER),
        initial_state: json!({"counter": 0}),
        owner: "bench".into(),
    });
    for tx in interactions() {
        ledger.push_interaction("counter", tx);
    }
    ledger
}

fn evaluator(ledger: &InMemoryLedger) -> StateEvaluator {
    let shared = Arc::new(ledger.clone());
    StateEvaluator::builder(shared.clone(), shared)
        .natives(NativeRegistry::new())
        .options(EvaluationOptions::default().with_timeout(None))
        .build()
}

fn bench_cold_fold(c: &mut Criterion) {
    let ledger = ledger();
    c.bench_function("cold_fold_500", |b| {
        b.iter_batched(
            || evaluator(&ledger),
            |evaluator| black_box(evaluator.read_state("counter", None)),
            BatchSize::SmallInput,
        )
    });
}

fn bench_cache_hit(c: &mut Criterion) {
    let ledger = ledger();
    let evaluator = evaluator(&ledger);
    let _ = evaluator.read_state("counter", None);
    c.bench_function("cache_hit_500", |b| {
        b.iter(|| black_box(evaluator.read_state("counter", None)))
    });
}

fn bench_sort(c: &mut Criterion) {
    let mut shuffled = interactions();
    shuffled.reverse();
    c.bench_function("sort_500", |b| {
        b.iter_batched(
            || shuffled.clone(),
            |batch| black_box(LexicographicalSorter.sort(batch)),
            BatchSize::SmallInput,
        )
    });
}

criterion_group!(benches, bench_cold_fold, bench_cache_hit, bench_sort);
criterion_main!(benches);
