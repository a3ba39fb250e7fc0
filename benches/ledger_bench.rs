//! Performance benchmarks for the consent ledger.
//!
//! Run with: cargo bench

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{Duration, TimeZone, Utc};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use serde_json::json;

use consent_ledger::audit::verify_entries;
use consent_ledger::config::ScoringConfig;
use consent_ledger::crypto::{compute_entry_hash, payload_digest};
use consent_ledger::domain::{
    AccessRequest, Actor, AnonymizationLevel, AuditEntry, AuditPayload, BuyerId, ChainHead,
    DataCategory, NewGrant, UserId,
};
use consent_ledger::infra::{ManualClock, MemoryDataSource};
use consent_ledger::packaging::SchemaRegistry;
use consent_ledger::trust::score_history;
use consent_ledger::{ConsentCore, CoreConfig};

fn buyer() -> BuyerId {
    BuyerId::new("acme-analytics")
}

/// Build a valid chain of `count` compliance entries
fn create_chain(count: usize) -> Vec<AuditEntry> {
    let start = Utc.with_ymd_and_hms(2024, 9, 1, 10, 0, 0).unwrap();
    let actor = Actor::admin("ops-oncall");
    let mut prev_hash = ChainHead::genesis().hash;

    (0..count)
        .map(|i| {
            let payload = if i % 7 == 0 {
                AuditPayload::PolicyViolation {
                    buyer_id: buyer(),
                    description: format!("violation {i}"),
                }
            } else {
                AuditPayload::DsrFulfilled {
                    buyer_id: buyer(),
                    request_ref: format!("dsr-{i}"),
                    on_time: i % 3 != 0,
                    latency_hours: (i % 72) as u32,
                }
            };
            let sequence = i as u64 + 1;
            let recorded_at = start + Duration::seconds(i as i64);
            let action = payload.action();
            let entry_hash =
                compute_entry_hash(sequence, &prev_hash, &actor, action, &recorded_at, &payload)
                    .unwrap();
            let entry = AuditEntry {
                sequence,
                prev_hash,
                entry_hash,
                actor: actor.clone(),
                action,
                recorded_at,
                payload,
            };
            prev_hash = entry_hash;
            entry
        })
        .collect()
}

fn raw_location() -> BTreeMap<String, serde_json::Value> {
    BTreeMap::from([
        ("street".to_string(), json!("742 Evergreen Terrace")),
        ("lat".to_string(), json!(44.0462)),
        ("lon".to_string(), json!(-123.0220)),
        ("zip".to_string(), json!("97403")),
        ("city".to_string(), json!("Springfield")),
        ("country".to_string(), json!("US")),
        ("captured_at".to_string(), json!("2024-08-30T18:22:05Z")),
    ])
}

/// Benchmark a single entry hash
fn bench_entry_hash(c: &mut Criterion) {
    let actor = Actor::user(&UserId::new("user-alice-7f3a"));
    let payload = AuditPayload::PolicyViolation {
        buyer_id: buyer(),
        description: "late deletion of expired data".into(),
    };
    let recorded_at = Utc.with_ymd_and_hms(2024, 9, 1, 10, 0, 0).unwrap();
    let prev_hash = [7u8; 32];

    c.bench_function("entry_hash", |b| {
        b.iter(|| {
            black_box(compute_entry_hash(
                42,
                &prev_hash,
                &actor,
                payload.action(),
                &recorded_at,
                &payload,
            ))
        });
    });
}

/// Benchmark full chain verification
fn bench_verify_chain(c: &mut Criterion) {
    let mut group = c.benchmark_group("verify_chain");

    for count in [10, 100, 1000].iter() {
        let entries = create_chain(*count);
        group.throughput(Throughput::Elements(*count as u64));
        group.bench_with_input(BenchmarkId::new("entries", count), count, |b, &count| {
            b.iter(|| {
                black_box(verify_entries(
                    &entries,
                    1,
                    count as u64,
                    ChainHead::genesis().hash,
                ))
            });
        });
    }

    group.finish();
}

/// Benchmark scoring over a full window
fn bench_scoring(c: &mut Criterion) {
    let config = ScoringConfig::default();
    let window = create_chain(config.window_size);

    c.bench_function("score_window", |b| {
        b.iter(|| black_box(score_history(&buyer(), &window, &config)));
    });
}

/// Benchmark transform plus release verification at each level
fn bench_anonymization(c: &mut Criterion) {
    let schema = SchemaRegistry::default();
    let user = UserId::new("user-alice-7f3a");
    let category = DataCategory::new("location");
    let raw = raw_location();
    let mut group = c.benchmark_group("anonymization");

    for level in AnonymizationLevel::ALL {
        group.bench_with_input(BenchmarkId::new("transform_verify", level), &level, |b, &level| {
            b.iter(|| {
                let released = schema.transform(&user, &category, level, &raw);
                black_box(schema.verify_release(&user, &category, &raw, &released)).ok();
                black_box(payload_digest(&released)).ok();
            });
        });
    }

    group.finish();
}

/// Benchmark the validator end to end over in-memory storage
fn bench_evaluate(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let clock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2024, 9, 1, 10, 0, 0).unwrap(),
    ));
    let user = UserId::new("user-alice-7f3a");
    let category = DataCategory::new("location");

    let core = runtime.block_on(async {
        let source = MemoryDataSource::new();
        source.insert(user.clone(), category.clone(), raw_location()).await;
        let core = ConsentCore::in_memory(CoreConfig::default(), Arc::new(source), clock)
            .await
            .unwrap();
        core.onboard_buyer(&buyer(), Actor::admin("ops-oncall"))
            .await
            .unwrap();
        core.record_grant(
            NewGrant::new(user.clone(), buyer(), category.clone(), "research")
                .with_scope(["lat", "lon", "zip", "country"])
                .with_level(AnonymizationLevel::Partial),
            Actor::user(&user),
        )
        .await
        .unwrap();
        core
    });
    let request =
        AccessRequest::new(buyer(), user, category, "research").with_scope(["lat", "zip"]);

    c.bench_function("evaluate", |b| {
        b.to_async(&runtime)
            .iter(|| async { black_box(core.evaluate(&request).await.unwrap()) });
    });
}

criterion_group!(
    benches,
    bench_entry_hash,
    bench_verify_chain,
    bench_scoring,
    bench_anonymization,
    bench_evaluate
);
criterion_main!(benches);
