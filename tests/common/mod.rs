//! Common test utilities and fixtures for integration tests

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use serde_json::json;

use consent_ledger::domain::{
    AccessRequest, Actor, AnonymizationLevel, BuyerId, DataCategory, NewGrant, UserId,
};
use consent_ledger::infra::{DataSource, ManualClock, MemoryDataSource};
use consent_ledger::{ConsentCore, CoreConfig};

/// Logical T0 for every scenario
pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 9, 1, 10, 0, 0).unwrap()
}

pub fn test_clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(start_time()))
}

/// Test buyer
pub fn acme() -> BuyerId {
    BuyerId::new("acme-analytics")
}

/// Test user
pub fn alice() -> UserId {
    UserId::new("user-alice-7f3a")
}

pub fn location() -> DataCategory {
    DataCategory::new("location")
}

pub fn health() -> DataCategory {
    DataCategory::new("health")
}

pub fn ops() -> Actor {
    Actor::admin("ops-oncall")
}

/// Raw location record for alice
pub fn alice_location() -> BTreeMap<String, serde_json::Value> {
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

/// Raw health record for alice
pub fn alice_health() -> BTreeMap<String, serde_json::Value> {
    BTreeMap::from([
        ("name".to_string(), json!("Alice Example")),
        ("ssn".to_string(), json!("078-05-1120")),
        ("diagnosis".to_string(), json!("seasonal allergies")),
        ("age".to_string(), json!(34)),
        ("weight_kg".to_string(), json!(61.5)),
        ("blood_type".to_string(), json!("O+")),
        ("steps".to_string(), json!(10432)),
    ])
}

pub async fn data_source() -> Arc<dyn DataSource> {
    let source = MemoryDataSource::new();
    source.insert(alice(), location(), alice_location()).await;
    source.insert(alice(), health(), alice_health()).await;
    Arc::new(source)
}

/// In-memory engine with `acme` already onboarded
pub async fn memory_core(config: CoreConfig) -> (Arc<ConsentCore>, Arc<ManualClock>) {
    let clock = test_clock();
    let core = ConsentCore::in_memory(config, data_source().await, clock.clone())
        .await
        .unwrap();
    core.onboard_buyer(&acme(), ops()).await.unwrap();
    (Arc::new(core), clock)
}

pub fn location_grant(purpose: &str, level: AnonymizationLevel) -> NewGrant {
    NewGrant::new(alice(), acme(), location(), purpose)
        .with_scope(["street", "lat", "lon", "zip", "city", "country", "captured_at"])
        .with_level(level)
        .with_policy_version("2024-06")
}

pub fn location_request(purpose: &str) -> AccessRequest {
    AccessRequest::new(acme(), alice(), location(), purpose)
        .with_scope(["street", "lat", "lon", "zip", "country"])
}
