//! Shared fixtures for the engine integration tests.
#![allow(dead_code)]
use argus_authority::{AuthorityClient, AuthorityResult};
use argus_engine::app::{AppState, build_router};
use argus_engine::auth::AuthState;
use argus_index::doc::memory::MemoryDocumentStore;
use argus_index::{DocEngine, EvalEngine, Index};
use argus_policy::{InstanceKind, Policy};
use argus_snapshot::SnapshotStore;
use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::http::Request;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio::sync::mpsc;

/// In-process authority: serves a mutable policy table and accepts one
/// app-code/secret pair.
pub struct FakeAuthority {
    pub policies: Mutex<HashMap<i64, Policy>>,
    pub valid_secret: String,
    pub system_clients: Vec<String>,
}

impl FakeAuthority {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            policies: Mutex::new(HashMap::new()),
            valid_secret: "s3cret".to_string(),
            system_clients: vec!["bk_cmdb".to_string()],
        })
    }

    pub fn insert(&self, policy: Policy) {
        self.policies.lock().unwrap().insert(policy.id, policy);
    }

    pub fn remove(&self, id: i64) {
        self.policies.lock().unwrap().remove(&id);
    }
}

#[async_trait]
impl AuthorityClient for FakeAuthority {
    async fn ping(&self) -> AuthorityResult<()> {
        Ok(())
    }

    async fn max_policy_id(&self, _updated_at: i64) -> AuthorityResult<i64> {
        Ok(self
            .policies
            .lock()
            .unwrap()
            .keys()
            .copied()
            .max()
            .unwrap_or(0))
    }

    async fn list_policy_ids_between(
        &self,
        begin_updated_at: i64,
        end_updated_at: i64,
    ) -> AuthorityResult<Vec<i64>> {
        Ok(self
            .policies
            .lock()
            .unwrap()
            .values()
            .filter(|policy| {
                policy.updated_at >= begin_updated_at && policy.updated_at <= end_updated_at
            })
            .map(|policy| policy.id)
            .collect())
    }

    async fn list_policies_between_ids(
        &self,
        _timestamp: i64,
        min_id: i64,
        max_id: i64,
    ) -> AuthorityResult<Vec<Policy>> {
        Ok(self
            .policies
            .lock()
            .unwrap()
            .values()
            .filter(|policy| policy.id >= min_id && policy.id <= max_id)
            .cloned()
            .collect())
    }

    async fn list_policies_by_ids(&self, ids: &[i64]) -> AuthorityResult<Vec<Policy>> {
        let policies = self.policies.lock().unwrap();
        Ok(ids
            .iter()
            .filter_map(|id| policies.get(id).cloned())
            .collect())
    }

    async fn system_clients(&self, _system_id: &str) -> AuthorityResult<Vec<String>> {
        Ok(self.system_clients.clone())
    }

    async fn verify_credentials(
        &self,
        _app_code: &str,
        app_secret: &str,
    ) -> AuthorityResult<bool> {
        Ok(app_secret == self.valid_secret)
    }
}

pub fn policy(id: i64, subject: (&str, &str), expression: Value) -> Policy {
    serde_json::from_value(json!({
        "version": "1",
        "id": id,
        "system": "bk_cmdb",
        "action": {"id": "edit"},
        "subject": {"type": subject.0, "id": subject.1, "name": subject.1},
        "template_id": 0,
        "expression": expression,
        "expired_at": 4102444800i64,
        "updated_at": 100i64
    }))
    .expect("policy fixture")
}

pub struct TestApp {
    pub router: Router,
    pub index: Arc<Index>,
    pub authority: Arc<FakeAuthority>,
    pub full_sync_rx: mpsc::Receiver<()>,
    // keeps the snapshot directory alive for the test's duration
    pub storage_dir: TempDir,
}

/// An engine wired onto the in-memory document store, a fake authority and
/// a fresh snapshot directory. `apigw_public_key` enables the gateway auth
/// path; `super_app_codes` seeds the bypass set.
pub fn test_app(apigw_public_key: Option<&str>, super_app_codes: Vec<String>) -> TestApp {
    let authority = FakeAuthority::new();
    let index = Arc::new(Index::new(
        DocEngine::new(Arc::new(MemoryDocumentStore::new())),
        EvalEngine::new(),
    ));
    let storage_dir = TempDir::new().expect("storage dir");
    let snapshot_store = Arc::new(SnapshotStore::new(storage_dir.path(), InstanceKind::Abac));
    let auth = Arc::new(
        AuthState::new(
            authority.clone() as Arc<dyn AuthorityClient>,
            apigw_public_key,
            super_app_codes,
        )
        .expect("auth state"),
    );
    let (full_sync_tx, full_sync_rx) = mpsc::channel(1);

    let state = AppState {
        index: Arc::clone(&index),
        auth,
        authority: authority.clone(),
        snapshot_store,
        full_sync_tx,
    };

    TestApp {
        router: build_router(state),
        index,
        authority,
        full_sync_rx,
        storage_dir,
    }
}

pub fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .header("x-bk-app-code", "bk_cmdb")
        .header("x-bk-app-secret", "s3cret")
        .body(Body::from(body.to_string()))
        .expect("request")
}

pub fn json_request_as(
    method: &str,
    uri: &str,
    app_code: &str,
    app_secret: &str,
    body: Option<Value>,
) -> Request<Body> {
    let body = match body {
        Some(value) => Body::from(value.to_string()),
        None => Body::empty(),
    };
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .header("x-bk-app-code", app_code)
        .header("x-bk-app-secret", app_secret)
        .body(body)
        .expect("request")
}

pub async fn read_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    serde_json::from_slice(&bytes).expect("json")
}

pub fn search_body(resource_id: &str, attrs: Value, limit: i64) -> Value {
    json!({
        "system": "bk_cmdb",
        "action": {"id": "edit"},
        "resource": [{
            "system": "bk_cmdb",
            "type": "host",
            "id": resource_id,
            "attribute": attrs
        }],
        "subject_type": "all",
        "limit": limit
    })
}
