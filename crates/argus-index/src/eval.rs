//! Evaluation engine: per-`(system, action)` shards of policies whose
//! expressions must be evaluated against each request.
use argus_policy::{Policy, SearchRequest, SnapshotRecord, Subject, SUBJECT_TYPE_ALL};
use dashmap::DashMap;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::error;

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// The policies of one `(system, action)` pair. The read lock is held for
/// the whole of a search scan; mutations take the write lock.
struct ActionShard {
    system: String,
    action: String,
    policies: RwLock<HashMap<i64, Arc<Policy>>>,
    last_index_time: AtomicI64,
}

impl ActionShard {
    fn new(system: &str, action: &str) -> Self {
        Self {
            system: system.to_string(),
            action: action.to_string(),
            policies: RwLock::new(HashMap::new()),
            last_index_time: AtomicI64::new(now_unix()),
        }
    }

    fn touch(&self) {
        self.last_index_time.store(now_unix(), Ordering::Relaxed);
    }

    fn size(&self) -> u64 {
        self.policies.read().map(|p| p.len() as u64).unwrap_or(0)
    }

    fn add(&self, policy: Arc<Policy>) {
        if let Ok(mut policies) = self.policies.write() {
            policies.insert(policy.id, policy);
        }
        self.touch();
    }

    fn bulk_delete(&self, ids: &[i64]) {
        if let Ok(mut policies) = self.policies.write() {
            for id in ids {
                policies.remove(id);
            }
        }
        self.touch();
    }

    fn delete_matching(&self, matcher: impl Fn(&Policy) -> bool) {
        if let Ok(mut policies) = self.policies.write() {
            policies.retain(|_, policy| !matcher(policy));
        }
        self.touch();
    }

    fn search(&self, req: &SearchRequest) -> Vec<Subject> {
        let Ok(policies) = self.policies.read() else {
            return Vec::new();
        };
        if policies.is_empty() {
            return Vec::new();
        }

        let objects = req.object_set();
        let mut subjects = Vec::new();
        let mut seen_uids: HashSet<&str> = HashSet::new();
        // Memoise per signature within this one query: templated policies
        // share expressions, so a batch commonly re-evaluates the same tree.
        let mut eval_memo: HashMap<&str, bool> = HashMap::new();

        for policy in policies.values() {
            if policy.expired_at < req.now_timestamp {
                continue;
            }
            if req.subject_type != SUBJECT_TYPE_ALL
                && req.subject_type != policy.subject.subject_type
            {
                continue;
            }
            if seen_uids.contains(policy.subject.uid.as_str()) {
                continue;
            }

            let allowed = match eval_memo.get(policy.expression_signature.as_str()) {
                Some(cached) => *cached,
                None => {
                    let result = policy.expression.eval(&objects);
                    eval_memo.insert(policy.expression_signature.as_str(), result);
                    result
                }
            };

            if allowed {
                seen_uids.insert(policy.subject.uid.as_str());
                subjects.push(policy.subject.clone());
            }
        }
        subjects
    }

    fn dump(&self) -> Vec<Policy> {
        self.policies
            .read()
            .map(|policies| policies.values().map(|p| (**p).clone()).collect())
            .unwrap_or_default()
    }
}

/// Typed concurrent registry of action shards, keyed `"system:action"`.
#[derive(Default)]
pub struct EvalEngine {
    shards: DashMap<String, Arc<ActionShard>>,
}

impl EvalEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn shard_key(system: &str, action: &str) -> String {
        format!("{system}:{action}")
    }

    fn get_shard(&self, system: &str, action: &str) -> Option<Arc<ActionShard>> {
        self.shards
            .get(&Self::shard_key(system, action))
            .map(|entry| Arc::clone(&entry))
    }

    fn get_or_create_shard(&self, system: &str, action: &str) -> Arc<ActionShard> {
        Arc::clone(
            &self
                .shards
                .entry(Self::shard_key(system, action))
                .or_insert_with(|| Arc::new(ActionShard::new(system, action))),
        )
    }

    /// Inserts or replaces by policy id. A policy must carry exactly one
    /// action here; anything else points at broken source data and is
    /// skipped with an error log.
    pub fn bulk_add(&self, policies: Vec<Policy>) {
        for policy in policies {
            if policy.actions.len() != 1 {
                error!(
                    policy_id = policy.id,
                    actions = policy.actions.len(),
                    "eval engine expects exactly one action per policy, skip"
                );
                continue;
            }
            let shard = self.get_or_create_shard(&policy.system, &policy.actions[0].id);
            shard.add(Arc::new(policy));
        }
    }

    pub fn bulk_delete(&self, ids: &[i64]) {
        if ids.is_empty() {
            return;
        }
        for entry in self.shards.iter() {
            entry.value().bulk_delete(ids);
        }
    }

    pub fn bulk_delete_by_subjects(&self, before_updated_at: i64, subjects: &[Subject]) {
        if subjects.is_empty() {
            return;
        }
        let uids: HashSet<String> = subjects
            .iter()
            .map(|s| format!("{}:{}", s.subject_type, s.id))
            .collect();
        for entry in self.shards.iter() {
            entry.value().delete_matching(|policy| {
                uids.contains(&policy.subject.uid) && policy.updated_at < before_updated_at
            });
        }
    }

    pub fn bulk_delete_by_template_subjects(
        &self,
        before_updated_at: i64,
        template_id: i64,
        subjects: &[Subject],
    ) {
        if subjects.is_empty() {
            return;
        }
        let uids: HashSet<String> = subjects
            .iter()
            .map(|s| format!("{}:{}", s.subject_type, s.id))
            .collect();
        for entry in self.shards.iter() {
            entry.value().delete_matching(|policy| {
                policy.template_id == template_id
                    && uids.contains(&policy.subject.uid)
                    && policy.updated_at < before_updated_at
            });
        }
    }

    pub fn search(&self, req: &SearchRequest) -> Vec<Subject> {
        match self.get_shard(&req.system, &req.action.id) {
            Some(shard) => shard.search(req),
            None => Vec::new(),
        }
    }

    pub fn size(&self, system: &str, action: &str) -> u64 {
        self.get_shard(system, action)
            .map(|shard| shard.size())
            .unwrap_or(0)
    }

    pub fn total(&self) -> u64 {
        self.shards.iter().map(|entry| entry.value().size()).sum()
    }

    pub fn take_snapshot(&self) -> Vec<SnapshotRecord> {
        self.shards
            .iter()
            .map(|entry| {
                let shard = entry.value();
                SnapshotRecord {
                    system: shard.system.clone(),
                    action: shard.action.clone(),
                    last_modified_timestamp: shard.last_index_time.load(Ordering::Relaxed),
                    eval_policies: shard.dump(),
                }
            })
            .collect()
    }

    pub fn load_snapshot(&self, records: Vec<SnapshotRecord>) {
        for record in records {
            let shard = self.get_or_create_shard(&record.system, &record.action);
            for policy in record.eval_policies {
                shard.add(Arc::new(policy));
            }
            shard
                .last_index_time
                .store(record.last_modified_timestamp, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn policy(id: i64, subject: (&str, &str), expression: serde_json::Value) -> Policy {
        let mut policy: Policy = serde_json::from_value(json!({
            "id": id,
            "system": "bk_cmdb",
            "action": {"id": "edit"},
            "subject": {"type": subject.0, "id": subject.1, "name": subject.1},
            "expression": expression,
            "expired_at": 4102444800i64,
            "updated_at": 100i64
        }))
        .expect("fixture");
        policy.fill_derived().expect("derive");
        policy
    }

    fn request(resource_attrs: serde_json::Value) -> SearchRequest {
        let mut req: SearchRequest = serde_json::from_value(json!({
            "system": "bk_cmdb",
            "action": {"id": "edit"},
            "resource": [{
                "system": "bk_cmdb", "type": "host", "id": "42",
                "attribute": resource_attrs
            }],
            "subject_type": "all",
            "limit": 0
        }))
        .expect("request");
        req.now_timestamp = 1700000000;
        for node in &mut req.resource {
            node.inject_id();
        }
        req
    }

    const AND_EXPR: fn() -> serde_json::Value = || {
        json!({"op": "AND", "content": [
            {"op": "eq", "field": "host.id", "value": "42"},
            {"op": "eq", "field": "host.owner", "value": "bob"}
        ]})
    };

    #[test]
    fn search_evaluates_policies_against_the_resource() {
        let engine = EvalEngine::new();
        engine.bulk_add(vec![policy(1, ("group", "admins"), AND_EXPR())]);

        let hit = engine.search(&request(json!({"owner": "bob"})));
        assert_eq!(hit.len(), 1);
        assert_eq!(hit[0].uid, "group:admins");

        let miss = engine.search(&request(json!({"owner": "carol"})));
        assert!(miss.is_empty());
    }

    #[test]
    fn absent_shard_returns_empty() {
        let engine = EvalEngine::new();
        assert!(engine.search(&request(json!({}))).is_empty());
    }

    #[test]
    fn expired_policies_are_skipped() {
        let engine = EvalEngine::new();
        let mut expired = policy(1, ("user", "bob"), AND_EXPR());
        expired.expired_at = 10;
        engine.bulk_add(vec![expired]);
        assert!(engine.search(&request(json!({"owner": "bob"}))).is_empty());
    }

    #[test]
    fn subject_type_filter_applies() {
        let engine = EvalEngine::new();
        engine.bulk_add(vec![
            policy(1, ("user", "bob"), AND_EXPR()),
            policy(2, ("group", "admins"), AND_EXPR()),
        ]);

        let mut req = request(json!({"owner": "bob"}));
        req.subject_type = "group".to_string();
        let subjects = engine.search(&req);
        assert_eq!(subjects.len(), 1);
        assert_eq!(subjects[0].subject_type, "group");
    }

    #[test]
    fn duplicate_subjects_are_admitted_once() {
        let engine = EvalEngine::new();
        engine.bulk_add(vec![
            policy(1, ("user", "bob"), AND_EXPR()),
            policy(2, ("user", "bob"), AND_EXPR()),
        ]);
        let subjects = engine.search(&request(json!({"owner": "bob"})));
        assert_eq!(subjects.len(), 1);
    }

    #[test]
    fn policies_without_exactly_one_action_are_skipped() {
        let engine = EvalEngine::new();
        let mut bad = policy(1, ("user", "bob"), AND_EXPR());
        bad.actions.push(argus_policy::Action {
            id: "view".to_string(),
        });
        engine.bulk_add(vec![bad]);
        assert_eq!(engine.total(), 0);
    }

    #[test]
    fn bulk_delete_by_subjects_respects_timestamp() {
        let engine = EvalEngine::new();
        engine.bulk_add(vec![policy(1, ("user", "bob"), AND_EXPR())]);

        let bob = vec![Subject::new("user", "bob")];
        // fixture updated_at is 100
        engine.bulk_delete_by_subjects(50, &bob);
        assert_eq!(engine.total(), 1);

        engine.bulk_delete_by_subjects(200, &bob);
        assert_eq!(engine.total(), 0);
    }

    #[test]
    fn upsert_replaces_by_policy_id() {
        let engine = EvalEngine::new();
        engine.bulk_add(vec![policy(1, ("user", "bob"), AND_EXPR())]);
        engine.bulk_add(vec![policy(1, ("user", "carol"), AND_EXPR())]);
        assert_eq!(engine.size("bk_cmdb", "edit"), 1);

        let subjects = engine.search(&request(json!({"owner": "bob"})));
        assert_eq!(subjects[0].id, "carol");
    }

    #[test]
    fn snapshot_round_trip_preserves_results() {
        let engine = EvalEngine::new();
        engine.bulk_add(vec![
            policy(1, ("user", "bob"), AND_EXPR()),
            policy(2, ("group", "admins"), AND_EXPR()),
        ]);

        let mut records = engine.take_snapshot();
        // simulate persistence: drop derived fields like the wire form does
        for record in &mut records {
            let bytes = serde_json::to_vec(record).expect("serialize");
            *record = serde_json::from_slice(&bytes).expect("deserialize");
            record.fill_policies_derived().expect("derive");
        }

        let restored = EvalEngine::new();
        restored.load_snapshot(records);

        let req = request(json!({"owner": "bob"}));
        let mut before: Vec<String> = engine.search(&req).into_iter().map(|s| s.uid).collect();
        let mut after: Vec<String> = restored.search(&req).into_iter().map(|s| s.uid).collect();
        before.sort();
        after.sort();
        assert_eq!(before, after);
        assert_eq!(restored.total(), 2);
    }
}
