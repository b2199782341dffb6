//! End-to-end engine flows: update, enforce, delete, ACL denial, cycles.

use std::sync::Arc;

use ballast_apply::{DriverRegistry, EnforcerConfig, NoopDriver};
use ballast_core::{BallastError, Generation, Metadata};
use ballast_engine::{
    all_types, ActionProgress, Enforcer, PolicyUpdater, Registry, RevisionStatus, UpdateOpts,
};
use ballast_policy::*;
use ballast_resolve::StaticExternalData;
use ballast_store::ObjectStore;
use tokio::sync::mpsc;

fn labels(pairs: &[(&str, &str)]) -> LabelSet {
    pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
}

fn admin() -> User {
    User { metadata: Metadata::new("user", "system", "root"), labels: labels(&[]), domain_admin: true }
}

fn consumer(name: &str, pairs: &[(&str, &str)]) -> User {
    User { metadata: Metadata::new("user", "system", name), labels: labels(pairs), domain_admin: false }
}

fn base_objects() -> Vec<PolicyObject> {
    vec![
        PolicyObject::AclRule(AclRule {
            metadata: Metadata::new("aclrule", "system", "everyone-consumes"),
            weight: 100,
            criteria: None,
            actions: AclActions { add_role: [(Role::Consumer, vec!["*".to_string()])].into() },
        }),
        PolicyObject::Cluster(Cluster {
            metadata: Metadata::new("cluster", "system", "east"),
            cluster_type: "noop".into(),
            labels: labels(&[]),
            config: serde_json::Value::Null,
        }),
        PolicyObject::Service(Service {
            metadata: Metadata::new("service", "main", "pipeline"),
            components: vec![
                Component {
                    name: "db".into(),
                    code: Some(Code {
                        code_type: "helm".into(),
                        params: serde_json::json!({ "chart": "postgres", "replicas": "1" }),
                    }),
                    contract: None,
                    dependencies: vec![],
                    discovery: serde_json::Value::Null,
                },
                Component {
                    name: "web".into(),
                    code: Some(Code {
                        code_type: "helm".into(),
                        params: serde_json::json!({ "chart": "webapp" }),
                    }),
                    contract: None,
                    dependencies: vec!["db".into()],
                    discovery: serde_json::Value::Null,
                },
            ],
        }),
        PolicyObject::Contract(Contract {
            metadata: Metadata::new("contract", "main", "analytics"),
            contexts: vec![
                Context {
                    name: "prod".into(),
                    criteria: Some(Criteria {
                        require_all: vec!["env == 'prod'".into()],
                        ..Default::default()
                    }),
                    change_labels: LabelOperations::default(),
                    allocation: Allocation { service: "pipeline".into() },
                    params: serde_json::Value::Null,
                },
                Context {
                    name: "staging".into(),
                    criteria: None,
                    change_labels: LabelOperations::default(),
                    allocation: Allocation { service: "pipeline".into() },
                    params: serde_json::Value::Null,
                },
            ],
        }),
        PolicyObject::Claim(Claim {
            metadata: Metadata::new("claim", "main", "web"),
            user: "alice".into(),
            contract: "analytics".into(),
            labels: labels(&[("cluster", "east")]),
        }),
    ]
}

struct Harness {
    updater: PolicyUpdater,
    enforcer: Enforcer,
    driver: Arc<NoopDriver>,
    _rx_guard: Option<mpsc::Receiver<()>>,
}

fn harness() -> Harness {
    let store = ObjectStore::in_memory(all_types());
    let registry = Arc::new(Registry::new(store));
    let external = Arc::new(StaticExternalData::with_users([
        consumer("alice", &[("env", "prod")]),
        consumer("bob", &[]),
    ]));
    let (updater, rx) = PolicyUpdater::new(Arc::clone(&registry), external);

    let driver = Arc::new(NoopDriver::new());
    let mut drivers = DriverRegistry::new();
    drivers.register("noop", driver.clone());
    let enforcer = Enforcer::new(
        registry,
        Arc::new(drivers),
        EnforcerConfig { driver_timeout_secs: 5, backoff_max_secs: 2, max_attempts: 2 },
    );
    Harness { updater, enforcer, driver, _rx_guard: Some(rx) }
}

#[tokio::test(start_paused = true)]
async fn update_resolve_enforce_round_trip() {
    let h = harness();
    let result = h
        .updater
        .apply_changes(base_objects(), &admin(), UpdateOpts::default())
        .unwrap();

    assert!(result.policy_changed);
    assert_eq!(result.policy_generation, Generation(1));
    assert_eq!(result.wait_for_revision, Some(Generation(1)));
    assert!(result.plan_as_text.contains("create"));
    assert!(result.event_log.iter().any(|e| e.message == "context-chosen: prod"));

    // the enforcement pass applies the plan via the noop driver
    assert!(h.enforcer.enforce_once().await.unwrap());
    let registry = h.updater.registry();
    let revision = registry.get_revision(Generation::EMPTY).unwrap().unwrap();
    assert_eq!(revision.status, RevisionStatus::Completed);
    assert!(revision.progress.iter().all(|p| *p == ActionProgress::Success));

    let created: Vec<&'static str> = h
        .driver
        .applied_actions()
        .iter()
        .filter(|(verb, _)| verb == "create")
        .map(|(_, k)| {
            if k.contains("/db#") {
                "db"
            } else if k.contains("/web#") {
                "web"
            } else {
                "root"
            }
        })
        .collect();
    assert_eq!(created, vec!["db", "web", "root"]);

    // component times were recorded for every instance
    let desired = registry.get_desired_state(&revision).unwrap().unwrap();
    for key in desired.instances.keys() {
        let times = registry.component_times(key).unwrap().unwrap();
        assert_eq!(times.first_seen, times.last_seen);
    }

    // a second signal with nothing new to do is a no-op
    assert!(!h.enforcer.enforce_once().await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn resubmitting_identical_objects_changes_nothing() {
    let h = harness();
    h.updater.apply_changes(base_objects(), &admin(), UpdateOpts::default()).unwrap();
    h.enforcer.enforce_once().await.unwrap();

    let result = h
        .updater
        .apply_changes(base_objects(), &admin(), UpdateOpts::default())
        .unwrap();
    assert!(!result.policy_changed);
    assert_eq!(result.policy_generation, Generation(1));
    assert_eq!(result.wait_for_revision, None);

    let registry = h.updater.registry();
    let revision = registry.get_revision(Generation::EMPTY).unwrap().unwrap();
    assert_eq!(revision.generation(), Generation(1));
}

#[tokio::test(start_paused = true)]
async fn noop_mode_previews_without_persisting() {
    let h = harness();
    let result = h
        .updater
        .apply_changes(base_objects(), &admin(), UpdateOpts { noop: true, ..Default::default() })
        .unwrap();
    assert!(!result.policy_changed);
    assert!(result.plan_as_text.contains("create"));

    let registry = h.updater.registry();
    assert!(registry.get_policy_data(Generation::EMPTY).unwrap().is_none());
    assert!(registry.get_revision(Generation::EMPTY).unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn unprivileged_submission_is_denied_and_policy_untouched() {
    let h = harness();
    h.updater.apply_changes(base_objects(), &admin(), UpdateOpts::default()).unwrap();

    let submission = vec![PolicyObject::Cluster(Cluster {
        metadata: Metadata::new("cluster", "platform", "rogue"),
        cluster_type: "noop".into(),
        labels: labels(&[]),
        config: serde_json::Value::Null,
    })];
    let err = h
        .updater
        .apply_changes(submission, &consumer("alice", &[]), UpdateOpts::default())
        .unwrap_err();
    assert!(matches!(err, BallastError::AclDenied { .. }));
    assert_eq!(err.status_code(), 403);

    // policy generation unchanged, no extra revision
    let registry = h.updater.registry();
    let (policy, gen) = registry.get_policy(Generation::EMPTY).unwrap();
    assert_eq!(gen, Generation(1));
    assert!(policy.get_object("cluster", "rogue", "platform").is_none());
}

#[tokio::test(start_paused = true)]
async fn contract_cycle_blocks_the_update_entirely() {
    let h = harness();
    let mut objects = vec![PolicyObject::Cluster(Cluster {
        metadata: Metadata::new("cluster", "system", "east"),
        cluster_type: "noop".into(),
        labels: labels(&[]),
        config: serde_json::Value::Null,
    })];
    for (contract, service, sub) in [("a", "svc-a", "b"), ("b", "svc-b", "a")] {
        objects.push(PolicyObject::Service(Service {
            metadata: Metadata::new("service", "main", service),
            components: vec![Component {
                name: "inner".into(),
                code: None,
                contract: Some(sub.into()),
                dependencies: vec![],
                discovery: serde_json::Value::Null,
            }],
        }));
        objects.push(PolicyObject::Contract(Contract {
            metadata: Metadata::new("contract", "main", contract),
            contexts: vec![Context {
                name: "default".into(),
                criteria: None,
                change_labels: LabelOperations::default(),
                allocation: Allocation { service: service.into() },
                params: serde_json::Value::Null,
            }],
        }));
    }
    objects.push(PolicyObject::Claim(Claim {
        metadata: Metadata::new("claim", "main", "tangled"),
        user: "bob".into(),
        contract: "a".into(),
        labels: labels(&[("cluster", "east")]),
    }));

    let err = h.updater.apply_changes(objects, &admin(), UpdateOpts::default()).unwrap_err();
    assert!(matches!(err, BallastError::ResolutionCycle { .. }));

    // nothing was persisted
    let registry = h.updater.registry();
    assert!(registry.get_policy_data(Generation::EMPTY).unwrap().is_none());
    assert!(registry.get_revision(Generation::EMPTY).unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn deleting_the_claim_tears_the_tree_down() {
    let h = harness();
    h.updater.apply_changes(base_objects(), &admin(), UpdateOpts::default()).unwrap();
    h.enforcer.enforce_once().await.unwrap();
    h.driver.applied.lock().unwrap().clear();

    let claim = vec![PolicyObject::Claim(Claim {
        metadata: Metadata::new("claim", "main", "web"),
        user: "alice".into(),
        contract: "analytics".into(),
        labels: labels(&[("cluster", "east")]),
    })];
    let result = h.updater.delete_objects(claim, &admin(), UpdateOpts::default()).unwrap();
    assert!(result.policy_changed);
    assert_eq!(result.policy_generation, Generation(2));
    assert!(result.plan_as_text.contains("delete"));

    assert!(h.enforcer.enforce_once().await.unwrap());
    let deletes: Vec<String> = h
        .driver
        .applied_actions()
        .iter()
        .filter(|(verb, _)| verb == "delete")
        .map(|(_, k)| k.clone())
        .collect();
    assert_eq!(deletes.len(), 3);
    // root goes first (reverse topological order), its prerequisites after
    assert!(!deletes[0].contains("/db#") && !deletes[0].contains("/web#"));

    // the deleted claim is explicit in the new desired state: absent
    let registry = h.updater.registry();
    let revision = registry.get_revision(Generation::EMPTY).unwrap().unwrap();
    let desired = registry.get_desired_state(&revision).unwrap().unwrap();
    assert!(desired.instances.is_empty());
    assert!(desired.claim_results.is_empty());
}

#[tokio::test(start_paused = true)]
async fn updating_code_params_produces_update_actions() {
    let h = harness();
    h.updater.apply_changes(base_objects(), &admin(), UpdateOpts::default()).unwrap();
    h.enforcer.enforce_once().await.unwrap();
    h.driver.applied.lock().unwrap().clear();

    let mut objects = base_objects();
    if let PolicyObject::Service(service) = &mut objects[2] {
        service.components[0].code.as_mut().unwrap().params =
            serde_json::json!({ "chart": "postgres", "replicas": "3" });
    }
    let result = h.updater.apply_changes(objects, &admin(), UpdateOpts::default()).unwrap();
    assert!(result.policy_changed);
    assert_eq!(result.policy_generation, Generation(2));
    assert!(result.plan_as_text.contains("update"));

    h.enforcer.enforce_once().await.unwrap();
    let applied = h.driver.applied_actions();
    let updates: Vec<&(String, String)> =
        applied.iter().filter(|(verb, _)| verb == "update").collect();
    assert_eq!(updates.len(), 1);
    assert!(updates[0].1.contains("/db#"));
}

#[tokio::test(start_paused = true)]
async fn endpoints_surface_from_the_latest_revision() {
    let h = harness();
    h.driver
        .endpoints_by_component
        .lock()
        .unwrap()
        .insert("web".into(), vec!["http://web.example".into()]);
    h.updater.apply_changes(base_objects(), &admin(), UpdateOpts::default()).unwrap();
    h.enforcer.enforce_once().await.unwrap();

    let endpoints = h.enforcer.endpoints().await.unwrap();
    assert_eq!(endpoints.len(), 1);
    let (key, urls) = endpoints.iter().next().unwrap();
    assert!(key.0.contains("/web#"));
    assert_eq!(urls, &vec!["http://web.example".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn signal_channel_coalesces_and_drives_the_loop() {
    let store = ObjectStore::in_memory(all_types());
    let registry = Arc::new(Registry::new(store));
    let external = Arc::new(StaticExternalData::with_users([consumer("alice", &[("env", "prod")])]));
    let (updater, rx) = PolicyUpdater::new(Arc::clone(&registry), external);

    let driver = Arc::new(NoopDriver::new());
    let mut drivers = DriverRegistry::new();
    drivers.register("noop", driver.clone());
    let enforcer = Enforcer::new(
        Arc::clone(&registry),
        Arc::new(drivers),
        EnforcerConfig { driver_timeout_secs: 5, backoff_max_secs: 2, max_attempts: 2 },
    );
    let handle = enforcer.spawn(rx);

    updater.apply_changes(base_objects(), &admin(), UpdateOpts::default()).unwrap();
    // wait for the loop to process the signal
    for _ in 0..100 {
        tokio::task::yield_now().await;
        let revision = registry.get_revision(Generation::EMPTY).unwrap();
        if matches!(revision, Some(ref r) if r.status == RevisionStatus::Completed) {
            break;
        }
    }
    let revision = registry.get_revision(Generation::EMPTY).unwrap().unwrap();
    assert_eq!(revision.status, RevisionStatus::Completed);

    drop(updater); // all senders gone: the loop exits
    handle.await.unwrap();
}
