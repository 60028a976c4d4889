use super::*;
use crate::{
    app_config::AppConfig,
    config::{ClassConfig, ResourceLimits, UserConfig},
    orchestrator::LifecycleOrchestrator,
    registry::{FileRegistry, LedgerStore, UserRecord},
};
use hyper::{Body, Request, Response};
use serde_json::json;
use std::collections::HashMap;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};
use test_case::test_case;
use tower_test::mock::{self, Handle};

fn status_success() -> Vec<u8> {
    serde_json::to_vec(&json!({
        "kind": "Status",
        "apiVersion": "v1",
        "metadata": {},
        "status": "Success",
        "code": 200
    }))
    .unwrap()
}

fn status_failure(message: &str, code: u16) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "kind": "Status",
        "apiVersion": "v1",
        "metadata": {},
        "status": "Failure",
        "message": message,
        "reason": "Conflict",
        "code": code
    }))
    .unwrap()
}

/// Answers the cluster requests the lifecycle flows issue. Deleting the
/// profile `bob` fails once so the forced escalation path gets exercised;
/// `dex_ok: false` simulates a broker outage.
async fn mock_k8s_handler(
    handle: &mut Handle<Request<Body>, Response<Body>>,
    calls: Arc<AtomicUsize>,
    dex_ok: bool,
) {
    let mut seen: HashMap<String, usize> = HashMap::new();
    while let Some((request, send)) = handle.next_request().await {
        calls.fetch_add(1, Ordering::SeqCst);
        let (parts, body) = request.into_parts();
        let request_body = hyper::body::to_bytes(body).await.unwrap();
        let method = parts.method.as_str().to_string();
        let path = parts.uri.path().to_string();
        let attempt = {
            let n = seen.entry(format!("{} {}", method, path)).or_insert(0);
            *n += 1;
            *n
        };

        let (status, response_body) = match (method.as_str(), path.as_str()) {
            ("POST", "/apis/kubeflow.org/v1/profiles") => (201, request_body.to_vec()),
            ("GET", "/api/v1/namespaces/auth/configmaps/dex") => {
                if dex_ok {
                    let configmap = json!({
                        "apiVersion": "v1",
                        "kind": "ConfigMap",
                        "metadata": { "name": "dex", "namespace": "auth" },
                        "data": {
                            "config.yaml":
                                "issuer: http://dex.auth.svc.cluster.local:5556/dex\nstaticPasswords: []\n"
                        }
                    });
                    (200, serde_json::to_vec(&configmap).unwrap())
                } else {
                    (500, status_failure("dex configmap unavailable", 500))
                }
            }
            ("PUT", "/api/v1/namespaces/auth/configmaps/dex") => (200, request_body.to_vec()),
            ("PATCH", "/apis/apps/v1/namespaces/auth/deployments/dex") => {
                let deployment = json!({
                    "apiVersion": "apps/v1",
                    "kind": "Deployment",
                    "metadata": { "name": "dex", "namespace": "auth" }
                });
                (200, serde_json::to_vec(&deployment).unwrap())
            }
            ("DELETE", "/apis/kubeflow.org/v1/profiles/bob") if attempt == 1 => {
                (500, status_failure("profile bob has pending finalizers", 500))
            }
            ("PATCH", "/apis/kubeflow.org/v1/profiles/bob") => {
                let profile = json!({
                    "apiVersion": "kubeflow.org/v1",
                    "kind": "Profile",
                    "metadata": { "name": "bob" }
                });
                (200, serde_json::to_vec(&profile).unwrap())
            }
            ("DELETE", p) if p.starts_with("/apis/kubeflow.org/v1/profiles/") => {
                (200, status_success())
            }
            ("DELETE", p) if p.starts_with("/api/v1/namespaces/") => (200, status_success()),
            _ => panic!("unexpected API request {} {}", method, path),
        };

        send.send_response(
            Response::builder()
                .status(status)
                .body(Body::from(response_body))
                .unwrap(),
        );
    }
}

struct TestEnv {
    orchestrator: LifecycleOrchestrator<FileRegistry>,
    calls: Arc<AtomicUsize>,
    registry_path: String,
    manifests_dir: String,
    _dir: tempfile::TempDir,
}

impl TestEnv {
    fn registry(&self) -> FileRegistry {
        FileRegistry::new(self.registry_path.clone())
    }
}

async fn make_env(dex_ok: bool, template_path: &str) -> TestEnv {
    let (mock_service, mut handle) = mock::pair::<Request<Body>, Response<Body>>();
    let calls = Arc::new(AtomicUsize::new(0));
    let handler_calls = calls.clone();
    let _spawned = tokio::spawn(async move {
        mock_k8s_handler(&mut handle, handler_calls, dex_ok).await;
    });

    let ctx = Context::empty();
    let manager = TenantK8sManager::new(mock_service, "default", &ctx).await;

    let dir = tempfile::tempdir().unwrap();
    let mut settings = AppConfig::default();
    settings.paths.template_path = template_path.to_string();
    settings.paths.manifests_dir = dir
        .path()
        .join("manifests")
        .to_string_lossy()
        .into_owned();
    settings.paths.registry_path = dir
        .path()
        .join("user_registry.json")
        .to_string_lossy()
        .into_owned();

    let registry_path = settings.paths.registry_path.clone();
    let manifests_dir = settings.paths.manifests_dir.clone();
    let registry = FileRegistry::new(registry_path.clone());
    TestEnv {
        orchestrator: LifecycleOrchestrator::new(manager, registry, settings, ctx),
        calls,
        registry_path,
        manifests_dir,
        _dir: dir,
    }
}

const TEMPLATE: &str = "templates/create-user-template.yaml";

fn limits() -> ResourceLimits {
    ResourceLimits {
        cpu_limit: "5".into(),
        memory_limit: "16Gi".into(),
        gpu_mem: "1".into(),
        gpu_count: "1".into(),
        storage_limit: "50Gi".into(),
    }
}

fn alice() -> UserConfig {
    UserConfig {
        profile_name: "alice".into(),
        user_email: "alice@paf-iast".into(),
        username: "alice".into(),
        password: "x7k2p".into(),
        limits: limits(),
    }
}

fn cs101(num_users: u32) -> ClassConfig {
    ClassConfig {
        class_name: "Intro to ML".into(),
        class_tag: "cs101".into(),
        num_users,
        limits: limits(),
    }
}

fn seed_user(env: &TestEnv, username: &str, class_tag: Option<&str>) {
    let mut registry = env.registry();
    registry
        .record_user(UserRecord::new(
            username,
            &format!("{}@paf-iast", username),
            class_tag,
            limits(),
        ))
        .unwrap();
}

#[tokio::test]
async fn created_user_is_recorded_with_its_exact_limits() {
    let mut env = make_env(true, TEMPLATE).await;
    let outcome = env.orchestrator.create_user(alice()).await.unwrap();
    assert!(outcome.all_succeeded());
    assert_eq!(outcome.succeeded, vec!["alice"]);

    let record = env.registry().get_active_user("alice").unwrap().unwrap();
    assert_eq!(record.limits, limits());
    assert_eq!(record.deletion_time, None);
    assert_eq!(record.class_tag, None);

    // profile apply + dex fetch/replace/restart
    assert_eq!(env.calls.load(Ordering::SeqCst), 4);
    assert!(std::path::Path::new(&env.manifests_dir)
        .join("create-user.yaml")
        .exists());
}

#[tokio::test]
async fn missing_template_leaves_no_records_and_makes_no_cluster_calls() {
    let mut env = make_env(true, "templates/no-such-template.yaml").await;
    let outcome = env.orchestrator.create_class(cs101(3)).await.unwrap();
    assert_eq!(outcome.succeeded.len(), 0);
    assert_eq!(outcome.failed.len(), 3);

    assert_eq!(env.calls.load(Ordering::SeqCst), 0);
    assert!(env
        .registry()
        .active_users_by_class("cs101")
        .unwrap()
        .is_empty());
    // the class record itself is written before any user is attempted
    assert!(env.registry().get_class("cs101").unwrap().is_some());
}

#[tokio::test]
async fn bulk_create_registers_class_users_and_credentials() {
    let mut env = make_env(true, TEMPLATE).await;
    let outcome = env.orchestrator.create_class(cs101(3)).await.unwrap();
    assert_eq!(outcome.succeeded, vec!["cs101-1", "cs101-2", "cs101-3"]);
    assert!(outcome.failed.is_empty());

    let active = env.registry().active_users_by_class("cs101").unwrap();
    assert_eq!(active, vec!["cs101-1", "cs101-2", "cs101-3"]);

    let class = env.registry().get_class("cs101").unwrap().unwrap();
    assert_eq!(class.num_users, 3);

    // 3 profile applies, then one dex fetch/replace/restart for the batch
    assert_eq!(env.calls.load(Ordering::SeqCst), 6);

    // the audit copy holds the exact document that was applied: one hashed
    // entry per created user
    let audit = std::fs::read_to_string(
        std::path::Path::new(&env.manifests_dir).join("updated-dex-config.yaml"),
    )
    .unwrap();
    let configmap: serde_yaml::Value = serde_yaml::from_str(&audit).unwrap();
    let embedded = configmap["data"]["config.yaml"].as_str().unwrap();
    let inner: serde_yaml::Value = serde_yaml::from_str(embedded).unwrap();
    let entries = inner["staticPasswords"].as_sequence().unwrap();
    assert_eq!(entries.len(), 3);
    for entry in entries {
        assert!(entry["hash"].as_str().unwrap().starts_with("$2"));
    }
}

#[tokio::test]
async fn dex_outage_keeps_cluster_resources_and_ledger_records() {
    let mut env = make_env(false, TEMPLATE).await;
    let result = env.orchestrator.create_class(cs101(2)).await;
    assert!(matches!(result, Err(ProvisionError::Api { .. })));

    // at-least-once: no rollback of what already happened
    let active = env.registry().active_users_by_class("cs101").unwrap();
    assert_eq!(active, vec!["cs101-1", "cs101-2"]);
}

#[test_case("alice", 2 ; "normal delete takes one profile and one namespace call")]
#[test_case("bob", 4 ; "forced delete adds a finalizer strip and a retry")]
#[tokio::test]
async fn deleting_a_user_marks_the_ledger_only_after_both_resources_are_gone(
    username: &str,
    expected_calls: usize,
) {
    let mut env = make_env(true, TEMPLATE).await;
    seed_user(&env, username, None);

    let outcome = env
        .orchestrator
        .delete_users(&[username.to_string()])
        .await;
    assert_eq!(outcome.succeeded, vec![username.to_string()]);
    assert!(outcome.failed.is_empty());

    assert!(env.registry().get_active_user(username).unwrap().is_none());
    assert_eq!(env.calls.load(Ordering::SeqCst), expected_calls);
}

#[tokio::test]
async fn declined_confirmation_makes_no_cluster_calls_and_keeps_the_ledger() {
    let mut env = make_env(true, TEMPLATE).await;
    seed_user(&env, "cs101-1", Some("cs101"));
    seed_user(&env, "cs101-2", Some("cs101"));

    let outcome = env
        .orchestrator
        .delete_class_users("cs101", |users| {
            assert_eq!(users, ["cs101-1", "cs101-2"]);
            false
        })
        .await
        .unwrap();

    assert!(outcome.succeeded.is_empty());
    assert!(outcome.failed.is_empty());
    assert_eq!(env.calls.load(Ordering::SeqCst), 0);
    assert_eq!(
        env.registry().active_users_by_class("cs101").unwrap(),
        vec!["cs101-1", "cs101-2"]
    );
}

#[tokio::test]
async fn confirmed_class_deletion_removes_every_active_user() {
    let mut env = make_env(true, TEMPLATE).await;
    seed_user(&env, "cs101-1", Some("cs101"));
    seed_user(&env, "cs101-2", Some("cs101"));

    let outcome = env
        .orchestrator
        .delete_class_users("cs101", |_| true)
        .await
        .unwrap();

    assert_eq!(outcome.succeeded, vec!["cs101-1", "cs101-2"]);
    assert!(env
        .registry()
        .active_users_by_class("cs101")
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn a_stalled_cluster_call_times_out_and_fails_the_user() {
    let (mock_service, mut handle) = mock::pair::<Request<Body>, Response<Body>>();
    let _spawned = tokio::spawn(async move {
        // accept the first request and never answer; later requests queue up
        // unanswered too, so every call runs into its deadline
        if let Some((_request, _send)) = handle.next_request().await {
            std::future::pending::<()>().await;
        }
    });

    let ctx = Context::empty();
    let manager = TenantK8sManager::new(mock_service, "default", &ctx)
        .await
        .with_deadlines(Deadlines {
            apply_secs: 1,
            delete_secs: 1,
        });

    let dir = tempfile::tempdir().unwrap();
    let mut settings = AppConfig::default();
    settings.paths.registry_path = dir
        .path()
        .join("user_registry.json")
        .to_string_lossy()
        .into_owned();
    let registry = FileRegistry::new(settings.paths.registry_path.clone());
    let mut orchestrator = LifecycleOrchestrator::new(manager, registry, settings, ctx);

    let outcome = orchestrator.delete_users(&["slow".to_string()]).await;
    assert!(outcome.succeeded.is_empty());
    assert_eq!(outcome.failed, vec!["slow"]);
}
