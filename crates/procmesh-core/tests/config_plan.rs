//! Config -> plan -> teardown targets, through the public API only.

use procmesh_core::{
    check_instance_count, InstanceState, LifecyclePlan, MeshConfig, OrchestratorError, ProbeSpec,
    RunRecord, TeardownMode, TeardownSpec, MAX_INSTANCE_COUNT,
};

const DEVNET: &str = r#"
[settings]
spawn_grace_ms = 100
log_dir = "logs"

[[roles]]
name = "router"
command = ["ya-sb-router", "-l", "tcp://127.0.0.1:{port}"]
base_port = 7464
readiness = { kind = "tcp", address = "127.0.0.1:{port}" }

[[roles]]
name = "matcher"
command = ["matcher-server"]
enabled = false

[[roles]]
name = "provider"
indexed = true
command = ["provider-node", "--name", "{name}", "--peers", "{count}"]
env = { NODE_INDEX = "{index}" }

[[steps]]
name = "network"
roles = ["router"]
ready_delay_secs = 2
ready_timeout_secs = 10

[[steps]]
name = "services"
roles = ["matcher"]
ready_delay_secs = 1

[[steps]]
name = "nodes"
roles = ["provider"]
"#;

#[test]
fn test_devnet_plan_for_three_nodes() {
    let config = MeshConfig::from_toml_str(DEVNET).unwrap();
    let plan = LifecyclePlan::build(&config, Some(3)).unwrap();

    // the matcher is disabled, so its step disappears
    let names: Vec<&str> = plan.steps.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, vec!["network", "nodes"]);
    assert_eq!(plan.steps[1].index, 1);
    assert_eq!(plan.instance_count(), 4);

    let router = &plan.steps[0].instances[0];
    assert_eq!(router.command[2], "tcp://127.0.0.1:7464");
    assert_eq!(
        router.readiness,
        Some(ProbeSpec::Tcp {
            address: "127.0.0.1:7464".to_string()
        })
    );
    assert_eq!(plan.steps[0].ready_timeout.as_secs(), 10);

    let provider = &plan.steps[1].instances[2];
    assert_eq!(provider.name, "provider-2");
    assert_eq!(provider.command, vec!["provider-node", "--name", "provider-2", "--peers", "3"]);
    assert_eq!(provider.env["NODE_INDEX"], "2");

    assert_eq!(plan.minimum_duration().as_secs(), 2);
}

#[test]
fn test_digest_tracks_count() {
    let config = MeshConfig::from_toml_str(DEVNET).unwrap();
    let a = LifecyclePlan::build(&config, Some(2)).unwrap();
    let b = LifecyclePlan::build(&config, Some(2)).unwrap();
    let c = LifecyclePlan::build(&config, Some(3)).unwrap();
    assert_eq!(a.digest, b.digest);
    assert_ne!(a.digest, c.digest);
    assert_eq!(a.short_digest().len(), 12);
}

#[test]
fn test_teardown_targets_cover_disabled_roles() {
    let config = MeshConfig::from_toml_str(DEVNET).unwrap();
    let spec = TeardownSpec::from_config(&config, 2);
    assert_eq!(spec.mode, TeardownMode::Owned);

    let names: Vec<String> = spec.targets().into_iter().map(|t| t.name).collect();
    assert_eq!(names, vec!["router", "matcher", "provider-0", "provider-1"]);

    let only = spec.only_roles(&["provider".to_string()]);
    assert_eq!(only.targets().len(), 2);
}

#[test]
fn test_negative_instance_count_is_invalid_argument() {
    let text = DEVNET.replace("indexed = true", "indexed = true\ninstance_count = -1");
    let err = MeshConfig::from_toml_str(&text).unwrap_err();
    assert!(matches!(err, OrchestratorError::InvalidArgument(_)));
}

#[test]
fn test_unknown_role_in_step_is_rejected() {
    let text = DEVNET.replace(r#"roles = ["matcher"]"#, r#"roles = ["vanity"]"#);
    let err = MeshConfig::from_toml_str(&text).unwrap_err();
    assert!(err.to_string().contains("vanity"));
}

#[test]
fn test_builtin_network_loads_when_file_is_missing() {
    let dir = tempfile::tempdir().unwrap();
    let config = MeshConfig::load_or_default(&dir.path().join("procmesh.toml")).unwrap();
    assert!(config.role("matcher").map(|r| !r.enabled).unwrap_or(false));

    let plan = LifecyclePlan::build(&config, Some(2)).unwrap();
    let roles: Vec<&str> = plan.steps.iter().flat_map(|s| s.roles()).collect();
    assert_eq!(
        roles,
        vec!["router", "vanity", "attestation", "provider", "requestor"]
    );
}

#[test]
fn test_run_record_file_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state").join("run.json");
    assert!(RunRecord::load(&path).unwrap().is_none());

    let record = RunRecord::new("abc", 2);
    record.save(&path).unwrap();
    let loaded = RunRecord::load(&path).unwrap().unwrap();
    assert_eq!(loaded, record);

    // no instances left: the file goes away
    loaded.save_or_remove(&path).unwrap();
    assert!(!path.exists());
}

#[test]
fn test_state_machine_rejects_restart() {
    let err = InstanceState::Killed
        .transition(InstanceState::Running)
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::InvalidTransition { .. }));
}

#[test]
fn test_oversized_readiness_delay_is_rejected_not_panicking() {
    let text = DEVNET.replace("ready_delay_secs = 2", "ready_delay_secs = 1e30");
    let err = MeshConfig::from_toml_str(&text).unwrap_err();
    assert!(matches!(err, OrchestratorError::InvalidConfig(_)));
}

#[test]
fn test_huge_count_is_rejected_before_expansion() {
    let config = MeshConfig::from_toml_str(DEVNET).unwrap();
    let err = LifecyclePlan::build(&config, Some(4_000_000_000)).unwrap_err();
    assert!(matches!(err, OrchestratorError::InvalidArgument(_)));
    assert!(check_instance_count(MAX_INSTANCE_COUNT).is_ok());
    assert!(check_instance_count(MAX_INSTANCE_COUNT + 1).is_err());
}
