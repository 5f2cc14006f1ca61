use t8d_core::ExitCode;
use t8d_fs::{
    DEFAULT_SERVER_URL, init_workspace, load_config, resolve_workspace, run_doctor, save_config,
};

#[test]
fn init_workspace_creates_expected_layout() {
    let temp = tempfile::tempdir().expect("tempdir");
    let root = temp.path().join("ws");

    let result =
        init_workspace(Some(&root), Some("https://todo.example.com")).expect("init workspace");

    assert!(result.paths.root.is_dir());
    assert!(result.paths.state_dir.is_dir());
    assert!(result.paths.logs_dir.is_dir());
    assert!(result.paths.config_path.is_file());
    assert!(result.created.contains(&result.paths.config_path));

    let config = load_config(&result.paths).expect("load config");
    assert_eq!(config.server.url, "https://todo.example.com");
    assert!(config.sync.realtime);
}

#[test]
fn init_is_idempotent_and_keeps_existing_config() {
    let temp = tempfile::tempdir().expect("tempdir");
    let root = temp.path().join("ws");

    let first = init_workspace(Some(&root), None).expect("first init");
    let mut config = load_config(&first.paths).expect("load config");
    config.sync.interval_secs = 7;
    save_config(&first.paths, &config).expect("save config");

    let second = init_workspace(Some(&root), None).expect("second init");
    assert!(second.created.is_empty());
    assert_eq!(second.config.sync.interval_secs, 7);
    assert_eq!(second.config.server.url, DEFAULT_SERVER_URL);
}

#[test]
fn resolve_workspace_fails_when_uninitialized() {
    let temp = tempfile::tempdir().expect("tempdir");

    let error =
        resolve_workspace(Some(temp.path())).expect_err("workspace should not be initialized");

    assert_eq!(error.exit_code(), ExitCode::Usage);
}

#[test]
fn doctor_reports_broken_config() {
    let temp = tempfile::tempdir().expect("tempdir");
    let result = init_workspace(Some(temp.path()), None).expect("init workspace");

    let healthy = run_doctor(&result.paths, None).expect("doctor");
    assert!(healthy.healthy);
    assert_eq!(healthy.server.as_deref(), Some(DEFAULT_SERVER_URL));

    std::fs::write(&result.paths.config_path, "[server\nurl = ").expect("corrupt config");
    let broken = run_doctor(&result.paths, None).expect("doctor");
    assert!(!broken.healthy);
    assert!(
        broken
            .checks
            .iter()
            .any(|check| check.name == "config_parse" && !check.ok)
    );
}
