#![allow(dead_code)]

use assert_cmd::Command;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

pub const TOKEN_ENV: &str = "T8D_TOKEN";

#[derive(Debug)]
pub struct TestWorkspace {
    _temp: TempDir,
    pub path: PathBuf,
}

pub fn temp_workspace() -> TestWorkspace {
    let temp = tempfile::tempdir().expect("tempdir");
    let workspace_path = temp.path().join("workspace");
    std::fs::create_dir_all(&workspace_path).expect("create workspace dir");
    TestWorkspace {
        _temp: temp,
        path: workspace_path,
    }
}

pub fn base_command(workspace: &Path) -> Command {
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("t8d");
    cmd.current_dir(workspace)
        .env_remove(TOKEN_ENV)
        .env_remove("RUST_LOG")
        .args(["--workspace", workspace.to_str().expect("workspace path")]);
    cmd
}

pub fn init_workspace(workspace: &Path, server_url: &str) {
    base_command(workspace)
        .args(["init", "--server", server_url, "--json"])
        .assert()
        .success();
}

/// Runs a `--json` command that must succeed and returns its stdout.
pub fn run_json(workspace: &Path, args: &[&str]) -> Value {
    let mut cmd = base_command(workspace);
    cmd.arg("--json").args(args);
    let assert = cmd.assert().success();
    parse_stdout(&assert.get_output().stdout)
}

/// Same as [`run_json`] with a bearer token in the environment.
pub fn run_json_with_token(workspace: &Path, token: &str, args: &[&str]) -> Value {
    let mut cmd = base_command(workspace);
    cmd.env(TOKEN_ENV, token).arg("--json").args(args);
    let assert = cmd.assert().success();
    parse_stdout(&assert.get_output().stdout)
}

pub fn parse_stdout(stdout: &[u8]) -> Value {
    let text = String::from_utf8_lossy(stdout);
    serde_json::from_str(&text).unwrap_or_else(|err| panic!("json stdout ({err}): {text}"))
}
