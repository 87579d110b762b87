#![allow(deprecated)] // TODO: cargo_bin → cargo_bin_cmd! へ移行

use assert_cmd::Command;
use predicates::prelude::*;
mod common;
use common::TestProject;

/// CLIヘルプが正しく表示されることを確認
#[test]
fn test_cli_help() {
    let mut cmd = Command::cargo_bin("buildflow").unwrap();
    cmd.arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("build"))
        .stdout(predicate::str::contains("inside-build"))
        .stdout(predicate::str::contains("version"))
        .stdout(predicate::str::contains("--verbose"));
}

/// バージョン表示が正しく動作することを確認
#[test]
fn test_cli_version() {
    let mut cmd = Command::cargo_bin("buildflow").unwrap();
    cmd.arg("version")
        .assert()
        .success()
        .stdout(predicate::str::contains(format!("buildflow {}", env!("CARGO_PKG_VERSION"))));
}

/// buildコマンドのヘルプにビルド方法とソースの指定が表示されることを確認
#[test]
fn test_build_help() {
    let mut cmd = Command::cargo_bin("buildflow").unwrap();
    cmd.arg("build")
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--method"))
        .stdout(predicate::str::contains("hostdocker"))
        .stdout(predicate::str::contains("--git-url"))
        .stdout(predicate::str::contains("--push-buildroot-to"));
}

#[test]
fn test_inside_build_help() {
    let mut cmd = Command::cargo_bin("buildflow").unwrap();
    cmd.arg("inside-build")
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--input"))
        .stdout(predicate::str::contains("--substitute"))
        .stdout(predicate::str::contains("--results-dir"));
}

/// 不正なコマンドでエラーになることを確認
#[test]
fn test_invalid_command() {
    let mut cmd = Command::cargo_bin("buildflow").unwrap();
    cmd.arg("invalid-command").assert().failure();
}

/// ソース未指定のビルドは引数エラーになることを確認
#[test]
fn test_build_without_source() {
    let mut cmd = Command::cargo_bin("buildflow").unwrap();
    cmd.args(["build", "--image", "app:1"]).assert().failure();
}

/// 不正な --method はエラーになることを確認
#[test]
fn test_build_invalid_method() {
    let mut cmd = Command::cargo_bin("buildflow").unwrap();
    cmd.args(["build", "--image", "app:1", "--path", ".", "--method", "remote"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("remote"));
}

/// BUILDFLOW_CONFIG が存在しないファイルを指す場合はエラー終了することを確認
#[test]
fn test_missing_env_config() {
    let project = TestProject::new();
    let mut cmd = Command::cargo_bin("buildflow").unwrap();
    cmd.current_dir(project.path())
        .env("BUILDFLOW_CONFIG", project.path().join("missing.yaml"))
        .args(["inside-build", "--input", "env"])
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("Error:"))
        .stderr(predicate::str::contains("missing.yaml"));
}

/// 設定ファイルの内容が不正な場合はエラー終了することを確認
#[test]
fn test_invalid_config_file() {
    let project = TestProject::new();
    project.write_config("timeout_secs: 0\n");
    let mut cmd = Command::cargo_bin("buildflow").unwrap();
    cmd.current_dir(project.path())
        .env_remove("BUILDFLOW_CONFIG")
        .args(["inside-build", "--input", "env"])
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("timeout_secs"));
}

/// 不正な --input-arg はエラー終了することを確認
#[test]
fn test_invalid_input_arg() {
    let project = TestProject::new();
    let config = project.write_config("build_image: buildroot\n");
    let mut cmd = Command::cargo_bin("buildflow").unwrap();
    cmd.current_dir(project.path())
        .env("BUILDFLOW_CONFIG", config)
        .args(["inside-build", "--input-arg", "novalue"])
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("novalue"));
}

/// 実際のDockerデーモンでビルドする
///
/// 実行方法: `cargo test --test cli_test -- --ignored`
#[test]
#[ignore = "Docker依存テスト"]
fn test_build_here_with_docker() {
    let project = TestProject::new();
    project.write_dockerfile("FROM busybox:latest\nRUN true\n");
    let mut cmd = Command::cargo_bin("buildflow").unwrap();
    cmd.current_dir(project.path())
        .env_remove("BUILDFLOW_CONFIG")
        .args(["build", "--image", "buildflow-test:latest", "--path", "."])
        .assert()
        .success()
        .stdout(predicate::str::contains("buildflow-test:latest"));
}
