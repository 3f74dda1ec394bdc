use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn memh_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("memh");
    path
}

fn setup_test_env(extra: &str) -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();
    fs::create_dir_all(root.join("notes")).unwrap();

    let config_content = format!(
        r#"[store]
path = "{root}/data/memory.sqlite"

[index]
dir = "{root}/data/indices"

[ingest]
root = "{root}/notes"
{extra}
"#,
        root = root.display(),
        extra = extra,
    );

    let config_path = config_dir.join("memh.toml");
    fs::write(&config_path, config_content).unwrap();
    (tmp, config_path)
}

fn run_memh(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = memh_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run memh binary at {:?}: {}", binary, e));

    (
        String::from_utf8_lossy(&output.stdout).to_string(),
        String::from_utf8_lossy(&output.stderr).to_string(),
        output.status.success(),
    )
}

#[test]
fn test_init_creates_database() {
    let (tmp, config_path) = setup_test_env("");

    let (stdout, stderr, success) = run_memh(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));
    assert!(tmp.path().join("data/memory.sqlite").exists());
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env("");

    let (_, _, first) = run_memh(&config_path, &["init"]);
    assert!(first, "First init failed");
    let (_, _, second) = run_memh(&config_path, &["init"]);
    assert!(second, "Second init failed (not idempotent)");
}

#[test]
fn test_invalid_config_is_reported() {
    let (_tmp, config_path) = setup_test_env("max_tokens = 0");

    let (_, stderr, success) = run_memh(&config_path, &["init"]);
    assert!(!success);
    assert!(stderr.contains("max_tokens"), "stderr was: {}", stderr);
}

#[test]
fn test_missing_config_fails() {
    let tmp = TempDir::new().unwrap();
    let (_, stderr, success) = run_memh(&tmp.path().join("nope.toml"), &["init"]);
    assert!(!success);
    assert!(stderr.contains("Failed to read config file"));
}
