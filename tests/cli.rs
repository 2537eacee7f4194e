// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;
use std::process::{Command, Output};

use gatehouse::config::CONFIG_TEMPLATE;

const BIN: &str = env!("CARGO_BIN_EXE_gatehouse");

fn gatehouse(args: &[&str]) -> Output {
    Command::new(BIN)
        .args(args)
        .env_remove("GATEHOUSE_LOG")
        .output()
        .unwrap_or_else(|e| panic!("failed to run `gatehouse {}`: {e:#?}", args.join(" ")))
}

fn scratch(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("gatehouse-{}-{name}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

#[test]
fn demo_with_defaults() {
    let output = gatehouse(&["demo", "--callers", "3", "--calls", "5"]);
    assert!(output.status.success(), "{output:?}");

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("3 callers x 5 calls"), "{stdout}");
    assert!(stdout.contains("delivered 15"), "{stdout}");
}

#[test]
fn config_init_then_demo() {
    let dir = scratch("config");
    let path = dir.join("Gatehouse.toml");
    let path = path.to_str().unwrap();

    let output = gatehouse(&["config", "init", path]);
    assert!(output.status.success(), "{output:?}");
    assert_eq!(std::fs::read_to_string(path).unwrap(), CONFIG_TEMPLATE);

    // An existing file is left alone.
    let output = gatehouse(&["config", "init", path]);
    assert!(!output.status.success());

    let output = gatehouse(&["demo", "--config", path, "--callers", "2", "--calls", "3"]);
    assert!(output.status.success(), "{output:?}");

    std::fs::remove_dir_all(dir).unwrap();
}

#[test]
fn broken_config_is_rejected() {
    let dir = scratch("broken");
    let path = dir.join("Gatehouse.toml");
    std::fs::write(&path, "pages = 0\n").unwrap();

    let output = gatehouse(&["demo", "--config", path.to_str().unwrap()]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("at least one page"), "{stderr}");

    std::fs::remove_dir_all(dir).unwrap();
}
