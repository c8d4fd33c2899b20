// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use std::fs;
use std::path::Path;
use std::process::{Command, Output};

use serde_json::Value;
use tempfile::tempdir;

const SMALL_PAIR: &str = r#"
[generator]
ch = 1
dim_z = 8
resolution = 32
attention = ""
n_classes = 3
seed = 5

[discriminator]
ch = 2
resolution = 32
attention = "16"
n_classes = 3
seed = 6
"#;

fn run_cli(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_st-gan-cli"))
        .args(args)
        .env("RUST_LOG", "warn")
        .output()
        .unwrap()
}

fn stdout_json(output: &Output) -> Value {
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    serde_json::from_slice(&output.stdout).unwrap()
}

fn write_config(dir: &Path) -> String {
    let path = dir.join("pair.toml");
    fs::write(&path, SMALL_PAIR).unwrap();
    path.to_str().unwrap().to_string()
}

#[test]
fn layout_prints_discriminator_stages() {
    let output = run_cli(&[
        "layout",
        "--network",
        "discriminator",
        "--resolution",
        "64",
        "--ch",
        "4",
        "--attention",
        "32",
    ]);
    let layout = stdout_json(&output);
    let stages = layout["stages"].as_array().unwrap();
    assert_eq!(stages.len(), 5);
    assert_eq!(stages[0]["in_channels"], 3);
    assert_eq!(stages[0]["has_attention"], true);
    assert_eq!(stages[4]["out_channels"], 64);
}

#[test]
fn layout_rejects_unsupported_resolution() {
    let output = run_cli(&["layout", "--resolution", "100"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("unsupported resolution 100"));
}

#[test]
fn summary_reports_both_networks() {
    let dir = tempdir().unwrap();
    let config = write_config(dir.path());
    let summary = stdout_json(&run_cli(&["summary", "--config", &config]));
    assert_eq!(summary["dim_z"], 8);
    assert_eq!(summary["output_resolution"], 32);
    assert_eq!(summary["generator"]["stages"], 3);
    assert_eq!(summary["discriminator"]["attention_resolutions"], serde_json::json!([16, 16, 16, 16]));
    assert!(summary["generator"]["param_count"].as_u64().unwrap() > 0);
}

#[test]
fn sample_writes_bounded_images() {
    let dir = tempdir().unwrap();
    let config = write_config(dir.path());
    let out = dir.path().join("samples").join("images.json");
    let output = run_cli(&[
        "sample",
        "--config",
        &config,
        "--batch",
        "2",
        "--labels",
        "2,0",
        "--output",
        out.to_str().unwrap(),
    ]);
    assert!(output.status.success());
    let payload: Value = serde_json::from_str(&fs::read_to_string(&out).unwrap()).unwrap();
    assert_eq!(payload["shape"], serde_json::json!([2, 3, 32, 32]));
    assert_eq!(payload["labels"], serde_json::json!([2, 0]));
    let data = payload["data"].as_array().unwrap();
    assert_eq!(data.len(), 2 * 3 * 32 * 32);
    assert!(data
        .iter()
        .all(|v| (-1.0..=1.0).contains(&v.as_f64().unwrap())));
}

#[test]
fn sample_rejects_mismatched_labels() {
    let dir = tempdir().unwrap();
    let config = write_config(dir.path());
    let out = dir.path().join("images.json");
    let output = run_cli(&[
        "sample",
        "--config",
        &config,
        "--batch",
        "3",
        "--labels",
        "1",
        "--output",
        out.to_str().unwrap(),
    ]);
    assert!(!output.status.success());
    assert!(!out.exists());
}
