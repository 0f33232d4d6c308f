use std::fs;
use std::path::Path;
use std::process::{Command, Output};

use tempfile::tempdir;

const MODEL: &str = r#"{
    "name": "meadow",
    "environment": {"width": 16.0, "height": 16.0},
    "global": {
        "variables": [{"name": "bees", "type": "int", "init": {"lit": 2}}],
        "init": [{"create": {"species": "bee", "count": {"var": "bees"}}}]
    },
    "species": [{
        "name": "bee",
        "skills": ["moving"],
        "reflexes": [{"name": "fly", "body": [{"do": {"action": "wander"}}]}]
    }],
    "experiments": [{
        "name": "survey",
        "seed": 4,
        "final_step": 3,
        "parameters": [{"name": "Swarm", "var": "bees", "type": "int", "value": 5}],
        "outputs": [
            {"kind": "monitor", "name": "swarm", "framerate": 1,
             "value": {"call": {"op": "length", "args": [{"call": {"op": "population", "args": [{"lit": "bee"}]}}]}}},
            {"kind": "display", "name": "field", "width": 16, "height": 16, "framerate": 3}
        ]
    }]
}"#;

fn hivesim(dir: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_hivesim"))
        .current_dir(dir)
        .env("RUST_LOG", "off")
        .env_remove("HIVESIM_CONFIG")
        .env_remove("HIVESIM_MODEL_ROOT")
        .env_remove("HIVESIM_IMAGES")
        .args(args)
        .output()
        .expect("failed to run hivesim binary")
}

#[test]
fn run_writes_outputs_and_images() {
    let dir = tempdir().expect("tempdir");
    fs::write(dir.path().join("meadow.json"), MODEL).expect("model");

    let out = hivesim(
        dir.path(),
        &[
            "run",
            "meadow.json",
            "--experiment",
            "survey",
            "--param",
            "Swarm=7",
            "--watch",
            "cycle:2",
            "--output",
            "out/survey.jsonl",
            "--images",
            "frames",
            "--no-progress",
        ],
    );
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("3 steps"), "unexpected summary: {stdout}");

    let text = fs::read_to_string(dir.path().join("out/survey.jsonl")).expect("outputs");
    let lines: Vec<serde_json::Value> = text
        .lines()
        .map(|line| serde_json::from_str(line).expect("json line"))
        .collect();
    assert_eq!(lines.len(), 4);
    assert_eq!(lines[1]["outputs"]["swarm"]["value"], 7);
    assert_eq!(lines[1]["outputs"]["cycle"]["available"], true);
    assert_eq!(lines[2]["outputs"]["cycle"]["available"], false);

    let frames: Vec<_> = fs::read_dir(dir.path().join("frames"))
        .expect("frames directory")
        .collect();
    assert_eq!(frames.len(), 1);
}

#[test]
fn describe_lists_declared_experiments() {
    let dir = tempdir().expect("tempdir");
    fs::write(dir.path().join("meadow.json"), MODEL).expect("model");
    let out = hivesim(dir.path(), &["describe", "meadow.json"]);
    assert!(out.status.success());
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("experiment survey"));
    assert!(stdout.contains("parameter Swarm -> bees"));
    assert!(stdout.contains("display field every 3 step(s)"));
}

#[test]
fn unknown_experiment_fails_without_running() {
    let dir = tempdir().expect("tempdir");
    fs::write(dir.path().join("meadow.json"), MODEL).expect("model");
    let out = hivesim(
        dir.path(),
        &["run", "meadow.json", "--experiment", "missing", "--no-progress"],
    );
    assert!(!out.status.success());
    assert!(String::from_utf8_lossy(&out.stderr).contains("missing"));
}

#[test]
fn replicate_writes_one_file_per_seed() {
    let dir = tempdir().expect("tempdir");
    fs::write(dir.path().join("meadow.json"), MODEL).expect("model");
    let out = hivesim(
        dir.path(),
        &[
            "replicate",
            "meadow.json",
            "--experiment",
            "survey",
            "--seeds",
            "1,2",
            "--output",
            "rep.jsonl",
            "--images",
            "frames",
        ],
    );
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
    assert!(dir.path().join("rep-1.jsonl").exists());
    assert!(dir.path().join("rep-2.jsonl").exists());
}
