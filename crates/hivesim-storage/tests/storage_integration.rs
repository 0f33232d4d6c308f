use std::fs;
use std::sync::Arc;

use hivesim_core::{
    ExperimentJob, HeadlessConfig, LoadError, ModelLoader, OutputSink, Plan, Registry,
    RuntimeContext, SimulationConfig, SinkError,
};
use hivesim_storage::{
    JsonLinesSink, JsonModelLoader, PersistError, PngImageWriter, load_job, load_plan, save_job,
    save_plan,
};
use serde_json::Value as Json;
use tempfile::tempdir;

const MODEL: &str = r#"{
    "name": "pond",
    "environment": {"width": 20.0, "height": 20.0},
    "global": {
        "variables": [{"name": "frogs", "type": "int", "init": {"lit": 3}}],
        "init": [{"create": {"species": "frog", "count": {"var": "frogs"}}}]
    },
    "species": [{
        "name": "frog",
        "skills": ["moving"],
        "reflexes": [{"name": "hop", "body": [{"do": {"action": "wander"}}]}]
    }],
    "experiments": [{
        "name": "watch",
        "final_step": 4,
        "outputs": [
            {"kind": "monitor", "name": "count", "framerate": 2,
             "value": {"call": {"op": "length", "args": [{"call": {"op": "population", "args": [{"lit": "frog"}]}}]}}},
            {"kind": "display", "name": "pond", "width": 20, "height": 20, "framerate": 4}
        ]
    }]
}"#;

fn context(root: &std::path::Path) -> RuntimeContext {
    RuntimeContext::new(
        Arc::new(Registry::with_builtins()),
        Box::new(JsonModelLoader::with_root(root)),
        SimulationConfig::default(),
    )
    .expect("context")
}

fn read_lines(path: &std::path::Path) -> Vec<Json> {
    fs::read_to_string(path)
        .expect("sink file")
        .lines()
        .map(|line| serde_json::from_str(line).expect("json line"))
        .collect()
}

#[test]
fn loader_reports_missing_and_malformed_models() {
    let dir = tempdir().expect("tempdir");
    fs::write(dir.path().join("pond.json"), MODEL).expect("model");
    fs::write(dir.path().join("bad.json"), "{ not json").expect("bad model");
    let loader = JsonModelLoader::with_root(dir.path());

    let descriptor = loader.load("pond.json".as_ref()).expect("loads");
    assert_eq!(descriptor.name, "pond");
    assert!(matches!(
        loader.load("absent.json".as_ref()),
        Err(LoadError::NotFound(path)) if path.ends_with("absent.json")
    ));
    assert!(matches!(
        loader.load("bad.json".as_ref()),
        Err(LoadError::Parse { .. })
    ));
}

#[test]
fn headless_run_writes_json_lines_and_png_frames() {
    let dir = tempdir().expect("tempdir");
    fs::write(dir.path().join("pond.json"), MODEL).expect("model");
    let context = context(dir.path());
    let model = context.model("pond.json".as_ref()).expect("model");
    let output = dir.path().join("out/run.jsonl");
    let images = dir.path().join("frames");

    let mut job = ExperimentJob::from_declaration("pond.json", &model, "watch").expect("job");
    job.set_headless(HeadlessConfig {
        images_dir: images.clone(),
        show_progress: false,
        ..HeadlessConfig::default()
    });
    job.set_sink(Box::new(JsonLinesSink::with_threshold(&output, 2).expect("sink")));
    job.set_image_writer(Box::new(PngImageWriter));
    let report = job.play_and_dispose(&context).expect("run");
    assert_eq!(report.steps, 4);

    let lines = read_lines(&output);
    assert_eq!(lines.len(), 5);
    assert_eq!(lines[0]["header"]["experiment_name"], "watch");
    assert_eq!(lines[1]["step"], 0);
    assert_eq!(lines[1]["outputs"]["count"], serde_json::json!({"available": true, "value": 3}));
    assert_eq!(lines[2]["outputs"]["count"]["available"], false);
    assert_eq!(lines[2]["outputs"]["pond"]["available"], false);

    let frame = images.join(format!("pond{}-0.png", report.job_id));
    assert_eq!(lines[1]["outputs"]["pond"]["image"]["path"], frame.display().to_string());
    let decoded = image::open(&frame).expect("png frame").to_rgba8();
    assert_eq!(decoded.dimensions(), (20, 20));
}

#[test]
fn closed_sink_rejects_writes_and_keeps_flushed_lines() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("steps.jsonl");
    let mut sink = JsonLinesSink::create(&path).expect("sink");
    sink.write_step(0, &[]).expect("buffered");
    assert_eq!(fs::read_to_string(&path).expect("file"), "");
    sink.close().expect("close");
    assert!(matches!(sink.write_step(1, &[]), Err(SinkError::Closed)));
    drop(sink);
    assert_eq!(read_lines(&path), vec![serde_json::json!({"step": 0, "outputs": {}})]);
}

#[test]
fn dropping_an_open_sink_flushes_its_buffer() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("partial.jsonl");
    {
        let mut sink = JsonLinesSink::create(&path).expect("sink");
        sink.write_step(7, &[]).expect("buffered");
    }
    assert_eq!(read_lines(&path)[0]["step"], 7);
}

#[test]
fn job_and_plan_documents_round_trip() {
    let dir = tempdir().expect("tempdir");
    let mut job = ExperimentJob::new("pond.json", "watch", 12, 99);
    job.add_output("count", 3).expect("output");
    let record = job.to_record();

    let job_path = dir.path().join("jobs/one.json");
    save_job(&job_path, &record).expect("save job");
    assert_eq!(load_job(&job_path).expect("load job"), record);

    let plan = Plan {
        jobs: vec![record.clone(), ExperimentJob::from_record(record).to_record()],
    };
    let plan_path = dir.path().join("plan.json");
    save_plan(&plan_path, &plan).expect("save plan");
    assert_eq!(load_plan(&plan_path).expect("load plan"), plan);

    fs::write(dir.path().join("torn.json"), "[1, 2").expect("torn");
    assert!(matches!(
        load_plan(&dir.path().join("torn.json")),
        Err(PersistError::Json { .. })
    ));
    assert!(matches!(
        load_job(&dir.path().join("missing.json")),
        Err(PersistError::Io { .. })
    ));
}
