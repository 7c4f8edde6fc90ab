use catcount::codec::decode_line;
use catcount::config::{JobConfig, SourceFormat};
use catcount::sink::SUCCESS_MARKER;
use catcount::source::write_table;
use catcount::standalone::{prepare_job, run_job, JobState};
use catcount::{InfrastructureError, JobError, KeyValue, UsageError};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

const CLOTHING: &str = "Clothing, Shoes & Jewelry";

fn documents() -> Vec<String> {
    let mut docs = Vec::new();
    for i in 0..40 {
        let doc = match i % 5 {
            0 => serde_json::json!({"asin": i, "category": [CLOTHING, "Men", "Shirts"]}),
            1 => serde_json::json!({"asin": i, "category": [CLOTHING, "Women", "Dresses"]}),
            2 => serde_json::json!({"asin": i, "category": ["Books", "Fiction"]}),
            3 => serde_json::json!({"asin": i, "title": "no category"}),
            _ => serde_json::json!({"asin": i, "category": [CLOTHING, "Men"]}),
        };
        docs.push(doc.to_string());
    }
    docs.push("{not json".to_string());
    docs
}

fn expected() -> BTreeMap<String, u64> {
    BTreeMap::from([
        ("Dresses".to_string(), 8),
        ("Men".to_string(), 16),
        ("Shirts".to_string(), 8),
        ("Women".to_string(), 8),
    ])
}

fn read_output(dir: &Path) -> BTreeMap<String, u64> {
    let mut totals = BTreeMap::new();
    for entry in fs::read_dir(dir).unwrap() {
        let path = entry.unwrap().path();
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        if !name.starts_with("part-r-") {
            continue;
        }
        for line in fs::read_to_string(&path).unwrap().lines() {
            let (key, total) = decode_line(line).unwrap();
            assert!(totals.insert(key, total).is_none(), "key in two parts");
        }
    }
    totals
}

fn config_for(input: &Path, format: SourceFormat) -> JobConfig {
    let mut config = JobConfig::default();
    config.source.input = Some(input.display().to_string());
    config.source.format = format;
    config.execution.reducers = 4;
    config.execution.parallelism = 3;
    config
}

#[tokio::test]
async fn json_lines_job_writes_committed_output() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("products.jsonl");
    fs::write(&input, documents().join("\n") + "\n").unwrap();
    let output = dir.path().join("out");

    let mut config = config_for(&input, SourceFormat::Jsonl);
    config.source.split_bytes = 700;
    let report = run_job(config, &output.display().to_string())
        .await
        .unwrap();

    assert_eq!(report.state, JobState::Completed);
    assert!(report.map_tasks > 1);
    assert_eq!(report.counters.rows_processed(), 41);
    assert_eq!(report.distinct_keys, 4);
    assert!(output.join(SUCCESS_MARKER).exists());
    assert!(!output.join("_temporary").exists());
    assert_eq!(read_output(&output), expected());
}

#[tokio::test]
async fn table_job_matches_json_lines_job() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("products.parquet");
    let records: Vec<KeyValue> = documents()
        .into_iter()
        .enumerate()
        .map(|(i, doc)| KeyValue::new(format!("row-{i:04}"), doc))
        .collect();
    write_table(&input, &records, "row_key", "product_data", 9).unwrap();
    let output = dir.path().join("out");

    let mut config = config_for(&input, SourceFormat::Table);
    config.scan.caching = 4;
    let report = run_job(config, &output.display().to_string())
        .await
        .unwrap();

    assert_eq!(report.map_tasks, 5);
    assert_eq!(report.counters.rows_processed(), 41);
    assert_eq!(read_output(&output), expected());
}

#[tokio::test]
async fn existing_output_is_refused_before_any_work() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("products.jsonl");
    fs::write(&input, documents().join("\n")).unwrap();
    let output = dir.path().join("out");
    fs::create_dir(&output).unwrap();
    fs::write(output.join("keep.txt"), "old").unwrap();

    let err = run_job(
        config_for(&input, SourceFormat::Jsonl),
        &output.display().to_string(),
    )
    .await
    .unwrap_err();

    assert!(matches!(err, JobError::Usage(UsageError::OutputExists(_))));
    assert_eq!(err.exit_code(), 2);
    assert_eq!(fs::read_to_string(output.join("keep.txt")).unwrap(), "old");
}

#[tokio::test]
async fn unreadable_source_fails_the_job_and_cleans_up() {
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("out");
    let config = config_for(&dir.path().join("missing-*.jsonl"), SourceFormat::Jsonl);

    let runner = prepare_job(config, &output.display().to_string()).unwrap();
    let states = runner.subscribe();
    let err = runner.run().await.unwrap_err();

    assert!(matches!(
        err,
        JobError::Infrastructure(InfrastructureError::Source { .. })
    ));
    assert_eq!(err.exit_code(), 1);
    assert_eq!(*states.borrow(), JobState::Failed);
    assert!(!output.exists());
}

#[tokio::test]
async fn prefilter_keeps_the_totals() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("products.jsonl");
    fs::write(&input, documents().join("\n")).unwrap();
    let output = dir.path().join("out");

    let mut config = config_for(&input, SourceFormat::Jsonl);
    config.scan.prefilter = true;
    let report = run_job(config, &output.display().to_string())
        .await
        .unwrap();

    assert_eq!(report.counters.rows_processed(), 24);
    assert_eq!(read_output(&output), expected());
}

#[tokio::test]
async fn keys_with_line_breaks_stay_one_row() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("products.jsonl");
    let docs = [
        serde_json::json!({"category": [CLOTHING, "Men\nShirts"]}).to_string(),
        serde_json::json!({"category": [CLOTHING, "Shirts"]}).to_string(),
    ];
    fs::write(&input, docs.join("\n")).unwrap();
    let output = dir.path().join("out");

    let mut config = config_for(&input, SourceFormat::Jsonl);
    config.execution.reducers = 1;
    run_job(config, &output.display().to_string())
        .await
        .unwrap();

    let part = fs::read_to_string(output.join("part-r-00000")).unwrap();
    assert_eq!(part.lines().count(), 2);
    assert!(part.lines().all(|line| decode_line(line).is_some()));
    assert_eq!(
        read_output(&output),
        BTreeMap::from([("Men\nShirts".to_string(), 1), ("Shirts".to_string(), 1)])
    );
}
