//! Tests for error types

use research_engine::config::RunOptions;
use research_engine::domain::{Domain, Opt};
use research_engine::experiment::Experiment;
use research_engine::research::{ConfigFilter, LoadFilter, Research, ResearchResults};
use research_engine::Error;
use std::path::PathBuf;

fn unique_dir(name: &str) -> PathBuf {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    std::env::temp_dir().join(format!("research-engine-error-{name}-{}-{nanos}", std::process::id()))
}

#[test]
fn test_invalid_config_error() {
    let error = Error::InvalidConfig("two filters".to_string());
    let error_str = format!("{error}");
    assert!(error_str.contains("Invalid configuration"));
    assert!(error_str.contains("two filters"));
}

#[test]
fn test_research_exists_error() {
    let error = Error::ResearchExists(PathBuf::from("my_research"));
    assert_eq!(format!("{error}"), "Research with name 'my_research' already exists");
}

#[test]
fn test_not_found_error() {
    let error = Error::NotFound("research folder x".to_string());
    assert!(format!("{error}").contains("Not found"));
}

#[test]
fn test_io_error_conversion() {
    let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
    let error: Error = io.into();
    assert!(matches!(error, Error::Io(_)));
    assert!(format!("{error}").contains("denied"));
}

#[test]
fn test_json_error_conversion() {
    let json = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
    let error: Error = json.into();
    assert!(matches!(error, Error::Json(_)));
}

#[test]
fn test_filter_with_config_and_alias_rejected() {
    let results = ResearchResults::new("unused", false);
    let filter = ConfigFilter::new()
        .config(research_engine::config::Config::new().with("x", 1).config())
        .alias([("x", "1")]);
    assert!(matches!(
        results.filter_ids_by_configs(&filter),
        Err(Error::InvalidConfig(_))
    ));
}

#[test]
fn test_load_missing_research() {
    let err = Research::load_results(unique_dir("missing"), &LoadFilter::new()).unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
}

#[test]
fn test_empty_workers_rejected() {
    let mut research = Research::new(
        unique_dir("workers"),
        Domain::grid(vec![Opt::new("x", [1])]),
        Experiment::new(),
    );
    let options = RunOptions::new().workers(0).dump_results(false);
    assert!(matches!(research.run(options), Err(Error::InvalidConfig(_))));
}
