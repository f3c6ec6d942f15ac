/// Startup validation of the model artifact.
/// Every broken artifact must stop the service from reaching Ready.
use msme_risk_api::artifact::{self, ArtifactPins, ModelLoadError};
use msme_risk_api::features::SchemaError;
use msme_risk_api::health::Readiness;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

fn fixture_path() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/msme_risk_model.json")
}

fn fixture() -> Value {
    let raw = std::fs::read_to_string(fixture_path()).unwrap();
    serde_json::from_str(&raw).unwrap()
}

/// Writes `contents` to a unique temp file and returns its path.
fn write_temp(contents: &str) -> PathBuf {
    let path = std::env::temp_dir().join(format!("msme-artifact-{}.json", Uuid::new_v4()));
    std::fs::write(&path, contents).unwrap();
    path
}

fn load_value(value: &Value) -> Result<artifact::ModelHandle, ModelLoadError> {
    let path = write_temp(&value.to_string());
    let result = artifact::load(&path);
    std::fs::remove_file(&path).ok();
    result
}

/// Mirrors the startup sequence: only a successful load flips readiness.
fn start(path: &PathBuf, pins: &ArtifactPins) -> Readiness {
    let readiness = Readiness::new();
    match artifact::load_with(path, pins) {
        Ok(handle) => {
            readiness.mark_ready(Arc::new(handle));
        }
        Err(e) => readiness.mark_failed(e.to_string()),
    }
    readiness
}

#[test]
fn test_fixture_loads() {
    let handle = artifact::load(fixture_path()).unwrap();

    assert_eq!(handle.model_version(), "msme-risk-2024.06.1");
    assert_eq!(handle.format_version(), 1);
    assert_eq!(handle.schema().len(), 8);
    assert_eq!(handle.forest().num_trees(), 3);
    assert_eq!(handle.thresholds().low_max, 0.3);
    assert_eq!(handle.source(), Some(fixture_path().as_path()));
}

#[test]
fn test_missing_file() {
    let missing = fixture_path().with_file_name("missing_model.json");
    let err = artifact::load(&missing).unwrap_err();
    assert!(matches!(err, ModelLoadError::Io { .. }));

    assert!(!start(&missing, &ArtifactPins::default()).is_ready());
}

#[test]
fn test_corrupt_file() {
    let raw = std::fs::read_to_string(fixture_path()).unwrap();
    let path = write_temp(&raw[..raw.len() / 2]);

    let err = artifact::load(&path).unwrap_err();
    assert!(matches!(err, ModelLoadError::Corrupt(_)));
    assert!(!start(&path, &ArtifactPins::default()).is_ready());

    std::fs::remove_file(&path).ok();
}

#[test]
fn test_unsupported_format_version() {
    let mut value = fixture();
    value["format_version"] = json!(2);

    match load_value(&value) {
        Err(ModelLoadError::UnsupportedFormat { found, .. }) => assert_eq!(found, 2),
        other => panic!("unexpected result: {other:?}"),
    }
}

#[test]
fn test_empty_schema() {
    let mut value = fixture();
    value["features"] = json!([]);
    assert!(matches!(load_value(&value), Err(ModelLoadError::EmptySchema)));

    value.as_object_mut().unwrap().remove("features");
    assert!(matches!(load_value(&value), Err(ModelLoadError::EmptySchema)));
}

#[test]
fn test_invalid_schema() {
    let mut value = fixture();
    value["features"][1]["name"] = json!("annual_revenue");
    assert!(matches!(
        load_value(&value),
        Err(ModelLoadError::InvalidSchema(SchemaError::DuplicateFeature(_)))
    ));

    let mut value = fixture();
    value["features"][6]["categories"] = json!({});
    assert!(matches!(
        load_value(&value),
        Err(ModelLoadError::InvalidSchema(SchemaError::EmptyVocabulary(_)))
    ));
}

#[test]
fn test_invalid_thresholds() {
    let mut value = fixture();
    value["thresholds"] = json!({ "low_max": 0.7, "high_min": 0.3 });

    match load_value(&value) {
        Err(ModelLoadError::InvalidThresholds { low_max, high_min }) => {
            assert_eq!(low_max, 0.7);
            assert_eq!(high_min, 0.3);
        }
        other => panic!("unexpected result: {other:?}"),
    }
}

#[test]
fn test_tree_referencing_unknown_feature() {
    let mut value = fixture();
    value["trees"][0]["split_indices"][0] = json!(8);
    assert!(matches!(
        load_value(&value),
        Err(ModelLoadError::InvalidModel(_))
    ));
}

#[test]
fn test_tree_with_mismatched_arrays() {
    let mut value = fixture();
    value["trees"][1]["leaf_values"] = json!([0.0, 0.1]);
    assert!(matches!(
        load_value(&value),
        Err(ModelLoadError::InvalidModel(_))
    ));
}

#[test]
fn test_version_pin() {
    let pinned = ArtifactPins {
        model_version: Some("msme-risk-2024.06.1".to_string()),
        sha256: None,
    };
    assert!(start(&fixture_path(), &pinned).is_ready());

    let wrong = ArtifactPins {
        model_version: Some("msme-risk-2023.01.0".to_string()),
        sha256: None,
    };
    let err = artifact::load_with(fixture_path(), &wrong).unwrap_err();
    assert!(matches!(err, ModelLoadError::VersionMismatch { .. }));
    assert!(!start(&fixture_path(), &wrong).is_ready());
}

#[test]
fn test_digest_pin() {
    let digest = artifact::load(fixture_path()).unwrap().sha256().to_string();

    let pinned = ArtifactPins {
        model_version: None,
        sha256: Some(digest.to_uppercase()),
    };
    assert!(artifact::load_with(fixture_path(), &pinned).is_ok());

    let wrong = ArtifactPins {
        model_version: None,
        sha256: Some("0".repeat(64)),
    };
    let err = artifact::load_with(fixture_path(), &wrong).unwrap_err();
    assert!(matches!(err, ModelLoadError::DigestMismatch { .. }));
}

#[test]
fn test_split_conditions_are_single_precision() {
    let mut value = fixture();
    value["trees"][1]["split_conditions"][0] = json!(1e39);
    assert!(matches!(
        load_value(&value),
        Err(ModelLoadError::InvalidModel(_))
    ));
}

#[test]
fn test_base_weights_must_cover_every_node() {
    let mut value = fixture();
    value["trees"][0]["base_weights"] = json!([0.1, 0.2]);
    assert!(matches!(
        load_value(&value),
        Err(ModelLoadError::InvalidModel(_))
    ));

    value["trees"][0]["base_weights"] = json!([0.1, -0.2, 1.2, -0.8, 0.4]);
    assert!(load_value(&value).is_ok());
}
