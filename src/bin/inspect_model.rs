//! Utility to validate a model artifact and print its schema.
//!
//! Runs the same checks as service startup, so a release pipeline can reject
//! a bad artifact before it is deployed.
//!
//! ```sh
//! cargo run --bin inspect_model -- models/msme_risk_model.json
//! ```

use dotenvy::dotenv;
use msme_risk_api::artifact::{self, ArtifactPins};
use msme_risk_api::features::FeatureKind;
use std::env;

fn main() -> anyhow::Result<()> {
    dotenv().ok();
    let path = env::args()
        .nth(1)
        .or_else(|| env::var("MODEL_PATH").ok())
        .ok_or_else(|| anyhow::anyhow!("usage: inspect_model <artifact.json> (or set MODEL_PATH)"))?;

    let pins = ArtifactPins {
        model_version: env::var("MODEL_EXPECTED_VERSION").ok().filter(|v| !v.trim().is_empty()),
        sha256: env::var("MODEL_SHA256").ok().filter(|v| !v.trim().is_empty()),
    };
    let model = artifact::load_with(&path, &pins)?;

    println!("Artifact:       {}", path);
    println!("SHA-256:        {}", model.sha256());
    println!("Format version: {}", model.format_version());
    println!("Model version:  {}", model.model_version());
    println!("Trained at:     {}", model.trained_at());
    println!("Objective:      {}", model.objective());
    println!("Trees:          {}", model.forest().num_trees());
    println!(
        "Thresholds:     low <= {} < medium < {} <= high",
        model.thresholds().low_max,
        model.thresholds().high_min
    );
    println!();

    println!("Features ({}):", model.schema().len());
    for (i, spec) in model.schema().features().iter().enumerate() {
        let requirement = match &spec.impute {
            Some(value) => format!("optional, imputed as {:?}", value),
            None => "required".to_string(),
        };
        println!(
            "  {:>2}. {} [{}] {}",
            i,
            spec.name,
            spec.kind.type_name(),
            requirement
        );
        if let FeatureKind::Categorical { categories } = &spec.kind {
            for (category, code) in categories {
                println!("        - {} => {}", category, code);
            }
        }
    }

    Ok(())
}
