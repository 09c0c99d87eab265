//! Fitted-model persistence.
//!
//! Binary files (.glmm.model) are bincode payloads starting with the
//! model's magic bytes and version. A pretty-printed JSON sidecar can be
//! written for inspection.

use anyhow::{bail, Context, Result};
use std::path::Path;

use super::fitted::FittedModel;

/// Save a fitted model to a binary file.
pub fn save_model(model: &FittedModel, path: &Path) -> Result<()> {
    let encoded = bincode::serialize(model)?;
    std::fs::write(path, &encoded).with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}

/// Load a fitted model from a binary file.
pub fn load_model(path: &Path) -> Result<FittedModel> {
    let data = std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    if data.len() < 4 || data[..4] != FittedModel::MAGIC {
        bail!(
            "Invalid model file {}: expected magic bytes {:?}",
            path.display(),
            FittedModel::MAGIC
        );
    }
    let model: FittedModel = bincode::deserialize(&data)
        .with_context(|| format!("Failed to decode model file {}", path.display()))?;
    if model.version != FittedModel::VERSION {
        bail!(
            "Unsupported model version {} in {} (expected {})",
            model.version,
            path.display(),
            FittedModel::VERSION
        );
    }
    Ok(model)
}

/// Save a JSON sidecar for inspection (.glmm.model.json).
pub fn save_model_json(model: &FittedModel, path: &Path) -> Result<()> {
    let json = serde_json::to_string_pretty(model)?;
    std::fs::write(path, json).with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::glmm::family::Family;
    use crate::glmm::fit::{fit, FitControl};
    use crate::model::predict::{predict, PredictType, ReForm};
    use crate::model::spec::{LinearPredictor, ModelSpec, ReTerm};

    fn small_model() -> FittedModel {
        let y = vec![1.0, 0.0, 2.0, 4.0, 3.0, 5.0, 0.0, 1.0, 1.0];
        let groups = ["a", "a", "a", "b", "b", "b", "c", "c", "c"];
        let spec = ModelSpec::builder()
            .response(y)
            .family(Family::Poisson)
            .conditional(LinearPredictor::intercept(9).with_re_term(ReTerm::intercept("g", &groups)))
            .build()
            .unwrap();
        fit(&spec, &FitControl::default()).unwrap()
    }

    #[test]
    fn test_save_load_roundtrip() {
        let model = small_model();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.glmm.model");

        save_model(&model, &path).unwrap();
        let loaded = load_model(&path).unwrap();

        assert!(loaded.is_valid());
        assert_eq!(loaded.parameters, model.parameters);
        assert_eq!(loaded.b, model.b);
        assert_eq!(loaded.log_lik, model.log_lik);

        let before = predict(&model, None, PredictType::Response, ReForm::Conditional, false).unwrap();
        let after = predict(&loaded, None, PredictType::Response, ReForm::Conditional, false).unwrap();
        assert_eq!(before.fit, after.fit);
    }

    #[test]
    fn test_load_rejects_foreign_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bogus.glmm.model");
        std::fs::write(&path, b"NOPE not a model").unwrap();
        let err = load_model(&path).unwrap_err();
        assert!(err.to_string().contains("magic"));
    }

    #[test]
    fn test_json_sidecar() {
        let model = small_model();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.glmm.model.json");
        save_model_json(&model, &path).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("\"log_lik\""));
    }
}
