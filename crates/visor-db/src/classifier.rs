//! Trained classifier files (JSON).

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use visor_core::{Error, LinearModel, Result};

const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct ClassifierFile {
    version: u32,
    dim: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tag: Option<String>,
    saved_at: DateTime<Utc>,
    model: LinearModel,
}

/// Write `model` to `file`.
pub fn save_classifier(file: &Path, model: &LinearModel, tag: Option<&str>) -> Result<()> {
    let record = ClassifierFile {
        version: FORMAT_VERSION,
        dim: model.dim(),
        tag: tag.map(String::from),
        saved_at: Utc::now(),
        model: model.clone(),
    };
    std::fs::write(file, serde_json::to_vec_pretty(&record)?)?;
    debug!(file = %file.display(), feature_dim = model.dim(), "Classifier saved");
    Ok(())
}

/// Read a classifier written by [`save_classifier`].
pub fn load_classifier(file: &Path) -> Result<LinearModel> {
    let bytes = std::fs::read(file).map_err(|e| {
        Error::InvalidRequest(format!("cannot read classifier {}: {}", file.display(), e))
    })?;
    let record: ClassifierFile = serde_json::from_slice(&bytes)?;
    if record.version != FORMAT_VERSION {
        return Err(Error::InvalidRequest(format!(
            "unsupported classifier file version {}",
            record.version
        )));
    }
    if record.dim != record.model.dim() {
        return Err(Error::DimensionMismatch {
            expected: record.dim,
            actual: record.model.dim(),
        });
    }
    Ok(record.model)
}
