use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;
use uuid::Uuid;

use crate::error::StagingError;

const FALLBACK_IMAGE_EXTENSION: &str = "webp";

/// Copies request files into the engine's input directory under names that
/// cannot collide with earlier requests.
#[derive(Debug, Clone)]
pub struct InputStager {
    input_dir: PathBuf,
}

/// File names (relative to the input directory) written for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedInputs {
    pub image: String,
    pub audio: Option<String>,
}

impl InputStager {
    pub fn new(input_dir: impl Into<PathBuf>) -> Self {
        Self {
            input_dir: input_dir.into(),
        }
    }

    pub fn stage(&self, image: &Path, audio: Option<&Path>) -> Result<StagedInputs, StagingError> {
        let image = self.copy_in("image", image, Some(FALLBACK_IMAGE_EXTENSION))?;
        let audio = audio
            .map(|path| self.copy_in("audio", path, None))
            .transpose()?;
        Ok(StagedInputs { image, audio })
    }

    fn copy_in(
        &self,
        kind: &'static str,
        source: &Path,
        fallback_extension: Option<&str>,
    ) -> Result<String, StagingError> {
        let err = |source_err| StagingError {
            kind,
            source_path: source.to_path_buf(),
            input_dir: self.input_dir.clone(),
            source: source_err,
        };

        fs::create_dir_all(&self.input_dir).map_err(err)?;

        let extension = source
            .extension()
            .and_then(|ext| ext.to_str())
            .or(fallback_extension);
        let filename = unique_input_name(extension);
        let destination = self.input_dir.join(&filename);

        fs::copy(source, &destination).map_err(err)?;
        debug!(
            kind,
            source = %source.display(),
            destination = %destination.display(),
            "Staged input file"
        );
        Ok(filename)
    }
}

fn unique_input_name(extension: Option<&str>) -> String {
    let stem = format!("input_{}", Uuid::new_v4().simple());
    match extension {
        Some(ext) if !ext.is_empty() => format!("{stem}.{ext}"),
        _ => stem,
    }
}
