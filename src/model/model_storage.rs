//! Model artifact persistence
//!
//! One tar.gz file holds both parts:
//! - metadata.json: metadata (architecture, labels, training history)
//! - model.bin: weights

use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tar::{Archive, Builder};

use crate::model::model_metadata::ModelMetadata;

const METADATA_ENTRY: &str = "metadata.json";
const MODEL_ENTRY: &str = "model.bin";

/// File actually used for a configured artifact path
///
/// Appends `.tar.gz` unless the path already ends in `.gz`. Writers and readers
/// both go through this.
pub fn artifact_path(path: &Path) -> PathBuf {
    if path.extension().and_then(|s| s.to_str()) == Some("gz") {
        path.to_path_buf()
    } else {
        path.with_extension("tar.gz")
    }
}

fn append_entry<W: Write>(builder: &mut Builder<W>, name: &str, bytes: &[u8]) -> Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_path(name)?;
    header.set_size(bytes.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder
        .append(&header, bytes)
        .with_context(|| format!("Failed to add {} to tar", name))
}

/// Writes the artifact and returns its final path
///
/// The archive is built in a temporary file in the target directory and
/// renamed into place, so an existing artifact is only replaced by a complete one.
pub fn save_model_with_metadata(
    output_path: &Path,
    metadata: &ModelMetadata,
    model_binary: &[u8],
) -> Result<PathBuf> {
    let tar_gz_path = artifact_path(output_path);
    let parent = match tar_gz_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&parent)
        .with_context(|| format!("Failed to create parent directory: {}", parent.display()))?;

    let temp = tempfile::NamedTempFile::new_in(&parent)
        .with_context(|| format!("Failed to create temporary file in {}", parent.display()))?;

    let encoder = GzEncoder::new(temp.as_file(), Compression::default());
    let mut tar_builder = Builder::new(encoder);
    append_entry(&mut tar_builder, METADATA_ENTRY, metadata.to_json_string()?.as_bytes())?;
    append_entry(&mut tar_builder, MODEL_ENTRY, model_binary)?;
    tar_builder
        .into_inner()
        .context("Failed to finalize tar archive")?
        .finish()
        .context("Failed to finalize gzip stream")?;
    temp.as_file().sync_all()?;

    temp.persist(&tar_gz_path)
        .with_context(|| format!("Failed to write artifact: {}", tar_gz_path.display()))?;

    Ok(tar_gz_path)
}

fn open_archive(tar_gz_path: &Path) -> Result<Archive<GzDecoder<File>>> {
    let tar_gz_path = artifact_path(tar_gz_path);
    let tar_gz_file = File::open(&tar_gz_path)
        .with_context(|| format!("Failed to open model artifact: {}", tar_gz_path.display()))?;
    Ok(Archive::new(GzDecoder::new(tar_gz_file)))
}

/// Reads metadata and weights
pub fn load_model_with_metadata(tar_gz_path: &Path) -> Result<(ModelMetadata, Vec<u8>)> {
    let mut archive = open_archive(tar_gz_path)?;

    let mut metadata_opt: Option<ModelMetadata> = None;
    let mut model_binary_opt: Option<Vec<u8>> = None;

    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?;

        match path.to_str() {
            Some(METADATA_ENTRY) => {
                let mut json_str = String::new();
                entry.read_to_string(&mut json_str)?;
                metadata_opt = Some(ModelMetadata::from_json_string(&json_str)?);
            }
            Some(MODEL_ENTRY) => {
                let mut buffer = Vec::new();
                entry.read_to_end(&mut buffer)?;
                model_binary_opt = Some(buffer);
            }
            _ => {}
        }
    }

    match (metadata_opt, model_binary_opt) {
        (Some(metadata), Some(binary)) => Ok((metadata, binary)),
        (None, _) => Err(anyhow::anyhow!("{} not found in {}", METADATA_ENTRY, tar_gz_path.display())),
        (_, None) => Err(anyhow::anyhow!("{} not found in {}", MODEL_ENTRY, tar_gz_path.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::ml_model::ModelConfig;
    use burn::optim::AdamConfig;

    fn metadata() -> ModelMetadata {
        ModelMetadata::new(ModelConfig::new(), AdamConfig::new(), 1e-4, 32, Vec::new())
    }

    #[test]
    fn test_artifact_path_extension() {
        assert_eq!(artifact_path(Path::new("out/model")), PathBuf::from("out/model.tar.gz"));
        assert_eq!(
            artifact_path(Path::new("tuberculosis_detector.tar.gz")),
            PathBuf::from("tuberculosis_detector.tar.gz")
        );
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = save_model_with_metadata(&dir.path().join("nested/model"), &metadata(), &[1, 2, 3])
            .unwrap();
        assert_eq!(path, dir.path().join("nested/model.tar.gz"));

        let (loaded, binary) = load_model_with_metadata(&path).unwrap();
        assert_eq!(binary, vec![1, 2, 3]);
        assert_eq!(loaded.model_config.hidden_units, 1024);
        assert!(!loaded.trained_at.is_empty());
    }

    #[test]
    fn test_load_uses_same_path_as_save() {
        let dir = tempfile::tempdir().unwrap();
        let configured = dir.path().join("detector.model");
        save_model_with_metadata(&configured, &metadata(), &[4, 5]).unwrap();

        let (_, binary) = load_model_with_metadata(&configured).unwrap();
        assert_eq!(binary, vec![4, 5]);
    }

    #[test]
    fn test_save_replaces_existing_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("model.tar.gz");
        std::fs::write(&target, b"stale").unwrap();

        save_model_with_metadata(&target, &metadata(), &[9]).unwrap();
        let (_, binary) = load_model_with_metadata(&target).unwrap();
        assert_eq!(binary, vec![9]);

        // no temporary files left behind
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_missing_and_corrupt_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_model_with_metadata(&dir.path().join("absent.tar.gz")).is_err());

        let corrupt = dir.path().join("corrupt.tar.gz");
        std::fs::write(&corrupt, b"not gzip at all").unwrap();
        assert!(load_model_with_metadata(&corrupt).is_err());
    }
}
