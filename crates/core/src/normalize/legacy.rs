use crate::IngestError;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Mutex;

pub const DEFAULT_OFFICE_PROGRAM: &str = "soffice";

/// Converts `.doc`/`.wps` files to `.docx` with a headless office suite.
/// The source file is never modified.
pub struct LegacyConverter {
    program: String,
    output_dir: PathBuf,
    // One office instance per profile; concurrent runs fail to start.
    running: Mutex<()>,
}

impl LegacyConverter {
    pub fn new(program: impl Into<String>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            output_dir: output_dir.into(),
            running: Mutex::new(()),
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Per-source working directory, so equal stems from different folders
    /// never overwrite each other.
    pub fn work_dir(&self, source: &Path) -> PathBuf {
        let mut hasher = Sha256::new();
        hasher.update(source.to_string_lossy().as_bytes());
        let digest = format!("{:x}", hasher.finalize());
        self.output_dir.join(&digest[..16])
    }

    pub fn converted_path(&self, source: &Path) -> Result<PathBuf, IngestError> {
        let stem = source
            .file_stem()
            .and_then(|stem| stem.to_str())
            .ok_or_else(|| IngestError::MissingFileName(source.display().to_string()))?;
        Ok(self.work_dir(source).join(format!("{stem}.docx")))
    }

    pub fn convert(&self, source: &Path) -> Result<PathBuf, IngestError> {
        let work_dir = self.work_dir(source);
        let target = self.converted_path(source)?;
        std::fs::create_dir_all(&work_dir)?;
        if target.exists() {
            std::fs::remove_file(&target)?;
        }

        let output = {
            let _guard = self
                .running
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            Command::new(&self.program)
                .args(["--headless", "--convert-to", "docx", "--outdir"])
                .arg(&work_dir)
                .arg(source)
                .output()
                .map_err(|error| {
                    IngestError::ConversionFailed(format!(
                        "could not start {}: {error}",
                        self.program
                    ))
                })?
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(IngestError::ConversionFailed(format!(
                "{} exited with {} for {}: {}",
                self.program,
                output.status,
                source.display(),
                stderr.trim()
            )));
        }

        if !target.is_file() {
            return Err(IngestError::ConversionFailed(format!(
                "{} reported success but {} was not produced",
                self.program,
                target.display()
            )));
        }

        tracing::debug!(
            source = %source.display(),
            target = %target.display(),
            "legacy document converted"
        );
        Ok(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureKind;

    #[test]
    fn derived_paths_are_deterministic_and_distinct() {
        let converter = LegacyConverter::new(DEFAULT_OFFICE_PROGRAM, "/tmp/converted");
        let first = converter.converted_path(Path::new("/data/Case/预案.doc")).unwrap();
        let again = converter.converted_path(Path::new("/data/Case/预案.doc")).unwrap();
        let other = converter.converted_path(Path::new("/data/Technology/预案.wps")).unwrap();

        assert_eq!(first, again);
        assert_ne!(first, other);
        assert_eq!(first.file_name().and_then(|name| name.to_str()), Some("预案.docx"));
        assert!(first.starts_with("/tmp/converted"));
    }

    #[test]
    fn missing_program_is_a_conversion_failure() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let source = dir.path().join("old.doc");
        std::fs::write(&source, b"legacy")?;
        let converter =
            LegacyConverter::new("doc-qa-no-such-office-binary", dir.path().join("out"));

        let error = converter.convert(&source).unwrap_err();
        assert_eq!(error.kind(), FailureKind::ConversionFailed);
        assert!(source.exists());
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn exit_status_decides_success() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let source = dir.path().join("old.wps");
        std::fs::write(&source, b"legacy")?;

        let failing = LegacyConverter::new("false", dir.path().join("out"));
        assert!(matches!(
            failing.convert(&source),
            Err(IngestError::ConversionFailed(_))
        ));

        // Exit zero without an output file still counts as a failure.
        let silent = LegacyConverter::new("true", dir.path().join("out"));
        assert!(matches!(
            silent.convert(&source),
            Err(IngestError::ConversionFailed(_))
        ));
        Ok(())
    }
}
