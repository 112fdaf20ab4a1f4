//! The boundary to the external plotting backend.
//!
//! Plotting itself happens outside of this crate. A [`PlottingBackend`] receives a
//! [`RenderRequest`] and writes the encoded image into a temporary file owned by the cache.
//! [`CommandBackend`] implements this by running a configured command once per render.

use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;

use futures::future::BoxFuture;
use tempfile::NamedTempFile;
use thiserror::Error;
use tokio::io::AsyncReadExt;

use crate::config::PlottingConfig;
use crate::types::RenderRequest;

/// The kind of a [`PlottingError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlottingErrorKind {
    /// The backend rejected one of the parameters.
    BadInput,
    /// The dataset file does not exist.
    DatasetNotFound,
    /// The requested expression layer does not exist in the dataset.
    LayerNotFound,
    /// The gene does not exist in the dataset.
    GeneNotFound,
    /// Any other backend failure.
    Failed,
}

impl PlottingErrorKind {
    /// The code used on the wire, both by the backend on stderr and in API error responses.
    pub fn code(&self) -> &'static str {
        match self {
            PlottingErrorKind::BadInput => "BAD_INPUT",
            PlottingErrorKind::DatasetNotFound => "FILE_NOT_FOUND",
            PlottingErrorKind::LayerNotFound => "LAYER_NOT_FOUND",
            PlottingErrorKind::GeneNotFound => "GENE_NOT_FOUND",
            PlottingErrorKind::Failed => "PLOT_FAILED",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        Some(match code {
            "BAD_INPUT" => PlottingErrorKind::BadInput,
            "FILE_NOT_FOUND" => PlottingErrorKind::DatasetNotFound,
            "LAYER_NOT_FOUND" => PlottingErrorKind::LayerNotFound,
            "GENE_NOT_FOUND" => PlottingErrorKind::GeneNotFound,
            "PLOT_FAILED" => PlottingErrorKind::Failed,
            _ => return None,
        })
    }
}

impl fmt::Display for PlottingErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// A failure reported by the plotting backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct PlottingError {
    pub kind: PlottingErrorKind,
    pub message: String,
    /// Additional context, such as the backend's stderr output.
    pub detail: Option<String>,
}

impl PlottingError {
    pub fn new(kind: PlottingErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// Parses the diagnostics a backend printed to stderr.
    ///
    /// A first line of the form `CODE: message` with a known code determines the error kind.
    /// Anything else is reported as [`PlottingErrorKind::Failed`] with the whole output attached.
    pub fn from_stderr(stderr: &str) -> Self {
        let stderr = stderr.trim();
        let first_line = stderr.lines().next().unwrap_or_default();
        let rest = stderr
            .split_once('\n')
            .map(|(_, rest)| rest.trim())
            .filter(|rest| !rest.is_empty());

        if let Some((code, message)) = first_line.split_once(':') {
            if let Some(kind) = PlottingErrorKind::from_code(code.trim()) {
                let error = Self::new(kind, message.trim());
                return match rest {
                    Some(rest) => error.with_detail(rest),
                    None => error,
                };
            }
        }

        let error = Self::new(PlottingErrorKind::Failed, "plotting backend failed");
        if stderr.is_empty() {
            error
        } else {
            error.with_detail(stderr)
        }
    }
}

/// Renders images for [`RenderRequest`]s.
pub trait PlottingBackend: Send + Sync + 'static {
    /// Renders `request` and writes the encoded image into `output`.
    ///
    /// The file is empty when this is called. On error, its contents are discarded.
    fn render<'a>(
        &'a self,
        request: &'a RenderRequest,
        output: &'a mut NamedTempFile,
    ) -> BoxFuture<'a, Result<(), PlottingError>>;
}

/// A [`PlottingBackend`] that spawns an external command for every render.
///
/// The command is invoked as
/// `<command...> --dataset-path PATH --dataset ID --gene GENE --format FMT [--param NAME=VALUE]...`
/// and must write the image to stdout. On failure it exits non-zero, and may print
/// `CODE: message` as the first line of stderr.
#[derive(Debug, Clone)]
pub struct CommandBackend {
    program: String,
    args: Vec<String>,
    data_dir: PathBuf,
}

impl CommandBackend {
    /// Creates the backend from the configured command line.
    ///
    /// Returns `None` if no command is configured.
    pub fn from_config(config: &PlottingConfig, data_dir: impl Into<PathBuf>) -> Option<Self> {
        let (program, args) = config.command.split_first()?;
        Some(Self {
            program: program.clone(),
            args: args.to_vec(),
            data_dir: data_dir.into(),
        })
    }

    async fn run(
        &self,
        request: &RenderRequest,
        output: &mut NamedTempFile,
    ) -> Result<(), PlottingError> {
        let dataset_path = self.data_dir.join(&request.dataset_id);
        if !dataset_path.is_file() {
            return Err(
                PlottingError::new(PlottingErrorKind::DatasetNotFound, "dataset does not exist")
                    .with_detail(dataset_path.display().to_string()),
            );
        }

        let stdout = output.reopen().map_err(|err| {
            PlottingError::new(PlottingErrorKind::Failed, "failed to open output file")
                .with_detail(err.to_string())
        })?;

        let mut command = tokio::process::Command::new(&self.program);
        command
            .args(&self.args)
            .arg("--dataset-path")
            .arg(&dataset_path)
            .arg("--dataset")
            .arg(&request.dataset_id)
            .arg("--gene")
            .arg(&request.gene)
            .arg("--format")
            .arg(request.format.as_str());
        for (name, value) in &request.params {
            command.arg("--param").arg(format!("{name}={value}"));
        }
        command
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        tracing::debug!(
            program = %self.program,
            dataset = %request.dataset_id,
            gene = %request.gene,
            "Spawning plotting command"
        );

        let mut child = command.spawn().map_err(|err| {
            PlottingError::new(PlottingErrorKind::Failed, "failed to spawn plotting command")
                .with_detail(format!("{}: {err}", self.program))
        })?;

        let mut stderr = String::new();
        if let Some(mut pipe) = child.stderr.take() {
            // stderr is not guaranteed to be utf-8
            let mut buf = Vec::new();
            pipe.read_to_end(&mut buf).await.ok();
            stderr = String::from_utf8_lossy(&buf).into_owned();
        }

        let status = child.wait().await.map_err(|err| {
            PlottingError::new(PlottingErrorKind::Failed, "failed to wait for plotting command")
                .with_detail(err.to_string())
        })?;

        if !status.success() {
            tracing::debug!(%status, stderr = %stderr.trim(), "Plotting command failed");
            return Err(PlottingError::from_stderr(&stderr));
        }

        let written = output.as_file().metadata().map(|m| m.len()).unwrap_or(0);
        if written == 0 {
            return Err(PlottingError::new(
                PlottingErrorKind::Failed,
                "plotting command produced no output",
            ));
        }

        Ok(())
    }
}

impl PlottingBackend for CommandBackend {
    fn render<'a>(
        &'a self,
        request: &'a RenderRequest,
        output: &'a mut NamedTempFile,
    ) -> BoxFuture<'a, Result<(), PlottingError>> {
        Box::pin(self.run(request, output))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stderr_with_code() {
        let err = PlottingError::from_stderr("GENE_NOT_FOUND: gene `Foo` not in var_names\n");
        assert_eq!(err.kind, PlottingErrorKind::GeneNotFound);
        assert_eq!(err.message, "gene `Foo` not in var_names");
        assert_eq!(err.detail, None);

        let err = PlottingError::from_stderr("LAYER_NOT_FOUND: no layer `raw`\navailable: counts\n");
        assert_eq!(err.kind, PlottingErrorKind::LayerNotFound);
        assert_eq!(err.detail.as_deref(), Some("available: counts"));
    }

    #[test]
    fn test_stderr_without_code() {
        let err = PlottingError::from_stderr("Traceback (most recent call last):\n  oops");
        assert_eq!(err.kind, PlottingErrorKind::Failed);
        assert!(err.detail.unwrap().starts_with("Traceback"));

        let err = PlottingError::from_stderr("");
        assert_eq!(err.kind, PlottingErrorKind::Failed);
        assert_eq!(err.detail, None);
    }

    #[test]
    fn test_codes_roundtrip() {
        for kind in [
            PlottingErrorKind::BadInput,
            PlottingErrorKind::DatasetNotFound,
            PlottingErrorKind::LayerNotFound,
            PlottingErrorKind::GeneNotFound,
            PlottingErrorKind::Failed,
        ] {
            assert_eq!(PlottingErrorKind::from_code(kind.code()), Some(kind));
        }
        assert_eq!(PlottingErrorKind::from_code("LOCK_TIMEOUT"), None);
    }

    #[test]
    fn test_command_backend_requires_command() {
        let config = PlottingConfig { command: vec![] };
        assert!(CommandBackend::from_config(&config, "data").is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_backend() {
        let data_dir = tempfile::tempdir().unwrap();
        std::fs::write(data_dir.path().join("brain.h5ad"), b"").unwrap();

        // `sh -c SCRIPT NAME ARGS...`: echo the arguments back as the "image"
        let config = PlottingConfig {
            command: vec![
                "sh".into(),
                "-c".into(),
                r#"shift 2; printf '%s ' "$@""#.into(),
                "plot".into(),
            ],
        };
        let backend = CommandBackend::from_config(&config, data_dir.path()).unwrap();

        let request = RenderRequest::new("brain.h5ad", "Gfap", crate::types::ImageFormat::Png)
            .with_param("dpi", 300u32);
        let mut output = NamedTempFile::new().unwrap();
        backend.render(&request, &mut output).await.unwrap();

        let written = std::fs::read_to_string(output.path()).unwrap();
        assert_eq!(
            written,
            "--dataset brain.h5ad --gene Gfap --format png --param dpi=300 "
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_backend_failure() {
        let data_dir = tempfile::tempdir().unwrap();
        std::fs::write(data_dir.path().join("brain.h5ad"), b"").unwrap();

        let config = PlottingConfig {
            command: vec![
                "sh".into(),
                "-c".into(),
                "echo 'GENE_NOT_FOUND: no such gene' >&2; exit 3".into(),
                "plot".into(),
            ],
        };
        let backend = CommandBackend::from_config(&config, data_dir.path()).unwrap();

        let request = RenderRequest::new("brain.h5ad", "Nope", crate::types::ImageFormat::Png);
        let mut output = NamedTempFile::new().unwrap();
        let err = backend.render(&request, &mut output).await.unwrap_err();
        assert_eq!(err.kind, PlottingErrorKind::GeneNotFound);
        assert_eq!(err.message, "no such gene");

        let request = RenderRequest::new("missing.h5ad", "Gfap", crate::types::ImageFormat::Png);
        let err = backend.render(&request, &mut output).await.unwrap_err();
        assert_eq!(err.kind, PlottingErrorKind::DatasetNotFound);
    }
}
