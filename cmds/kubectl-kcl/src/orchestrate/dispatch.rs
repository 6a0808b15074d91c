//! Routing the materialized pipeline output to its destination.

use std::{fmt, io::Cursor, path::{Path, PathBuf}};

use tokio::io::AsyncWriteExt;
use tracing::instrument;

use super::{source::STDIN_SENTINEL, MaterializedBuffer, OrchestrationError};
use crate::k8s::{ClusterClient, ScopingOptions};

/// What happens to the pipeline output.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum OutputTarget {
	/// Apply the manifests to the cluster.
	#[default]
	Apply,
	/// Write the manifests to a file, or stdout for `-`, without applying.
	Render(PathBuf),
}

impl OutputTarget {
	/// Target selected by the `--output` flag.
	pub fn from_output_arg(output: Option<&str>) -> Self {
		match output {
			None | Some("") => OutputTarget::Apply,
			Some(path) => OutputTarget::Render(PathBuf::from(path)),
		}
	}
}

impl fmt::Display for OutputTarget {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			OutputTarget::Apply => f.write_str("apply"),
			OutputTarget::Render(path) => write!(f, "render:{}", path.display()),
		}
	}
}

/// Submit `buffer` to the cluster under `scoping`.
#[instrument(skip_all, fields(bytes = buffer.len()))]
pub async fn apply<C: ClusterClient>(
	client: &C,
	buffer: MaterializedBuffer,
	scoping: &ScopingOptions,
) -> Result<(), OrchestrationError> {
	client
		.apply(scoping, Cursor::new(buffer.into_inner()))
		.await
		.map_err(|e| OrchestrationError::Apply(Box::new(e)))
}

/// Write `buffer` to `path`, or to stdout when `path` is `-`.
#[instrument(skip_all, fields(path = %path.display(), bytes = buffer.len()))]
pub async fn render(buffer: &MaterializedBuffer, path: &Path) -> Result<(), OrchestrationError> {
	let render_error = |source: std::io::Error| OrchestrationError::Render {
		path: path.to_path_buf(),
		source,
	};

	if path.as_os_str() == STDIN_SENTINEL {
		let mut stdout = tokio::io::stdout();
		let written = async {
			stdout.write_all(buffer.as_bytes()).await?;
			stdout.flush().await
		}
		.await;
		return match written {
			// Reader went away (e.g. piped into `head`), nothing left to do
			Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => Ok(()),
			other => other.map_err(render_error),
		};
	}

	tokio::fs::write(path, buffer.as_bytes())
		.await
		.map_err(render_error)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_output_target_from_arg() {
		assert_eq!(OutputTarget::from_output_arg(None), OutputTarget::Apply);
		assert_eq!(OutputTarget::from_output_arg(Some("")), OutputTarget::Apply);
		assert_eq!(
			OutputTarget::from_output_arg(Some("out.yaml")),
			OutputTarget::Render(PathBuf::from("out.yaml"))
		);
	}

	#[tokio::test]
	async fn test_render_overwrites_file() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("out.yaml");
		std::fs::write(&path, "stale content that is longer than the output\n").unwrap();

		let buffer = MaterializedBuffer::from(b"kind: ConfigMap\n".to_vec());
		render(&buffer, &path).await.unwrap();

		assert_eq!(std::fs::read(&path).unwrap(), b"kind: ConfigMap\n");
	}
}
