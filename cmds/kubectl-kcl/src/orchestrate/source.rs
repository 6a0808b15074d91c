//! Assembling the combined resource stream.

use std::{
	fmt,
	path::{Path, PathBuf},
};

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};
use tracing::instrument;

use super::{OrchestrationError, ResourceStream};
use crate::k8s::ClusterClient;

/// Path value selecting standard input.
pub const STDIN_SENTINEL: &str = "-";

/// Where the function configuration document comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputSource {
	/// A single line read from standard input.
	Stdin,
	/// The whole content of a file.
	File(PathBuf),
}

impl From<&str> for InputSource {
	fn from(path: &str) -> Self {
		if path == STDIN_SENTINEL {
			InputSource::Stdin
		} else {
			InputSource::File(PathBuf::from(path))
		}
	}
}

impl fmt::Display for InputSource {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			InputSource::Stdin => f.write_str("<stdin>"),
			InputSource::File(path) => write!(f, "{}", path.display()),
		}
	}
}

/// Read the function configuration document.
///
/// Standard input contributes exactly one line without its terminator; a
/// file contributes all of its bytes, possibly none.
#[instrument(skip_all, fields(source = %source))]
pub async fn read_function_config<R>(
	source: &InputSource,
	stdin: R,
) -> Result<Vec<u8>, OrchestrationError>
where
	R: AsyncBufRead + Unpin,
{
	match source {
		InputSource::Stdin => read_line(stdin).await,
		InputSource::File(path) => read_file(path).await,
	}
}

async fn read_line<R: AsyncBufRead + Unpin>(mut stdin: R) -> Result<Vec<u8>, OrchestrationError> {
	let mut line = Vec::new();
	let read = stdin
		.read_until(b'\n', &mut line)
		.await
		.map_err(OrchestrationError::StdinRead)?;
	if read == 0 {
		return Err(OrchestrationError::InputScan);
	}

	if line.last() == Some(&b'\n') {
		line.pop();
		if line.last() == Some(&b'\r') {
			line.pop();
		}
	}
	Ok(line)
}

async fn read_file(path: &Path) -> Result<Vec<u8>, OrchestrationError> {
	let mut file = tokio::fs::File::open(path)
		.await
		.map_err(|source| OrchestrationError::FileOpen {
			path: path.to_path_buf(),
			source,
		})?;

	let read_error = |source: std::io::Error| OrchestrationError::FileRead {
		path: path.to_path_buf(),
		source,
	};
	let size = file.metadata().await.map_err(read_error)?.len();

	let mut content = Vec::with_capacity(usize::try_from(size).unwrap_or_default());
	file.read_to_end(&mut content).await.map_err(read_error)?;
	tracing::debug!(bytes = content.len(), "read function configuration");
	Ok(content)
}

/// Fetch the cluster snapshot into a fresh buffer.
#[instrument(skip_all)]
pub async fn fetch_snapshot<C: ClusterClient>(client: &C) -> Result<Vec<u8>, OrchestrationError> {
	let mut snapshot = Vec::new();
	client
		.get_general_resources(&mut snapshot)
		.await
		.map_err(|e| OrchestrationError::Fetch(Box::new(e)))?;
	tracing::debug!(bytes = snapshot.len(), "fetched cluster snapshot");
	Ok(snapshot)
}

/// The combined stream: cluster snapshot bytes, then function config bytes.
pub fn concatenate(snapshot: Vec<u8>, function_config: Vec<u8>) -> ResourceStream {
	let mut bytes = snapshot;
	bytes.extend_from_slice(&function_config);
	ResourceStream::from(bytes)
}

#[cfg(test)]
mod tests {
	use std::io::Write;

	use assert_matches::assert_matches;

	use super::*;

	#[test]
	fn test_input_source_from_arg() {
		assert_eq!(InputSource::from("-"), InputSource::Stdin);
		assert_eq!(
			InputSource::from("fn.yaml"),
			InputSource::File(PathBuf::from("fn.yaml"))
		);
	}

	#[tokio::test]
	async fn test_stdin_reads_single_line() {
		let stdin: &[u8] = b"{\"kind\": \"KCLRun\"}\r\nsecond line\n";
		let config = read_function_config(&InputSource::Stdin, stdin).await.unwrap();
		assert_eq!(config, b"{\"kind\": \"KCLRun\"}");
	}

	#[tokio::test]
	async fn test_stdin_line_without_newline() {
		let stdin: &[u8] = b"kind: KCLRun";
		let config = read_function_config(&InputSource::Stdin, stdin).await.unwrap();
		assert_eq!(config, b"kind: KCLRun");
	}

	#[tokio::test]
	async fn test_stdin_blank_line_is_a_line() {
		let stdin: &[u8] = b"\n";
		let config = read_function_config(&InputSource::Stdin, stdin).await.unwrap();
		assert!(config.is_empty());
	}

	#[tokio::test]
	async fn test_empty_stdin_is_scan_error() {
		let stdin: &[u8] = b"";
		assert_matches!(
			read_function_config(&InputSource::Stdin, stdin).await,
			Err(OrchestrationError::InputScan)
		);
	}

	#[tokio::test]
	async fn test_file_is_read_whole() {
		let mut file = tempfile::NamedTempFile::new().unwrap();
		file.write_all(b"apiVersion: krm.kcl.dev/v1alpha1\nkind: KCLRun\n")
			.unwrap();

		let source = InputSource::File(file.path().to_path_buf());
		let config = read_function_config(&source, tokio::io::empty()).await.unwrap();
		assert_eq!(config, b"apiVersion: krm.kcl.dev/v1alpha1\nkind: KCLRun\n");
	}

	#[tokio::test]
	async fn test_missing_file_is_open_error() {
		let dir = tempfile::tempdir().unwrap();
		let source = InputSource::File(dir.path().join("missing.yaml"));
		assert_matches!(
			read_function_config(&source, tokio::io::empty()).await,
			Err(OrchestrationError::FileOpen { .. })
		);
	}

	#[test]
	fn test_concatenate_keeps_order() {
		let stream = concatenate(b"a: 1\n---\n".to_vec(), b"b: 2\n".to_vec());
		assert_eq!(stream.as_bytes(), b"a: 1\n---\nb: 2\n");
	}
}
