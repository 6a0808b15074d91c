//! Pipeline engine running an external KRM function.

use std::process::Stdio;

use bon::Builder;
use tokio::{
	io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
	process::Command,
};
use tracing::instrument;

use super::{
	resource_list::{ResourceList, Severity},
	PipelineEngine, PipelineError,
};
use crate::yaml;

/// Default executable implementing the KCL function.
pub const DEFAULT_FUNCTION_COMMAND: &str = "krm-kcl";

/// Runs a function executable speaking the KRM Functions protocol.
///
/// The input stream is split into items and the `KCLRun` function
/// configuration, sent to the function as a `ResourceList`, and the items of
/// the returned list are written to the output as a YAML stream.
#[derive(Debug, Clone, Builder)]
pub struct KrmFunctionEngine {
	#[builder(into, default = DEFAULT_FUNCTION_COMMAND.to_string())]
	command: String,
	#[builder(default)]
	args: Vec<String>,
}

impl Default for KrmFunctionEngine {
	fn default() -> Self {
		Self::builder().build()
	}
}

impl KrmFunctionEngine {
	pub fn command(&self) -> &str {
		&self.command
	}

	#[instrument(skip_all, fields(command = %self.command, items = input.items.len()))]
	async fn run_function(&self, input: &ResourceList) -> Result<ResourceList, PipelineError> {
		let request = input.to_yaml()?;

		let mut child = Command::new(&self.command)
			.args(&self.args)
			.stdin(Stdio::piped())
			.stdout(Stdio::piped())
			.stderr(Stdio::piped())
			.kill_on_drop(true)
			.spawn()
			.map_err(|source| PipelineError::Spawn {
				command: self.command.clone(),
				source,
			})?;

		let mut stdin = child
			.stdin
			.take()
			.ok_or_else(|| std::io::Error::other("function stdin is not piped"))?;

		// Feed stdin while draining stdout, a full pipe on either side would stall the other
		let feed = async move {
			stdin.write_all(request.as_bytes()).await?;
			stdin.shutdown().await
		};
		let (fed, output) = tokio::join!(feed, child.wait_with_output());
		let output = output?;

		let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
		if !output.status.success() {
			return Err(PipelineError::FunctionFailed {
				command: self.command.clone(),
				status: output.status,
				stderr,
			});
		}
		fed?;
		if !stderr.is_empty() {
			tracing::debug!(stderr = %stderr, "function stderr");
		}

		let list = ResourceList::from_function_output(&output.stdout)?;
		for result in &list.results {
			if result.severity == Some(Severity::Warning) {
				tracing::warn!(message = %result.message, "function warning");
			}
		}

		let errors = list.errors();
		if !errors.is_empty() {
			return Err(PipelineError::FunctionReportedErrors(errors));
		}
		Ok(list)
	}
}

impl PipelineEngine for KrmFunctionEngine {
	async fn execute<R, W>(&self, mut input: R, mut output: W) -> Result<(), PipelineError>
	where
		R: AsyncRead + Unpin + Send,
		W: AsyncWrite + Unpin + Send,
	{
		let mut bytes = Vec::new();
		input.read_to_end(&mut bytes).await?;

		let request = ResourceList::from_documents(yaml::parse_stream(&bytes)?)?;
		tracing::debug!(items = request.items.len(), "assembled function input");

		let response = self.run_function(&request).await?;
		tracing::debug!(items = response.items.len(), "function produced items");

		let rendered = yaml::to_yaml_stream(&response.items)?;
		output.write_all(rendered.as_bytes()).await?;
		output.shutdown().await?;
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_default_command() {
		let engine = KrmFunctionEngine::default();
		assert_eq!(engine.command(), DEFAULT_FUNCTION_COMMAND);
		assert!(engine.args.is_empty());
	}
}
