//! Transformation pipeline engines.
//!
//! An engine consumes a resource stream that carries a function
//! configuration alongside the resources, and writes the transformed
//! resources to its output sink.

use std::future::Future;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::yaml::YamlError;

pub mod krm;
pub mod resource_list;

pub use krm::KrmFunctionEngine;

#[derive(Debug, Error)]
pub enum PipelineError {
	#[error("pipeline I/O")]
	Io(#[from] std::io::Error),

	#[error(transparent)]
	Yaml(#[from] YamlError),

	#[error("no function configuration (kind: KCLRun) found in the input stream")]
	MissingFunctionConfig,

	#[error("starting function `{command}`")]
	Spawn {
		command: String,
		#[source]
		source: std::io::Error,
	},

	#[error("function `{command}` exited with {status}: {stderr}")]
	FunctionFailed {
		command: String,
		status: std::process::ExitStatus,
		stderr: String,
	},

	#[error("function reported errors: {}", .0.join("; "))]
	FunctionReportedErrors(Vec<String>),

	#[error("function output is not a ResourceList: {0}")]
	InvalidOutput(String),
}

/// Executes the function logic embedded in a resource stream.
///
/// The engine owns `output`: dropping it is what tells the reader the
/// stream is complete, so implementations must not leak it.
pub trait PipelineEngine: Send + Sync + 'static {
	fn execute<R, W>(&self, input: R, output: W) -> impl Future<Output = Result<(), PipelineError>> + Send
	where
		R: AsyncRead + Unpin + Send,
		W: AsyncWrite + Unpin + Send;
}
