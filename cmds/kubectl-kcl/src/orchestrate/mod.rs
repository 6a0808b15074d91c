//! The apply orchestration.
//!
//! ```text
//!   function config (file | stdin line) ─┐
//!   cluster snapshot ─────────────────────┴▶ snapshot ++ config
//!       ──▶ pipeline engine (background task, bounded pipe)
//!       ──▶ materialized buffer ──▶ apply (or render)
//! ```

use std::{fmt, path::PathBuf, sync::Arc, time::Duration};

use bon::Builder;
use thiserror::Error;
use tokio::io::AsyncBufRead;
use tracing::{instrument::WithSubscriber, Dispatch};

use crate::{
	k8s::{ClusterClient, ScopingOptions},
	pipeline::{PipelineEngine, PipelineError},
};

pub mod coupler;
pub mod dispatch;
pub mod source;

pub use dispatch::OutputTarget;
pub use source::InputSource;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Error)]
pub enum OrchestrationError {
	#[error("fetching general resources from the cluster")]
	Fetch(#[source] BoxError),

	#[error("standard input ended before a line was read")]
	InputScan,

	#[error("reading standard input")]
	StdinRead(#[source] std::io::Error),

	#[error("opening {}", path.display())]
	FileOpen {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},

	#[error("reading {}", path.display())]
	FileRead {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},

	#[error("pipeline execution")]
	Pipeline(#[source] PipelineError),

	#[error("pipeline task")]
	PipelineTask(#[source] tokio::task::JoinError),

	#[error("pipeline did not finish within {0:?}")]
	PipelineTimeout(Duration),

	#[error("reading pipeline output")]
	Drain(#[source] std::io::Error),

	#[error("applying resources to the cluster")]
	Apply(#[source] BoxError),

	#[error("writing rendered resources to {}", path.display())]
	Render {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},
}

/// Step of the orchestration an error came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
	ReadInput,
	Fetch,
	Pipeline,
	Dispatch,
}

impl fmt::Display for Stage {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(match self {
			Stage::ReadInput => "read-input",
			Stage::Fetch => "fetch",
			Stage::Pipeline => "pipeline",
			Stage::Dispatch => "dispatch",
		})
	}
}

impl OrchestrationError {
	pub fn stage(&self) -> Stage {
		match self {
			Self::InputScan | Self::StdinRead(_) | Self::FileOpen { .. } | Self::FileRead { .. } => {
				Stage::ReadInput
			}
			Self::Fetch(_) => Stage::Fetch,
			Self::Pipeline(_) | Self::PipelineTask(_) | Self::PipelineTimeout(_) | Self::Drain(_) => {
				Stage::Pipeline
			}
			Self::Apply(_) | Self::Render { .. } => Stage::Dispatch,
		}
	}
}

/// Cluster snapshot followed by the function configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceStream(Vec<u8>);

impl From<Vec<u8>> for ResourceStream {
	fn from(bytes: Vec<u8>) -> Self {
		Self(bytes)
	}
}

impl ResourceStream {
	pub fn as_bytes(&self) -> &[u8] {
		&self.0
	}

	pub fn into_inner(self) -> Vec<u8> {
		self.0
	}

	pub fn len(&self) -> usize {
		self.0.len()
	}

	pub fn is_empty(&self) -> bool {
		self.0.is_empty()
	}
}

/// Complete pipeline output, collected before anything is applied.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaterializedBuffer(Vec<u8>);

impl From<Vec<u8>> for MaterializedBuffer {
	fn from(bytes: Vec<u8>) -> Self {
		Self(bytes)
	}
}

impl MaterializedBuffer {
	pub fn as_bytes(&self) -> &[u8] {
		&self.0
	}

	pub fn into_inner(self) -> Vec<u8> {
		self.0
	}

	pub fn len(&self) -> usize {
		self.0.len()
	}

	pub fn is_empty(&self) -> bool {
		self.0.is_empty()
	}
}

/// One `apply` invocation: inputs, collaborators and options.
#[derive(Builder)]
pub struct Orchestrator<C, E> {
	client: C,
	engine: Arc<E>,
	input: InputSource,
	#[builder(default)]
	scoping: ScopingOptions,
	#[builder(default)]
	output: OutputTarget,
	pipeline_timeout: Option<Duration>,
	/// Where diagnostics go; defaults to the subscriber active at build time.
	#[builder(default = tracing::dispatcher::get_default(Dispatch::clone))]
	log: Dispatch,
}

impl<C, E> Orchestrator<C, E>
where
	C: ClusterClient,
	E: PipelineEngine,
{
	pub fn client(&self) -> &C {
		&self.client
	}

	/// Read input, fetch, transform and dispatch.
	///
	/// `stdin` is only read when the input source is standard input. The
	/// input is read before the cluster is contacted, so an unreadable input
	/// never costs a fetch.
	pub async fn run<R>(&self, stdin: R) -> Result<(), OrchestrationError>
	where
		R: AsyncBufRead + Unpin,
	{
		self.run_stages(stdin)
			.with_subscriber(self.log.clone())
			.await
			.inspect_err(|e| {
				let _guard = tracing::dispatcher::set_default(&self.log);
				tracing::error!(stage = %e.stage(), error = %e, "apply failed");
			})
	}

	async fn run_stages<R>(&self, stdin: R) -> Result<(), OrchestrationError>
	where
		R: AsyncBufRead + Unpin,
	{
		let function_config = source::read_function_config(&self.input, stdin).await?;
		let snapshot = source::fetch_snapshot(&self.client).await?;
		let stream = source::concatenate(snapshot, function_config);
		tracing::debug!(bytes = stream.len(), "assembled resource stream");

		let buffer = coupler::couple(stream, Arc::clone(&self.engine), self.pipeline_timeout).await?;

		match &self.output {
			OutputTarget::Apply => dispatch::apply(&self.client, buffer, &self.scoping).await,
			OutputTarget::Render(path) => dispatch::render(&buffer, path).await,
		}
	}
}
