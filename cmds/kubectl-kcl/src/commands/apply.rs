//! Apply command handler.
//!
//! Runs the KCL function over the cluster's general resources plus the given
//! function configuration, then applies (or renders) the result.

use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use clap::Args;
use tokio::io::BufReader;
use tracing::Level;

use crate::{
	k8s::{
		client::ConnectionOptions,
		kube_client::KubeClusterClient,
		selector::{FieldSelector, LabelSelector},
		ScopingOptions,
	},
	orchestrate::{InputSource, Orchestrator, OutputTarget},
	pipeline::{krm::DEFAULT_FUNCTION_COMMAND, KrmFunctionEngine},
	telemetry::LogFormat,
};

#[derive(Args, Debug, Clone)]
pub struct ApplyArgs {
	/// KCLRun function configuration file, or `-` to read one line from stdin
	#[arg(short = 'f', long)]
	pub filename: String,

	/// Write the resulting manifests to this file (`-` for stdout) instead of applying them
	#[arg(short = 'o', long)]
	pub output: Option<String>,

	/// Namespace to fetch from and apply into
	#[arg(short = 'n', long, default_value = "")]
	pub namespace: String,

	/// Label selector, supports '=', '==', '!=', 'in', 'notin' and existence checks
	#[arg(short = 'l', long, default_value = "")]
	pub selector: String,

	/// Field selector, supports '=', '==' and '!='
	#[arg(long, default_value = "")]
	pub field_selector: String,

	/// Path to the kubeconfig file
	#[arg(long)]
	pub kubeconfig: Option<PathBuf>,

	/// Kubeconfig context to use
	#[arg(long)]
	pub context: Option<String>,

	/// Use server-side apply
	#[arg(long)]
	pub server_side: bool,

	/// Take ownership of conflicting fields during server-side apply
	#[arg(long)]
	pub force: bool,

	/// Executable implementing the KCL function
	#[arg(long, default_value = DEFAULT_FUNCTION_COMMAND)]
	pub fn_command: String,

	/// Extra argument for the function executable (repeatable)
	#[arg(long = "fn-arg")]
	pub fn_args: Vec<String>,

	/// Abort the function after this many seconds
	#[arg(long)]
	pub pipeline_timeout: Option<u64>,

	/// Log level (possible values: error, warn, info, debug, trace)
	#[arg(long)]
	pub log_level: Option<Level>,

	/// Log format on stderr
	#[arg(long, default_value = "auto", value_enum)]
	pub log_format: LogFormat,
}

impl ApplyArgs {
	/// Reject unusable arguments before any I/O happens.
	pub fn validate(&self) -> Result<()> {
		if self.filename.is_empty() {
			anyhow::bail!("--filename must not be empty");
		}
		self.selector
			.parse::<LabelSelector>()
			.with_context(|| format!("invalid --selector {:?}", self.selector))?;
		self.field_selector
			.parse::<FieldSelector>()
			.with_context(|| format!("invalid --field-selector {:?}", self.field_selector))?;
		if self.pipeline_timeout == Some(0) {
			anyhow::bail!("--pipeline-timeout must be positive");
		}
		Ok(())
	}

	pub fn scoping(&self) -> ScopingOptions {
		ScopingOptions::new(&self.namespace, &self.selector, &self.field_selector)
	}

	fn connection_options(&self) -> ConnectionOptions {
		ConnectionOptions::builder()
			.maybe_kubeconfig(self.kubeconfig.clone())
			.maybe_context(self.context.clone())
			.build()
	}

	fn engine(&self) -> KrmFunctionEngine {
		KrmFunctionEngine::builder()
			.command(&self.fn_command)
			.args(self.fn_args.clone())
			.build()
	}
}

/// Run the apply command.
pub fn run(args: ApplyArgs) -> Result<()> {
	args.validate()?;

	let runtime = tokio::runtime::Builder::new_multi_thread()
		.enable_all()
		.build()
		.context("creating tokio runtime")?;

	runtime.block_on(run_async(args))
}

async fn run_async(args: ApplyArgs) -> Result<()> {
	let scoping = args.scoping();

	let client = KubeClusterClient::builder()
		.connection_options(args.connection_options())
		.fetch_scoping(scoping.clone())
		.server_side(args.server_side)
		.force(args.force)
		.build();

	let orchestrator = Orchestrator::builder()
		.client(client)
		.engine(Arc::new(args.engine()))
		.input(InputSource::from(args.filename.as_str()))
		.scoping(scoping)
		.output(OutputTarget::from_output_arg(args.output.as_deref()))
		.maybe_pipeline_timeout(args.pipeline_timeout.map(Duration::from_secs))
		.build();

	orchestrator
		.run(BufReader::new(tokio::io::stdin()))
		.await
		.with_context(|| format!("applying with function configuration {}", args.filename))
}
