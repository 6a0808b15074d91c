//! Kubernetes cluster connection management.

use std::{path::PathBuf, time::Duration};

use bon::Builder;
use k8s_openapi::apimachinery::pkg::version::Info;
use kube::{
	config::{KubeConfigOptions, Kubeconfig, KubeconfigError},
	Client, Config,
};
use thiserror::Error;
use tracing::instrument;

/// Default timeout for Kubernetes API requests.
const DEFAULT_API_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors that can occur when connecting to a Kubernetes cluster.
#[derive(Debug, Error)]
pub enum ConnectionError {
	#[error("no context named `{0}` was found. Please check your kubeconfig")]
	ContextNotFound(String),

	#[error("kubeconfig has no current-context, pass --context to select one")]
	NoCurrentContext,

	#[error(transparent)]
	Kubeconfig(#[from] KubeconfigError),

	#[error(transparent)]
	Kube(#[from] kube::Error),
}

/// Where to find the kubeconfig and which context to use.
///
/// Mirrors the `--kubeconfig` and `--context` flags every kubectl plugin takes.
#[derive(Debug, Clone, Default, Builder)]
pub struct ConnectionOptions {
	/// Explicit kubeconfig path. Falls back to `$KUBECONFIG` / `~/.kube/config`.
	pub kubeconfig: Option<PathBuf>,
	/// Context name. Falls back to the kubeconfig's current-context.
	#[builder(into)]
	pub context: Option<String>,
}

/// Represents a connection to a Kubernetes cluster.
#[derive(Clone)]
pub struct ClusterConnection {
	client: Client,
	server_version: Info,
	context: String,
}

impl std::fmt::Debug for ClusterConnection {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ClusterConnection")
			.field("context", &self.context)
			.field("server_version", &self.server_version)
			.finish_non_exhaustive()
	}
}

impl ClusterConnection {
	/// Connect using the kubeconfig located by `options`.
	#[instrument(skip_all)]
	pub async fn from_options(options: &ConnectionOptions) -> Result<Self, ConnectionError> {
		let kubeconfig = match &options.kubeconfig {
			Some(path) => Kubeconfig::read_from(path)?,
			None => Kubeconfig::read()?,
		};
		Self::from_options_with_kubeconfig(options, kubeconfig).await
	}

	/// Connect using an already loaded kubeconfig.
	#[instrument(skip_all)]
	pub async fn from_options_with_kubeconfig(
		options: &ConnectionOptions,
		kubeconfig: Kubeconfig,
	) -> Result<Self, ConnectionError> {
		let context = select_context(&kubeconfig, options.context.as_deref())?;
		tracing::debug!(context = %context, "using kubeconfig context");

		let mut config = Config::from_custom_kubeconfig(
			kubeconfig,
			&KubeConfigOptions {
				context: Some(context.clone()),
				..Default::default()
			},
		)
		.await?;

		config.read_timeout = Some(DEFAULT_API_TIMEOUT);
		let client = Client::try_from(config)?;

		let server_version = client.apiserver_version().await?;

		Ok(Self {
			client,
			server_version,
			context,
		})
	}

	/// Get a reference to the underlying kube client.
	pub fn client(&self) -> &Client {
		&self.client
	}

	pub fn server_version(&self) -> &Info {
		&self.server_version
	}

	/// Get the default namespace from the current context.
	pub fn default_namespace(&self) -> &str {
		self.client.default_namespace()
	}

	pub fn context(&self) -> &str {
		&self.context
	}
}

/// Resolve the context to connect with.
fn select_context(kubeconfig: &Kubeconfig, requested: Option<&str>) -> Result<String, ConnectionError> {
	match requested {
		Some(name) => {
			if kubeconfig.contexts.iter().any(|c| c.name == name) {
				Ok(name.to_string())
			} else {
				Err(ConnectionError::ContextNotFound(name.to_string()))
			}
		}
		None => kubeconfig
			.current_context
			.clone()
			.filter(|c| !c.is_empty())
			.ok_or(ConnectionError::NoCurrentContext),
	}
}

#[cfg(test)]
mod tests {
	use assert_matches::assert_matches;
	use kube::config::NamedContext;

	use super::*;

	#[tokio::test]
	async fn test_connect_context_not_found() {
		let options = ConnectionOptions::builder().context("nonexistent").build();
		let kubeconfig = Kubeconfig::default();

		let result = ClusterConnection::from_options_with_kubeconfig(&options, kubeconfig).await;
		assert_matches!(
			result,
			Err(ConnectionError::ContextNotFound(context)) if context == "nonexistent"
		);
	}

	#[tokio::test]
	async fn test_connect_without_current_context_errors() {
		let options = ConnectionOptions::default();
		let kubeconfig = Kubeconfig::default();

		let result = ClusterConnection::from_options_with_kubeconfig(&options, kubeconfig).await;
		assert_matches!(result, Err(ConnectionError::NoCurrentContext));
	}

	#[test]
	fn test_select_context_prefers_requested() {
		let kubeconfig = Kubeconfig {
			contexts: vec![
				NamedContext {
					name: "dev".to_string(),
					context: None,
				},
				NamedContext {
					name: "prod".to_string(),
					context: None,
				},
			],
			current_context: Some("dev".to_string()),
			..Default::default()
		};

		assert_eq!(select_context(&kubeconfig, Some("prod")).unwrap(), "prod");
		assert_eq!(select_context(&kubeconfig, None).unwrap(), "dev");
	}
}
