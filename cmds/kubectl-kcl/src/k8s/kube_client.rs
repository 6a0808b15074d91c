//! [`ClusterClient`] backed by kube-rs.

use bon::Builder;
use thiserror::Error;
use tokio::{
	io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
	sync::OnceCell,
};
use tracing::instrument;

use super::{
	apply::{select_manifests, ApplyEngine, ApplyError},
	client::{ClusterConnection, ConnectionError, ConnectionOptions},
	fetch::{fetch_general_resources, FetchError},
	ClusterClient, ScopingOptions,
};

#[derive(Debug, Error)]
pub enum ClientError {
	#[error("connecting to Kubernetes cluster")]
	Connection(#[from] ConnectionError),

	#[error("fetching general resources")]
	Fetch(#[from] FetchError),

	#[error(transparent)]
	Apply(#[from] ApplyError),

	#[error("writing fetched resources")]
	Sink(#[source] std::io::Error),
}

/// Cluster client that connects on first use.
///
/// Fetching uses the same scoping options as the later apply, so the
/// function sees the resources it is allowed to touch.
#[derive(Builder)]
pub struct KubeClusterClient {
	#[builder(default)]
	connection_options: ConnectionOptions,
	#[builder(default)]
	fetch_scoping: ScopingOptions,
	#[builder(default)]
	server_side: bool,
	#[builder(default)]
	force: bool,
	/// Pre-established connection, mostly for tests.
	connection: Option<ClusterConnection>,
	#[builder(skip)]
	lazy_connection: OnceCell<ClusterConnection>,
}

impl KubeClusterClient {
	async fn connection(&self) -> Result<&ClusterConnection, ClientError> {
		if let Some(conn) = &self.connection {
			return Ok(conn);
		}
		let conn = self
			.lazy_connection
			.get_or_try_init(|| async {
				let conn = ClusterConnection::from_options(&self.connection_options).await?;
				tracing::debug!(
					context = %conn.context(),
					server_version = %format!("{}.{}", conn.server_version().major, conn.server_version().minor),
					"connected to cluster"
				);
				Ok::<_, ConnectionError>(conn)
			})
			.await?;
		Ok(conn)
	}
}

impl ClusterClient for KubeClusterClient {
	type Error = ClientError;

	#[instrument(skip_all)]
	async fn get_general_resources<W>(&self, sink: &mut W) -> Result<(), Self::Error>
	where
		W: AsyncWrite + Unpin + Send,
	{
		let conn = self.connection().await?;
		let stream = fetch_general_resources(conn.client(), &self.fetch_scoping).await?;
		sink.write_all(stream.as_bytes())
			.await
			.map_err(ClientError::Sink)?;
		sink.flush().await.map_err(ClientError::Sink)?;
		Ok(())
	}

	#[instrument(skip_all, fields(
		namespace = scoping.namespace().unwrap_or(""),
		selector = scoping.selector().unwrap_or(""),
		field_selector = scoping.field_selector().unwrap_or(""),
	))]
	async fn apply<R>(&self, scoping: &ScopingOptions, mut payload: R) -> Result<(), Self::Error>
	where
		R: AsyncRead + Unpin + Send,
	{
		let mut bytes = Vec::new();
		payload
			.read_to_end(&mut bytes)
			.await
			.map_err(ApplyError::Payload)?;

		let manifests = select_manifests(&bytes, scoping)?;

		let conn = self.connection().await?;
		let engine = ApplyEngine::new(
			conn.client().clone(),
			scoping.namespace().map(str::to_string),
			conn.default_namespace().to_string(),
			self.server_side,
			self.force,
		);
		let applied = engine.apply_all(&manifests).await?;
		tracing::info!(applied, "apply complete");
		Ok(())
	}
}
