//! Kubernetes access for fetching general resources and applying manifests.
//!
//! The orchestration only depends on the [`ClusterClient`] trait; the
//! [`kube_client::KubeClusterClient`] implementation talks to the API server
//! natively through kube-rs.

use std::future::Future;

use tokio::io::{AsyncRead, AsyncWrite};

pub mod apply;
pub mod client;
pub mod discovery;
pub mod fetch;
pub mod kube_client;
pub mod selector;

/// Kubernetes API resource scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceScope {
	/// Resource is namespaced (e.g., Deployment, ConfigMap).
	Namespaced,

	/// Resource is cluster-wide (e.g., Namespace, ClusterRole).
	ClusterWide,
}

/// Namespace, label and field constraints applied when talking to the cluster.
///
/// An empty string leaves the corresponding dimension unconstrained.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScopingOptions {
	namespace: String,
	selector: String,
	field_selector: String,
}

impl ScopingOptions {
	pub fn new(
		namespace: impl Into<String>,
		selector: impl Into<String>,
		field_selector: impl Into<String>,
	) -> Self {
		Self {
			namespace: namespace.into(),
			selector: selector.into(),
			field_selector: field_selector.into(),
		}
	}

	pub fn namespace(&self) -> Option<&str> {
		non_empty(&self.namespace)
	}

	pub fn selector(&self) -> Option<&str> {
		non_empty(&self.selector)
	}

	pub fn field_selector(&self) -> Option<&str> {
		non_empty(&self.field_selector)
	}

	/// True when no dimension narrows the request.
	pub fn is_unconstrained(&self) -> bool {
		self.namespace().is_none() && self.selector().is_none() && self.field_selector().is_none()
	}
}

fn non_empty(s: &str) -> Option<&str> {
	if s.is_empty() {
		None
	} else {
		Some(s)
	}
}

/// The operations the apply orchestration needs from a cluster.
pub trait ClusterClient {
	type Error: std::error::Error + Send + Sync + 'static;

	/// Write the general resources of the cluster into `sink` as a YAML stream.
	fn get_general_resources<W>(&self, sink: &mut W) -> impl Future<Output = Result<(), Self::Error>>
	where
		W: AsyncWrite + Unpin + Send;

	/// Apply every manifest of the YAML stream `payload`, restricted by `scoping`.
	fn apply<R>(
		&self,
		scoping: &ScopingOptions,
		payload: R,
	) -> impl Future<Output = Result<(), Self::Error>>
	where
		R: AsyncRead + Unpin + Send;
}
