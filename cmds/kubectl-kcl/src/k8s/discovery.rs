//! Resolving the kinds a run touches to their REST endpoints.
//!
//! A [`KindIndex`] is built once per fetch or apply for exactly the kinds it
//! needs. Clusters serving the aggregated discovery document are resolved in
//! a single round trip; older ones are asked about each kind separately.

use std::{
	collections::{HashMap, HashSet},
	sync::Arc,
};

use kube::{
	core::GroupVersionKind,
	discovery::{oneshot::pinned_kind, verbs, ApiCapabilities, ApiResource, Scope},
	Client, Discovery,
};
use thiserror::Error;
use tokio::{sync::Semaphore, task::JoinSet};
use tracing::instrument;

use super::ResourceScope;

/// Upper bound on per-kind discovery requests in flight.
const LAZY_CONCURRENCY: usize = 8;

#[derive(Debug, Error)]
pub enum DiscoveryError {
	#[error("kind discovery task did not complete")]
	Join(#[source] tokio::task::JoinError),

	#[error("cluster serves none of the requested kinds (first failure: {api_version}/{kind})")]
	NothingServed {
		api_version: String,
		kind: String,
		#[source]
		source: kube::Error,
	},
}

/// Kind key of a manifest, `None` when `apiVersion` or `kind` is absent.
pub fn kind_of(manifest: &serde_json::Value) -> Option<GroupVersionKind> {
	let api_version = manifest.get("apiVersion")?.as_str()?;
	let kind = manifest.get("kind")?.as_str()?;
	Some(kind_key(api_version, kind))
}

/// Kind key from an `apiVersion` (`v1`, `apps/v1`) and a kind name.
pub fn kind_key(api_version: &str, kind: &str) -> GroupVersionKind {
	match api_version.split_once('/') {
		Some((group, version)) => GroupVersionKind::gvk(group, version, kind),
		None => GroupVersionKind::gvk("", api_version, kind),
	}
}

/// How the cluster serves one kind.
#[derive(Debug, Clone)]
pub struct ServedKind {
	pub resource: ApiResource,
	pub scope: ResourceScope,
	/// Whether `list` is allowed; fetching skips kinds that are not.
	pub listable: bool,
}

impl From<(ApiResource, ApiCapabilities)> for ServedKind {
	fn from((resource, caps): (ApiResource, ApiCapabilities)) -> Self {
		Self {
			scope: match caps.scope {
				Scope::Namespaced => ResourceScope::Namespaced,
				Scope::Cluster => ResourceScope::ClusterWide,
			},
			listable: caps.supports_operation(verbs::LIST),
			resource,
		}
	}
}

/// Served kinds keyed by group, version and kind.
#[derive(Debug, Clone, Default)]
pub struct KindIndex {
	kinds: HashMap<GroupVersionKind, ServedKind>,
}

impl KindIndex {
	/// Resolve `wanted` against the cluster.
	///
	/// Kinds the cluster does not serve are absent from the index. Failing
	/// to resolve every one of them is an error.
	#[instrument(skip_all, fields(wanted = wanted.len()))]
	pub async fn discover(
		client: &Client,
		wanted: HashSet<GroupVersionKind>,
	) -> Result<Self, DiscoveryError> {
		match Discovery::new(client.clone()).run_aggregated().await {
			Ok(discovery) => Ok(Self::from_aggregated(&discovery, &wanted)),
			Err(e) => {
				tracing::debug!(error = %e, "no aggregated discovery, resolving kinds one by one");
				Self::discover_each(client, wanted).await
			}
		}
	}

	fn from_aggregated(discovery: &Discovery, wanted: &HashSet<GroupVersionKind>) -> Self {
		// Every served version, not just the preferred one
		let kinds = discovery
			.groups()
			.flat_map(|group| {
				group
					.versions()
					.flat_map(|version| group.versioned_resources(version))
					.collect::<Vec<_>>()
			})
			.filter_map(|(resource, caps)| {
				let key = GroupVersionKind::gvk(&resource.group, &resource.version, &resource.kind);
				wanted
					.contains(&key)
					.then(|| (key, ServedKind::from((resource, caps))))
			})
			.collect::<HashMap<_, _>>();

		tracing::debug!(served = kinds.len(), "resolved kinds from aggregated discovery");
		Self { kinds }
	}

	async fn discover_each(
		client: &Client,
		wanted: HashSet<GroupVersionKind>,
	) -> Result<Self, DiscoveryError> {
		let permits = Arc::new(Semaphore::new(LAZY_CONCURRENCY));
		let mut lookups = JoinSet::new();

		for key in wanted {
			let client = client.clone();
			let permits = permits.clone();
			lookups.spawn(async move {
				let _permit = permits.acquire_owned().await.ok();
				let served = pinned_kind(&client, &key).await;
				(key, served)
			});
		}

		let mut kinds = HashMap::new();
		let mut first_failure = None;
		while let Some(joined) = lookups.join_next().await {
			match joined.map_err(DiscoveryError::Join)? {
				(key, Ok(served)) => {
					kinds.insert(key, ServedKind::from(served));
				}
				(key, Err(e)) => {
					tracing::debug!(kind = %key.kind, api_version = %key.api_version(), error = %e, "kind not served");
					first_failure.get_or_insert((key, e));
				}
			}
		}

		match first_failure {
			Some((key, source)) if kinds.is_empty() => Err(DiscoveryError::NothingServed {
				api_version: key.api_version(),
				kind: key.kind,
				source,
			}),
			_ => Ok(Self { kinds }),
		}
	}

	pub fn get(&self, key: &GroupVersionKind) -> Option<&ServedKind> {
		self.kinds.get(key)
	}
}

#[cfg(test)]
mod tests {
	use rstest::rstest;
	use serde_json::json;

	use super::*;

	#[rstest]
	#[case::core("v1", "ConfigMap", "")]
	#[case::grouped("batch/v1", "CronJob", "batch")]
	#[case::dotted_group("networking.k8s.io/v1", "Ingress", "networking.k8s.io")]
	fn test_kind_key_splits_group(#[case] api_version: &str, #[case] kind: &str, #[case] group: &str) {
		let key = kind_key(api_version, kind);
		assert_eq!(key.group, group);
		assert_eq!(key.version, "v1");
		assert_eq!(key.kind, kind);
		assert_eq!(key.api_version(), api_version);
	}

	#[test]
	fn test_kind_of_manifest() {
		let manifest = json!({"apiVersion": "apps/v1", "kind": "StatefulSet", "metadata": {"name": "db"}});
		assert_eq!(kind_of(&manifest), Some(kind_key("apps/v1", "StatefulSet")));
	}

	#[rstest]
	#[case::no_api_version(json!({"kind": "Job"}))]
	#[case::no_kind(json!({"apiVersion": "v1"}))]
	#[case::not_a_string(json!({"apiVersion": "v1", "kind": 3}))]
	fn test_kind_of_incomplete_manifest(#[case] manifest: serde_json::Value) {
		assert!(kind_of(&manifest).is_none());
	}
}
