//! Mock Kubernetes API discovery types.

use std::collections::HashMap;

/// Discovery mode for the mock server.
#[derive(Clone, Copy, Default)]
pub enum DiscoveryMode {
	/// Support aggregated discovery (APIGroupDiscoveryList).
	#[default]
	Aggregated,
	/// Return 406 for aggregated discovery, forcing fallback to legacy endpoints.
	Legacy,
}

/// Pre-configured discovery responses.
pub struct MockDiscovery {
	pub core_resources: Vec<MockApiResource>,
	/// Resources per `group/version`.
	pub group_resources: HashMap<String, Vec<MockApiResource>>,
}

impl Default for MockDiscovery {
	fn default() -> Self {
		Self {
			core_resources: vec![
				MockApiResource::namespaced("configmaps", "ConfigMap"),
				MockApiResource::namespaced("secrets", "Secret"),
				MockApiResource::namespaced("services", "Service"),
				MockApiResource::namespaced("serviceaccounts", "ServiceAccount"),
				MockApiResource::namespaced("pods", "Pod"),
				MockApiResource::cluster_scoped("namespaces", "Namespace"),
			],
			group_resources: HashMap::from([
				(
					"apps/v1".to_string(),
					vec![
						MockApiResource::namespaced("deployments", "Deployment"),
						MockApiResource::namespaced("statefulsets", "StatefulSet"),
						MockApiResource::namespaced("daemonsets", "DaemonSet"),
					],
				),
				(
					"batch/v1".to_string(),
					vec![
						MockApiResource::namespaced("jobs", "Job"),
						MockApiResource::namespaced("cronjobs", "CronJob"),
					],
				),
				(
					"networking.k8s.io/v1".to_string(),
					vec![MockApiResource::namespaced("ingresses", "Ingress")],
				),
				(
					"rbac.authorization.k8s.io/v1".to_string(),
					vec![MockApiResource::cluster_scoped("clusterroles", "ClusterRole")],
				),
			]),
		}
	}
}

impl MockDiscovery {
	/// Resources served under `api_version` (`v1` or `group/version`).
	pub fn resources(&self, api_version: &str) -> &[MockApiResource] {
		if api_version.contains('/') {
			self.group_resources
				.get(api_version)
				.map(Vec::as_slice)
				.unwrap_or_default()
		} else if api_version == "v1" {
			&self.core_resources
		} else {
			&[]
		}
	}

	pub fn by_kind(&self, api_version: &str, kind: &str) -> Option<&MockApiResource> {
		self.resources(api_version).iter().find(|r| r.kind == kind)
	}

	pub fn by_plural(&self, api_version: &str, plural: &str) -> Option<&MockApiResource> {
		self.resources(api_version).iter().find(|r| r.name == plural)
	}
}

/// A mock API resource definition.
pub struct MockApiResource {
	pub name: String,
	pub kind: String,
	pub namespaced: bool,
	pub verbs: Vec<String>,
}

impl MockApiResource {
	pub fn namespaced(name: &str, kind: &str) -> Self {
		Self::new(name, kind, true)
	}

	pub fn cluster_scoped(name: &str, kind: &str) -> Self {
		Self::new(name, kind, false)
	}

	fn new(name: &str, kind: &str, namespaced: bool) -> Self {
		Self {
			name: name.to_string(),
			kind: kind.to_string(),
			namespaced,
			verbs: ["create", "delete", "get", "list", "patch", "update", "watch"]
				.into_iter()
				.map(String::from)
				.collect(),
		}
	}
}
