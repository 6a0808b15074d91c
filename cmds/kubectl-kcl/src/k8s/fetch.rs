//! Fetching the general resources of a cluster as a YAML stream.

use kube::{
	api::{Api, DynamicObject, ListParams},
	core::GroupVersionKind,
	Client,
};
use thiserror::Error;
use tracing::instrument;

use super::{
	discovery::{kind_key, DiscoveryError, KindIndex, ServedKind},
	ResourceScope, ScopingOptions,
};
use crate::yaml::{self, YamlError};

/// Kinds fetched as context for the function, as `(apiVersion, kind)`.
pub const GENERAL_KINDS: &[(&str, &str)] = &[
	("v1", "ConfigMap"),
	("v1", "Secret"),
	("v1", "Service"),
	("v1", "ServiceAccount"),
	("apps/v1", "Deployment"),
	("apps/v1", "StatefulSet"),
	("apps/v1", "DaemonSet"),
	("batch/v1", "Job"),
	("batch/v1", "CronJob"),
	("networking.k8s.io/v1", "Ingress"),
];

/// Metadata fields populated by the API server that must not be re-applied.
const SERVER_METADATA_FIELDS: &[&str] = &[
	"managedFields",
	"uid",
	"resourceVersion",
	"generation",
	"creationTimestamp",
	"selfLink",
];

#[derive(Debug, Error)]
pub enum FetchError {
	#[error("discovering general resource types")]
	Discovery(#[source] Box<DiscoveryError>),

	#[error("listing {kind}")]
	List {
		kind: String,
		#[source]
		source: Box<kube::Error>,
	},

	#[error("converting {kind} to JSON")]
	Conversion {
		kind: String,
		#[source]
		source: serde_json::Error,
	},

	#[error(transparent)]
	Yaml(#[from] YamlError),
}

pub fn general_kinds() -> impl Iterator<Item = GroupVersionKind> {
	GENERAL_KINDS
		.iter()
		.map(|(api_version, kind)| kind_key(api_version, kind))
}

/// List every general resource visible under `scoping` and render them as a
/// YAML stream, one document per object, each followed by `---`.
#[instrument(skip_all, fields(namespace = scoping.namespace().unwrap_or("<all>")))]
pub async fn fetch_general_resources(
	client: &Client,
	scoping: &ScopingOptions,
) -> Result<String, FetchError> {
	let index = KindIndex::discover(client, general_kinds().collect())
		.await
		.map_err(|e| FetchError::Discovery(Box::new(e)))?;

	let mut params = ListParams::default();
	if let Some(selector) = scoping.selector() {
		params = params.labels(selector);
	}
	if let Some(fields) = scoping.field_selector() {
		params = params.fields(fields);
	}

	let mut objects = Vec::new();
	for gvk in general_kinds() {
		let Some(served) = index.get(&gvk).filter(|s| s.listable) else {
			tracing::debug!(api_version = %gvk.api_version(), kind = %gvk.kind, "skipping kind not served by cluster");
			continue;
		};

		let api = list_api(client, served, scoping.namespace());
		let list = api.list(&params).await.map_err(|e| FetchError::List {
			kind: gvk.kind.clone(),
			source: Box::new(e),
		})?;
		tracing::debug!(kind = %gvk.kind, count = list.items.len(), "listed resources");

		for item in list.items {
			let mut value = serde_json::to_value(&item).map_err(|source| FetchError::Conversion {
				kind: gvk.kind.clone(),
				source,
			})?;
			fill_type_meta(&mut value, &gvk);
			strip_server_fields(&mut value);
			objects.push(value);
		}
	}

	tracing::info!(count = objects.len(), "fetched general resources");
	Ok(yaml::to_yaml_stream(&objects)?)
}

fn list_api(
	client: &Client,
	served: &ServedKind,
	namespace: Option<&str>,
) -> Api<DynamicObject> {
	match (served.scope, namespace) {
		(ResourceScope::Namespaced, Some(ns)) => {
			Api::namespaced_with(client.clone(), ns, &served.resource)
		}
		_ => Api::all_with(client.clone(), &served.resource),
	}
}

/// List responses omit `apiVersion`/`kind` on items.
fn fill_type_meta(value: &mut serde_json::Value, gvk: &GroupVersionKind) {
	if let serde_json::Value::Object(obj) = value {
		obj.entry("apiVersion")
			.or_insert_with(|| gvk.api_version().into());
		obj.entry("kind").or_insert_with(|| gvk.kind.clone().into());
	}
}

/// Remove status and server managed metadata.
pub fn strip_server_fields(value: &mut serde_json::Value) {
	let serde_json::Value::Object(obj) = value else {
		return;
	};
	obj.remove("status");
	if let Some(serde_json::Value::Object(metadata)) = obj.get_mut("metadata") {
		for field in SERVER_METADATA_FIELDS {
			metadata.remove(*field);
		}
		if let Some(serde_json::Value::Object(annotations)) = metadata.get_mut("annotations") {
			annotations.remove("kubectl.kubernetes.io/last-applied-configuration");
			if annotations.is_empty() {
				metadata.remove("annotations");
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use serde_json::json;

	use super::*;

	#[test]
	fn test_strip_server_fields() {
		let mut value = json!({
			"apiVersion": "v1",
			"kind": "ConfigMap",
			"metadata": {
				"name": "app",
				"namespace": "default",
				"uid": "1234",
				"resourceVersion": "42",
				"managedFields": [{"manager": "kubectl"}],
				"creationTimestamp": "2024-01-01T00:00:00Z",
				"annotations": {
					"kubectl.kubernetes.io/last-applied-configuration": "{}"
				},
				"labels": {"app": "web"}
			},
			"data": {"key": "value"},
			"status": {}
		});

		strip_server_fields(&mut value);

		assert_eq!(
			value,
			json!({
				"apiVersion": "v1",
				"kind": "ConfigMap",
				"metadata": {
					"name": "app",
					"namespace": "default",
					"labels": {"app": "web"}
				},
				"data": {"key": "value"}
			})
		);
	}

	#[test]
	fn test_fill_type_meta_keeps_existing() {
		let gvk = GroupVersionKind::gvk("apps", "v1", "Deployment");
		let mut value = json!({"metadata": {"name": "web"}});
		fill_type_meta(&mut value, &gvk);
		assert_eq!(value["apiVersion"], "apps/v1");
		assert_eq!(value["kind"], "Deployment");

		let mut value = json!({"apiVersion": "apps/v1beta2", "kind": "Deployment"});
		fill_type_meta(&mut value, &gvk);
		assert_eq!(value["apiVersion"], "apps/v1beta2");
	}

	#[test]
	fn test_general_kinds_cover_core_and_groups() {
		let kinds: Vec<_> = general_kinds().collect();
		assert_eq!(kinds.len(), GENERAL_KINDS.len());
		assert!(kinds.contains(&GroupVersionKind::gvk("", "v1", "ConfigMap")));
		assert!(kinds.contains(&GroupVersionKind::gvk("batch", "v1", "CronJob")));
	}
}
