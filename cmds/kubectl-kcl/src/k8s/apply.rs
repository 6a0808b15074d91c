//! Kubernetes resource apply engine.
//!
//! Applies a rendered YAML stream to the cluster using either client-side or
//! server-side apply, after narrowing it with the scoping options.

use std::collections::HashSet;

use kube::{
	api::{Api, DynamicObject, Patch, PatchParams},
	Client,
};
use thiserror::Error;
use tracing::instrument;

use super::{
	discovery::{kind_of, DiscoveryError, KindIndex, ServedKind},
	selector::{FieldSelector, LabelSelector, SelectorError},
	ResourceScope, ScopingOptions,
};
use crate::yaml::{self, YamlError};

/// Field manager recorded for server-side apply.
pub const FIELD_MANAGER: &str = "kubectl-kcl";

/// Annotation marking documents that are consumed locally and never applied.
pub const LOCAL_CONFIG_ANNOTATION: &str = "config.kubernetes.io/local-config";

#[derive(Debug, Error)]
pub enum ApplyError {
	#[error("manifest missing apiVersion or kind")]
	MissingApiVersionOrKind,

	#[error("{kind} manifest missing metadata.name")]
	MissingName { kind: String },

	#[error("unknown resource type: {api_version}/{kind}")]
	UnknownResourceType { api_version: String, kind: String },

	#[error(
		"the namespace from the provided object \"{object_namespace}\" does not match \
		 the namespace \"{namespace}\". You must pass '--namespace={object_namespace}' \
		 to perform this operation"
	)]
	NamespaceMismatch {
		namespace: String,
		object_namespace: String,
	},

	#[error("invalid label selector")]
	LabelSelector(#[source] SelectorError),

	#[error("invalid field selector")]
	FieldSelector(#[source] SelectorError),

	#[error("reading manifests")]
	Payload(#[source] std::io::Error),

	#[error(transparent)]
	Yaml(#[from] YamlError),

	#[error("resolving manifest kinds")]
	Discovery(#[source] Box<DiscoveryError>),

	#[error("applying {kind}/{name}")]
	ApplyFailed {
		kind: String,
		name: String,
		#[source]
		source: Box<kube::Error>,
	},

	#[error("converting manifest to DynamicObject")]
	ManifestConversion(#[source] serde_json::Error),
}

/// Parse `payload` and keep the manifests selected by `scoping`.
///
/// `List` documents are flattened, local-config documents are dropped, and
/// the label and field selectors are evaluated against each object.
pub fn select_manifests(
	payload: &[u8],
	scoping: &ScopingOptions,
) -> Result<Vec<serde_json::Value>, ApplyError> {
	let labels: LabelSelector = scoping
		.selector()
		.unwrap_or_default()
		.parse()
		.map_err(ApplyError::LabelSelector)?;
	let fields: FieldSelector = scoping
		.field_selector()
		.unwrap_or_default()
		.parse()
		.map_err(ApplyError::FieldSelector)?;

	let mut manifests = Vec::new();
	for document in yaml::parse_stream(payload)? {
		flatten_lists(document, &mut manifests);
	}

	let total = manifests.len();
	manifests.retain(|m| !is_local_config(m) && labels.matches_manifest(m) && fields.matches(m));
	tracing::debug!(total, selected = manifests.len(), "selected manifests");

	Ok(manifests)
}

fn flatten_lists(value: serde_json::Value, out: &mut Vec<serde_json::Value>) {
	match value {
		serde_json::Value::Object(mut map)
			if map.get("kind").and_then(|k| k.as_str()) == Some("List") =>
		{
			if let Some(serde_json::Value::Array(items)) = map.remove("items") {
				for item in items {
					flatten_lists(item, out);
				}
			}
		}
		serde_json::Value::Object(_) => out.push(value),
		_ => {}
	}
}

fn is_local_config(manifest: &serde_json::Value) -> bool {
	manifest
		.pointer("/metadata/annotations")
		.and_then(|a| a.get(LOCAL_CONFIG_ANNOTATION))
		.and_then(|v| v.as_str())
		== Some("true")
}

/// Engine for applying resources to a Kubernetes cluster.
pub struct ApplyEngine {
	client: Client,
	/// Namespace requested on the command line, if any.
	namespace: Option<String>,
	/// Namespace of the kubeconfig context.
	default_namespace: String,
	server_side: bool,
	force: bool,
}

impl ApplyEngine {
	pub fn new(
		client: Client,
		namespace: Option<String>,
		default_namespace: String,
		server_side: bool,
		force: bool,
	) -> Self {
		Self {
			client,
			namespace,
			default_namespace,
			server_side,
			force,
		}
	}

	/// Apply every manifest in order, stopping at the first failure.
	///
	/// Every manifest is resolved against discovery and the namespace rules
	/// before the first write, so a rejected object leaves the cluster
	/// untouched. Returns the number of applied objects.
	#[instrument(skip_all, fields(count = manifests.len(), server_side = self.server_side))]
	pub async fn apply_all(&self, manifests: &[serde_json::Value]) -> Result<usize, ApplyError> {
		if manifests.is_empty() {
			tracing::warn!("no manifests selected for apply");
			return Ok(0);
		}

		let required_keys: HashSet<_> = manifests
			.iter()
			.map(|m| kind_of(m).ok_or(ApplyError::MissingApiVersionOrKind))
			.collect::<Result<_, _>>()?;
		let index = KindIndex::discover(&self.client, required_keys)
			.await
			.map_err(|e| ApplyError::Discovery(Box::new(e)))?;

		let targets = manifests
			.iter()
			.map(|m| self.resolve(&index, m))
			.collect::<Result<Vec<_>, _>>()?;

		for target in &targets {
			self.apply_target(target).await?;
		}
		Ok(targets.len())
	}

	/// Resolve where `manifest` is written without contacting the cluster.
	fn resolve(
		&self,
		index: &KindIndex,
		manifest: &serde_json::Value,
	) -> Result<ApplyTarget, ApplyError> {
		let gvk = kind_of(manifest).ok_or(ApplyError::MissingApiVersionOrKind)?;

		let name = manifest
			.pointer("/metadata/name")
			.and_then(|v| v.as_str())
			.ok_or_else(|| ApplyError::MissingName {
				kind: gvk.kind.clone(),
			})?
			.to_string();

		let served = index
			.get(&gvk)
			.ok_or_else(|| ApplyError::UnknownResourceType {
				api_version: gvk.api_version(),
				kind: gvk.kind.clone(),
			})?;

		let namespace = self.resolve_namespace(manifest, served)?;
		let manifest = with_namespace(manifest, namespace.as_deref());
		let object: DynamicObject =
			serde_json::from_value(manifest.clone()).map_err(ApplyError::ManifestConversion)?;
		Ok(ApplyTarget {
			api: self.dynamic_api(served, namespace.as_deref()),
			manifest,
			object,
			kind: gvk.kind,
			name,
		})
	}

	#[instrument(skip_all, fields(kind = %target.kind, name = %target.name))]
	async fn apply_target(&self, target: &ApplyTarget) -> Result<(), ApplyError> {
		let ApplyTarget {
			api,
			manifest,
			object,
			kind,
			name,
		} = target;

		let apply_failed = |e: kube::Error| ApplyError::ApplyFailed {
			kind: kind.clone(),
			name: name.clone(),
			source: Box::new(e),
		};

		if self.server_side {
			let patch_params = PatchParams {
				field_manager: Some(FIELD_MANAGER.to_string()),
				force: self.force,
				..Default::default()
			};

			api.patch(name, &patch_params, &Patch::Apply(manifest))
				.await
				.map_err(apply_failed)?;
		} else {
			let patch_params = PatchParams {
				field_manager: Some(FIELD_MANAGER.to_string()),
				..Default::default()
			};

			// Strategic merge first, merge patch for CRDs, create when absent
			match api
				.patch(name, &patch_params, &Patch::Strategic(manifest))
				.await
			{
				Ok(_) => {}
				Err(kube::Error::Api(ref err)) if err.code == 415 => {
					api.patch(name, &patch_params, &Patch::Merge(manifest))
						.await
						.map_err(apply_failed)?;
				}
				Err(kube::Error::Api(ref err)) if err.code == 404 => {
					api.create(&Default::default(), object)
						.await
						.map_err(apply_failed)?;
				}
				Err(e) => return Err(apply_failed(e)),
			}
		}

		tracing::info!("{}/{} configured", kind.to_lowercase(), name);
		Ok(())
	}

	/// Namespace an object is applied in, `None` for cluster-wide kinds.
	fn resolve_namespace(
		&self,
		manifest: &serde_json::Value,
		served: &ServedKind,
	) -> Result<Option<String>, ApplyError> {
		if served.scope == ResourceScope::ClusterWide {
			return Ok(None);
		}

		let object_namespace = manifest
			.pointer("/metadata/namespace")
			.and_then(|v| v.as_str())
			.filter(|ns| !ns.is_empty());

		match (object_namespace, self.namespace.as_deref()) {
			(Some(object_ns), Some(ns)) if object_ns != ns => Err(ApplyError::NamespaceMismatch {
				namespace: ns.to_string(),
				object_namespace: object_ns.to_string(),
			}),
			(Some(object_ns), _) => Ok(Some(object_ns.to_string())),
			(None, Some(ns)) => Ok(Some(ns.to_string())),
			(None, None) => Ok(Some(self.default_namespace.clone())),
		}
	}

	fn dynamic_api(&self, served: &ServedKind, namespace: Option<&str>) -> Api<DynamicObject> {
		match namespace {
			Some(ns) => Api::namespaced_with(self.client.clone(), ns, &served.resource),
			None => Api::all_with(self.client.clone(), &served.resource),
		}
	}
}

/// A manifest with its endpoint and namespace resolved, ready to write.
struct ApplyTarget {
	api: Api<DynamicObject>,
	manifest: serde_json::Value,
	object: DynamicObject,
	kind: String,
	name: String,
}

/// Copy of `manifest` with `metadata.namespace` set and annotations present.
fn with_namespace(manifest: &serde_json::Value, namespace: Option<&str>) -> serde_json::Value {
	let mut manifest = manifest.clone();
	if let Some(serde_json::Value::Object(metadata)) = manifest.get_mut("metadata") {
		if let Some(ns) = namespace {
			metadata.insert("namespace".to_string(), ns.into());
		}
		metadata
			.entry("annotations")
			.or_insert(serde_json::json!({}));
	}
	manifest
}

#[cfg(test)]
mod tests {
	use assert_matches::assert_matches;
	use indoc::indoc;
	use serde_json::json;

	use super::*;

	const PAYLOAD: &str = indoc! {"
		apiVersion: v1
		kind: ConfigMap
		metadata:
		  name: web-config
		  labels:
		    app: web
		---
		apiVersion: v1
		kind: List
		items:
		- apiVersion: v1
		  kind: Service
		  metadata:
		    name: web
		    labels:
		      app: web
		- apiVersion: v1
		  kind: Service
		  metadata:
		    name: db
		    labels:
		      app: db
		---
		apiVersion: krm.kcl.dev/v1alpha1
		kind: KCLRun
		metadata:
		  name: set-annotation
		  annotations:
		    config.kubernetes.io/local-config: \"true\"
	"};

	fn names(manifests: &[serde_json::Value]) -> Vec<&str> {
		manifests
			.iter()
			.map(|m| m["metadata"]["name"].as_str().unwrap())
			.collect()
	}

	#[test]
	fn test_select_unconstrained_flattens_lists() {
		let manifests = select_manifests(PAYLOAD.as_bytes(), &ScopingOptions::default()).unwrap();
		assert_eq!(names(&manifests), vec!["web-config", "web", "db"]);
	}

	#[test]
	fn test_select_by_label() {
		let scoping = ScopingOptions::new("", "app=web", "");
		let manifests = select_manifests(PAYLOAD.as_bytes(), &scoping).unwrap();
		assert_eq!(names(&manifests), vec!["web-config", "web"]);
	}

	#[test]
	fn test_select_by_field() {
		let scoping = ScopingOptions::new("", "", "kind=Service,metadata.name!=web");
		let manifests = select_manifests(PAYLOAD.as_bytes(), &scoping).unwrap();
		assert_eq!(names(&manifests), vec!["db"]);
	}

	#[test]
	fn test_select_rejects_bad_selector() {
		let scoping = ScopingOptions::new("", "app in (web", "");
		assert_matches!(
			select_manifests(PAYLOAD.as_bytes(), &scoping),
			Err(ApplyError::LabelSelector(_))
		);
	}

	#[test]
	fn test_with_namespace_sets_namespace_and_annotations() {
		let manifest = json!({"kind": "ConfigMap", "metadata": {"name": "a"}});
		let result = with_namespace(&manifest, Some("prod"));
		assert_eq!(result["metadata"]["namespace"], "prod");
		assert_eq!(result["metadata"]["annotations"], json!({}));

		let result = with_namespace(&manifest, None);
		assert!(result["metadata"].get("namespace").is_none());
	}
}
