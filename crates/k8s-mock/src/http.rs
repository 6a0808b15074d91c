//! HTTP-based mock Kubernetes server using wiremock.
//!
//! Serves discovery, list, get, create and patch for the resource types known
//! to [`MockDiscovery`], backed by an in-memory object store, so real
//! kubeconfig-based clients can run against it.

use std::{
	collections::HashMap,
	sync::{Arc, RwLock},
};

use bon::Builder;
use k8s_openapi::apimachinery::pkg::version::Info;
use kube::config::{
	AuthInfo, Cluster, Context, Kubeconfig, NamedAuthInfo, NamedCluster, NamedContext,
};
use serde_json::{json, Value};
use tracing::{debug, trace};
use wiremock::{
	matchers::{header_regex, method, path, path_regex},
	Mock, MockServer, Request, ResponseTemplate,
};

use super::{
	discovery::{DiscoveryMode, MockDiscovery},
	helpers::{
		matches_field_selector, matches_label_selector, merge_json,
		strip_strategic_merge_directives,
	},
};

/// Identity of a stored object.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectKey {
	pub api_version: String,
	pub plural: String,
	pub namespace: Option<String>,
	pub name: String,
}

/// Type alias for the shared mutable object store.
pub type SharedResources = Arc<RwLock<HashMap<ObjectKey, Value>>>;

/// A write request the server received.
#[derive(Debug, Clone)]
pub struct RecordedWrite {
	pub method: String,
	pub path: String,
	pub content_type: String,
	pub body: Value,
}

/// A mock Kubernetes server exposed over HTTP.
#[derive(Builder)]
pub struct HttpMockK8sServer {
	#[builder(default)]
	discovery_mode: DiscoveryMode,
	/// Objects present at startup. Their API paths are derived from
	/// apiVersion/kind using the discovery data.
	#[builder(default)]
	resources: Vec<Value>,
}

/// A running HTTP mock server instance.
pub struct RunningHttpMockK8sServer {
	server: MockServer,
	discovery: Arc<MockDiscovery>,
	resources: SharedResources,
}

impl HttpMockK8sServer {
	/// Start the mock server with all configured resources.
	pub async fn start(self) -> RunningHttpMockK8sServer {
		let server = MockServer::start().await;
		let discovery = Arc::new(MockDiscovery::default());

		debug!(uri = %server.uri(), "Started mock K8s server");

		let mut resources = HashMap::new();
		for manifest in self.resources {
			if let Some(key) = object_key(&manifest, &discovery) {
				trace!(?key, "Registered resource");
				resources.insert(key, manifest);
			}
		}

		let default_ns = json!({
			"apiVersion": "v1",
			"kind": "Namespace",
			"metadata": {"name": "default"}
		});
		if let Some(key) = object_key(&default_ns, &discovery) {
			resources.entry(key).or_insert(default_ns);
		}

		let shared_resources = Arc::new(RwLock::new(resources));

		mount_version(&server).await;
		mount_discovery(&server, &discovery, self.discovery_mode).await;
		mount_resources(&server, &discovery, &shared_resources).await;

		RunningHttpMockK8sServer {
			server,
			discovery,
			resources: shared_resources,
		}
	}
}

/// Derive the store key for a manifest using discovery data.
fn object_key(manifest: &Value, discovery: &MockDiscovery) -> Option<ObjectKey> {
	let api_version = manifest.get("apiVersion")?.as_str()?;
	let kind = manifest.get("kind")?.as_str()?;
	let name = manifest.pointer("/metadata/name")?.as_str()?;
	let resource = discovery.by_kind(api_version, kind)?;

	let namespace = resource.namespaced.then(|| {
		manifest
			.pointer("/metadata/namespace")
			.and_then(Value::as_str)
			.unwrap_or("default")
			.to_string()
	});

	Some(ObjectKey {
		api_version: api_version.to_string(),
		plural: resource.name.clone(),
		namespace,
		name: name.to_string(),
	})
}

/// A resource request path split into its parts.
#[derive(Debug, PartialEq, Eq)]
struct RequestPath {
	api_version: String,
	namespace: Option<String>,
	plural: String,
	name: Option<String>,
}

impl RequestPath {
	/// Parse `/api/v1/...` and `/apis/<group>/<version>/...` resource paths.
	///
	/// Examples:
	/// - `/api/v1/configmaps` lists configmaps in all namespaces
	/// - `/api/v1/namespaces/default/configmaps/app` is one configmap
	/// - `/api/v1/namespaces/default` is the `default` namespace itself
	fn parse(path: &str) -> Option<Self> {
		let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
		let (api_version, rest) = match segments.as_slice() {
			["api", version, rest @ ..] => ((*version).to_string(), rest),
			["apis", group, version, rest @ ..] => (format!("{group}/{version}"), rest),
			_ => return None,
		};

		let (namespace, plural, name) = match rest {
			[plural] => (None, *plural, None),
			[plural, name] => (None, *plural, Some(*name)),
			["namespaces", ns, plural] => (Some(*ns), *plural, None),
			["namespaces", ns, plural, name] => (Some(*ns), *plural, Some(*name)),
			_ => return None,
		};

		Some(Self {
			api_version,
			namespace: namespace.map(str::to_string),
			plural: plural.to_string(),
			name: name.map(str::to_string),
		})
	}

	fn key(&self, name: &str) -> ObjectKey {
		ObjectKey {
			api_version: self.api_version.clone(),
			plural: self.plural.clone(),
			namespace: self.namespace.clone(),
			name: name.to_string(),
		}
	}

	/// Whether `key` belongs to the collection this path lists.
	fn lists(&self, key: &ObjectKey) -> bool {
		key.api_version == self.api_version
			&& key.plural == self.plural
			&& (self.namespace.is_none() || key.namespace == self.namespace)
	}
}

impl RunningHttpMockK8sServer {
	/// Get the server's URI (e.g., "http://127.0.0.1:12345").
	pub fn uri(&self) -> String {
		self.server.uri()
	}

	/// Create a Kubeconfig pointing to this mock server.
	pub fn kubeconfig(&self) -> Kubeconfig {
		self.kubeconfig_with_context("mock-context")
	}

	/// Create a Kubeconfig pointing to this mock server with a custom context name.
	pub fn kubeconfig_with_context(&self, context_name: &str) -> Kubeconfig {
		let cluster_name = "mock-cluster";
		let user_name = "mock-user";

		Kubeconfig {
			clusters: vec![NamedCluster {
				name: cluster_name.to_string(),
				cluster: Some(Cluster {
					server: Some(self.uri()),
					insecure_skip_tls_verify: Some(true),
					..Default::default()
				}),
			}],
			contexts: vec![NamedContext {
				name: context_name.to_string(),
				context: Some(Context {
					cluster: cluster_name.to_string(),
					user: Some(user_name.to_string()),
					namespace: Some("default".to_string()),
					..Default::default()
				}),
			}],
			auth_infos: vec![NamedAuthInfo {
				name: user_name.to_string(),
				auth_info: Some(AuthInfo::default()),
			}],
			current_context: Some(context_name.to_string()),
			..Default::default()
		}
	}

	/// Current state of a stored object.
	pub fn object(
		&self,
		api_version: &str,
		kind: &str,
		namespace: Option<&str>,
		name: &str,
	) -> Option<Value> {
		let resource = self.discovery.by_kind(api_version, kind)?;
		let key = ObjectKey {
			api_version: api_version.to_string(),
			plural: resource.name.clone(),
			namespace: namespace.map(str::to_string),
			name: name.to_string(),
		};
		self.resources.read().ok()?.get(&key).cloned()
	}

	/// Number of stored objects of the given type.
	pub fn count(&self, api_version: &str, kind: &str) -> usize {
		let Some(resource) = self.discovery.by_kind(api_version, kind) else {
			return 0;
		};
		self.resources.read().map_or(0, |resources| {
			resources
				.keys()
				.filter(|k| k.api_version == api_version && k.plural == resource.name)
				.count()
		})
	}

	/// Every POST and PATCH request received so far, in arrival order.
	pub async fn writes(&self) -> Vec<RecordedWrite> {
		self.server
			.received_requests()
			.await
			.unwrap_or_default()
			.into_iter()
			.filter(|req| matches!(req.method.as_str(), "POST" | "PATCH"))
			.map(|req| RecordedWrite {
				method: req.method.to_string(),
				path: req.url.path().to_string(),
				content_type: content_type(&req).to_string(),
				body: serde_json::from_slice(&req.body).unwrap_or(Value::Null),
			})
			.collect()
	}
}

async fn mount_version(server: &MockServer) {
	let info = Info {
		major: "1".into(),
		minor: "31".into(),
		git_version: "v1.31.0".into(),
		git_commit: "fake".into(),
		git_tree_state: "clean".into(),
		build_date: "2024-01-01T00:00:00Z".into(),
		go_version: "go1.22.0".into(),
		compiler: "gc".into(),
		platform: "linux/amd64".into(),
		..Info::default()
	};
	Mock::given(method("GET"))
		.and(path("/version"))
		.respond_with(ResponseTemplate::new(200).set_body_json(&info))
		.mount(server)
		.await;
}

fn scope(namespaced: bool) -> &'static str {
	if namespaced {
		"Namespaced"
	} else {
		"Cluster"
	}
}

async fn mount_discovery(server: &MockServer, discovery: &MockDiscovery, mode: DiscoveryMode) {
	let core_aggregated_resources: Vec<_> = discovery
		.core_resources
		.iter()
		.map(|r| {
			json!({
				"resource": r.name,
				"responseKind": {"group": "", "version": "v1", "kind": r.kind},
				"scope": scope(r.namespaced),
				"verbs": r.verbs,
			})
		})
		.collect();

	let aggregated_core_body = json!({
		"kind": "APIGroupDiscoveryList",
		"apiVersion": "apidiscovery.k8s.io/v2",
		"items": [{
			"metadata": {"name": ""},
			"versions": [{
				"version": "v1",
				"resources": core_aggregated_resources,
				"freshness": "Current"
			}]
		}]
	});

	let aggregated_groups: Vec<_> = discovery
		.group_resources
		.iter()
		.map(|(gv, rs)| {
			let (group, version) = gv.split_once('/').unwrap_or(("", gv));
			let resources: Vec<_> = rs
				.iter()
				.map(|r| {
					json!({
						"resource": r.name,
						"responseKind": {"group": group, "version": version, "kind": r.kind},
						"scope": scope(r.namespaced),
						"verbs": r.verbs,
					})
				})
				.collect();

			json!({
				"metadata": {"name": group},
				"versions": [{
					"version": version,
					"resources": resources,
					"freshness": "Current"
				}]
			})
		})
		.collect();

	let aggregated_apis_body = json!({
		"kind": "APIGroupDiscoveryList",
		"apiVersion": "apidiscovery.k8s.io/v2",
		"items": aggregated_groups
	});

	// Clients only parse aggregated discovery when the Content-Type says so
	const AGGREGATED_DISCOVERY_CONTENT_TYPE: &str =
		"application/json;g=apidiscovery.k8s.io;v=v2;as=APIGroupDiscoveryList";

	for (discovery_path, body) in [("/api", aggregated_core_body), ("/apis", aggregated_apis_body)] {
		let response = match mode {
			// set_body_raw, since set_body_json overwrites Content-Type
			DiscoveryMode::Aggregated => ResponseTemplate::new(200)
				.set_body_raw(body.to_string().into_bytes(), AGGREGATED_DISCOVERY_CONTENT_TYPE),
			DiscoveryMode::Legacy => ResponseTemplate::new(406),
		};
		Mock::given(method("GET"))
			.and(path(discovery_path))
			.and(header_regex("accept", "apidiscovery"))
			.respond_with(response)
			.mount(server)
			.await;
	}

	// Legacy discovery endpoints
	Mock::given(method("GET"))
		.and(path("/api"))
		.respond_with(ResponseTemplate::new(200).set_body_json(json!({
			"kind": "APIVersions",
			"versions": ["v1"],
			"serverAddressByClientCIDRs": []
		})))
		.mount(server)
		.await;

	let groups: Vec<_> = discovery
		.group_resources
		.keys()
		.map(|gv| {
			let (group, version) = gv.split_once('/').unwrap_or(("", gv));
			json!({
				"name": group,
				"versions": [{"groupVersion": gv, "version": version}],
				"preferredVersion": {"groupVersion": gv, "version": version}
			})
		})
		.collect();

	Mock::given(method("GET"))
		.and(path("/apis"))
		.respond_with(ResponseTemplate::new(200).set_body_json(json!({
			"kind": "APIGroupList",
			"apiVersion": "v1",
			"groups": groups
		})))
		.mount(server)
		.await;

	let legacy_group_versions = std::iter::once(("v1", "/api/v1".to_string())).chain(
		discovery
			.group_resources
			.keys()
			.map(|gv| (gv.as_str(), format!("/apis/{gv}"))),
	);
	for (gv, discovery_path) in legacy_group_versions {
		let resources: Vec<_> = discovery
			.resources(gv)
			.iter()
			.map(|r| {
				json!({
					"name": r.name,
					"singularName": "",
					"namespaced": r.namespaced,
					"kind": r.kind,
					"verbs": r.verbs,
				})
			})
			.collect();

		Mock::given(method("GET"))
			.and(path(discovery_path))
			.respond_with(ResponseTemplate::new(200).set_body_json(json!({
				"kind": "APIResourceList",
				"apiVersion": "v1",
				"groupVersion": gv,
				"resources": resources
			})))
			.mount(server)
			.await;
	}
}

fn status(code: u16, reason: &str, message: &str) -> ResponseTemplate {
	ResponseTemplate::new(code).set_body_json(json!({
		"kind": "Status",
		"apiVersion": "v1",
		"metadata": {},
		"status": "Failure",
		"message": message,
		"reason": reason,
		"code": code
	}))
}

fn content_type(req: &Request) -> &str {
	req.headers
		.get("content-type")
		.and_then(|v| v.to_str().ok())
		.unwrap_or("")
}

fn query_param(req: &Request, name: &str) -> Option<String> {
	req.url
		.query_pairs()
		.find(|(k, _)| k == name)
		.map(|(_, v)| v.into_owned())
}

/// Resolve a request path against discovery, rejecting unknown types.
fn resolve(req: &Request, discovery: &MockDiscovery) -> Result<(RequestPath, String), ResponseTemplate> {
	let parsed = RequestPath::parse(req.url.path())
		.ok_or_else(|| status(404, "NotFound", "the server could not find the requested resource"))?;
	let resource = discovery
		.by_plural(&parsed.api_version, &parsed.plural)
		.ok_or_else(|| status(404, "NotFound", "the server could not find the requested resource"))?;
	Ok((parsed, resource.kind.clone()))
}

async fn mount_resources(
	server: &MockServer,
	discovery: &Arc<MockDiscovery>,
	resources: &SharedResources,
) {
	let (get_discovery, get_resources) = (Arc::clone(discovery), Arc::clone(resources));
	Mock::given(method("GET"))
		.and(path_regex(r"^/api(s)?/.*"))
		.respond_with(move |req: &Request| {
			let (target, kind) = match resolve(req, &get_discovery) {
				Ok(resolved) => resolved,
				Err(response) => return response,
			};
			let Ok(resources) = get_resources.read() else {
				return status(500, "InternalError", "store poisoned");
			};

			if let Some(name) = &target.name {
				return match resources.get(&target.key(name)) {
					Some(object) => ResponseTemplate::new(200).set_body_json(object),
					None => status(404, "NotFound", &format!("{} \"{name}\" not found", target.plural)),
				};
			}

			let labels = query_param(req, "labelSelector").unwrap_or_default();
			let fields = query_param(req, "fieldSelector").unwrap_or_default();
			let mut items: Vec<(&ObjectKey, &Value)> = resources
				.iter()
				.filter(|(key, object)| {
					target.lists(key)
						&& matches_label_selector(object, &labels)
						&& matches_field_selector(object, &fields)
				})
				.collect();
			items.sort_by(|a, b| (&a.0.namespace, &a.0.name).cmp(&(&b.0.namespace, &b.0.name)));

			ResponseTemplate::new(200).set_body_json(json!({
				"kind": format!("{kind}List"),
				"apiVersion": target.api_version,
				"metadata": {"resourceVersion": "1"},
				"items": items.into_iter().map(|(_, v)| v.clone()).collect::<Vec<_>>()
			}))
		})
		.mount(server)
		.await;

	// PATCH merges into the stored object; only apply patches may create
	let (patch_discovery, patch_resources) = (Arc::clone(discovery), Arc::clone(resources));
	Mock::given(method("PATCH"))
		.and(path_regex(r"^/api(s)?/.*"))
		.respond_with(move |req: &Request| {
			let (target, _) = match resolve(req, &patch_discovery) {
				Ok(resolved) => resolved,
				Err(response) => return response,
			};
			let Some(name) = &target.name else {
				return status(405, "MethodNotAllowed", "patch requires a name");
			};
			let key = target.key(name);
			let is_dry_run = query_param(req, "dryRun").is_some();
			let is_apply = content_type(req).starts_with("application/apply-patch");

			let Ok(patch) = serde_json::from_slice::<Value>(&req.body) else {
				return status(400, "BadRequest", "patch body is not JSON");
			};
			let Ok(mut resources) = patch_resources.write() else {
				return status(500, "InternalError", "store poisoned");
			};

			let merged = match resources.get(&key) {
				Some(existing) => merge_json(existing.clone(), patch),
				None if is_apply => patch,
				None => return status(404, "NotFound", &format!("{} \"{name}\" not found", target.plural)),
			};
			let result = strip_strategic_merge_directives(merged);

			if !is_dry_run {
				resources.insert(key, result.clone());
			}
			ResponseTemplate::new(200).set_body_json(result)
		})
		.mount(server)
		.await;

	let (post_discovery, post_resources) = (Arc::clone(discovery), Arc::clone(resources));
	Mock::given(method("POST"))
		.and(path_regex(r"^/api(s)?/.*"))
		.respond_with(move |req: &Request| {
			let (target, _) = match resolve(req, &post_discovery) {
				Ok(resolved) => resolved,
				Err(response) => return response,
			};
			let Ok(body) = serde_json::from_slice::<Value>(&req.body) else {
				return status(400, "BadRequest", "create body is not JSON");
			};
			let Some(name) = body.pointer("/metadata/name").and_then(Value::as_str) else {
				return status(422, "Invalid", "metadata.name: Required value");
			};
			let Ok(mut resources) = post_resources.write() else {
				return status(500, "InternalError", "store poisoned");
			};

			let key = target.key(name);
			if resources.contains_key(&key) {
				return status(409, "AlreadyExists", &format!("{} \"{name}\" already exists", target.plural));
			}
			if query_param(req, "dryRun").is_none() {
				resources.insert(key, body.clone());
			}
			ResponseTemplate::new(201).set_body_json(body)
		})
		.mount(server)
		.await;
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_parse_request_paths() {
		assert_eq!(
			RequestPath::parse("/api/v1/configmaps"),
			Some(RequestPath {
				api_version: "v1".into(),
				namespace: None,
				plural: "configmaps".into(),
				name: None,
			})
		);
		assert_eq!(
			RequestPath::parse("/apis/apps/v1/namespaces/prod/deployments/web"),
			Some(RequestPath {
				api_version: "apps/v1".into(),
				namespace: Some("prod".into()),
				plural: "deployments".into(),
				name: Some("web".into()),
			})
		);
		assert_eq!(
			RequestPath::parse("/api/v1/namespaces/default"),
			Some(RequestPath {
				api_version: "v1".into(),
				namespace: None,
				plural: "namespaces".into(),
				name: Some("default".into()),
			})
		);
		assert_eq!(RequestPath::parse("/version"), None);
	}

	#[test]
	fn test_object_key_defaults_namespace() {
		let discovery = MockDiscovery::default();
		let key = object_key(
			&json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "a"}}),
			&discovery,
		)
		.unwrap();
		assert_eq!(key.namespace.as_deref(), Some("default"));
		assert_eq!(key.plural, "configmaps");
	}
}
