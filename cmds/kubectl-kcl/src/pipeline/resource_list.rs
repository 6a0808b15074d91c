//! The KRM function `ResourceList` wire document.
//!
//! A function reads one `ResourceList` on stdin (`items` plus the
//! `functionConfig` that parameterizes it) and writes one back on stdout,
//! optionally reporting structured `results`.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use super::PipelineError;
use crate::yaml;

pub const RESOURCE_LIST_API_VERSION: &str = "config.kubernetes.io/v1";
pub const RESOURCE_LIST_KIND: &str = "ResourceList";

/// Kind and API group of the KCL function configuration.
pub const FUNCTION_CONFIG_KIND: &str = "KCLRun";
pub const FUNCTION_CONFIG_GROUP: &str = "krm.kcl.dev";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceList {
	pub api_version: String,
	pub kind: String,
	#[serde(default)]
	pub items: Vec<JsonValue>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub function_config: Option<JsonValue>,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub results: Vec<FunctionResult>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
	Error,
	Warning,
	Info,
}

/// One structured result reported by a function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionResult {
	#[serde(default)]
	pub message: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub severity: Option<Severity>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub resource_ref: Option<JsonValue>,
}

impl FunctionResult {
	fn describe(&self) -> String {
		let target = self.resource_ref.as_ref().and_then(|r| {
			let kind = r.get("kind")?.as_str()?;
			let name = r.get("name")?.as_str()?;
			Some(format!("{kind}/{name}"))
		});
		match target {
			Some(target) => format!("{target}: {}", self.message),
			None => self.message.clone(),
		}
	}
}

/// Whether `doc` is a KCL function configuration.
pub fn is_function_config(doc: &JsonValue) -> bool {
	let kind = doc.get("kind").and_then(|k| k.as_str());
	let group = doc
		.get("apiVersion")
		.and_then(|v| v.as_str())
		.and_then(|v| v.split_once('/'))
		.map(|(group, _)| group);
	kind == Some(FUNCTION_CONFIG_KIND) && group == Some(FUNCTION_CONFIG_GROUP)
}

impl ResourceList {
	pub fn new(items: Vec<JsonValue>, function_config: Option<JsonValue>) -> Self {
		Self {
			api_version: RESOURCE_LIST_API_VERSION.to_string(),
			kind: RESOURCE_LIST_KIND.to_string(),
			items,
			function_config,
			results: Vec::new(),
		}
	}

	/// Assemble a list from the documents of a plain resource stream.
	///
	/// The last function configuration wins; earlier ones, like every other
	/// document, become items. Embedded `ResourceList` documents contribute
	/// their items and function configuration.
	pub fn from_documents(documents: Vec<JsonValue>) -> Result<Self, PipelineError> {
		let mut items = Vec::new();
		let mut function_config: Option<JsonValue> = None;

		for doc in documents {
			if !doc.is_object() {
				continue;
			}
			if doc.get("kind").and_then(|k| k.as_str()) == Some(RESOURCE_LIST_KIND) {
				let list: ResourceList = serde_json::from_value(doc)
					.map_err(|e| PipelineError::InvalidOutput(e.to_string()))?;
				items.extend(list.items);
				if let Some(config) = list.function_config {
					items.extend(function_config.replace(config));
				}
			} else if is_function_config(&doc) {
				items.extend(function_config.replace(doc));
			} else {
				items.push(doc);
			}
		}

		let function_config = function_config.ok_or(PipelineError::MissingFunctionConfig)?;
		Ok(Self::new(items, Some(function_config)))
	}

	/// Parse the `ResourceList` a function wrote to stdout.
	pub fn from_function_output(bytes: &[u8]) -> Result<Self, PipelineError> {
		let mut documents = yaml::parse_stream(bytes)?.into_iter();
		let (Some(doc), None) = (documents.next(), documents.next()) else {
			return Err(PipelineError::InvalidOutput(
				"expected exactly one document".to_string(),
			));
		};

		let list: ResourceList = serde_json::from_value(doc)
			.map_err(|e| PipelineError::InvalidOutput(e.to_string()))?;
		if list.kind != RESOURCE_LIST_KIND {
			return Err(PipelineError::InvalidOutput(format!(
				"unexpected kind `{}`",
				list.kind
			)));
		}
		Ok(list)
	}

	pub fn to_yaml(&self) -> Result<String, PipelineError> {
		let value = serde_json::to_value(self)
			.map_err(|e| PipelineError::InvalidOutput(e.to_string()))?;
		Ok(yaml::to_yaml(&value)?)
	}

	/// Messages of all results with error severity.
	pub fn errors(&self) -> Vec<String> {
		self.results
			.iter()
			.filter(|r| r.severity == Some(Severity::Error))
			.map(FunctionResult::describe)
			.collect()
	}
}

#[cfg(test)]
mod tests {
	use assert_matches::assert_matches;
	use indoc::indoc;
	use serde_json::json;

	use super::*;

	fn kcl_run(name: &str) -> JsonValue {
		json!({
			"apiVersion": "krm.kcl.dev/v1alpha1",
			"kind": "KCLRun",
			"metadata": {"name": name},
			"spec": {"source": "{items = option(\"items\")}"}
		})
	}

	#[test]
	fn test_from_documents_splits_config() {
		let configmap = json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "a"}});
		let list = ResourceList::from_documents(vec![configmap.clone(), kcl_run("fn")]).unwrap();

		assert_eq!(list.api_version, RESOURCE_LIST_API_VERSION);
		assert_eq!(list.items, vec![configmap]);
		assert_eq!(list.function_config, Some(kcl_run("fn")));
	}

	#[test]
	fn test_last_function_config_wins() {
		let list = ResourceList::from_documents(vec![kcl_run("first"), kcl_run("second")]).unwrap();
		assert_eq!(list.items, vec![kcl_run("first")]);
		assert_eq!(list.function_config, Some(kcl_run("second")));
	}

	#[test]
	fn test_missing_function_config() {
		let docs = vec![json!({"apiVersion": "v1", "kind": "ConfigMap"})];
		assert_matches!(
			ResourceList::from_documents(docs),
			Err(PipelineError::MissingFunctionConfig)
		);
	}

	#[test]
	fn test_kclrun_from_other_group_is_an_item() {
		let doc = json!({"apiVersion": "example.com/v1", "kind": "KCLRun"});
		assert!(!is_function_config(&doc));
	}

	#[test]
	fn test_function_output_errors() {
		let output = indoc! {"
			apiVersion: config.kubernetes.io/v1
			kind: ResourceList
			items:
			- apiVersion: v1
			  kind: ConfigMap
			  metadata:
			    name: a
			results:
			- message: replicas must be positive
			  severity: error
			  resourceRef:
			    kind: Deployment
			    name: web
			- message: deprecated field
			  severity: warning
		"};

		let list = ResourceList::from_function_output(output.as_bytes()).unwrap();
		assert_eq!(list.items.len(), 1);
		assert_eq!(list.errors(), vec!["Deployment/web: replicas must be positive"]);
	}

	#[test]
	fn test_function_output_must_be_resource_list() {
		let output = "apiVersion: v1\nkind: ConfigMap\n";
		assert_matches!(
			ResourceList::from_function_output(output.as_bytes()),
			Err(PipelineError::InvalidOutput(_))
		);
	}
}
