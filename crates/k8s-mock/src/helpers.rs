//! Helper functions for mock Kubernetes testing.

use serde_json::Value;

/// Deep merge two JSON values (patch into base).
pub fn merge_json(base: Value, patch: Value) -> Value {
	match (base, patch) {
		(Value::Object(mut base_map), Value::Object(patch_map)) => {
			for (key, patch_value) in patch_map {
				let base_value = base_map.remove(&key).unwrap_or(Value::Null);
				base_map.insert(key, merge_json(base_value, patch_value));
			}
			Value::Object(base_map)
		}
		(_, patch) => patch,
	}
}

/// Strip strategic merge patch directives (keys starting with `$`).
pub fn strip_strategic_merge_directives(value: Value) -> Value {
	match value {
		Value::Object(map) => Value::Object(
			map.into_iter()
				.filter(|(key, _)| !key.starts_with('$'))
				.map(|(key, val)| (key, strip_strategic_merge_directives(val)))
				.collect(),
		),
		Value::Array(arr) => Value::Array(
			arr.into_iter()
				.map(strip_strategic_merge_directives)
				.collect(),
		),
		other => other,
	}
}

/// Evaluate an equality-based `labelSelector` query parameter.
///
/// Supports `k=v`, `k==v`, `k!=v`, `k` and `!k`, which is all the mock's
/// callers send.
pub fn matches_label_selector(object: &Value, selector: &str) -> bool {
	let label = |key: &str| {
		object
			.pointer("/metadata/labels")
			.and_then(|l| l.get(key))
			.and_then(Value::as_str)
	};

	selector
		.split(',')
		.map(str::trim)
		.filter(|t| !t.is_empty())
		.all(|term| {
			if let Some((key, value)) = term.split_once("!=") {
				label(key.trim()) != Some(value.trim())
			} else if let Some((key, value)) = term.split_once("==").or_else(|| term.split_once('=')) {
				label(key.trim()) == Some(value.trim())
			} else if let Some(key) = term.strip_prefix('!') {
				label(key.trim()).is_none()
			} else {
				label(term).is_some()
			}
		})
}

/// Evaluate a `fieldSelector` query parameter against dotted field paths.
pub fn matches_field_selector(object: &Value, selector: &str) -> bool {
	let field = |path: &str| {
		let pointer = format!("/{}", path.trim().replace('.', "/"));
		match object.pointer(&pointer) {
			Some(Value::String(s)) => s.clone(),
			Some(Value::Null) | None => String::new(),
			Some(other) => other.to_string(),
		}
	};

	selector
		.split(',')
		.map(str::trim)
		.filter(|t| !t.is_empty())
		.all(|term| {
			if let Some((path, value)) = term.split_once("!=") {
				field(path) != value.trim()
			} else if let Some((path, value)) = term.split_once("==").or_else(|| term.split_once('=')) {
				field(path) == value.trim()
			} else {
				false
			}
		})
}

#[cfg(test)]
mod tests {
	use serde_json::json;

	use super::*;

	#[test]
	fn test_label_selector() {
		let object = json!({"metadata": {"labels": {"app": "web", "tier": "front"}}});
		assert!(matches_label_selector(&object, "app=web"));
		assert!(matches_label_selector(&object, "app==web,tier"));
		assert!(matches_label_selector(&object, "app!=db,!team"));
		assert!(!matches_label_selector(&object, "app=db"));
	}

	#[test]
	fn test_field_selector() {
		let object = json!({"metadata": {"name": "web", "namespace": "prod"}});
		assert!(matches_field_selector(&object, "metadata.name=web"));
		assert!(matches_field_selector(&object, "metadata.namespace!=default"));
		assert!(!matches_field_selector(&object, "metadata.name=db"));
	}

	#[test]
	fn test_strip_directives() {
		let patched = json!({"$setElementOrder/ports": [], "spec": {"$patch": "merge", "a": 1}});
		assert_eq!(strip_strategic_merge_directives(patched), json!({"spec": {"a": 1}}));
	}
}
