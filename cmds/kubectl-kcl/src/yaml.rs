//! YAML stream helpers shared by the pipeline engine and the cluster client.

use serde_json::Value as JsonValue;
use thiserror::Error;

/// Separator written after every document of an emitted stream.
pub const DOCUMENT_SEPARATOR: &str = "---\n";

#[derive(Debug, Error)]
pub enum YamlError {
	#[error("parsing YAML stream: {0}")]
	Parse(String),

	#[error("YAML stream is not valid UTF-8")]
	Utf8(#[source] std::str::Utf8Error),

	#[error("serializing YAML document")]
	Serialize(#[source] serde_saphyr::ser_error::Error),
}

/// Parse a multi-document YAML stream.
///
/// Null documents (empty documents, stray separators) are dropped.
pub fn parse_stream(bytes: &[u8]) -> Result<Vec<JsonValue>, YamlError> {
	let content = std::str::from_utf8(bytes).map_err(YamlError::Utf8)?;
	let options = serde_saphyr::Options {
		legacy_octal_numbers: true,
		budget: None,
		..Default::default()
	};
	let documents: Vec<JsonValue> = serde_saphyr::from_multiple_with_options(content, options)
		.map_err(|e| YamlError::Parse(e.to_string()))?;
	Ok(documents.into_iter().filter(|d| !d.is_null()).collect())
}

/// Serialize a single value as a YAML document body.
pub fn to_yaml(value: &JsonValue) -> Result<String, YamlError> {
	let options = serde_saphyr::SerializerOptions {
		indent_step: 2,
		indent_array: Some(0),
		prefer_block_scalars: true,
		empty_map_as_braces: true,
		empty_array_as_brackets: true,
		quote_numeric_strings: true,
		..Default::default()
	};

	let mut output = String::new();
	serde_saphyr::to_fmt_writer_with_options(&mut output, value, options)
		.map_err(YamlError::Serialize)?;
	Ok(output)
}

/// Serialize values as a stream where every document is followed by `---`.
pub fn to_yaml_stream<'a>(
	values: impl IntoIterator<Item = &'a JsonValue>,
) -> Result<String, YamlError> {
	let mut output = String::new();
	for value in values {
		let doc = to_yaml(value)?;
		output.push_str(&doc);
		if !doc.ends_with('\n') {
			output.push('\n');
		}
		output.push_str(DOCUMENT_SEPARATOR);
	}
	Ok(output)
}

#[cfg(test)]
mod tests {
	use indoc::indoc;
	use serde_json::json;

	use super::*;

	#[test]
	fn test_parse_stream_skips_empty_documents() {
		let stream = indoc! {"
			apiVersion: v1
			kind: ConfigMap
			---
			---
			{\"apiVersion\": \"krm.kcl.dev/v1alpha1\", \"kind\": \"KCLRun\"}
		"};

		let docs = parse_stream(stream.as_bytes()).unwrap();
		assert_eq!(
			docs,
			vec![
				json!({"apiVersion": "v1", "kind": "ConfigMap"}),
				json!({"apiVersion": "krm.kcl.dev/v1alpha1", "kind": "KCLRun"}),
			]
		);
	}

	#[test]
	fn test_parse_empty_stream() {
		assert!(parse_stream(b"").unwrap().is_empty());
	}

	#[test]
	fn test_stream_is_reparsable() {
		let values = vec![
			json!({"apiVersion": "v1", "kind": "ConfigMap", "data": {"port": "8080"}}),
			json!({"apiVersion": "v1", "kind": "Secret", "metadata": {"name": "s"}}),
		];
		let stream = to_yaml_stream(&values).unwrap();
		assert!(stream.ends_with(DOCUMENT_SEPARATOR));
		assert_eq!(parse_stream(stream.as_bytes()).unwrap(), values);
	}
}
