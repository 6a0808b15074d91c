//! Label and field selectors, matched locally against manifests.
//!
//! Label selectors accept the kubectl syntax: `k=v`, `k==v`, `k!=v`,
//! `k in (a,b)`, `k notin (a,b)`, `k` and `!k`, joined by commas.
//! Field selectors accept `path=v`, `path==v` and `path!=v`, where `path` is a
//! dotted path into the object (`metadata.name`, `spec.type`, ...).

use std::{
	collections::{BTreeMap, BTreeSet},
	fmt,
	str::FromStr,
	sync::OnceLock,
};

use regex::Regex;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SelectorError {
	#[error("invalid label key `{0}`")]
	InvalidKey(String),

	#[error("invalid label value `{value}` for key `{key}`")]
	InvalidValue { key: String, value: String },

	#[error("unbalanced parentheses in selector term `{0}`")]
	UnbalancedParens(String),

	#[error("empty value set in selector term `{0}`")]
	EmptyValueSet(String),

	#[error("unsupported operator in field selector term `{0}`, expected one of `=`, `==`, `!=`")]
	UnsupportedFieldOperator(String),

	#[error("empty field path in field selector term `{0}`")]
	EmptyFieldPath(String),
}

fn label_key_regex() -> &'static Regex {
	static KEY: OnceLock<Regex> = OnceLock::new();
	KEY.get_or_init(|| {
		Regex::new(
			r"^([a-z0-9]([-a-z0-9]*[a-z0-9])?(\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)*/)?[A-Za-z0-9]([-A-Za-z0-9_.]*[A-Za-z0-9])?$",
		)
		.expect("label key regex is valid")
	})
}

fn label_value_regex() -> &'static Regex {
	static VALUE: OnceLock<Regex> = OnceLock::new();
	VALUE.get_or_init(|| {
		Regex::new(r"^([A-Za-z0-9]([-A-Za-z0-9_.]*[A-Za-z0-9])?)?$")
			.expect("label value regex is valid")
	})
}

/// One clause of a label selector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Requirement {
	Equals { key: String, value: String },
	NotEquals { key: String, value: String },
	In { key: String, values: BTreeSet<String> },
	NotIn { key: String, values: BTreeSet<String> },
	Exists(String),
	DoesNotExist(String),
}

impl Requirement {
	fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
		match self {
			Requirement::Equals { key, value } => labels.get(key) == Some(value),
			// kubectl semantics: a missing key satisfies `!=`
			Requirement::NotEquals { key, value } => labels.get(key) != Some(value),
			Requirement::In { key, values } => labels.get(key).is_some_and(|v| values.contains(v)),
			Requirement::NotIn { key, values } => {
				!labels.get(key).is_some_and(|v| values.contains(v))
			}
			Requirement::Exists(key) => labels.contains_key(key),
			Requirement::DoesNotExist(key) => !labels.contains_key(key),
		}
	}
}

/// A parsed label selector; the empty selector matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelSelector {
	requirements: Vec<Requirement>,
}

impl LabelSelector {
	pub fn is_empty(&self) -> bool {
		self.requirements.is_empty()
	}

	pub fn requirements(&self) -> &[Requirement] {
		&self.requirements
	}

	pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
		self.requirements.iter().all(|r| r.matches(labels))
	}

	/// Match against the `metadata.labels` of a manifest.
	pub fn matches_manifest(&self, manifest: &serde_json::Value) -> bool {
		if self.is_empty() {
			return true;
		}
		let labels = manifest_labels(manifest);
		self.matches(&labels)
	}
}

impl FromStr for LabelSelector {
	type Err = SelectorError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let mut requirements = Vec::new();
		for term in split_terms(s)? {
			requirements.push(parse_requirement(term)?);
		}
		Ok(Self { requirements })
	}
}

impl fmt::Display for LabelSelector {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let mut first = true;
		for r in &self.requirements {
			if !first {
				f.write_str(",")?;
			}
			first = false;
			match r {
				Requirement::Equals { key, value } => write!(f, "{key}={value}")?,
				Requirement::NotEquals { key, value } => write!(f, "{key}!={value}")?,
				Requirement::In { key, values } => {
					write!(f, "{key} in ({})", join(values))?;
				}
				Requirement::NotIn { key, values } => {
					write!(f, "{key} notin ({})", join(values))?;
				}
				Requirement::Exists(key) => write!(f, "{key}")?,
				Requirement::DoesNotExist(key) => write!(f, "!{key}")?,
			}
		}
		Ok(())
	}
}

fn join(values: &BTreeSet<String>) -> String {
	values.iter().map(String::as_str).collect::<Vec<_>>().join(",")
}

fn manifest_labels(manifest: &serde_json::Value) -> BTreeMap<String, String> {
	manifest
		.pointer("/metadata/labels")
		.and_then(|v| v.as_object())
		.map(|labels| {
			labels
				.iter()
				.filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
				.collect()
		})
		.unwrap_or_default()
}

/// Split on commas that are not inside a parenthesized value set.
fn split_terms(s: &str) -> Result<Vec<&str>, SelectorError> {
	let mut terms = Vec::new();
	let mut depth = 0usize;
	let mut start = 0;

	for (i, c) in s.char_indices() {
		match c {
			'(' => depth += 1,
			')' => {
				depth = depth
					.checked_sub(1)
					.ok_or_else(|| SelectorError::UnbalancedParens(s.to_string()))?;
			}
			',' if depth == 0 => {
				terms.push(&s[start..i]);
				start = i + 1;
			}
			_ => {}
		}
	}
	if depth != 0 {
		return Err(SelectorError::UnbalancedParens(s.to_string()));
	}
	terms.push(&s[start..]);

	Ok(terms
		.into_iter()
		.map(str::trim)
		.filter(|t| !t.is_empty())
		.collect())
}

fn parse_requirement(term: &str) -> Result<Requirement, SelectorError> {
	if let Some(key) = term.strip_prefix('!') {
		return Ok(Requirement::DoesNotExist(validate_key(key.trim())?));
	}

	if let Some(open) = term.find('(') {
		let close = term
			.rfind(')')
			.filter(|&close| close > open && term[close + 1..].trim().is_empty())
			.ok_or_else(|| SelectorError::UnbalancedParens(term.to_string()))?;

		let head: Vec<&str> = term[..open].split_whitespace().collect();
		let [key, op] = head.as_slice() else {
			return Err(SelectorError::InvalidKey(term[..open].trim().to_string()));
		};
		let key = validate_key(key)?;

		let values = term[open + 1..close]
			.split(',')
			.map(str::trim)
			.filter(|v| !v.is_empty())
			.map(|v| validate_value(&key, v))
			.collect::<Result<BTreeSet<_>, _>>()?;
		if values.is_empty() {
			return Err(SelectorError::EmptyValueSet(term.to_string()));
		}

		return match *op {
			"in" => Ok(Requirement::In { key, values }),
			"notin" => Ok(Requirement::NotIn { key, values }),
			other => Err(SelectorError::InvalidKey(format!("{key} {other}"))),
		};
	}

	if let Some((key, value)) = term.split_once("!=") {
		let key = validate_key(key.trim())?;
		let value = validate_value(&key, value.trim())?;
		return Ok(Requirement::NotEquals { key, value });
	}

	let split = term
		.split_once("==")
		.or_else(|| term.split_once('='));
	if let Some((key, value)) = split {
		let key = validate_key(key.trim())?;
		let value = validate_value(&key, value.trim())?;
		return Ok(Requirement::Equals { key, value });
	}

	Ok(Requirement::Exists(validate_key(term)?))
}

fn validate_key(key: &str) -> Result<String, SelectorError> {
	if label_key_regex().is_match(key) {
		Ok(key.to_string())
	} else {
		Err(SelectorError::InvalidKey(key.to_string()))
	}
}

fn validate_value(key: &str, value: &str) -> Result<String, SelectorError> {
	if value.len() <= 63 && label_value_regex().is_match(value) {
		Ok(value.to_string())
	} else {
		Err(SelectorError::InvalidValue {
			key: key.to_string(),
			value: value.to_string(),
		})
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FieldOp {
	Equals,
	NotEquals,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct FieldTerm {
	path: Vec<String>,
	op: FieldOp,
	value: String,
}

/// A parsed field selector; the empty selector matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldSelector {
	terms: Vec<FieldTerm>,
}

impl FieldSelector {
	pub fn is_empty(&self) -> bool {
		self.terms.is_empty()
	}

	pub fn matches(&self, manifest: &serde_json::Value) -> bool {
		self.terms.iter().all(|term| {
			let actual = field_value(manifest, &term.path);
			match term.op {
				FieldOp::Equals => actual == term.value,
				FieldOp::NotEquals => actual != term.value,
			}
		})
	}
}

impl FromStr for FieldSelector {
	type Err = SelectorError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let mut terms = Vec::new();
		for term in s.split(',').map(str::trim).filter(|t| !t.is_empty()) {
			let (path, op, value) = if let Some((p, v)) = term.split_once("!=") {
				(p, FieldOp::NotEquals, v)
			} else if let Some((p, v)) = term.split_once("==") {
				(p, FieldOp::Equals, v)
			} else if let Some((p, v)) = term.split_once('=') {
				(p, FieldOp::Equals, v)
			} else {
				return Err(SelectorError::UnsupportedFieldOperator(term.to_string()));
			};

			let path = path.trim();
			if path.is_empty() {
				return Err(SelectorError::EmptyFieldPath(term.to_string()));
			}

			terms.push(FieldTerm {
				path: path.split('.').map(str::to_string).collect(),
				op,
				value: value.trim().to_string(),
			});
		}
		Ok(Self { terms })
	}
}

/// Resolve a dotted path to its string form; missing fields are empty.
fn field_value(manifest: &serde_json::Value, path: &[String]) -> String {
	let mut current = manifest;
	for segment in path {
		match current.get(segment) {
			Some(next) => current = next,
			None => return String::new(),
		}
	}
	match current {
		serde_json::Value::String(s) => s.clone(),
		serde_json::Value::Null => String::new(),
		other => other.to_string(),
	}
}
