//! Tests for the KRM function engine against small shell functions.
#![cfg(unix)]

use std::sync::Arc;

use assert_matches::assert_matches;
use indoc::indoc;
use kubectl_kcl::{
	k8s::{ClusterClient, ScopingOptions},
	orchestrate::{InputSource, OrchestrationError, Orchestrator},
	pipeline::{KrmFunctionEngine, PipelineEngine, PipelineError},
	yaml,
};
use serde_json::json;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const INPUT: &str = indoc! {"
	apiVersion: v1
	kind: ConfigMap
	metadata:
	  name: app-config
	data:
	  key: value
	---
	apiVersion: krm.kcl.dev/v1alpha1
	kind: KCLRun
	metadata:
	  name: noop
	spec:
	  source: '{items = option(\"items\")}'
"};

fn shell(script: &str) -> KrmFunctionEngine {
	KrmFunctionEngine::builder()
		.command("sh")
		.args(vec!["-c".to_string(), script.to_string()])
		.build()
}

async fn execute(engine: &KrmFunctionEngine, input: &str) -> Result<Vec<u8>, PipelineError> {
	let mut output = Vec::new();
	engine.execute(input.as_bytes(), &mut output).await?;
	Ok(output)
}

#[tokio::test]
async fn test_identity_function_returns_items() {
	// Echoing the request back is a valid no-op function
	let output = execute(&shell("cat"), INPUT).await.unwrap();

	let documents = yaml::parse_stream(&output).unwrap();
	assert_eq!(
		documents,
		vec![json!({
			"apiVersion": "v1",
			"kind": "ConfigMap",
			"metadata": {"name": "app-config"},
			"data": {"key": "value"}
		})]
	);
}

#[tokio::test]
async fn test_function_receives_resource_list() {
	let output = execute(
		&shell(r#"cat > /dev/null; printf 'apiVersion: config.kubernetes.io/v1\nkind: ResourceList\nitems:\n- apiVersion: v1\n  kind: Secret\n  metadata:\n    name: generated\n'"#),
		INPUT,
	)
	.await
	.unwrap();

	let documents = yaml::parse_stream(&output).unwrap();
	assert_eq!(documents.len(), 1);
	assert_eq!(documents[0]["kind"], "Secret");
	assert_eq!(documents[0]["metadata"]["name"], "generated");
}

#[tokio::test]
async fn test_nonzero_exit_is_reported_with_stderr() {
	let result = execute(&shell("cat > /dev/null; echo boom >&2; exit 3"), INPUT).await;

	assert_matches!(
		result,
		Err(PipelineError::FunctionFailed { status, stderr, .. })
			if status.code() == Some(3) && stderr == "boom"
	);
}

#[tokio::test]
async fn test_reported_errors_fail_the_pipeline() {
	let script = r#"cat > /dev/null; printf 'apiVersion: config.kubernetes.io/v1\nkind: ResourceList\nitems: []\nresults:\n- message: replicas must be positive\n  severity: error\n'"#;
	let result = execute(&shell(script), INPUT).await;

	assert_matches!(
		result,
		Err(PipelineError::FunctionReportedErrors(errors)) if errors == vec!["replicas must be positive"]
	);
}

#[tokio::test]
async fn test_missing_executable_is_spawn_error() {
	let engine = KrmFunctionEngine::builder()
		.command("kubectl-kcl-test-no-such-function")
		.build();

	assert_matches!(
		execute(&engine, INPUT).await,
		Err(PipelineError::Spawn { command, .. }) if command == "kubectl-kcl-test-no-such-function"
	);
}

#[tokio::test]
async fn test_input_without_function_config() {
	let input = "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: a\n";
	assert_matches!(
		execute(&shell("cat"), input).await,
		Err(PipelineError::MissingFunctionConfig)
	);
}

#[derive(Debug, thiserror::Error)]
#[error("unused")]
struct Never;

/// Serves one ConfigMap and keeps the applied payload.
#[derive(Default)]
struct RecordingClient {
	applied: std::sync::Mutex<Option<Vec<u8>>>,
}

impl ClusterClient for RecordingClient {
	type Error = Never;

	async fn get_general_resources<W>(&self, sink: &mut W) -> Result<(), Self::Error>
	where
		W: AsyncWrite + Unpin + Send,
	{
		sink.write_all(b"apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: app-config\n---\n")
			.await
			.map_err(|_| Never)
	}

	async fn apply<R>(&self, _scoping: &ScopingOptions, mut payload: R) -> Result<(), Self::Error>
	where
		R: AsyncRead + Unpin + Send,
	{
		let mut bytes = Vec::new();
		payload.read_to_end(&mut bytes).await.map_err(|_| Never)?;
		*self.applied.lock().unwrap() = Some(bytes);
		Ok(())
	}
}

#[tokio::test]
async fn test_orchestration_through_function_process() {
	let orchestrator = Orchestrator::builder()
		.client(RecordingClient::default())
		.engine(Arc::new(shell("cat")))
		.input(InputSource::Stdin)
		.build();

	let stdin: &[u8] = b"{\"apiVersion\": \"krm.kcl.dev/v1alpha1\", \"kind\": \"KCLRun\", \"metadata\": {\"name\": \"fn\"}}\n";
	orchestrator.run(stdin).await.unwrap();

	let applied = orchestrator.client().applied.lock().unwrap().clone().unwrap();
	let documents = yaml::parse_stream(&applied).unwrap();
	assert_eq!(documents.len(), 1);
	assert_eq!(documents[0]["kind"], "ConfigMap");
}

#[tokio::test]
async fn test_orchestration_surfaces_function_failure() {
	let orchestrator = Orchestrator::builder()
		.client(RecordingClient::default())
		.engine(Arc::new(shell("cat > /dev/null; exit 1")))
		.input(InputSource::Stdin)
		.build();

	let stdin: &[u8] = b"{\"apiVersion\": \"krm.kcl.dev/v1alpha1\", \"kind\": \"KCLRun\"}\n";
	let err = orchestrator.run(stdin).await.unwrap_err();

	assert_matches!(
		err,
		OrchestrationError::Pipeline(PipelineError::FunctionFailed { .. })
	);
	assert!(orchestrator.client().applied.lock().unwrap().is_none());
}
