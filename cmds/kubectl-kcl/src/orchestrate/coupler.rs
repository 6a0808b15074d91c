//! Coupling the pipeline engine to the caller through a bounded pipe.
//!
//! ```text
//!   ResourceStream ──▶ engine task ──▶ [duplex pipe] ──▶ caller drains ──▶ MaterializedBuffer
//!                      ├── owns the writer, dropping it is end-of-stream
//!                      └── returns its Result through the join handle
//! ```

use std::{io::Cursor, sync::Arc, time::Duration};

use tokio::{io::AsyncReadExt, task::JoinHandle};
use tracing::{instrument, instrument::WithSubscriber, Instrument};

use super::{MaterializedBuffer, OrchestrationError, ResourceStream};
use crate::pipeline::{PipelineEngine, PipelineError};

/// Pipe capacity; a full pipe blocks the engine until the caller reads.
pub const PIPE_CAPACITY: usize = 64 * 1024;

/// Aborts the engine task when dropped, so an abandoned coupling never
/// leaves the engine running.
struct ProducerGuard(JoinHandle<Result<(), PipelineError>>);

impl Drop for ProducerGuard {
	fn drop(&mut self) {
		self.0.abort();
	}
}

/// Run `engine` over `input` on a background task and collect its output.
///
/// Returns only after the engine closed its end of the pipe, the output
/// was drained and the engine task finished. An engine failure is returned
/// instead of the partial output. The `deadline` covers draining and the
/// engine's completion; without one, an engine that never finishes keeps
/// this future pending.
#[instrument(skip_all, fields(input_bytes = input.len()))]
pub async fn couple<E: PipelineEngine>(
	input: ResourceStream,
	engine: Arc<E>,
	deadline: Option<Duration>,
) -> Result<MaterializedBuffer, OrchestrationError> {
	let (writer, mut reader) = tokio::io::duplex(PIPE_CAPACITY);

	// The writer moves into the task, so every exit path closes it
	let mut producer = ProducerGuard(tokio::spawn(
		async move { engine.execute(Cursor::new(input.into_inner()), writer).await }
			.in_current_span()
			.with_current_subscriber(),
	));

	let collect = async {
		let mut output = Vec::new();
		if let Err(e) = reader.read_to_end(&mut output).await {
			tracing::error!(error = %e, "draining pipeline output failed");
			return Err(OrchestrationError::Drain(e));
		}

		match (&mut producer.0).await {
			Ok(Ok(())) => {
				tracing::debug!(output_bytes = output.len(), "pipeline finished");
				Ok(MaterializedBuffer::from(output))
			}
			Ok(Err(e)) => {
				tracing::error!(error = %e, discarded_bytes = output.len(), "pipeline execution failed");
				Err(OrchestrationError::Pipeline(e))
			}
			Err(e) => {
				tracing::error!(error = %e, "pipeline task did not complete");
				Err(OrchestrationError::PipelineTask(e))
			}
		}
	};

	// Early returns drop the guard, which aborts the engine task
	match deadline {
		Some(deadline) => tokio::time::timeout(deadline, collect)
			.await
			.unwrap_or_else(|_| {
				tracing::error!(?deadline, "pipeline did not finish in time");
				Err(OrchestrationError::PipelineTimeout(deadline))
			}),
		None => collect.await,
	}
}

#[cfg(test)]
mod tests {
	use std::{
		future::pending,
		sync::atomic::{AtomicBool, Ordering},
	};

	use assert_matches::assert_matches;
	use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

	use super::*;

	/// Writes a fixed payload in small chunks, ignoring its input.
	struct ChunkedEngine(Vec<u8>);

	impl PipelineEngine for ChunkedEngine {
		async fn execute<R, W>(&self, _input: R, mut output: W) -> Result<(), PipelineError>
		where
			R: AsyncRead + Unpin + Send,
			W: AsyncWrite + Unpin + Send,
		{
			for chunk in self.0.chunks(7) {
				output.write_all(chunk).await?;
			}
			Ok(())
		}
	}

	struct PanickingEngine;

	impl PipelineEngine for PanickingEngine {
		async fn execute<R, W>(&self, _input: R, _output: W) -> Result<(), PipelineError>
		where
			R: AsyncRead + Unpin + Send,
			W: AsyncWrite + Unpin + Send,
		{
			panic!("engine bug")
		}
	}

	struct StalledEngine;

	impl PipelineEngine for StalledEngine {
		async fn execute<R, W>(&self, _input: R, mut output: W) -> Result<(), PipelineError>
		where
			R: AsyncRead + Unpin + Send,
			W: AsyncWrite + Unpin + Send,
		{
			output.write_all(b"partial").await?;
			pending::<()>().await;
			Ok(())
		}
	}

	/// Closes its output, then never returns.
	struct LingeringEngine;

	impl PipelineEngine for LingeringEngine {
		async fn execute<R, W>(&self, _input: R, mut output: W) -> Result<(), PipelineError>
		where
			R: AsyncRead + Unpin + Send,
			W: AsyncWrite + Unpin + Send,
		{
			output.write_all(b"kind: ConfigMap\n").await?;
			drop(output);
			pending::<()>().await;
			Ok(())
		}
	}

	/// Flags its own cancellation once it starts running.
	struct CancellableEngine(Arc<AtomicBool>);

	impl PipelineEngine for CancellableEngine {
		async fn execute<R, W>(&self, _input: R, _output: W) -> Result<(), PipelineError>
		where
			R: AsyncRead + Unpin + Send,
			W: AsyncWrite + Unpin + Send,
		{
			let _dropped = DropFlag(self.0.clone());
			pending::<()>().await;
			Ok(())
		}
	}

	struct DropFlag(Arc<AtomicBool>);

	impl Drop for DropFlag {
		fn drop(&mut self) {
			self.0.store(true, Ordering::SeqCst);
		}
	}

	#[tokio::test]
	async fn test_output_larger_than_pipe_is_complete() {
		// Several pipe capacities worth, so the engine must block on the reader
		let payload: Vec<u8> = (0..PIPE_CAPACITY * 3 + 11).map(|i| (i % 251) as u8).collect();

		let buffer = couple(
			ResourceStream::from(Vec::new()),
			Arc::new(ChunkedEngine(payload.clone())),
			None,
		)
		.await
		.unwrap();

		assert_eq!(buffer.as_bytes(), payload.as_slice());
	}

	#[tokio::test]
	async fn test_engine_panic_is_reported() {
		let result = couple(
			ResourceStream::from(b"kind: KCLRun\n".to_vec()),
			Arc::new(PanickingEngine),
			None,
		)
		.await;

		assert_matches!(result, Err(OrchestrationError::PipelineTask(e)) if e.is_panic());
	}

	#[tokio::test]
	async fn test_deadline_aborts_stalled_engine() {
		let result = couple(
			ResourceStream::from(Vec::new()),
			Arc::new(StalledEngine),
			Some(Duration::from_millis(50)),
		)
		.await;

		assert_matches!(result, Err(OrchestrationError::PipelineTimeout(_)));
	}

	#[tokio::test]
	async fn test_deadline_covers_engine_after_output_closed() {
		let result = couple(
			ResourceStream::from(Vec::new()),
			Arc::new(LingeringEngine),
			Some(Duration::from_millis(50)),
		)
		.await;

		assert_matches!(result, Err(OrchestrationError::PipelineTimeout(_)));
	}

	#[tokio::test]
	async fn test_dropping_coupling_aborts_engine() {
		let dropped = Arc::new(AtomicBool::new(false));
		let coupling = couple(
			ResourceStream::from(Vec::new()),
			Arc::new(CancellableEngine(dropped.clone())),
			None,
		);

		// Cancelled from outside, as an enclosing select or timeout would
		let outer = tokio::time::timeout(Duration::from_millis(50), coupling).await;
		assert!(outer.is_err());

		for _ in 0..100 {
			if dropped.load(Ordering::SeqCst) {
				break;
			}
			tokio::time::sleep(Duration::from_millis(10)).await;
		}
		assert!(dropped.load(Ordering::SeqCst));
	}
}
