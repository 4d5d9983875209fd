//! Serial execution of work against the synthesis engine
//!
//! The model is not reentrant. Every call into the engine goes through one
//! worker task that runs jobs strictly in submission order, one at a time.

use crate::engine::{EngineState, SynthesisEngine};
use crate::error::{SpeechError, SpeechResult};
use futures_util::future::{BoxFuture, FutureExt};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

type Job = Box<dyn FnOnce(Arc<SynthesisEngine>) -> BoxFuture<'static, ()> + Send>;

/// FIFO queue owning the engine
pub struct SynthesisQueue {
    sender: mpsc::UnboundedSender<Job>,
    engine: Arc<SynthesisEngine>,
}

impl SynthesisQueue {
    /// Take ownership of `engine` and start the worker. Must be called inside
    /// a tokio runtime.
    pub fn new(engine: SynthesisEngine) -> Self {
        let engine = Arc::new(engine);
        let (sender, mut receiver) = mpsc::unbounded_channel::<Job>();

        let worker_engine = Arc::clone(&engine);
        tokio::spawn(async move {
            while let Some(job) = receiver.recv().await {
                let run = job(Arc::clone(&worker_engine));
                if AssertUnwindSafe(run).catch_unwind().await.is_err() {
                    error!("Synthesis job panicked; continuing with next job");
                }
            }
            debug!("Synthesis queue closed");
        });

        Self { sender, engine }
    }

    /// Append `op` to the queue.
    ///
    /// The job is queued immediately, before the returned future is polled.
    /// Dropping the future does not cancel the job.
    pub fn enqueue<F, Fut, T>(&self, op: F) -> impl Future<Output = SpeechResult<T>> + Send + 'static
    where
        F: FnOnce(Arc<SynthesisEngine>) -> Fut + Send + 'static,
        Fut: Future<Output = SpeechResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        let (reply, result) = oneshot::channel();
        let job: Job = Box::new(move |engine| {
            async move {
                let outcome = op(engine).await;
                if let Err(ref e) = outcome {
                    warn!("Queued synthesis job failed: {}", e);
                }
                let _ = reply.send(outcome);
            }
            .boxed()
        });
        let queued = self.sender.send(job).is_ok();

        async move {
            if !queued {
                return Err(SpeechError::QueueClosed);
            }
            // A dropped reply means the job panicked or the worker stopped.
            result
                .await
                .map_err(|_| SpeechError::Synthesis("Synthesis job did not complete".to_string()))?
        }
    }

    /// Lifecycle state of the owned engine
    pub fn engine_state(&self) -> EngineState {
        self.engine.state()
    }

    pub fn engine_backend(&self) -> Option<crate::backend::ExecutionProfile> {
        self.engine.backend()
    }
}
