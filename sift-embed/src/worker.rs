//! Runs an embedding backend on a dedicated worker thread.
//!
//! The host sends typed tasks over a bounded channel and waits on a per-task
//! reply. The task timeout starts when the worker dequeues the task, so time
//! spent queued behind a busy worker is latency, not failure. A worker that
//! panics, exits or misses the task timeout is replaced by a fresh one built
//! from the same [`BackendBuilder`], re-initialized if the pool was
//! initialized, and the task is re-submitted. After
//! `max_retries` re-submissions the caller gets
//! [`EmbedError::WorkerUnavailable`].

use crate::backend::EmbedderFactory;
use crate::config::{QueueFullPolicy, WorkerPoolConfig};
use crate::downloader::ProgressSender;
use crate::error::{EmbedError, Result};
use crate::provider::{EmbeddingProvider, EmbeddingResult};
use crate::status::{EmbedderStatus, StatusCell};
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use tokio::sync::{Mutex, oneshot, watch};

pub type TaskId = u64;

/// Work the host can ask of the worker.
#[derive(Debug, Clone)]
pub enum WorkerTaskKind {
    Initialize { progress: Option<ProgressSender> },
    Embed { text: String },
    EmbedBatch { texts: Vec<String> },
    Dispose,
}

/// Successful answer to a [`WorkerTaskKind`], variant for variant.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerOutput {
    Initialized { dimension: usize, backend_id: String },
    Embedding(Vec<f32>),
    Embeddings(EmbeddingResult),
    Disposed,
}

/// The reply to one task, correlated by id.
#[derive(Debug)]
pub struct WorkerResult {
    pub task_id: TaskId,
    pub outcome: Result<WorkerOutput>,
}

struct WorkerTask {
    task_id: TaskId,
    kind: WorkerTaskKind,
    /// Fired when the worker dequeues the task.
    started: oneshot::Sender<()>,
    reply: oneshot::Sender<WorkerResult>,
}

/// Creates a fresh backend for each worker generation.
pub type BackendBuilder = Arc<dyn Fn() -> Result<Box<dyn EmbeddingProvider>> + Send + Sync>;

struct WorkerHandle {
    generation: u64,
    sender: flume::Sender<WorkerTask>,
}

/// Decrements the outstanding count when a submitted task settles.
struct Slot(Arc<AtomicUsize>);

impl Drop for Slot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Why a dispatch produced no backend answer.
enum Failure {
    /// The worker panicked, exited or missed the timeout.
    Crashed(String),
    /// The worker was replaced while the task still sat in its queue.
    Superseded,
}

/// Failure of the worker itself, as opposed to an error the backend returned.
type Dispatch = std::result::Result<Result<WorkerOutput>, Failure>;

pub struct WorkerPool {
    config: WorkerPoolConfig,
    builder: BackendBuilder,
    worker: Mutex<WorkerHandle>,
    /// Generation of the live worker, for tasks still waiting in an old queue.
    generation: watch::Sender<u64>,
    next_task_id: AtomicU64,
    outstanding: Arc<AtomicUsize>,
    restarts: AtomicU64,
    initialized: AtomicBool,
    dimension: usize,
    backend_id: String,
    status: StatusCell,
}

impl WorkerPool {
    /// Build the first backend and start its worker. The backend is not initialized.
    pub fn new(config: WorkerPoolConfig, builder: BackendBuilder) -> Result<Self> {
        if config.queue_capacity == 0 {
            return Err(EmbedError::invalid_config(
                "worker.queue_capacity must be at least 1",
            ));
        }
        let backend = builder()?;
        let dimension = backend.embedding_dimension();
        let backend_id = backend.provider_name().to_string();
        let sender = spawn_worker(0, backend, config.queue_capacity)?;

        Ok(Self {
            status: StatusCell::new(format!("worker pool ({backend_id})")),
            config,
            builder,
            worker: Mutex::new(WorkerHandle {
                generation: 0,
                sender,
            }),
            generation: watch::Sender::new(0),
            next_task_id: AtomicU64::new(1),
            outstanding: Arc::new(AtomicUsize::new(0)),
            restarts: AtomicU64::new(0),
            initialized: AtomicBool::new(false),
            dimension,
            backend_id,
        })
    }

    /// A pool around whichever backend `factory` selects.
    pub fn from_factory(factory: EmbedderFactory) -> Result<Self> {
        let kind = factory.select()?.kind();
        let config = factory.config().worker.clone();
        let builder: BackendBuilder = Arc::new(move || {
            factory
                .build(kind)
                .map(|embedder| Box::new(embedder) as Box<dyn EmbeddingProvider>)
        });
        Self::new(config, builder)
    }

    /// Tasks submitted and not yet settled.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }

    /// Workers replaced after a crash or timeout.
    pub fn restarts(&self) -> u64 {
        self.restarts.load(Ordering::SeqCst)
    }

    fn acquire_slot(&self) -> Result<Slot> {
        match self.config.queue_full_policy {
            QueueFullPolicy::Wait => {
                self.outstanding.fetch_add(1, Ordering::SeqCst);
            }
            QueueFullPolicy::Reject => {
                let capacity = self.config.queue_capacity;
                self.outstanding
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                        (n < capacity).then_some(n + 1)
                    })
                    .map_err(|_| EmbedError::QueueFull { capacity })?;
            }
        }
        Ok(Slot(Arc::clone(&self.outstanding)))
    }

    async fn current(&self) -> (u64, flume::Sender<WorkerTask>) {
        let worker = self.worker.lock().await;
        (worker.generation, worker.sender.clone())
    }

    /// Queue `kind` on the worker of `generation` and wait for its answer.
    ///
    /// Queueing is unbounded in time; the task timeout covers only the
    /// execution that follows the worker's `started` signal.
    async fn dispatch(
        &self,
        generation: u64,
        sender: &flume::Sender<WorkerTask>,
        kind: WorkerTaskKind,
    ) -> Dispatch {
        let task_id = self.next_task_id.fetch_add(1, Ordering::SeqCst);
        let timeout = self.config.task_timeout();
        let (reply, answer) = oneshot::channel();
        let (started, dequeued) = oneshot::channel();
        let mut live = self.generation.subscribe();

        let queued = async {
            sender
                .send_async(WorkerTask {
                    task_id,
                    kind,
                    started,
                    reply,
                })
                .await
                .map_err(|_| format!("worker channel closed before task {task_id}"))?;
            dequeued
                .await
                .map_err(|_| format!("worker exited before starting task {task_id}"))
        };

        tokio::select! {
            queued = queued => queued.map_err(Failure::Crashed)?,
            _ = live.wait_for(|current| *current != generation) => {
                return Err(Failure::Superseded);
            }
        }

        match tokio::time::timeout(timeout, answer).await {
            Err(_) => Err(Failure::Crashed(format!(
                "task {task_id} timed out after {timeout:?}"
            ))),
            Ok(Err(_)) => Err(Failure::Crashed(format!(
                "worker exited before answering task {task_id}"
            ))),
            Ok(Ok(result)) if result.task_id != task_id => Err(Failure::Crashed(format!(
                "reply for task {} while waiting for task {task_id}",
                result.task_id
            ))),
            Ok(Ok(result)) => Ok(result.outcome),
        }
    }

    /// Replace the worker of `failed_generation`, unless another caller already did.
    async fn restart(&self, failed_generation: u64, reason: &str) -> Result<()> {
        let mut worker = self.worker.lock().await;
        if worker.generation != failed_generation {
            return Ok(());
        }

        tracing::warn!(
            "Restarting embedding worker {} for {}: {}",
            failed_generation,
            self.backend_id,
            reason
        );
        self.status
            .set(EmbedderStatus::Degraded(format!("worker restarting: {reason}")));

        let generation = failed_generation + 1;
        let backend = (self.builder)()?;
        let sender = spawn_worker(generation, backend, self.config.queue_capacity)?;
        *worker = WorkerHandle {
            generation,
            sender: sender.clone(),
        };
        self.generation.send_replace(generation);
        self.restarts.fetch_add(1, Ordering::SeqCst);

        if self.initialized.load(Ordering::SeqCst) {
            match self
                .dispatch(generation, &sender, WorkerTaskKind::Initialize { progress: None })
                .await
            {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => return Err(e),
                Err(Failure::Superseded) => {}
                Err(Failure::Crashed(reason)) => {
                    return Err(EmbedError::WorkerUnavailable {
                        attempts: 1,
                        reason,
                    });
                }
            }
        }
        Ok(())
    }

    /// Run one task, restarting the worker and re-submitting on worker failure.
    pub async fn submit(&self, kind: WorkerTaskKind) -> Result<WorkerOutput> {
        let _slot = self.acquire_slot()?;
        let attempts = self.config.max_retries + 1;
        let mut attempt = 1;
        let mut last_reason: String;

        loop {
            let (generation, sender) = self.current().await;
            match self.dispatch(generation, &sender, kind.clone()).await {
                Ok(outcome) => {
                    if attempt > 1 && self.initialized.load(Ordering::SeqCst) {
                        self.status.set(EmbedderStatus::Ready);
                    }
                    return outcome;
                }
                Err(Failure::Superseded) => {
                    tracing::debug!(
                        "Embedding worker {} was replaced before it started the task; re-queueing",
                        generation
                    );
                }
                Err(Failure::Crashed(reason)) => {
                    tracing::warn!(
                        "Embedding worker {} failed (attempt {}/{}): {}",
                        generation,
                        attempt,
                        attempts,
                        reason
                    );
                    last_reason = reason;
                    if attempt == attempts {
                        break;
                    }
                    attempt += 1;
                    if let Err(e) = self.restart(generation, &last_reason).await {
                        tracing::warn!("Embedding worker restart failed: {}", e);
                    }
                }
            }
        }

        self.status.set(EmbedderStatus::Error(last_reason.clone()));
        Err(EmbedError::WorkerUnavailable {
            attempts,
            reason: last_reason,
        })
    }

    fn ensure_initialized(&self) -> Result<()> {
        if self.initialized.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(EmbedError::not_initialized(&self.backend_id))
        }
    }

    /// Start a fresh worker if the last one exited after a dispose.
    async fn revive(&self) -> Result<()> {
        let mut worker = self.worker.lock().await;
        if worker.sender.is_disconnected() {
            let generation = worker.generation + 1;
            let backend = (self.builder)()?;
            worker.sender = spawn_worker(generation, backend, self.config.queue_capacity)?;
            worker.generation = generation;
            self.generation.send_replace(generation);
        }
        Ok(())
    }
}

fn unexpected(output: WorkerOutput) -> EmbedError {
    EmbedError::External {
        source: anyhow::anyhow!("unexpected worker output: {output:?}"),
    }
}

#[async_trait]
impl EmbeddingProvider for WorkerPool {
    async fn initialize_with_progress(&self, progress: Option<ProgressSender>) -> Result<()> {
        if self.initialized.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.revive().await?;
        self.status.set(EmbedderStatus::Initializing);

        match self.submit(WorkerTaskKind::Initialize { progress }).await {
            Ok(WorkerOutput::Initialized { dimension, .. }) if dimension != self.dimension => {
                let err = EmbedError::DimensionMismatch {
                    expected: self.dimension,
                    actual: dimension,
                };
                self.status.set(EmbedderStatus::Error(err.to_string()));
                Err(err)
            }
            Ok(WorkerOutput::Initialized { .. }) => {
                self.initialized.store(true, Ordering::SeqCst);
                self.status.set(EmbedderStatus::Ready);
                Ok(())
            }
            Ok(other) => Err(unexpected(other)),
            Err(e) => {
                self.status.set(EmbedderStatus::Error(e.to_string()));
                Err(e)
            }
        }
    }

    async fn embed_text(&self, text: &str) -> Result<Vec<f32>> {
        self.ensure_initialized()?;
        match self
            .submit(WorkerTaskKind::Embed {
                text: text.to_string(),
            })
            .await?
        {
            WorkerOutput::Embedding(embedding) => Ok(embedding),
            other => Err(unexpected(other)),
        }
    }

    async fn embed_texts(&self, texts: &[String]) -> Result<EmbeddingResult> {
        self.ensure_initialized()?;
        if texts.is_empty() {
            return Ok(EmbeddingResult::new(vec![]));
        }
        match self
            .submit(WorkerTaskKind::EmbedBatch {
                texts: texts.to_vec(),
            })
            .await?
        {
            WorkerOutput::Embeddings(result) => Ok(result),
            other => Err(unexpected(other)),
        }
    }

    async fn dispose(&self) -> Result<()> {
        if !self.initialized.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let outcome = self.submit(WorkerTaskKind::Dispose).await;
        // The worker exits after a dispose; close its channel now so `revive`
        // never races the thread's shutdown.
        let (closed, _) = flume::bounded(1);
        self.worker.lock().await.sender = closed;
        self.status.set(EmbedderStatus::Uninitialized);
        outcome.map(|_| ())
    }

    fn embedding_dimension(&self) -> usize {
        self.dimension
    }

    fn provider_name(&self) -> &str {
        &self.backend_id
    }

    fn status(&self) -> EmbedderStatus {
        self.status.get()
    }
}

fn spawn_worker(
    generation: u64,
    backend: Box<dyn EmbeddingProvider>,
    capacity: usize,
) -> Result<flume::Sender<WorkerTask>> {
    let (sender, receiver) = flume::bounded::<WorkerTask>(capacity);
    std::thread::Builder::new()
        .name(format!("sift-embed-worker-{generation}"))
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(e) => {
                    tracing::error!("Embedding worker {} has no runtime: {}", generation, e);
                    return;
                }
            };
            runtime.block_on(worker_loop(generation, backend, receiver));
        })?;
    Ok(sender)
}

async fn worker_loop(
    generation: u64,
    backend: Box<dyn EmbeddingProvider>,
    receiver: flume::Receiver<WorkerTask>,
) {
    tracing::debug!("Embedding worker {} started", generation);
    while let Ok(WorkerTask {
        task_id,
        kind,
        started,
        reply,
    }) = receiver.recv_async().await
    {
        if started.send(()).is_err() {
            tracing::debug!("Task {} was abandoned before it started", task_id);
            continue;
        }
        let stop = matches!(kind, WorkerTaskKind::Dispose);
        let outcome = execute(backend.as_ref(), kind).await;
        if reply.send(WorkerResult { task_id, outcome }).is_err() {
            tracing::debug!("Task {} was abandoned by its caller", task_id);
        }
        if stop {
            break;
        }
    }
    tracing::debug!("Embedding worker {} stopped", generation);
}

async fn execute(backend: &dyn EmbeddingProvider, kind: WorkerTaskKind) -> Result<WorkerOutput> {
    match kind {
        WorkerTaskKind::Initialize { progress } => {
            backend.initialize_with_progress(progress).await?;
            Ok(WorkerOutput::Initialized {
                dimension: backend.embedding_dimension(),
                backend_id: backend.provider_name().to_string(),
            })
        }
        WorkerTaskKind::Embed { text } => backend.embed_text(&text).await.map(WorkerOutput::Embedding),
        WorkerTaskKind::EmbedBatch { texts } => backend
            .embed_texts(&texts)
            .await
            .map(WorkerOutput::Embeddings),
        WorkerTaskKind::Dispose => {
            backend.dispose().await?;
            Ok(WorkerOutput::Disposed)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EmbedConfig;
    use crate::hashing::HashEmbeddingProvider;
    use std::time::Duration;
    use tracing_test::traced_test;

    #[derive(Clone, Copy)]
    enum Fault {
        None,
        PanicOnFirst,
        PanicAlways,
        StallOnFirst,
        SlowAlways,
    }

    /// Hash embeddings with a scripted fault, counting embed calls across generations.
    struct FaultyBackend {
        inner: HashEmbeddingProvider,
        fault: Fault,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl EmbeddingProvider for FaultyBackend {
        async fn initialize_with_progress(&self, progress: Option<ProgressSender>) -> Result<()> {
            self.inner.initialize_with_progress(progress).await
        }

        async fn embed_texts(&self, texts: &[String]) -> Result<EmbeddingResult> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            match self.fault {
                Fault::PanicOnFirst if call == 0 => panic!("backend crashed"),
                Fault::PanicAlways => panic!("backend crashed"),
                Fault::StallOnFirst if call == 0 => {
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
                Fault::SlowAlways => tokio::time::sleep(Duration::from_millis(300)).await,
                _ => {}
            }
            self.inner.embed_texts(texts).await
        }

        async fn dispose(&self) -> Result<()> {
            self.inner.dispose().await
        }

        fn embedding_dimension(&self) -> usize {
            self.inner.embedding_dimension()
        }

        fn provider_name(&self) -> &str {
            self.inner.provider_name()
        }

        fn status(&self) -> EmbedderStatus {
            self.inner.status()
        }
    }

    fn builder(fault: Fault, calls: Arc<AtomicUsize>) -> BackendBuilder {
        Arc::new(move || {
            Ok(Box::new(FaultyBackend {
                inner: HashEmbeddingProvider::new(16),
                fault,
                calls: Arc::clone(&calls),
            }) as Box<dyn EmbeddingProvider>)
        })
    }

    fn pool(config: WorkerPoolConfig, fault: Fault) -> (WorkerPool, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let pool = WorkerPool::new(config, builder(fault, Arc::clone(&calls))).unwrap();
        (pool, calls)
    }

    #[tokio::test]
    async fn test_embeds_through_worker() -> Result<()> {
        let (pool, _) = pool(WorkerPoolConfig::default(), Fault::None);
        assert_eq!(pool.provider_name(), "hash:v1:16");
        assert_eq!(pool.embedding_dimension(), 16);

        pool.initialize().await?;
        assert_eq!(pool.status(), EmbedderStatus::Ready);

        let direct = HashEmbeddingProvider::new(16).embed_sync("open the file");
        assert_eq!(pool.embed_text("open the file").await?, direct);

        let batch = pool
            .embed_texts(&["a".to_string(), "b".to_string()])
            .await?;
        assert_eq!(batch.len(), 2);
        assert_eq!(pool.outstanding(), 0);
        assert_eq!(pool.restarts(), 0);

        pool.dispose().await?;
        assert_eq!(pool.status(), EmbedderStatus::Uninitialized);
        Ok(())
    }

    #[tokio::test]
    async fn test_embed_before_initialize_is_rejected() {
        let (pool, calls) = pool(WorkerPoolConfig::default(), Fault::None);
        let err = pool.embed_text("x").await.unwrap_err();
        assert!(matches!(err, EmbedError::NotInitialized { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_recovers_from_worker_panic() -> Result<()> {
        let (pool, calls) = pool(WorkerPoolConfig::default(), Fault::PanicOnFirst);
        pool.initialize().await?;

        let embedding = pool.embed_text("survives a crash").await?;
        assert_eq!(embedding.len(), 16);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(pool.restarts(), 1);
        assert_eq!(pool.status(), EmbedderStatus::Ready);
        assert!(logs_contain("Restarting embedding worker"));
        Ok(())
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let config = WorkerPoolConfig::default().with_max_retries(2);
        let (pool, calls) = pool(config, Fault::PanicAlways);
        pool.initialize().await.unwrap();

        let err = pool.embed_text("never works").await.unwrap_err();
        match err {
            EmbedError::WorkerUnavailable { attempts, .. } => assert_eq!(attempts, 3),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(pool.restarts(), 2);
        assert!(matches!(pool.status(), EmbedderStatus::Error(_)));
    }

    #[tokio::test]
    async fn test_stalled_task_times_out_and_is_resubmitted() -> Result<()> {
        let config = WorkerPoolConfig::default().with_timeout(Duration::from_millis(100));
        let (pool, calls) = pool(config, Fault::StallOnFirst);
        pool.initialize().await?;

        let embedding = pool.embed_text("slow start").await?;
        assert_eq!(embedding.len(), 16);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(pool.restarts(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_reject_policy_reports_queue_full() -> Result<()> {
        let config = WorkerPoolConfig::default().with_capacity(1, QueueFullPolicy::Reject);
        let (pool, _) = pool(config, Fault::SlowAlways);
        let pool = Arc::new(pool);
        pool.initialize().await?;

        let busy = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.embed_text("first").await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(pool.outstanding(), 1);

        let err = pool.embed_text("second").await.unwrap_err();
        assert!(matches!(err, EmbedError::QueueFull { capacity: 1 }));

        busy.await??;
        assert_eq!(pool.outstanding(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_wait_policy_applies_backpressure() -> Result<()> {
        let config = WorkerPoolConfig::default().with_capacity(1, QueueFullPolicy::Wait);
        let (pool, calls) = pool(config, Fault::None);
        pool.initialize().await?;

        let texts: Vec<String> = (0..6).map(|i| format!("text {i}")).collect();
        let results =
            futures::future::join_all(texts.iter().map(|t| pool.embed_text(t))).await;
        assert!(results.iter().all(|r| r.is_ok()));
        assert_eq!(calls.load(Ordering::SeqCst), 6);
        assert_eq!(pool.outstanding(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_backlog_waits_instead_of_restarting() -> Result<()> {
        // Eight 300ms tasks behind a single slot take far longer than the
        // timeout in total, but each one finishes well within it once started.
        let config = WorkerPoolConfig::default()
            .with_capacity(1, QueueFullPolicy::Wait)
            .with_timeout(Duration::from_millis(500));
        let (pool, calls) = pool(config, Fault::SlowAlways);
        pool.initialize().await?;

        let texts: Vec<String> = (0..8).map(|i| format!("queued {i}")).collect();
        let results =
            futures::future::join_all(texts.iter().map(|t| pool.embed_text(t))).await;
        for result in &results {
            assert!(result.is_ok(), "{result:?}");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 8);
        assert_eq!(pool.restarts(), 0);
        assert_eq!(pool.status(), EmbedderStatus::Ready);
        Ok(())
    }

    #[tokio::test]
    async fn test_queued_task_moves_to_replacement_worker() -> Result<()> {
        // The first task stalls past the timeout; the second waits behind it
        // in the old queue and must run on the restarted worker.
        let config = WorkerPoolConfig::default().with_timeout(Duration::from_millis(100));
        let (pool, calls) = pool(config, Fault::StallOnFirst);
        pool.initialize().await?;

        let (stalled, queued) =
            tokio::join!(pool.embed_text("stalls"), pool.embed_text("waits behind it"));
        assert_eq!(stalled?.len(), 16);
        assert_eq!(queued?.len(), 16);
        assert_eq!(pool.restarts(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        Ok(())
    }

    #[tokio::test]
    async fn test_reinitialize_after_dispose() -> Result<()> {
        let (pool, _) = pool(WorkerPoolConfig::default(), Fault::None);
        pool.initialize().await?;
        pool.dispose().await?;
        assert!(pool.embed_text("x").await.is_err());

        pool.initialize().await?;
        assert_eq!(pool.embed_text("x").await?.len(), 16);
        assert_eq!(pool.restarts(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_from_factory_uses_selected_backend() -> Result<()> {
        let pool = WorkerPool::from_factory(EmbedderFactory::new(EmbedConfig::hashing(24)))?;
        pool.initialize().await?;
        assert_eq!(pool.embed_text("x").await?.len(), 24);
        assert_eq!(pool.provider_name(), "hash:v1:24");
        Ok(())
    }
}
