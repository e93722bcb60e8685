//! Single-worker render queue.
//!
//! Every render submitted through a [`RenderQueue`] runs strictly one at a time
//! in submission order, no matter how many resolvers share the queue. Callers
//! wait for their own result up to the operation timeout.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use super::{InteractionStep, PageRenderer, RenderError};

const DEFAULT_CAPACITY: usize = 16;
const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, Copy)]
pub struct RenderQueueConfig {
    /// Pending jobs accepted before submissions fail with `QueueFull`.
    pub capacity: usize,
    /// Upper bound for one submission, queueing time included.
    pub operation_timeout: Duration,
}

impl Default for RenderQueueConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
        }
    }
}

struct RenderJob {
    url: String,
    steps: Vec<InteractionStep>,
    reply: oneshot::Sender<Result<String, RenderError>>,
}

struct Worker {
    sender: mpsc::Sender<RenderJob>,
    handle: JoinHandle<()>,
}

/// Serializes a [`PageRenderer`] behind one worker task.
pub struct RenderQueue {
    renderer: Arc<dyn PageRenderer>,
    config: RenderQueueConfig,
    worker: Mutex<Option<Worker>>,
}

impl RenderQueue {
    /// Creates a stopped queue; call [`start`](Self::start) before submitting.
    #[must_use]
    pub fn new(renderer: Arc<dyn PageRenderer>, config: RenderQueueConfig) -> Self {
        Self {
            renderer,
            config,
            worker: Mutex::new(None),
        }
    }

    /// Spawns the worker task. Idempotent. Must be called inside a Tokio runtime.
    pub fn start(&self) {
        let mut guard = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
        if guard.is_some() {
            return;
        }
        let (sender, receiver) = mpsc::channel(self.config.capacity.max(1));
        let handle = tokio::spawn(run_worker(
            Arc::clone(&self.renderer),
            receiver,
            self.config.operation_timeout,
        ));
        *guard = Some(Worker { sender, handle });
        info!(capacity = self.config.capacity, "render queue started");
    }

    /// Stops accepting work and waits for the in-flight job to finish.
    pub async fn shutdown(&self) {
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(Worker { sender, handle }) = worker {
            drop(sender);
            if let Err(error) = handle.await {
                warn!(error = %error, "render worker ended abnormally");
            }
        }
    }

    #[must_use]
    pub fn is_started(&self) -> bool {
        self.worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    #[instrument(skip(self, steps), fields(url = %url))]
    async fn submit(&self, url: &str, steps: Vec<InteractionStep>) -> Result<String, RenderError> {
        let sender = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|worker| worker.sender.clone())
            .ok_or(RenderError::NotStarted)?;

        let (reply, result) = oneshot::channel();
        let job = RenderJob {
            url: url.to_string(),
            steps,
            reply,
        };
        sender.try_send(job).map_err(|error| match error {
            mpsc::error::TrySendError::Full(_) => RenderError::QueueFull {
                capacity: self.config.capacity,
            },
            mpsc::error::TrySendError::Closed(_) => RenderError::NotStarted,
        })?;
        debug!("render job queued");

        match tokio::time::timeout(self.config.operation_timeout, result).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(RenderError::NotStarted),
            Err(_) => Err(RenderError::Timeout {
                url: url.to_string(),
                timeout: self.config.operation_timeout,
            }),
        }
    }
}

async fn run_worker(
    renderer: Arc<dyn PageRenderer>,
    mut receiver: mpsc::Receiver<RenderJob>,
    operation_timeout: Duration,
) {
    while let Some(job) = receiver.recv().await {
        if job.reply.is_closed() {
            debug!(url = %job.url, "caller gave up before render started");
            continue;
        }
        let render = renderer.render_and_interact(&job.url, &job.steps);
        let outcome = tokio::time::timeout(operation_timeout, render)
            .await
            .unwrap_or_else(|_| {
                Err(RenderError::Timeout {
                    url: job.url.clone(),
                    timeout: operation_timeout,
                })
            });
        // The caller may have timed out meanwhile.
        let _ = job.reply.send(outcome);
    }
    debug!("render worker stopped");
}

#[async_trait]
impl PageRenderer for RenderQueue {
    async fn render(&self, url: &str) -> Result<String, RenderError> {
        self.submit(url, Vec::new()).await
    }

    async fn render_and_interact(
        &self,
        url: &str,
        steps: &[InteractionStep],
    ) -> Result<String, RenderError> {
        self.submit(url, steps.to_vec()).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    /// Records the maximum number of renders observed running at once.
    struct SlowRenderer {
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        delay: Duration,
        order: Mutex<Vec<String>>,
    }

    impl SlowRenderer {
        fn new(delay: Duration) -> Self {
            Self {
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                delay,
                order: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl PageRenderer for SlowRenderer {
        async fn render(&self, url: &str) -> Result<String, RenderError> {
            self.render_and_interact(url, &[]).await
        }

        async fn render_and_interact(
            &self,
            url: &str,
            _steps: &[InteractionStep],
        ) -> Result<String, RenderError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            self.order.lock().unwrap().push(url.to_string());
            tokio::time::sleep(self.delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(format!("<html>{url}</html>"))
        }
    }

    #[tokio::test]
    async fn test_submit_before_start_is_not_started() {
        let queue = RenderQueue::new(
            Arc::new(SlowRenderer::new(Duration::ZERO)),
            RenderQueueConfig::default(),
        );
        let err = queue.render("https://a.test").await.unwrap_err();
        assert!(matches!(err, RenderError::NotStarted));
    }

    #[tokio::test]
    async fn test_renders_run_one_at_a_time_in_order() {
        let renderer = Arc::new(SlowRenderer::new(Duration::from_millis(20)));
        let queue = Arc::new(RenderQueue::new(
            renderer.clone(),
            RenderQueueConfig::default(),
        ));
        queue.start();

        let mut handles = Vec::new();
        for i in 0..4 {
            let queue = Arc::clone(&queue);
            handles.push(tokio::spawn(async move {
                queue.render(&format!("https://a.test/{i}")).await
            }));
            // Give each submission a distinct enqueue instant.
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(renderer.max_in_flight.load(Ordering::SeqCst), 1);
        assert_eq!(
            *renderer.order.lock().unwrap(),
            vec![
                "https://a.test/0",
                "https://a.test/1",
                "https://a.test/2",
                "https://a.test/3"
            ]
        );
        queue.shutdown().await;
        assert!(!queue.is_started());
    }

    #[tokio::test]
    async fn test_full_queue_rejects_submission() {
        let renderer = Arc::new(SlowRenderer::new(Duration::from_millis(200)));
        let queue = Arc::new(RenderQueue::new(
            renderer,
            RenderQueueConfig {
                capacity: 1,
                operation_timeout: Duration::from_secs(5),
            },
        ));
        queue.start();

        // First job occupies the worker, second fills the single slot.
        let first = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.render("https://a.test/1").await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let second = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.render("https://a.test/2").await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let third = queue.render("https://a.test/3").await;
        assert!(matches!(third, Err(RenderError::QueueFull { capacity: 1 })));

        first.await.unwrap().unwrap();
        second.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_slow_render_times_out() {
        let queue = RenderQueue::new(
            Arc::new(SlowRenderer::new(Duration::from_millis(500))),
            RenderQueueConfig {
                capacity: 2,
                operation_timeout: Duration::from_millis(50),
            },
        );
        queue.start();
        let err = queue.render("https://slow.test").await.unwrap_err();
        assert!(matches!(err, RenderError::Timeout { .. }));
    }
}
