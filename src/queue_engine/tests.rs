use super::*;
use crate::progress::{BroadcastChannel, QueueEvent};
use crate::repository::MemoryRepository;
use crate::worker::WorkerError;
use async_trait::async_trait;
use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tokio::sync::broadcast;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(3);

/// Instruction sent by a test to the job currently running on the worker
enum Step {
    Progress(f64),
    Complete,
    Fail(&'static str),
}

/// Notification that the worker started a job
struct Started {
    input_ref: String,
    output_ref: String,
    control: mpsc::UnboundedSender<Step>,
}

impl Started {
    fn send(&self, step: Step) {
        self.control.send(step).unwrap();
    }
}

/// Worker driven step by step from the test body
struct ScriptedWorker {
    started: mpsc::UnboundedSender<Started>,
    runs: Mutex<Vec<String>>,
    cancelled: Mutex<Vec<String>>,
    produced: Mutex<HashSet<String>>,
}

impl ScriptedWorker {
    fn runs(&self) -> Vec<String> {
        self.runs.lock().unwrap().clone()
    }

    fn cancelled(&self) -> Vec<String> {
        self.cancelled.lock().unwrap().clone()
    }

    fn mark_produced(&self, output_ref: &str) {
        self.produced.lock().unwrap().insert(output_ref.to_string());
    }
}

#[async_trait]
impl Worker for ScriptedWorker {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn output_ref_for(&self, input_ref: &str) -> Result<String, String> {
        if input_ref.ends_with(".txt") {
            return Err(format!("Unsupported file type: {}", input_ref));
        }
        Ok(format!("{}.out", input_ref))
    }

    async fn is_already_produced(&self, job: &WorkerJob) -> bool {
        self.produced.lock().unwrap().contains(&job.output_ref)
    }

    async fn run(
        &self,
        job: &WorkerJob,
        progress: ProgressSink,
        cancel: CancellationToken,
    ) -> Result<(), WorkerError> {
        self.runs.lock().unwrap().push(job.input_ref.clone());
        // Only absolute refs point into a test's temporary directory
        if Path::new(&job.output_ref).is_absolute() {
            tokio::fs::write(&job.output_ref, b"partial").await?;
        }

        let (control, mut steps) = mpsc::unbounded_channel();
        let _ = self.started.send(Started {
            input_ref: job.input_ref.clone(),
            output_ref: job.output_ref.clone(),
            control,
        });

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.cancelled.lock().unwrap().push(job.input_ref.clone());
                    return Err(WorkerError::Cancelled);
                }
                step = steps.recv() => match step {
                    Some(Step::Progress(percent)) => progress.report(percent),
                    Some(Step::Complete) => return Ok(()),
                    Some(Step::Fail(reason)) => {
                        return Err(WorkerError::Exit {
                            code: Some(1),
                            stderr: reason.to_string(),
                        })
                    }
                    // The test dropped its handle; keep running until removed
                    None => {
                        cancel.cancelled().await;
                        self.cancelled.lock().unwrap().push(job.input_ref.clone());
                        return Err(WorkerError::Cancelled);
                    }
                }
            }
        }
    }
}

/// Repository whose writes can be switched off
struct FlakyRepository {
    inner: MemoryRepository,
    failing: AtomicBool,
}

impl FlakyRepository {
    fn check(&self) -> Result<(), RepositoryError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(RepositoryError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "disk full",
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl QueueRepository for FlakyRepository {
    fn collection(&self) -> &str {
        self.inner.collection()
    }

    async fn put(&self, item: &QueueItem) -> Result<(), RepositoryError> {
        self.check()?;
        self.inner.put(item).await
    }

    async fn get(&self, id: &str) -> Result<Option<QueueItem>, RepositoryError> {
        self.inner.get(id).await
    }

    async fn delete(&self, id: &str) -> Result<(), RepositoryError> {
        self.check()?;
        self.inner.delete(id).await
    }

    async fn get_all(&self) -> Result<Vec<QueueItem>, RepositoryError> {
        self.inner.get_all().await
    }

    async fn clear(&self) -> Result<(), RepositoryError> {
        self.check()?;
        self.inner.clear().await
    }
}

struct Harness {
    engine: QueueEngine,
    worker: Arc<ScriptedWorker>,
    channel: BroadcastChannel,
    started: mpsc::UnboundedReceiver<Started>,
}

fn test_config() -> EngineConfig {
    EngineConfig {
        progress_interval: Duration::from_millis(100),
        reschedule_delay: Duration::from_millis(5),
    }
}

async fn start_with(repository: Arc<dyn QueueRepository>) -> Harness {
    let (started_tx, started) = mpsc::unbounded_channel();
    let worker = Arc::new(ScriptedWorker {
        started: started_tx,
        runs: Mutex::new(Vec::new()),
        cancelled: Mutex::new(Vec::new()),
        produced: Mutex::new(HashSet::new()),
    });
    let channel = BroadcastChannel::new(1024);

    let engine = QueueEngine::start(
        worker.clone(),
        repository,
        Arc::new(channel.clone()),
        test_config(),
    )
    .await
    .unwrap();

    Harness {
        engine,
        worker,
        channel,
        started,
    }
}

async fn start() -> (Harness, Arc<MemoryRepository>) {
    let repository = Arc::new(MemoryRepository::new("scripted"));
    (start_with(repository.clone()).await, repository)
}

impl Harness {
    async fn next_started(&mut self) -> Started {
        timeout(WAIT, self.started.recv())
            .await
            .expect("worker was not started in time")
            .expect("engine dropped the worker")
    }

    /// Poll the queue until `predicate` holds
    async fn wait_for<F>(&self, predicate: F) -> Vec<QueueItem>
    where
        F: Fn(&[QueueItem]) -> bool,
    {
        timeout(WAIT, async {
            loop {
                let queue = self.engine.queue().await.unwrap();
                if predicate(&queue) {
                    return queue;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("queue never reached the expected state")
    }

    async fn add(&self, input_ref: &str) -> String {
        let queue = self.engine.add(input_ref).await.unwrap();
        queue
            .iter()
            .rev()
            .find(|item| item.input_ref == input_ref)
            .map(|item| item.id.clone())
            .unwrap()
    }
}

fn statuses(queue: &[QueueItem]) -> Vec<(String, JobStatus)> {
    queue
        .iter()
        .map(|item| (item.input_ref.clone(), item.status.clone()))
        .collect()
}

fn pending(input: &str) -> (String, JobStatus) {
    (input.to_string(), JobStatus::Pending)
}

fn processing(input: &str) -> (String, JobStatus) {
    (input.to_string(), JobStatus::Processing)
}

fn paused(input: &str) -> (String, JobStatus) {
    (input.to_string(), JobStatus::Paused)
}

async fn next_event(rx: &mut broadcast::Receiver<QueueEvent>, topic: &str) -> QueueEvent {
    timeout(WAIT, async {
        loop {
            let event = rx.recv().await.unwrap();
            if event.topic == topic {
                return event;
            }
        }
    })
    .await
    .expect("event was not published in time")
}

#[tokio::test]
async fn test_single_job_runs_to_completion() {
    let (mut h, repository) = start().await;
    let mut events = h.channel.subscribe();

    let queue = h.engine.add("A").await.unwrap();
    assert_eq!(statuses(&queue), vec![pending("A")]);
    assert!(repository.get(&queue[0].id).await.unwrap().is_some());

    let job = h.next_started().await;
    assert_eq!(job.input_ref, "A");
    assert_eq!(job.output_ref, "A.out");
    assert!(!Path::new(&job.output_ref).exists());
    let queue = h.wait_for(|q| q.iter().any(|i| i.is_processing())).await;
    assert_eq!(statuses(&queue), vec![processing("A")]);

    job.send(Step::Complete);
    let completed = next_event(&mut events, "scripted:completed").await;
    assert_eq!(completed.payload["completedItem"]["inputRef"], "A");
    assert_eq!(completed.payload["completedItem"]["status"], "completed");
    assert_eq!(completed.payload["queue"], serde_json::json!([]));

    h.wait_for(|q| q.is_empty()).await;
    assert!(repository.get_all().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_second_job_waits_for_first() {
    let (mut h, _) = start().await;

    h.add("A").await;
    let a = h.next_started().await;
    h.wait_for(|q| q.iter().any(|i| i.is_processing())).await;

    let queue = h.engine.add("B").await.unwrap();
    assert_eq!(statuses(&queue), vec![processing("A"), pending("B")]);

    a.send(Step::Complete);
    let b = h.next_started().await;
    assert_eq!(b.input_ref, "B");

    let queue = h
        .wait_for(|q| q.len() == 1 && q[0].is_processing())
        .await;
    assert_eq!(statuses(&queue), vec![processing("B")]);
}

#[tokio::test]
async fn test_paused_job_is_skipped() {
    let (mut h, repository) = start().await;

    h.add("X").await;
    let x = h.next_started().await;
    let a = h.add("A").await;

    let queue = h.engine.pause(&a).await.unwrap();
    assert_eq!(statuses(&queue), vec![processing("X"), paused("A")]);
    assert!(h.engine.is_paused(&a).await.unwrap());
    assert_eq!(
        repository.get(&a).await.unwrap().unwrap().status,
        JobStatus::Paused
    );

    h.add("C").await;
    x.send(Step::Complete);

    let c = h.next_started().await;
    assert_eq!(c.input_ref, "C");
    let queue = h.wait_for(|q| q.len() == 2 && q[0].is_processing()).await;
    assert_eq!(statuses(&queue), vec![processing("C"), paused("A")]);

    c.send(Step::Complete);
    let queue = h.wait_for(|q| q.len() == 1).await;
    assert_eq!(statuses(&queue), vec![paused("A")]);
    assert!(h.engine.current().await.unwrap().is_none());

    h.engine.unpause(&a).await.unwrap();
    assert!(!h.engine.is_paused(&a).await.unwrap());
    assert_eq!(h.next_started().await.input_ref, "A");
}

#[tokio::test]
async fn test_removing_running_job_cancels_and_cleans_up() {
    let (mut h, repository) = start().await;
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("A.mkv").to_string_lossy().to_string();

    let a = h.add(&input).await;
    let started = h.next_started().await;
    assert!(Path::new(&started.output_ref).exists());

    let queue = h.engine.remove(&a).await.unwrap();
    assert!(queue.is_empty());
    assert!(!Path::new(&started.output_ref).exists());
    assert!(repository.get_all().await.unwrap().is_empty());

    timeout(WAIT, async {
        while h.worker.cancelled().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(h.worker.cancelled(), vec![input]);

    h.add("B").await;
    assert_eq!(h.next_started().await.input_ref, "B");
}

#[tokio::test]
async fn test_removing_running_job_starts_next() {
    let (mut h, _) = start().await;

    let a = h.add("A").await;
    let _running = h.next_started().await;
    h.add("B").await;

    let queue = h.engine.remove(&a).await.unwrap();
    assert_eq!(statuses(&queue), vec![pending("B")]);
    assert_eq!(h.next_started().await.input_ref, "B");
    assert!(h.engine.current().await.unwrap().is_some());
}

#[tokio::test]
async fn test_remove_pending_job() {
    let (mut h, _) = start().await;

    h.add("X").await;
    let _running = h.next_started().await;
    let a = h.add("A").await;

    let queue = h.engine.remove(&a).await.unwrap();
    assert_eq!(statuses(&queue), vec![processing("X")]);
    assert!(h.worker.cancelled().is_empty());

    let err = h.engine.remove(&a).await.unwrap_err();
    assert!(matches!(err, QueueError::NotFound(_)));
}

#[tokio::test]
async fn test_interrupted_job_is_recovered_as_pending() {
    let repository = Arc::new(MemoryRepository::new("scripted"));
    let mut a = QueueItem::new("a".to_string(), "A".to_string(), "A.out".to_string(), 1);
    a.status = JobStatus::Processing;
    a.progress_percent = Some(42.0);
    repository.put(&a).await.unwrap();

    let recovered = recover_items(repository.as_ref()).await.unwrap();
    assert_eq!(statuses(&recovered), vec![pending("A")]);
    assert_eq!(recovered[0].progress_percent, None);
    assert_eq!(
        repository.get("a").await.unwrap().unwrap().status,
        JobStatus::Pending
    );

    let mut h = start_with(repository.clone()).await;
    let job = h.next_started().await;
    assert_eq!(job.input_ref, "A");
    job.send(Step::Complete);
    h.wait_for(|q| q.is_empty()).await;
}

#[tokio::test]
async fn test_recovery_keeps_order_paused_and_failed() {
    let repository = Arc::new(MemoryRepository::new("scripted"));
    let mut c = QueueItem::new("c".to_string(), "C".to_string(), "C.out".to_string(), 7);
    c.status = JobStatus::Paused;
    let b = QueueItem::new("b".to_string(), "B".to_string(), "B.out".to_string(), 5);
    let mut f = QueueItem::new("f".to_string(), "F".to_string(), "F.out".to_string(), 2);
    f.status = JobStatus::Failed {
        reason: "boom".to_string(),
    };
    for item in [&c, &b, &f] {
        repository.put(item).await.unwrap();
    }

    let recovered = recover_items(repository.as_ref()).await.unwrap();
    let ids: Vec<&str> = recovered.iter().map(|i| i.id.as_str()).collect();
    assert_eq!(ids, vec!["f", "b", "c"]);
    assert_eq!(recovered[0].status, f.status);

    let mut h = start_with(repository.clone()).await;
    assert_eq!(h.next_started().await.input_ref, "B");

    // New jobs are numbered after the highest persisted index
    let d = h.add("D").await;
    assert_eq!(repository.get(&d).await.unwrap().unwrap().queue_index, Some(8));
}

#[tokio::test]
async fn test_swap_reorders_pending_jobs() {
    let (mut h, repository) = start().await;

    h.add("X").await;
    let x = h.next_started().await;
    let a = h.add("A").await;
    let b = h.add("B").await;
    let a_index = repository.get(&a).await.unwrap().unwrap().queue_index;
    let b_index = repository.get(&b).await.unwrap().unwrap().queue_index;

    let queue = h.engine.swap(&a, &b).await.unwrap();
    assert_eq!(
        statuses(&queue),
        vec![processing("X"), pending("B"), pending("A")]
    );
    assert_eq!(repository.get(&a).await.unwrap().unwrap().queue_index, b_index);
    assert_eq!(repository.get(&b).await.unwrap().unwrap().queue_index, a_index);

    x.send(Step::Complete);
    assert_eq!(h.next_started().await.input_ref, "B");
}

#[tokio::test]
async fn test_swap_requires_two_pending_jobs() {
    let (mut h, _) = start().await;

    let x = h.add("X").await;
    let _running = h.next_started().await;
    let a = h.add("A").await;
    let p = h.add("P").await;
    h.engine.pause(&p).await.unwrap();
    let before = h.engine.queue().await.unwrap();

    let err = h.engine.swap(&x, &a).await.unwrap_err();
    assert!(matches!(err, QueueError::Conflict(_)));
    let err = h.engine.swap(&a, &p).await.unwrap_err();
    assert!(matches!(err, QueueError::Conflict(_)));
    let err = h.engine.swap(&a, "missing").await.unwrap_err();
    assert!(matches!(err, QueueError::NotFound(_)));

    assert_eq!(h.engine.queue().await.unwrap(), before);
}

#[tokio::test]
async fn test_pause_and_unpause_conflicts() {
    let (mut h, _) = start().await;

    let x = h.add("X").await;
    let _running = h.next_started().await;
    let a = h.add("A").await;

    let err = h.engine.pause(&x).await.unwrap_err();
    assert!(matches!(err, QueueError::Conflict(_)));
    let err = h.engine.unpause(&a).await.unwrap_err();
    assert!(matches!(err, QueueError::Conflict(_)));

    h.engine.pause(&a).await.unwrap();
    let err = h.engine.pause(&a).await.unwrap_err();
    assert!(matches!(err, QueueError::Conflict(_)));

    let err = h.engine.pause("missing").await.unwrap_err();
    assert!(matches!(err, QueueError::NotFound(_)));
    assert_eq!(err.kind(), "not_found");
    assert!(!h.engine.is_paused("missing").await.unwrap());
}

#[tokio::test]
async fn test_only_one_job_processes_at_a_time() {
    let (mut h, _) = start().await;

    for input in ["A", "B", "C", "D"] {
        h.add(input).await;
    }

    for expected in ["A", "B", "C", "D"] {
        let job = h.next_started().await;
        assert_eq!(job.input_ref, expected);

        let queue = h.engine.queue().await.unwrap();
        assert!(queue.iter().filter(|i| i.is_processing()).count() <= 1);
        let current = h.engine.current().await.unwrap();
        assert_eq!(current.map(|i| i.input_ref), Some(expected.to_string()));

        job.send(Step::Complete);
    }

    h.wait_for(|q| q.is_empty()).await;
    assert_eq!(h.worker.runs(), vec!["A", "B", "C", "D"]);
}

#[tokio::test]
async fn test_add_rejects_ineligible_input() {
    let (h, _) = start().await;

    let err = h.engine.add("notes.txt").await.unwrap_err();
    assert!(matches!(err, QueueError::Validation(_)));

    h.worker.mark_produced("A.out");
    let err = h.engine.add("A").await.unwrap_err();
    assert!(matches!(err, QueueError::Validation(_)));
    assert_eq!(err.kind(), "validation");

    assert!(h.engine.queue().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_produced_output_is_completed_without_running() {
    let (mut h, _) = start().await;
    let mut events = h.channel.subscribe();

    h.add("X").await;
    let x = h.next_started().await;
    h.add("A").await;
    h.worker.mark_produced("A.out");

    x.send(Step::Complete);
    next_event(&mut events, "scripted:completed").await;
    let completed = next_event(&mut events, "scripted:completed").await;
    assert_eq!(completed.payload["completedItem"]["inputRef"], "A");

    h.wait_for(|q| q.is_empty()).await;
    assert_eq!(h.worker.runs(), vec!["X"]);
}

#[tokio::test]
async fn test_failed_job_stays_visible_and_queue_advances() {
    let (mut h, repository) = start().await;
    let mut events = h.channel.subscribe();

    let a = h.add("A").await;
    h.add("B").await;
    let job = h.next_started().await;
    job.send(Step::Fail("corrupt stream"));

    let failed = next_event(&mut events, "scripted:failed").await;
    assert_eq!(failed.payload["failedItem"]["id"], a.as_str());
    assert_eq!(failed.payload["failedItem"]["status"], "failed");

    assert_eq!(h.next_started().await.input_ref, "B");

    let stored = repository.get(&a).await.unwrap().unwrap();
    match stored.status {
        JobStatus::Failed { reason } => assert!(reason.contains("corrupt stream")),
        other => panic!("unexpected status {}", other),
    }

    let queue = h.engine.queue().await.unwrap();
    assert_eq!(queue[0].input_ref, "B");
    assert_eq!(queue[1].status.as_str(), "failed");

    // Failed jobs cannot be paused but can be removed
    assert!(matches!(
        h.engine.pause(&a).await.unwrap_err(),
        QueueError::Conflict(_)
    ));
    h.engine.remove(&a).await.unwrap();
    assert!(repository.get(&a).await.unwrap().is_none());
}

#[tokio::test]
async fn test_progress_is_throttled_and_monotonic() {
    let (mut h, _) = start().await;
    let mut events = h.channel.subscribe();

    h.add("A").await;
    let job = h.next_started().await;

    job.send(Step::Progress(10.0));
    let first = next_event(&mut events, "scripted:progress").await;
    assert_eq!(first.payload["queue"][0]["progressPercent"], 10.0);

    job.send(Step::Progress(20.0));
    job.send(Step::Progress(5.0));
    job.send(Step::Progress(30.0));

    let flushed = next_event(&mut events, "scripted:progress").await;
    assert_eq!(flushed.payload["queue"][0]["progressPercent"], 30.0);

    let current = h.engine.current().await.unwrap().unwrap();
    assert_eq!(current.progress_percent, Some(30.0));

    job.send(Step::Progress(25.0));
    tokio::time::sleep(Duration::from_millis(250)).await;
    let current = h.engine.current().await.unwrap().unwrap();
    assert_eq!(current.progress_percent, Some(30.0));
}

#[tokio::test]
async fn test_changes_are_published() {
    let (h, _) = start().await;
    let mut events = h.channel.subscribe();

    let id = h.add("A").await;
    let changed = next_event(&mut events, "scripted:changed").await;
    assert_eq!(changed.payload["queue"][0]["id"], id.as_str());
}

#[tokio::test]
async fn test_persistence_failure_leaves_memory_untouched() {
    let repository = Arc::new(FlakyRepository {
        inner: MemoryRepository::new("scripted"),
        failing: AtomicBool::new(false),
    });
    let mut h = start_with(repository.clone()).await;

    h.add("X").await;
    let _running = h.next_started().await;
    let a = h.add("A").await;

    repository.failing.store(true, Ordering::SeqCst);
    let err = h.engine.add("B").await.unwrap_err();
    assert!(matches!(err, QueueError::Persistence(_)));
    assert_eq!(err.kind(), "persistence");

    let err = h.engine.pause(&a).await.unwrap_err();
    assert!(matches!(err, QueueError::Persistence(_)));

    let queue = h.engine.queue().await.unwrap();
    assert_eq!(statuses(&queue), vec![processing("X"), pending("A")]);
}

#[tokio::test]
async fn test_storage_failures_do_not_stop_scheduling() {
    let repository = Arc::new(FlakyRepository {
        inner: MemoryRepository::new("scripted"),
        failing: AtomicBool::new(false),
    });
    let mut h = start_with(repository.clone()).await;
    let mut events = h.channel.subscribe();

    h.add("X").await;
    let x = h.next_started().await;
    h.add("A").await;
    h.add("B").await;

    repository.failing.store(true, Ordering::SeqCst);

    x.send(Step::Complete);
    next_event(&mut events, "scripted:completed").await;
    let a = h.next_started().await;
    assert_eq!(a.input_ref, "A");

    a.send(Step::Fail("bad input"));
    let failed = next_event(&mut events, "scripted:failed").await;
    assert_eq!(failed.payload["failedItem"]["inputRef"], "A");
    let b = h.next_started().await;
    assert_eq!(b.input_ref, "B");

    let queue = h.wait_for(|q| q.iter().any(|i| i.is_processing())).await;
    assert_eq!(queue.len(), 2);
    assert_eq!(queue[0].input_ref, "A");
    assert!(matches!(queue[0].status, JobStatus::Failed { .. }));
    assert_eq!(statuses(&queue[1..]), vec![processing("B")]);
}

#[tokio::test]
async fn test_remove_with_failing_storage_still_drops_job_from_memory() {
    let repository = Arc::new(FlakyRepository {
        inner: MemoryRepository::new("scripted"),
        failing: AtomicBool::new(false),
    });
    let mut h = start_with(repository.clone()).await;

    h.add("X").await;
    let _running = h.next_started().await;
    let a = h.add("A").await;

    repository.failing.store(true, Ordering::SeqCst);
    let err = h.engine.remove(&a).await.unwrap_err();
    assert!(matches!(err, QueueError::Persistence(_)));

    let queue = h.engine.queue().await.unwrap();
    assert_eq!(statuses(&queue), vec![processing("X")]);
    // The stored copy survives and comes back on restart
    assert!(repository.inner.get(&a).await.unwrap().is_some());
}

#[tokio::test]
async fn test_progress_is_kept_out_of_storage() {
    let (mut h, repository) = start().await;

    let id = h.add("A").await;
    let job = h.next_started().await;
    job.send(Step::Progress(40.0));

    h.wait_for(|q| q.iter().any(|i| i.progress_percent == Some(40.0)))
        .await;

    let stored = repository.get(&id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Processing);
    assert_eq!(stored.progress_percent, None);
}
