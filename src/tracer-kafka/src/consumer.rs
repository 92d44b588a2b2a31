use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use tracer_common::{PartitionNamer, TraceRecord, TraceStore};
use tracer_config::KafkaConsumerConfig;

use crate::source::TraceSource;

/// Batch outcome counters, shared between the worker and its owner.
#[derive(Debug, Default)]
pub struct CommitStats {
    committed_batches: AtomicU64,
    committed_records: AtomicU64,
    dropped_batches: AtomicU64,
    dropped_records: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommitStatsSnapshot {
    pub committed_batches: u64,
    pub committed_records: u64,
    pub dropped_batches: u64,
    pub dropped_records: u64,
}

impl CommitStats {
    pub fn snapshot(&self) -> CommitStatsSnapshot {
        CommitStatsSnapshot {
            committed_batches: self.committed_batches.load(Ordering::Relaxed),
            committed_records: self.committed_records.load(Ordering::Relaxed),
            dropped_batches: self.dropped_batches.load(Ordering::Relaxed),
            dropped_records: self.dropped_records.load(Ordering::Relaxed),
        }
    }
}

/// What a single poll cycle did to the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// Below the threshold; holds the buffered count.
    Buffered(usize),
    /// Flushed and committed this many records.
    Committed(usize),
    /// The cycle failed and this many buffered records were discarded uncommitted.
    Dropped(usize),
}

/// Consumes trace nodes and writes them to day-partitioned tables.
///
/// A single worker task polls, buffers and flushes. The queue offset is
/// committed only after every record of a batch was stored. When any step of
/// a cycle fails the buffer is discarded without committing, so those records
/// come back only through redelivery from the last committed offset (after a
/// restart or a rebalance). Delivery is therefore at-least-once across
/// restarts but best-effort within a running worker.
pub struct TraceConsumer {
    config: KafkaConsumerConfig,
    namer: PartitionNamer,
    store: Arc<dyn TraceStore>,
    started: AtomicBool,
    stats: Arc<CommitStats>,
}

impl TraceConsumer {
    pub fn new(
        config: KafkaConsumerConfig,
        namer: PartitionNamer,
        store: Arc<dyn TraceStore>,
    ) -> Self {
        Self {
            config,
            namer,
            store,
            started: AtomicBool::new(false),
            stats: Arc::new(CommitStats::default()),
        }
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> CommitStatsSnapshot {
        self.stats.snapshot()
    }

    /// Spawns the worker, which subscribes `source` and starts polling.
    ///
    /// Only the first call starts anything; later calls drop `source` and
    /// return `None`.
    pub fn start<S>(&self, source: S) -> Option<ConsumerHandle>
    where
        S: TraceSource + 'static,
    {
        if self.started.swap(true, Ordering::SeqCst) {
            warn!("Trace consumer already running");
            return None;
        }

        info!(
            "Starting trace consumer: min_batch_size={}, poll_timeout={}ms",
            self.config.min_batch_size, self.config.poll_timeout_ms
        );

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let worker = BatchWorker::new(
            source,
            self.store.clone(),
            self.namer.clone(),
            &self.config,
            self.stats.clone(),
        );
        let topics = self.config.topics.clone();
        let task = tokio::spawn(worker.run(topics, shutdown_rx));

        Some(ConsumerHandle { shutdown_tx, task })
    }
}

/// Owner side of a running worker. Dropping it also stops the worker.
pub struct ConsumerHandle {
    shutdown_tx: broadcast::Sender<()>,
    task: JoinHandle<Result<CommitStatsSnapshot>>,
}

impl ConsumerHandle {
    /// Waits for the worker to exit on its own, which only happens when it
    /// cannot subscribe.
    pub async fn wait(&mut self) -> Result<CommitStatsSnapshot> {
        match (&mut self.task).await {
            Ok(result) => result,
            Err(e) => Err(anyhow::anyhow!("Trace consumer task failed: {}", e)),
        }
    }

    /// Stops polling and closes the queue client. Records buffered below the
    /// threshold are discarded uncommitted.
    pub async fn shutdown(mut self) -> Result<CommitStatsSnapshot> {
        let _ = self.shutdown_tx.send(());
        self.wait().await
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

struct BatchWorker<S> {
    source: S,
    store: Arc<dyn TraceStore>,
    namer: PartitionNamer,
    buffer: Vec<TraceRecord>,
    min_batch_size: usize,
    poll_timeout: Duration,
    stats: Arc<CommitStats>,
}

impl<S: TraceSource> BatchWorker<S> {
    fn new(
        source: S,
        store: Arc<dyn TraceStore>,
        namer: PartitionNamer,
        config: &KafkaConsumerConfig,
        stats: Arc<CommitStats>,
    ) -> Self {
        Self {
            source,
            store,
            namer,
            buffer: Vec::with_capacity(config.min_batch_size << 1),
            min_batch_size: config.min_batch_size,
            poll_timeout: config.poll_timeout(),
            stats,
        }
    }

    async fn run(
        mut self,
        topics: Vec<String>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<CommitStatsSnapshot> {
        self.source
            .subscribe(&topics)
            .context("Trace consumer could not subscribe")?;

        let timeout = self.poll_timeout;
        loop {
            let polled = tokio::select! {
                biased;
                _ = shutdown.recv() => break,
                polled = self.source.poll(timeout) => polled,
            };
            self.absorb(polled).await;
        }

        if !self.buffer.is_empty() {
            warn!(
                "Discarding {} uncommitted records on shutdown",
                self.buffer.len()
            );
            self.buffer.clear();
        }
        self.source.close();

        let stats = self.stats.snapshot();
        info!("Trace consumer stopped: {:?}", stats);
        Ok(stats)
    }

    #[cfg(test)]
    async fn poll_once(&mut self) -> StepOutcome {
        let polled = self.source.poll(self.poll_timeout).await;
        self.absorb(polled).await
    }

    /// One cycle after a poll. Never fails: errors drop the buffer.
    async fn absorb(&mut self, polled: Result<Vec<TraceRecord>>) -> StepOutcome {
        match self.buffer_and_flush(polled).await {
            Ok(outcome) => outcome,
            Err(e) => {
                let dropped = self.buffer.len();
                self.buffer.clear();
                self.stats.dropped_batches.fetch_add(1, Ordering::Relaxed);
                self.stats
                    .dropped_records
                    .fetch_add(dropped as u64, Ordering::Relaxed);
                error!(
                    "Trace batch failed, dropped {} uncommitted records: {:#}",
                    dropped, e
                );
                StepOutcome::Dropped(dropped)
            }
        }
    }

    async fn buffer_and_flush(&mut self, polled: Result<Vec<TraceRecord>>) -> Result<StepOutcome> {
        let records = polled?;
        if !records.is_empty() {
            debug!("Buffering {} polled records", records.len());
        }
        self.buffer.extend(records);

        if self.buffer.len() < self.min_batch_size {
            return Ok(StepOutcome::Buffered(self.buffer.len()));
        }

        self.write_buffer().await?;
        self.source.commit()?;

        let size = self.buffer.len();
        info!("========committed size: {} ========", size);
        self.stats.committed_batches.fetch_add(1, Ordering::Relaxed);
        self.stats
            .committed_records
            .fetch_add(size as u64, Ordering::Relaxed);
        self.buffer.clear();

        Ok(StepOutcome::Committed(size))
    }

    /// Stores each buffered record's row pair, in arrival order.
    async fn write_buffer(&self) -> Result<()> {
        for record in &self.buffer {
            let (trace, reverse) = record.to_rows(&self.namer)?;
            self.store
                .insert_trace_and_reverse_index(&trace, &reverse)
                .await
                .with_context(|| format!("Failed to store trace {}", record.trace_id))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tracer_common::{ReverseIndexRow, TraceRow};

    // 2017-05-21T10:37:00Z
    const DAY: &str = "1495363020000";

    fn record(name: &str) -> TraceRecord {
        TraceRecord::new(format!("{}-{}", DAY, name), format!("{}-ctx-{}", DAY, name))
    }

    #[derive(Debug, Default)]
    struct SourceLog {
        subscribed: Vec<String>,
        commits: usize,
        closed: bool,
    }

    /// Ordered writes and commits, shared by a source and a store.
    type Journal = Arc<Mutex<Vec<String>>>;

    struct ScriptedSource {
        script: VecDeque<Result<Vec<TraceRecord>>>,
        log: Arc<Mutex<SourceLog>>,
        journal: Option<Journal>,
        fail_subscribe: bool,
        fail_commit: bool,
    }

    impl ScriptedSource {
        fn new(script: Vec<Result<Vec<TraceRecord>>>) -> (Self, Arc<Mutex<SourceLog>>) {
            let log = Arc::new(Mutex::new(SourceLog::default()));
            let source = Self {
                script: script.into(),
                log: log.clone(),
                journal: None,
                fail_subscribe: false,
                fail_commit: false,
            };
            (source, log)
        }
    }

    #[async_trait]
    impl TraceSource for ScriptedSource {
        fn subscribe(&mut self, topics: &[String]) -> Result<()> {
            if self.fail_subscribe {
                return Err(anyhow::anyhow!("broker unreachable"));
            }
            self.log.lock().unwrap().subscribed = topics.to_vec();
            Ok(())
        }

        async fn poll(&mut self, timeout: Duration) -> Result<Vec<TraceRecord>> {
            match self.script.pop_front() {
                Some(next) => next,
                None => {
                    tokio::time::sleep(timeout).await;
                    Ok(Vec::new())
                }
            }
        }

        fn commit(&mut self) -> Result<()> {
            if self.fail_commit {
                return Err(anyhow::anyhow!("coordinator not available"));
            }
            self.log.lock().unwrap().commits += 1;
            if let Some(journal) = &self.journal {
                journal.lock().unwrap().push("commit".to_string());
            }
            Ok(())
        }

        fn close(&mut self) {
            self.log.lock().unwrap().closed = true;
        }
    }

    /// Stores trace ids in call order; fails the call with index `fail_at`.
    #[derive(Default)]
    struct RecordingStore {
        stored: Mutex<Vec<(TraceRow, ReverseIndexRow)>>,
        calls: AtomicU64,
        fail_at: Option<u64>,
        journal: Option<Journal>,
    }

    impl RecordingStore {
        fn failing_at(call: u64) -> Self {
            Self {
                fail_at: Some(call),
                ..Self::default()
            }
        }

        fn trace_ids(&self) -> Vec<String> {
            self.stored
                .lock()
                .unwrap()
                .iter()
                .map(|(trace, _)| trace.trace_id.clone())
                .collect()
        }
    }

    #[async_trait]
    impl TraceStore for RecordingStore {
        async fn insert_trace_and_reverse_index(
            &self,
            trace: &TraceRow,
            reverse: &ReverseIndexRow,
        ) -> Result<()> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_at == Some(call) {
                return Err(anyhow::anyhow!("write rejected"));
            }
            if let Some(journal) = &self.journal {
                let name = trace.trace_id.rsplit('-').next().unwrap_or_default();
                journal.lock().unwrap().push(format!("w:{}", name));
            }
            self.stored
                .lock()
                .unwrap()
                .push((trace.clone(), reverse.clone()));
            Ok(())
        }
    }

    fn config(min_batch_size: usize) -> KafkaConsumerConfig {
        KafkaConsumerConfig {
            topics: vec!["trace".to_string()],
            min_batch_size,
            poll_timeout_ms: 10,
            ..KafkaConsumerConfig::default()
        }
    }

    fn worker(
        source: ScriptedSource,
        store: Arc<RecordingStore>,
        min_batch_size: usize,
    ) -> BatchWorker<ScriptedSource> {
        BatchWorker::new(
            source,
            store,
            PartitionNamer::default(),
            &config(min_batch_size),
            Arc::new(CommitStats::default()),
        )
    }

    #[tokio::test]
    async fn test_full_batch_is_written_and_committed() {
        let (source, log) = ScriptedSource::new(vec![Ok(vec![record("a"), record("b")])]);
        let store = Arc::new(RecordingStore::default());
        let mut worker = worker(source, store.clone(), 2);

        assert_eq!(worker.poll_once().await, StepOutcome::Committed(2));

        assert_eq!(log.lock().unwrap().commits, 1);
        assert!(worker.buffer.is_empty());

        let stored = store.stored.lock().unwrap();
        assert_eq!(stored.len(), 2);
        let (trace, reverse) = &stored[0];
        assert_eq!(trace.trace_id, format!("{}-a", DAY));
        assert_eq!(trace.table_name, "trace_20170521");
        assert_eq!(reverse.context_id, format!("{}-ctx-a", DAY));
        assert_eq!(reverse.table_name, "reverse_index_20170521");

        let stats = worker.stats.snapshot();
        assert_eq!(stats.committed_batches, 1);
        assert_eq!(stats.committed_records, 2);
    }

    #[tokio::test]
    async fn test_below_threshold_never_flushes() {
        let (source, log) = ScriptedSource::new(vec![Ok(vec![record("a")]), Ok(vec![])]);
        let store = Arc::new(RecordingStore::default());
        let mut worker = worker(source, store.clone(), 2);

        assert_eq!(worker.poll_once().await, StepOutcome::Buffered(1));
        assert_eq!(worker.poll_once().await, StepOutcome::Buffered(1));

        assert_eq!(log.lock().unwrap().commits, 0);
        assert_eq!(store.calls.load(Ordering::SeqCst), 0);
        assert_eq!(worker.buffer.len(), 1);
    }

    #[tokio::test]
    async fn test_batch_spans_polls_in_arrival_order() {
        let (source, log) = ScriptedSource::new(vec![
            Ok(vec![record("a")]),
            Ok(vec![record("b"), record("c")]),
        ]);
        let store = Arc::new(RecordingStore::default());
        let mut worker = worker(source, store.clone(), 2);

        assert_eq!(worker.poll_once().await, StepOutcome::Buffered(1));
        assert_eq!(worker.poll_once().await, StepOutcome::Committed(3));

        assert_eq!(log.lock().unwrap().commits, 1);
        assert_eq!(
            store.trace_ids(),
            vec![
                format!("{}-a", DAY),
                format!("{}-b", DAY),
                format!("{}-c", DAY)
            ]
        );
    }

    #[tokio::test]
    async fn test_store_failure_drops_batch_without_commit() {
        let (source, log) = ScriptedSource::new(vec![
            Ok(vec![record("a"), record("b"), record("c")]),
            Ok(vec![record("d")]),
        ]);
        let store = Arc::new(RecordingStore::failing_at(1));
        let mut worker = worker(source, store.clone(), 2);

        assert_eq!(worker.poll_once().await, StepOutcome::Dropped(3));
        assert_eq!(log.lock().unwrap().commits, 0);
        assert!(worker.buffer.is_empty());
        // the record after the failing one was never attempted
        assert_eq!(store.calls.load(Ordering::SeqCst), 2);

        // next cycle starts from an empty buffer
        assert_eq!(worker.poll_once().await, StepOutcome::Buffered(1));

        let stats = worker.stats.snapshot();
        assert_eq!(stats.dropped_batches, 1);
        assert_eq!(stats.dropped_records, 3);
        assert_eq!(stats.committed_batches, 0);
    }

    #[tokio::test]
    async fn test_poll_error_drops_buffered_records() {
        let (source, log) = ScriptedSource::new(vec![
            Ok(vec![record("a")]),
            Err(anyhow::anyhow!("Failed to deserialize trace node")),
            Ok(vec![record("b")]),
        ]);
        let store = Arc::new(RecordingStore::default());
        let mut worker = worker(source, store.clone(), 2);

        assert_eq!(worker.poll_once().await, StepOutcome::Buffered(1));
        assert_eq!(worker.poll_once().await, StepOutcome::Dropped(1));
        assert_eq!(worker.poll_once().await, StepOutcome::Buffered(1));

        assert_eq!(log.lock().unwrap().commits, 0);
        assert_eq!(store.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_commit_failure_counts_as_dropped() {
        let (mut source, log) = ScriptedSource::new(vec![Ok(vec![record("a"), record("b")])]);
        source.fail_commit = true;
        let store = Arc::new(RecordingStore::default());
        let mut worker = worker(source, store.clone(), 2);

        assert_eq!(worker.poll_once().await, StepOutcome::Dropped(2));

        // rows were written but the offset never moved, so both come back on redelivery
        assert_eq!(store.calls.load(Ordering::SeqCst), 2);
        assert_eq!(log.lock().unwrap().commits, 0);
        assert!(worker.buffer.is_empty());
    }

    #[tokio::test]
    async fn test_unroutable_id_drops_batch() {
        let (source, log) = ScriptedSource::new(vec![Ok(vec![
            TraceRecord::new("no-timestamp", "ctx"),
            record("b"),
        ])]);
        let store = Arc::new(RecordingStore::default());
        let mut worker = worker(source, store.clone(), 2);

        assert_eq!(worker.poll_once().await, StepOutcome::Dropped(2));
        assert_eq!(store.calls.load(Ordering::SeqCst), 0);
        assert_eq!(log.lock().unwrap().commits, 0);
    }

    #[tokio::test]
    async fn test_threshold_follows_config() {
        let (source, log) = ScriptedSource::new(vec![
            Ok(vec![record("a"), record("b")]),
            Ok(vec![record("c")]),
        ]);
        let store = Arc::new(RecordingStore::default());
        let mut worker = worker(source, store.clone(), 3);

        assert_eq!(worker.poll_once().await, StepOutcome::Buffered(2));
        assert_eq!(worker.poll_once().await, StepOutcome::Committed(3));
        assert_eq!(log.lock().unwrap().commits, 1);
    }

    #[tokio::test]
    async fn test_commit_follows_every_write_of_its_batch() {
        let journal: Journal = Arc::default();
        let (mut source, _) = ScriptedSource::new(vec![
            Ok(vec![record("a"), record("b")]),
            Ok(vec![record("c")]),
            Ok(vec![record("d"), record("e")]),
        ]);
        source.journal = Some(journal.clone());
        let store = Arc::new(RecordingStore {
            journal: Some(journal.clone()),
            ..RecordingStore::default()
        });
        let mut worker = worker(source, store, 2);

        assert_eq!(worker.poll_once().await, StepOutcome::Committed(2));
        assert_eq!(worker.poll_once().await, StepOutcome::Buffered(1));
        assert_eq!(worker.poll_once().await, StepOutcome::Committed(3));

        assert_eq!(
            *journal.lock().unwrap(),
            vec!["w:a", "w:b", "commit", "w:c", "w:d", "w:e", "commit"]
        );
    }

    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_commit_logs_batch_size() {
        let logs = CapturedLogs::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let (source, _) =
            ScriptedSource::new(vec![Ok(vec![record("a"), record("b"), record("c")])]);
        let mut worker = worker(source, Arc::new(RecordingStore::default()), 2);
        assert_eq!(worker.poll_once().await, StepOutcome::Committed(3));

        let output = String::from_utf8(logs.0.lock().unwrap().clone()).unwrap();
        assert!(output.contains("committed size: 3"), "{}", output);
    }

    async fn wait_for(log: &Arc<Mutex<SourceLog>>, done: impl Fn(&SourceLog) -> bool) {
        for _ in 0..200 {
            if done(&log.lock().unwrap()) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached: {:?}", log.lock().unwrap());
    }

    #[tokio::test]
    async fn test_start_runs_until_shutdown() {
        let (source, log) = ScriptedSource::new(vec![
            Ok(vec![record("a"), record("b")]),
            Ok(vec![record("c")]),
        ]);
        let store = Arc::new(RecordingStore::default());
        let consumer = TraceConsumer::new(config(2), PartitionNamer::default(), store.clone());

        let handle = consumer.start(source).unwrap();
        assert!(consumer.is_started());

        wait_for(&log, |l| l.commits == 1).await;
        // let the worker pick up the trailing single record
        tokio::time::sleep(Duration::from_millis(30)).await;

        let stats = handle.shutdown().await.unwrap();

        let log = log.lock().unwrap();
        assert_eq!(log.subscribed, vec!["trace".to_string()]);
        assert_eq!(log.commits, 1);
        assert!(log.closed);
        assert_eq!(stats.committed_records, 2);
        assert_eq!(consumer.stats(), stats);
        // "c" stayed below the threshold and was never stored
        assert_eq!(store.trace_ids().len(), 2);
    }

    #[tokio::test]
    async fn test_second_start_is_ignored() {
        let (first, first_log) = ScriptedSource::new(vec![]);
        let (second, second_log) = ScriptedSource::new(vec![Ok(vec![record("a"), record("b")])]);
        let store = Arc::new(RecordingStore::default());
        let consumer = TraceConsumer::new(config(2), PartitionNamer::default(), store.clone());

        let handle = consumer.start(first).unwrap();
        assert!(consumer.start(second).is_none());

        wait_for(&first_log, |l| !l.subscribed.is_empty()).await;
        handle.shutdown().await.unwrap();

        assert!(second_log.lock().unwrap().subscribed.is_empty());
        assert_eq!(second_log.lock().unwrap().commits, 0);
        assert_eq!(store.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_subscribe_failure_is_observable() {
        let (mut source, log) = ScriptedSource::new(vec![]);
        source.fail_subscribe = true;
        let consumer = TraceConsumer::new(
            config(2),
            PartitionNamer::default(),
            Arc::new(RecordingStore::default()),
        );

        let mut handle = consumer.start(source).unwrap();
        let err = handle.wait().await.unwrap_err();

        assert!(err.to_string().contains("could not subscribe"));
        assert!(handle.is_finished());
        assert!(!log.lock().unwrap().closed);
    }
}
