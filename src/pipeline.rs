// =============================================================================
// Signal Pipeline: wires every stage together and runs one submission date
// =============================================================================
//
// The pipeline owns the shared pieces (queue, audit log, fetch client) and
// the three stage engines.  A run spawns one worker pool per stage; every
// worker loops on `dequeue_ready` for its stage, processes the unit and hands
// the result back to the queue.  Stage order is enforced by the queue's state
// machine, never by the workers.
//
// Thread safety:
//   - The queue and the rate-limit buckets are behind parking_lot mutexes.
//   - Stage engines are shared read-only via `Arc`.
//   - Workers observe a `watch` channel and stop once the batch is settled.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::NaiveDate;
use futures_util::future::join_all;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::assembler::{SignalAssembler, SignalBatch};
use crate::audit::{AuditCode, AuditLog};
use crate::error::{BatchError, UnitFailure};
use crate::inference::{InferenceBackend, InferenceStage};
use crate::orchestrator::FetchOrchestrator;
use crate::queue::{DateProgress, EnqueueOutcome, EntityWorkQueue, StageOutcome, WorkUnit};
use crate::runtime_config::PipelineConfig;
use crate::sources::fixture::FixtureFetcher;
use crate::sources::{FetchClient, RateLimitRegistry};
use crate::types::Stage;
use crate::verification::{FactChecker, VerificationStage};

/// Summary of one date's run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub as_of: NaiveDate,
    pub progress: DateProgress,
    /// Units answered from an earlier run without redoing any work.
    pub cached: usize,
    pub elapsed_ms: u64,
}

/// State shared by every stage worker.
struct Stages {
    queue: Arc<EntityWorkQueue>,
    audit: Arc<AuditLog>,
    orchestrator: FetchOrchestrator,
    inference: InferenceStage,
    verification: VerificationStage,
}

impl Stages {
    async fn process(&self, stage: Stage, unit: &WorkUnit) -> StageOutcome {
        match stage {
            Stage::Fetch => match self.orchestrator.gather(&unit.key).await {
                Ok(context) => StageOutcome::Fetched(context),
                Err(failure) => StageOutcome::Failed(failure),
            },
            Stage::Infer => {
                let Some(context) = unit.context.as_deref() else {
                    return StageOutcome::Failed(UnitFailure::InvalidOutput {
                        reason: "unit reached inference without a merged context".to_string(),
                    });
                };
                match self.inference.infer(context).await {
                    Ok(result) => StageOutcome::Inferred(result),
                    Err(failure) => StageOutcome::Failed(failure),
                }
            }
            Stage::Verify => {
                let (Some(context), Some(inference)) = (unit.context.as_deref(), unit.inference.as_deref())
                else {
                    return StageOutcome::Failed(UnitFailure::InvalidOutput {
                        reason: "unit reached verification without an inference result".to_string(),
                    });
                };
                let verdict = self.verification.verify(inference, context).await;
                if !verdict.passed() {
                    self.audit.record(
                        &unit.key,
                        Stage::Verify,
                        AuditCode::LowConfidence,
                        format!(
                            "confidence {:.3} below threshold {:.3}",
                            verdict.confidence, verdict.threshold
                        ),
                    );
                }
                StageOutcome::Verified(verdict)
            }
        }
    }
}

/// One stage worker. Runs until the shutdown flag flips.
async fn run_worker(stages: Arc<Stages>, stage: Stage, worker_id: usize, mut shutdown: watch::Receiver<bool>) {
    debug!(stage = %stage, worker_id, "worker started");
    loop {
        if *shutdown.borrow() {
            break;
        }

        let notified = stages.queue.changed();
        tokio::pin!(notified);
        notified.as_mut().enable();

        let Some(unit) = stages.queue.dequeue_ready(stage, Instant::now()) else {
            tokio::select! {
                _ = notified => {}
                res = shutdown.changed() => {
                    if res.is_err() {
                        break;
                    }
                }
            }
            continue;
        };

        let outcome = tokio::select! {
            outcome = stages.process(stage, &unit) => outcome,
            _ = shutdown.changed() => break,
        };

        if let StageOutcome::Failed(failure) = &outcome {
            stages
                .audit
                .record(&unit.key, stage, failure.audit_code(), failure.to_string());
        }
        if !stages.queue.advance(&unit.ticket, outcome) {
            debug!(key = %unit.key, stage = %stage, worker_id, "late result discarded");
        }
    }
    debug!(stage = %stage, worker_id, "worker stopped");
}

pub struct Pipeline {
    config: PipelineConfig,
    client: Arc<FetchClient>,
    stages: Arc<Stages>,
    assembler: SignalAssembler,
}

impl Pipeline {
    /// Build a pipeline over an already-populated fetch client.
    pub fn new(
        config: PipelineConfig,
        client: FetchClient,
        backend: Arc<dyn InferenceBackend>,
        checker: Arc<dyn FactChecker>,
    ) -> Result<Self> {
        config.validate()?;

        let client = Arc::new(client);
        let audit = Arc::new(AuditLog::new(config.audit_capacity));
        let queue = Arc::new(EntityWorkQueue::new(Duration::from_secs(config.urgency_window_secs)));

        for source in &config.sources {
            if !client.has_source(&source.name) {
                warn!(source = %source.name, "configured source has no fetcher; it will always fail");
            }
        }

        let stages = Arc::new(Stages {
            queue: queue.clone(),
            audit: audit.clone(),
            orchestrator: FetchOrchestrator::new(client.clone(), &config, audit.clone()),
            inference: InferenceStage::new(
                backend,
                config.inference_concurrency,
                Duration::from_millis(config.model_timeout_ms),
                config.model_retry,
                (config.score_min, config.score_max),
            ),
            verification: VerificationStage::new(
                checker,
                config.confidence_threshold,
                config.core_claim_weight,
                config.peripheral_claim_weight,
            ),
        });
        let assembler = SignalAssembler::new(queue, audit, &config)?;

        Ok(Self {
            config,
            client,
            stages,
            assembler,
        })
    }

    pub fn queue(&self) -> &Arc<EntityWorkQueue> {
        &self.stages.queue
    }

    pub fn audit(&self) -> &Arc<AuditLog> {
        &self.stages.audit
    }

    pub fn client(&self) -> &Arc<FetchClient> {
        &self.client
    }

    /// Produce the signal batch for `as_of` over `entities`.
    ///
    /// On success the date's units are released.  On failure they are kept,
    /// so a second call only redoes the units that failed.
    pub async fn run_date(
        &self,
        as_of: NaiveDate,
        entities: &[String],
    ) -> Result<(SignalBatch, RunReport), BatchError> {
        let started = Instant::now();
        let deadline = started + Duration::from_secs(self.config.batch_deadline_secs);
        let queue = &self.stages.queue;

        let mut cached = 0;
        for entity in entities {
            match queue.enqueue(entity, as_of, Some(deadline)) {
                EnqueueOutcome::Cached(outcome) => {
                    cached += 1;
                    debug!(entity = %entity, state = %outcome.state(), "reusing finished unit");
                }
                EnqueueOutcome::AlreadyQueued(state) => {
                    debug!(entity = %entity, state = %state, "unit already in flight");
                }
                EnqueueOutcome::Enqueued | EnqueueOutcome::Requeued => {}
            }
        }
        info!(
            as_of = %as_of,
            entities = entities.len(),
            cached,
            deadline_secs = self.config.batch_deadline_secs,
            "run started"
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let pools = [
            (Stage::Fetch, self.config.fetch_workers),
            (Stage::Infer, self.config.inference_workers),
            (Stage::Verify, self.config.verify_workers),
        ];
        let mut handles = Vec::new();
        for (stage, workers) in pools {
            for worker_id in 0..workers.max(1) {
                handles.push(tokio::spawn(run_worker(
                    self.stages.clone(),
                    stage,
                    worker_id,
                    shutdown_rx.clone(),
                )));
            }
        }

        let progress = self.assembler.await_settled(as_of, deadline).await;

        let _ = shutdown_tx.send(true);
        for joined in join_all(handles).await {
            if let Err(e) = joined {
                warn!(error = %e, "stage worker panicked");
            }
        }

        let report = RunReport {
            as_of,
            progress,
            cached,
            elapsed_ms: started.elapsed().as_millis() as u64,
        };
        info!(
            as_of = %as_of,
            total = progress.total,
            complete = progress.complete,
            excluded = progress.excluded,
            failed = progress.failed,
            elapsed_ms = report.elapsed_ms,
            "run settled"
        );

        let batch = self.assembler.assemble(as_of)?;
        let released = queue.release_date(as_of);
        debug!(as_of = %as_of, released, "date released");
        if !queue.is_empty() {
            debug!(remaining = queue.len(), "units of other dates still queued");
        }
        Ok((batch, report))
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("client", &self.client)
            .field("queue", &self.stages.queue)
            .field("audit", &self.stages.audit)
            .field("assembler", &self.assembler)
            .finish()
    }
}

/// Fetch client backed by deterministic fixtures for every configured source.
pub fn fixture_client(config: &PipelineConfig) -> FetchClient {
    config.sources.iter().fold(
        FetchClient::new(RateLimitRegistry::from_sources(&config.sources)),
        |client, source| {
            client.with_fetcher(Arc::new(FixtureFetcher::new(
                source.name.clone(),
                source.kind,
                source.freshness_secs,
            )))
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::MergedContext;
    use crate::inference::{CompositeBackend, ModelError, ModelOutput};
    use crate::verification::ConsistencyChecker;
    use async_trait::async_trait;
    use crate::sources::{FetchError, Fetcher, SourceRecord};
    use crate::types::WorkKey;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 2, 13).unwrap()
    }

    fn entities(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn config() -> PipelineConfig {
        PipelineConfig {
            entities: entities(&["AAPL", "MSFT", "NVDA", "BRK.B"]),
            ..PipelineConfig::default()
        }
    }

    fn checker(config: &PipelineConfig) -> Arc<dyn FactChecker> {
        Arc::new(ConsistencyChecker::new(config.numeric_tolerance, config.min_token_overlap))
    }

    fn pipeline(config: PipelineConfig, backend: Arc<dyn InferenceBackend>) -> Pipeline {
        let client = fixture_client(&config);
        let checker = checker(&config);
        Pipeline::new(config, client, backend, checker).unwrap()
    }

    /// Composite scorer with call counting and scripted failures.
    struct Scripted {
        calls: Mutex<HashMap<String, u32>>,
        /// entity -> number of leading calls that fail
        failures: HashMap<String, u32>,
        /// entities whose claims are all made up
        hallucinate: Vec<String>,
    }

    impl Scripted {
        fn new() -> Self {
            Self {
                calls: Mutex::new(HashMap::new()),
                failures: HashMap::new(),
                hallucinate: Vec::new(),
            }
        }

        fn calls(&self, entity: &str) -> u32 {
            self.calls.lock().get(entity).copied().unwrap_or(0)
        }
    }

    #[async_trait]
    impl InferenceBackend for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn infer(&self, context: &MergedContext) -> Result<ModelOutput, ModelError> {
            let entity = context.key().entity_id.clone();
            let n = {
                let mut calls = self.calls.lock();
                let c = calls.entry(entity.clone()).or_default();
                *c += 1;
                *c
            };
            if n <= self.failures.get(&entity).copied().unwrap_or(0) {
                return Err(ModelError::InvalidOutput("unparseable".into()));
            }
            let mut out = CompositeBackend.infer(context).await?;
            if self.hallucinate.contains(&entity) {
                for claim in &mut out.claims {
                    claim.value = claim.value.map(|v| v * 3.0 + 100.0);
                    claim.text = "record buyback announced by the board".into();
                }
            }
            Ok(out)
        }
    }

    #[tokio::test]
    async fn fixture_run_emits_ranked_batch() {
        let cfg = config();
        let names = cfg.entities.clone();
        let p = pipeline(cfg, Arc::new(CompositeBackend));

        let (batch, report) = p.run_date(date(), &names).await.unwrap();
        assert_eq!(batch.len(), 4);
        assert_eq!(report.progress.complete, 4);
        assert!(batch
            .entries()
            .windows(2)
            .all(|w| w[0].score >= w[1].score));
        assert!(batch.entries().iter().all(|e| (0.0..=1.0).contains(&e.score)));

        // Units are released after a successful emission.
        assert!(p.queue().is_empty());
        let finnhub = p.client().health().into_iter().find(|h| h.source == "finnhub").unwrap();
        assert_eq!(finnhub.requests, 4);
    }

    #[tokio::test]
    async fn low_confidence_unit_is_excluded_not_failed() {
        let cfg = PipelineConfig {
            min_batch_fraction: 0.5,
            ..config()
        };
        let names = cfg.entities.clone();
        let mut backend = Scripted::new();
        backend.hallucinate.push("NVDA".into());
        let p = pipeline(cfg, Arc::new(backend));

        let (batch, report) = p.run_date(date(), &names).await.unwrap();
        assert_eq!(report.progress.excluded, 1);
        assert_eq!(report.progress.failed, 0);
        assert!(batch.entries().iter().all(|e| e.entity_id != "NVDA"));
        assert_eq!(p.audit().count(AuditCode::LowConfidence), 1);
    }

    #[tokio::test]
    async fn failed_run_keeps_finished_units_for_retry() {
        let cfg = PipelineConfig {
            min_batch_fraction: 1.0,
            ..config()
        };
        let names = cfg.entities.clone();
        let mut scripted = Scripted::new();
        scripted.failures.insert("MSFT".into(), 1);
        let backend = Arc::new(scripted);
        let p = pipeline(cfg, backend.clone());

        match p.run_date(date(), &names).await {
            Err(BatchError::IncompleteBatch { valid, total, .. }) => assert_eq!((valid, total), (3, 4)),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(p.audit().count(AuditCode::InvalidOutput), 1);

        // Second run: finished units come from cache, only MSFT is redone.
        let (batch, report) = p.run_date(date(), &names).await.unwrap();
        assert_eq!(batch.len(), 4);
        assert_eq!(report.cached, 3);
        assert_eq!(backend.calls("AAPL"), 1);
        assert_eq!(backend.calls("MSFT"), 2);
    }

    /// Never answers within any reasonable time.
    struct Stalled;

    #[async_trait]
    impl InferenceBackend for Stalled {
        fn name(&self) -> &str {
            "stalled"
        }

        async fn infer(&self, _context: &MergedContext) -> Result<ModelOutput, ModelError> {
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_turns_stragglers_into_incomplete_batch() {
        let cfg = PipelineConfig {
            batch_deadline_secs: 5,
            model_timeout_ms: 600_000,
            ..config()
        };
        let names = cfg.entities.clone();
        let p = pipeline(cfg, Arc::new(Stalled));

        match p.run_date(date(), &names).await {
            Err(BatchError::IncompleteBatch { valid, total, .. }) => assert_eq!((valid, total), (0, 4)),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(p.audit().count(AuditCode::DeadlineExceeded), 4);
        assert_eq!(p.queue().progress(date()).failed, 4);
    }

    /// A source that never answers.
    struct Unreachable {
        name: String,
        calls: AtomicU32,
    }

    #[async_trait]
    impl Fetcher for Unreachable {
        fn name(&self) -> &str {
            &self.name
        }

        async fn fetch(&self, _key: &WorkKey) -> Result<SourceRecord, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(FetchError::unavailable(&self.name, "request timed out"))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn units_complete_when_one_source_keeps_timing_out() {
        let mut cfg = config();
        for source in &mut cfg.sources {
            source.capacity = 100;
        }
        let names = cfg.entities.clone();
        let news = Arc::new(Unreachable {
            name: "news".to_string(),
            calls: AtomicU32::new(0),
        });
        let client = fixture_client(&cfg).with_fetcher(news.clone());
        let checker = checker(&cfg);
        let attempts = cfg.sources.iter().find(|s| s.name == "news").unwrap().retry.attempts();
        let p = Pipeline::new(cfg, client, Arc::new(CompositeBackend), checker).unwrap();

        let (batch, report) = p.run_date(date(), &names).await.unwrap();
        assert_eq!(report.progress.complete, names.len());
        assert_eq!(report.progress.failed, 0);

        let mut emitted: Vec<&str> = batch.entries().iter().map(|e| e.entity_id.as_str()).collect();
        emitted.sort_unstable();
        let mut expected: Vec<&str> = names.iter().map(String::as_str).collect();
        expected.sort_unstable();
        assert_eq!(emitted, expected);

        // One audited failure per unit, after the retry budget ran out.
        assert_eq!(p.audit().count(AuditCode::SourceFailed), names.len());
        assert_eq!(news.calls.load(Ordering::SeqCst), attempts * names.len() as u32);
    }

    #[tokio::test]
    async fn empty_universe_is_an_error() {
        let p = pipeline(config(), Arc::new(CompositeBackend));
        assert!(matches!(
            p.run_date(date(), &[]).await,
            Err(BatchError::Empty { .. })
        ));
    }
}
