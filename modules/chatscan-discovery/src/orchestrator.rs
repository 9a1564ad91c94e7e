// Drives one discovery run end to end.
//
// select source -> batch loop (normalize, dedupe, stream) -> DOM fallback
// when network interception came back empty -> completion check, anomaly
// audit -> terminal result -> cleanup.
//
// Every run yields exactly one terminal result, even when it fails; errors
// never escape the stream.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_stream::stream;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use futures::StreamExt;
use serde_json::{json, Value};
use tracing::{error, info, warn};
use uuid::Uuid;

use chatscan_common::{
    Anomaly, ChatScanError, Completeness, DiscoveryConfig, Metadata, ParsingResult, Result,
    SourceKind,
};

use crate::completion::{CompletionCheck, CompletionController};
use crate::identity::IdentityResolver;
use crate::normalizer::EntityNormalizer;
use crate::page::ChatPage;
use crate::publisher::{IntermediatePublisher, ResultPublisher};
use crate::selector::SourceSelector;
use crate::session::SessionRegistry;
use crate::sources::{EntitySource, PageSourceFactory, SourceFactory};
use crate::stats::DiscoveryStats;
use crate::working_set::WorkingSet;

#[derive(Clone)]
pub struct Orchestrator {
    config: DiscoveryConfig,
    cancel: Arc<AtomicBool>,
}

impl Orchestrator {
    pub fn new(config: DiscoveryConfig) -> Self {
        Self {
            config,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Share a cancellation flag. Setting it ends the run after the current
    /// batch with a partial terminal result.
    pub fn with_cancel_flag(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    /// Stream intermediate results for `page`; the last item is terminal.
    pub fn parse_entities_streaming(&self, page: Arc<dyn ChatPage>) -> BoxStream<'static, ParsingResult> {
        let factory = PageSourceFactory::new(page, self.config.clone());
        self.stream_with(Arc::new(factory))
    }

    /// Run to completion and return only the terminal result.
    pub async fn parse_entities(&self, page: Arc<dyn ChatPage>) -> ParsingResult {
        last_result(self.parse_entities_streaming(page)).await
    }

    /// Same as [`Orchestrator::parse_entities_streaming`] for a registered
    /// session. Runs on one session are serialized.
    pub fn parse_session_streaming(
        &self,
        registry: SessionRegistry,
        session_id: String,
    ) -> BoxStream<'static, ParsingResult> {
        let orchestrator = self.clone();
        Box::pin(stream! {
            let lease = match registry.lease(&session_id).await {
                Ok(lease) => lease,
                Err(err) => {
                    yield failure_result(&err, Vec::new(), SourceKind::Unknown, true, None, Metadata::new());
                    return;
                }
            };
            info!(session = session_id.as_str(), "Session leased for discovery");
            let mut results = orchestrator.parse_entities_streaming(lease.page());
            while let Some(result) = results.next().await {
                yield result;
            }
            drop(lease);
        })
    }

    /// Stream a run whose sources come from `factory`.
    pub fn stream_with(&self, factory: Arc<dyn SourceFactory>) -> BoxStream<'static, ParsingResult> {
        let mut run = DiscoveryRun::new(factory, self.config.clone(), self.cancel.clone());
        Box::pin(stream! {
            if let Err(err) = run.start().await {
                yield run.fail(err).await;
                return;
            }
            loop {
                match run.next_result().await {
                    Ok(Some(result)) => yield result,
                    Ok(None) => break,
                    Err(err) => {
                        yield run.fail(err).await;
                        return;
                    }
                }
            }
            yield run.finish().await;
        })
    }
}

/// Drain a result stream, keeping the terminal item.
pub async fn last_result(mut results: BoxStream<'static, ParsingResult>) -> ParsingResult {
    let mut last = None;
    while let Some(result) = results.next().await {
        last = Some(result);
    }
    last.unwrap_or_else(|| {
        let err = ChatScanError::RunFailure("discovery ended without a result".to_string());
        failure_result(&err, Vec::new(), SourceKind::Unknown, true, None, Metadata::new())
    })
}

fn failure_result(
    err: &ChatScanError,
    entities: Vec<chatscan_common::CanonicalEntity>,
    source_type: SourceKind,
    degraded: bool,
    expected: Option<usize>,
    source_metadata: Metadata,
) -> ParsingResult {
    let mut result = ParsingResult::new(entities, Completeness::Partial, expected, source_type, degraded);
    result.anomalies.push(Anomaly::ParsingError {
        error: err.to_string(),
    });
    result.metadata.insert("error".into(), json!(true));
    result.metadata.insert("error_message".into(), json!(err.to_string()));
    result
        .metadata
        .insert("source_metadata".into(), Value::Object(source_metadata));
    result
        .metadata
        .insert("parsing_timestamp".into(), json!(Utc::now().to_rfc3339()));
    result
}

/// State of one run. Owned by the stream; never shared.
struct DiscoveryRun {
    factory: Arc<dyn SourceFactory>,
    config: DiscoveryConfig,
    cancel: Arc<AtomicBool>,
    run_id: Uuid,
    started_at: DateTime<Utc>,

    resolver: IdentityResolver,
    normalizer: EntityNormalizer,
    controller: CompletionController,
    publisher: IntermediatePublisher,

    active: Option<Box<dyn EntitySource>>,
    retired: Vec<Box<dyn EntitySource>>,
    source_type: SourceKind,
    degraded: bool,
    expected: Option<usize>,
    selection: Metadata,
    fallback: Option<Value>,

    working_set: WorkingSet,
    iterations: u32,
    exhausted: bool,
    cancelled: bool,
    stats: DiscoveryStats,
}

impl DiscoveryRun {
    fn new(factory: Arc<dyn SourceFactory>, config: DiscoveryConfig, cancel: Arc<AtomicBool>) -> Self {
        Self {
            factory,
            config,
            cancel,
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            resolver: IdentityResolver::new(),
            normalizer: EntityNormalizer::new(),
            controller: CompletionController::new(),
            publisher: IntermediatePublisher::new(SourceKind::Unknown, true, None),
            active: None,
            retired: Vec::new(),
            source_type: SourceKind::Unknown,
            degraded: true,
            expected: None,
            selection: Metadata::new(),
            fallback: None,
            working_set: WorkingSet::new(),
            iterations: 0,
            exhausted: false,
            cancelled: false,
            stats: DiscoveryStats::default(),
        }
    }

    async fn start(&mut self) -> Result<()> {
        info!(run_id = %self.run_id, "Chat discovery started");
        let selected = SourceSelector::new(self.factory.as_ref()).select_source().await?;
        let mut source = selected.source;

        self.source_type = source.kind();
        self.degraded = selected.degraded;
        self.selection = selected.metadata;
        self.expected = expected_total(source.as_mut()).await;
        self.publisher = IntermediatePublisher::new(self.source_type, self.degraded, self.expected);
        self.active = Some(source);

        info!(
            run_id = %self.run_id,
            source = %self.source_type,
            degraded = self.degraded,
            expected = ?self.expected,
            "Collecting chats"
        );
        Ok(())
    }

    /// Run batches until one contributes new chats (`Some`) or every source
    /// is finished (`None`).
    async fn next_result(&mut self) -> Result<Option<ParsingResult>> {
        loop {
            if self.cancel.load(Ordering::SeqCst) {
                if !self.cancelled {
                    warn!(run_id = %self.run_id, collected = self.working_set.len(), "Discovery cancelled");
                }
                self.cancelled = true;
                return Ok(None);
            }

            if self.exhausted {
                if self.engage_dom_fallback().await {
                    continue;
                }
                return Ok(None);
            }

            let Some(source) = self.active.as_mut() else {
                return Ok(None);
            };
            let kind = source.kind();

            if self.iterations >= self.config.max_batch_iterations {
                warn!(source = %kind, iterations = self.iterations, "Batch iteration ceiling reached");
                self.exhausted = true;
                continue;
            }
            self.iterations += 1;
            self.stats.batches += 1;

            let (raws, failed) = match source.fetch_batch().await {
                Ok(raws) => (raws, false),
                Err(ChatScanError::Extraction(message)) => {
                    warn!(source = %kind, batch = self.iterations, error = message.as_str(), "Batch failed, skipping");
                    self.stats.batch_errors += 1;
                    (Vec::new(), true)
                }
                Err(err) => return Err(err),
            };
            let fetched = raws.len();

            let batch = self.normalizer.normalize_batch(raws, &self.resolver);
            self.stats.raw_entities += fetched;
            self.stats.dropped_entities += batch.dropped;
            self.stats.normalized_entities += batch.entities.len();
            let fresh = self.working_set.extend(batch.entities);

            let complete = source.is_complete().await.unwrap_or_else(|err| {
                warn!(source = %kind, error = %err, "Completion query failed");
                false
            });
            if complete || (fetched == 0 && !failed && kind != SourceKind::Dom) {
                self.exhausted = true;
            }

            if !fresh.is_empty() {
                return Ok(Some(self.publisher.publish_batch(fresh)));
            }
        }
    }

    /// Swap in the DOM source when network interception produced nothing.
    /// Runs at most once per run.
    async fn engage_dom_fallback(&mut self) -> bool {
        if self.fallback.is_some()
            || self.source_type != SourceKind::Network
            || !self.working_set.is_empty()
        {
            return false;
        }
        warn!(run_id = %self.run_id, "Network interception found no chats, falling back to DOM");

        let Some(mut dom) = self.factory.create(SourceKind::Dom) else {
            self.fallback = Some(json!({ "attempted": true, "succeeded": false, "error": "dom source not available" }));
            return false;
        };

        if let Err(err) = dom.init().await {
            warn!(error = %err, "DOM fallback failed");
            self.fallback = Some(json!({ "attempted": true, "succeeded": false, "error": err.to_string() }));
            dom.cleanup().await;
            return false;
        }

        if let Some(previous) = self.active.take() {
            self.retired.push(previous);
        }
        self.source_type = SourceKind::Dom;
        self.degraded = true;
        self.expected = expected_total(dom.as_mut()).await;
        self.publisher.switch_source(self.source_type, self.degraded, self.expected);
        self.active = Some(dom);
        self.iterations = 0;
        self.exhausted = false;
        self.fallback = Some(json!({ "attempted": true, "succeeded": true }));
        true
    }

    async fn finish(&mut self) -> ParsingResult {
        let collected = self.working_set.len();
        let mut check = match self.active.as_mut() {
            Some(source) => self.controller.check_completion(collected, source.as_mut()).await,
            None => CompletionCheck::without_source(collected, self.expected),
        };
        if self.cancelled {
            check.is_complete = false;
        }
        if check.expected.is_some() {
            self.expected = check.expected;
        }
        let completion_reason = self.active.as_ref().and_then(|s| s.completion_reason());

        let mut anomalies = self.resolver.detect_ambiguities(self.working_set.observations());
        let (unique, duplicate_ids) = self.resolver.validate_uniqueness(self.working_set.observations());
        if !unique {
            anomalies.push(Anomaly::DuplicateIds {
                count: duplicate_ids.len(),
                duplicate_ids,
            });
        }

        self.cleanup().await;

        self.stats.repeated_observations = self.working_set.repeated_observations();
        self.stats.published_entities = collected;
        self.stats.anomalies = anomalies.len();
        info!(run_id = %self.run_id, "{}", self.stats);

        let mut metadata = self.base_metadata();
        metadata.insert("source_complete".into(), json!(check.source_complete));
        metadata.insert("completion_reason".into(), json!(completion_reason));
        metadata.insert("batch_count".into(), json!(self.stats.batches));
        metadata.insert("batch_errors".into(), json!(self.stats.batch_errors));
        metadata.insert("raw_entities_count".into(), json!(self.stats.raw_entities));
        metadata.insert("normalized_entities_count".into(), json!(self.stats.normalized_entities));
        metadata.insert("dropped_entities_count".into(), json!(self.stats.dropped_entities));
        metadata.insert("repeated_observations_count".into(), json!(self.stats.repeated_observations));
        metadata.insert("anomalies_count".into(), json!(anomalies.len()));

        ResultPublisher::new().publish_final(
            self.working_set.entities().to_vec(),
            &check,
            self.source_type,
            self.degraded,
            anomalies,
            metadata,
        )
    }

    async fn fail(&mut self, err: ChatScanError) -> ParsingResult {
        error!(run_id = %self.run_id, error = %err, "Chat discovery failed");
        let source_metadata = match &err {
            ChatScanError::AllSourcesUnavailable { selection, .. } => selection.clone(),
            _ => self.selection.clone(),
        };
        self.cleanup().await;

        let mut result = failure_result(
            &err,
            self.working_set.entities().to_vec(),
            self.source_type,
            self.degraded || self.source_type.is_degraded(),
            self.expected,
            source_metadata,
        );
        for (key, value) in self.base_metadata() {
            if key != "source_metadata" {
                result.metadata.insert(key, value);
            }
        }
        result
    }

    fn base_metadata(&self) -> Metadata {
        let mut metadata = Metadata::new();
        metadata.insert("run_id".into(), json!(self.run_id.to_string()));
        metadata.insert("source_metadata".into(), Value::Object(self.selection.clone()));
        metadata.insert("fallback".into(), self.fallback.clone().unwrap_or(Value::Null));
        metadata.insert("cancelled".into(), json!(self.cancelled));
        metadata.insert("started_at".into(), json!(self.started_at.to_rfc3339()));
        metadata.insert("parsing_timestamp".into(), json!(Utc::now().to_rfc3339()));
        metadata
    }

    /// Release every source this run touched, once.
    async fn cleanup(&mut self) {
        for mut source in self.retired.drain(..).chain(self.active.take()) {
            source.cleanup().await;
        }
    }
}

async fn expected_total(source: &mut dyn EntitySource) -> Option<usize> {
    let kind = source.kind();
    source.total_expected().await.unwrap_or_else(|err| {
        warn!(source = %kind, error = %err, "Total query failed");
        None
    })
}
