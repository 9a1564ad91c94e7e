use futures::{Stream, StreamExt};
use serde_json::json;
use tracing::info;

use chatscan_common::{
    Anomaly, CanonicalEntity, Completeness, Metadata, ParsingResult, SourceKind,
};

use crate::completion::CompletionCheck;

/// Marker key present only on intermediate results.
pub const STREAMING_KEY: &str = "streaming";

/// Accumulates batches into advisory intermediate results.
#[derive(Debug)]
pub struct IntermediatePublisher {
    source_type: SourceKind,
    degraded: bool,
    expected: Option<usize>,
    entities: Vec<CanonicalEntity>,
    batch_index: usize,
}

impl IntermediatePublisher {
    pub fn new(source_type: SourceKind, degraded: bool, expected: Option<usize>) -> Self {
        Self {
            source_type,
            degraded,
            expected,
            entities: Vec::new(),
            batch_index: 0,
        }
    }

    /// Attribute later batches to a different source. Accumulated entities stay.
    pub fn switch_source(&mut self, source_type: SourceKind, degraded: bool, expected: Option<usize>) {
        self.source_type = source_type;
        self.degraded = degraded;
        self.expected = expected;
    }

    /// Fold one batch in and publish the running total. Completeness is
    /// provisional: complete as soon as a known total is reached.
    pub fn publish_batch(&mut self, batch: Vec<CanonicalEntity>) -> ParsingResult {
        self.batch_index += 1;
        let batch_size = batch.len();
        self.entities.extend(batch);

        let completeness = match self.expected {
            Some(total) if self.entities.len() >= total => Completeness::Complete,
            _ => Completeness::Partial,
        };

        let mut result = ParsingResult::new(
            self.entities.clone(),
            completeness,
            self.expected,
            self.source_type,
            self.degraded,
        );
        result.metadata.insert(STREAMING_KEY.into(), json!(true));
        result.metadata.insert("batch_index".into(), json!(self.batch_index));
        result.metadata.insert("batch_size".into(), json!(batch_size));
        result
    }
}

/// One intermediate result per input batch.
pub fn publish_stream<S>(
    batches: S,
    source_type: SourceKind,
    degraded: bool,
    expected: Option<usize>,
) -> impl Stream<Item = ParsingResult>
where
    S: Stream<Item = Vec<CanonicalEntity>>,
{
    let mut publisher = IntermediatePublisher::new(source_type, degraded, expected);
    batches.map(move |batch| publisher.publish_batch(batch))
}

/// Assembles terminal results.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResultPublisher;

impl ResultPublisher {
    pub fn new() -> Self {
        Self
    }

    pub fn publish_final(
        &self,
        entities: Vec<CanonicalEntity>,
        check: &CompletionCheck,
        source_type: SourceKind,
        degraded: bool,
        anomalies: Vec<Anomaly>,
        metadata: Metadata,
    ) -> ParsingResult {
        let completeness = if check.is_complete {
            Completeness::Complete
        } else {
            Completeness::Partial
        };
        let mut result =
            ParsingResult::new(entities, completeness, check.expected, source_type, degraded);
        result.anomalies = anomalies;
        result.metadata = metadata;

        info!(
            source = %result.source_type,
            degraded = result.source_degraded,
            completeness = %result.completeness,
            collected = result.collected,
            expected = ?result.expected,
            missing = result.missing_count,
            anomalies = result.anomalies.len(),
            "Published final chat list"
        );
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatscan_common::{EntityType, Integrity};

    fn entity(id: &str) -> CanonicalEntity {
        CanonicalEntity {
            id: id.to_string(),
            entity_type: EntityType::Personal,
            source: SourceKind::Network,
            integrity: Integrity::Verified,
            name: None,
            avatar: None,
            unread_count: 0,
            raw_data: Metadata::new(),
        }
    }

    #[tokio::test]
    async fn stream_accumulates_and_turns_complete_at_total() {
        let batches = futures::stream::iter(vec![
            vec![entity("1@c.us"), entity("2@c.us")],
            vec![entity("3@c.us")],
        ]);
        let results: Vec<_> = publish_stream(batches, SourceKind::Network, true, Some(3))
            .collect()
            .await;

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].collected, 2);
        assert_eq!(results[0].completeness, Completeness::Partial);
        assert_eq!(results[0].missing_count, 1);
        assert_eq!(results[1].collected, 3);
        assert_eq!(results[1].completeness, Completeness::Complete);
        assert_eq!(results[1].metadata[STREAMING_KEY], true);
        assert_eq!(results[1].metadata["batch_index"], 2);
        assert_eq!(results[1].metadata["batch_size"], 1);
        assert!(results.iter().all(|r| r.anomalies.is_empty() && r.source_degraded));
    }

    #[test]
    fn unknown_total_stays_partial() {
        let mut publisher = IntermediatePublisher::new(SourceKind::Dom, true, None);
        let result = publisher.publish_batch(vec![entity("a")]);
        assert_eq!(result.completeness, Completeness::Partial);
    }

    #[test]
    fn final_result_follows_the_check() {
        let check = CompletionCheck {
            is_complete: false,
            source_complete: true,
            collected: 1,
            expected: Some(4),
            missing_count: 3,
        };
        let anomalies = vec![Anomaly::ParsingError { error: "x".into() }];
        let result = ResultPublisher::new().publish_final(
            vec![entity("a")],
            &check,
            SourceKind::Store,
            false,
            anomalies,
            Metadata::new(),
        );

        assert_eq!(result.completeness, Completeness::Partial);
        assert_eq!(result.missing_count, 3);
        assert!(result.has_anomaly("parsing_error"));
        assert!(!result.metadata.contains_key(STREAMING_KEY));
    }
}
