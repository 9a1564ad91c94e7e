use tracing::{info, warn};

use chatscan_common::Completeness;

use crate::sources::EntitySource;

/// Outcome of asking a source whether discovery is finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletionCheck {
    pub is_complete: bool,
    pub source_complete: bool,
    pub collected: usize,
    pub expected: Option<usize>,
    pub missing_count: usize,
}

impl CompletionCheck {
    /// Used when no source is left to ask.
    pub fn without_source(collected: usize, expected: Option<usize>) -> Self {
        Self {
            is_complete: false,
            source_complete: false,
            collected,
            expected,
            missing_count: missing(collected, expected),
        }
    }
}

/// Combines a source's own completion claim with its announced total.
#[derive(Debug, Clone, Copy, Default)]
pub struct CompletionController;

impl CompletionController {
    pub fn new() -> Self {
        Self
    }

    /// Failing queries count as "not complete" and "total unknown".
    pub async fn check_completion(
        &self,
        collected: usize,
        source: &mut dyn EntitySource,
    ) -> CompletionCheck {
        let kind = source.kind();
        let source_complete = source.is_complete().await.unwrap_or_else(|err| {
            warn!(source = %kind, error = %err, "Completion query failed");
            false
        });
        let expected = source.total_expected().await.unwrap_or_else(|err| {
            warn!(source = %kind, error = %err, "Total query failed");
            None
        });

        let reached_total = expected.map_or(true, |total| collected >= total);
        let missing_count = missing(collected, expected);

        if source_complete && !reached_total {
            warn!(
                source = %kind,
                collected,
                expected = ?expected,
                missing_count,
                "Source claims completion short of its total"
            );
        } else if missing_count > 0 {
            info!(source = %kind, collected, missing_count, "Chats still missing");
        }

        CompletionCheck {
            is_complete: source_complete && reached_total,
            source_complete,
            collected,
            expected,
            missing_count,
        }
    }

    pub fn determine_completeness_status(
        &self,
        is_complete: bool,
        collected: usize,
        expected: Option<usize>,
    ) -> Completeness {
        let reached_total = expected.map_or(true, |total| collected >= total);
        if is_complete && reached_total {
            Completeness::Complete
        } else {
            Completeness::Partial
        }
    }
}

fn missing(collected: usize, expected: Option<usize>) -> usize {
    expected.map_or(0, |total| total.saturating_sub(collected))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockSource;
    use chatscan_common::SourceKind;

    #[tokio::test]
    async fn complete_when_source_done_and_total_reached() {
        let mut source = MockSource::new(SourceKind::Store).always_complete().total(3);
        let check = CompletionController::new().check_completion(3, &mut source).await;

        assert!(check.is_complete);
        assert_eq!(check.missing_count, 0);
    }

    #[tokio::test]
    async fn premature_claim_is_partial() {
        let mut source = MockSource::new(SourceKind::Store).always_complete().total(10);
        let check = CompletionController::new().check_completion(7, &mut source).await;

        assert!(check.source_complete);
        assert!(!check.is_complete);
        assert_eq!(check.expected, Some(10));
        assert_eq!(check.missing_count, 3);
    }

    #[tokio::test]
    async fn unknown_total_trusts_the_source() {
        let mut source = MockSource::new(SourceKind::Dom).always_complete();
        let check = CompletionController::new().check_completion(42, &mut source).await;
        assert!(check.is_complete);
        assert_eq!(check.expected, None);
    }

    #[tokio::test]
    async fn query_failures_degrade_to_incomplete() {
        let mut source = MockSource::new(SourceKind::Network).failing_queries();
        let check = CompletionController::new().check_completion(5, &mut source).await;

        assert!(!check.is_complete);
        assert!(!check.source_complete);
        assert_eq!(check.expected, None);
    }

    #[test]
    fn status_mapping() {
        let c = CompletionController::new();
        assert_eq!(c.determine_completeness_status(true, 3, Some(3)), Completeness::Complete);
        assert_eq!(c.determine_completeness_status(true, 2, Some(3)), Completeness::Partial);
        assert_eq!(c.determine_completeness_status(false, 3, None), Completeness::Partial);
        assert_eq!(c.determine_completeness_status(true, 0, None), Completeness::Complete);
    }
}
