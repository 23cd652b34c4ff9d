use audience_core::{AudienceError, AudienceResult, StoreError};
use std::future::Future;
use std::time::Duration;

/// Await a store call, optionally bounded by `limit`, and wrap any
/// failure with the operation name.
pub(crate) async fn bounded<T, F>(
    limit: Option<Duration>,
    op: &'static str,
    call: F,
) -> AudienceResult<T>
where
    F: Future<Output = Result<T, StoreError>>,
{
    let result = match limit {
        Some(limit) => match tokio::time::timeout(limit, call).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(limit)),
        },
        None => call.await,
    };
    result.map_err(|e| AudienceError::store(op, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bounded_times_out_stuck_call() {
        let stuck = std::future::pending::<Result<(), StoreError>>();
        let err = bounded(Some(Duration::from_millis(10)), "fetch_due", stuck)
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert!(err.to_string().contains("fetch_due"));
    }

    #[tokio::test]
    async fn test_bounded_passes_through_results() {
        let value = bounded(None, "all_user_ids", async { Ok::<_, StoreError>(7) })
            .await
            .unwrap();
        assert_eq!(value, 7);

        let err = bounded(None, "delete", async {
            Err::<(), _>(StoreError::SegmentNotFound("beta".into()))
        })
        .await
        .unwrap_err();
        assert!(matches!(err, AudienceError::SegmentNotFound(ref slug) if slug == "beta"));
    }
}
