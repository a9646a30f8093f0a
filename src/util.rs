use std::{future::Future, time::Duration};

use anyhow::{Context, Result, anyhow};
use tokio::time::timeout;

/// Wraps `tokio::time::timeout`, converting elapsed deadlines and inner errors into contextual
/// `anyhow::Error` values for consistent diagnostics.
pub async fn timeout_with_context<F, T, E>(
    duration: Duration,
    future: F,
    context: impl Into<String>,
) -> Result<T>
where
    F: Future<Output = Result<T, E>>,
    E: std::error::Error + Send + Sync + 'static,
{
    let context = context.into();
    timeout(duration, future)
        .await
        .map_err(|_| anyhow!("timed out {context}"))?
        .with_context(|| format!("failed while {context}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use tokio::time::sleep;

    #[tokio::test]
    async fn passes_through_successful_results() {
        let value = timeout_with_context(
            Duration::from_secs(1),
            async { Ok::<_, io::Error>(7) },
            "computing",
        )
        .await
        .unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn reports_timeout_with_context() {
        let err = timeout_with_context(
            Duration::from_millis(10),
            async {
                sleep(Duration::from_secs(5)).await;
                Ok::<_, io::Error>(())
            },
            "waiting for upstream",
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("timed out waiting for upstream"));
    }

    #[tokio::test]
    async fn wraps_inner_errors_with_context() {
        let err = timeout_with_context(
            Duration::from_secs(1),
            async { Err::<(), _>(io::Error::other("boom")) },
            "reading stream",
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("failed while reading stream"));
    }
}
