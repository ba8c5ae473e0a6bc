//! Run two fallible futures concurrently; the first error cancels the other.
//!
//! Both futures are polled inside the calling task (no detached spawns), and
//! both results are always returned, so callers decide with full knowledge of
//! what happened. A future abandoned because its sibling failed yields
//! [`Error::Cancelled`].

use std::future::Future;

use tokio_util::sync::CancellationToken;

use crate::{Error, Result};

async fn guarded<T>(fut: impl Future<Output = Result<T>>, token: CancellationToken) -> Result<T> {
    tokio::select! {
        biased;
        result = fut => {
            if result.is_err() {
                token.cancel();
            }
            result
        }
        () = token.cancelled() => Err(Error::Cancelled),
    }
}

/// Join `a` and `b` under a child of `parent`. Cancelling `parent` cancels
/// both; an error from either cancels the other.
pub async fn join_cancel_on_error<A, B>(
    parent: &CancellationToken,
    a: impl Future<Output = Result<A>>,
    b: impl Future<Output = Result<B>>,
) -> (Result<A>, Result<B>) {
    let token = parent.child_token();
    tokio::join!(guarded(a, token.clone()), guarded(b, token))
}

/// Like [`join_cancel_on_error`], collapsed to the first real error.
pub async fn try_join_cancel_on_error<A, B>(
    parent: &CancellationToken,
    a: impl Future<Output = Result<A>>,
    b: impl Future<Output = Result<B>>,
) -> Result<(A, B)> {
    match join_cancel_on_error(parent, a, b).await {
        (Ok(a), Ok(b)) => Ok((a, b)),
        (Err(Error::Cancelled), Err(e)) | (Err(e), _) | (_, Err(e)) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn both_succeed() {
        let token = CancellationToken::new();
        let (a, b) = join_cancel_on_error(&token, async { Ok(1) }, async { Ok("two") }).await;
        assert_eq!(a.unwrap(), 1);
        assert_eq!(b.unwrap(), "two");
    }

    #[tokio::test]
    async fn first_error_cancels_sibling() {
        // GIVEN: one fast failing future and one slow future
        let token = CancellationToken::new();
        let slow = async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok::<_, Error>(())
        };
        let failing = async { Err::<(), _>(Error::invalid_argument("bad token")) };

        // WHEN: joined
        let started = std::time::Instant::now();
        let (a, b) = join_cancel_on_error(&token, slow, failing).await;

        // THEN: the slow one was abandoned, both results observed
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(matches!(a, Err(Error::Cancelled)));
        assert!(matches!(b, Err(Error::InvalidArgument(_))));
        // the parent token is untouched
        assert!(!token.is_cancelled());
    }

    #[tokio::test]
    async fn try_join_reports_real_error_not_cancellation() {
        let token = CancellationToken::new();
        let slow = async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok::<_, Error>(())
        };
        let failing = async { Err::<(), _>(Error::internal("storage down")) };
        let err = try_join_cancel_on_error(&token, slow, failing).await.unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
    }

    #[tokio::test]
    async fn parent_cancellation_propagates() {
        let token = CancellationToken::new();
        token.cancel();
        let pending = std::future::pending::<Result<()>>();
        let (a, b) = join_cancel_on_error(&token, pending, std::future::pending::<Result<()>>()).await;
        assert!(matches!(a, Err(Error::Cancelled)));
        assert!(matches!(b, Err(Error::Cancelled)));
    }
}
