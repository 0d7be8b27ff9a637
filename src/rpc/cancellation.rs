//! Composition of caller cancellation and request expiration

use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Effective cancellation of one request: fires when the caller's token
/// fires or the configured expiration elapses, whichever comes first
///
/// The expiry timer is released when the scope is dropped, so it never
/// outlives the request it belongs to. Cancelling the composed token has no
/// effect on the caller's token.
pub(super) struct ComposedCancellation {
    token: CancellationToken,
    expiry: Option<JoinHandle<()>>,
}

impl ComposedCancellation {
    pub fn new(outer: &CancellationToken, expiration: Option<Duration>) -> Self {
        let token = outer.child_token();

        let expiry = expiration.map(|after| {
            let token = token.clone();
            tokio::spawn(async move {
                tokio::time::sleep(after).await;
                token.cancel();
            })
        });

        Self { token, expiry }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Drop for ComposedCancellation {
    fn drop(&mut self) {
        if let Some(expiry) = self.expiry.take() {
            expiry.abort();
        }
    }
}

#[cfg(test)]
mod does {
    use super::*;

    #[tokio::test]
    async fn follow_the_outer_token() {
        let outer = CancellationToken::new();
        let composed = ComposedCancellation::new(&outer, None);

        assert!(!composed.token().is_cancelled());
        outer.cancel();
        composed.token().cancelled().await;
    }

    #[tokio::test(start_paused = true)]
    async fn fire_when_the_expiration_elapses() {
        let outer = CancellationToken::new();
        let composed = ComposedCancellation::new(&outer, Some(Duration::from_millis(20)));

        composed.token().cancelled().await;
        assert!(!outer.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn leave_the_outer_token_alone() {
        let outer = CancellationToken::new();
        {
            let composed = ComposedCancellation::new(&outer, Some(Duration::from_millis(5)));
            composed.token().cancelled().await;
        }

        assert!(!outer.is_cancelled());
    }
}
