use tokio_util::sync::CancellationToken;

/// One-way latch that ends a reactor run.
///
/// Cloning shares the latch. Setting it more than once is a no-op and it can
/// never be reset.
#[derive(Clone, Debug, Default)]
pub struct StopSignal {
    token: CancellationToken,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        self.token.cancel();
    }

    pub fn is_set(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Completes once the latch is set.
    pub async fn wait(&self) {
        self.token.cancelled().await
    }
}
