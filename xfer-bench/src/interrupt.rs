use tokio_util::sync::CancellationToken;

/// Cloneable cancellation flag shared by the units of one run.
///
/// Async waiters park on [`Interrupt::triggered`]; the busy-spin completion
/// loops check [`Interrupt::is_triggered`] between polls.
#[derive(Clone, Debug, Default)]
pub struct Interrupt {
    token: CancellationToken,
}

impl Interrupt {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.token.cancel();
    }

    pub fn is_triggered(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once [`Interrupt::trigger`] has been called on any clone.
    pub async fn triggered(&self) {
        self.token.cancelled().await
    }
}
