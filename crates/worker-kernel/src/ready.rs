use tokio::sync::watch;

use crate::error::KernelError;

#[derive(Debug, Clone, PartialEq, Eq)]
enum GateState {
    Pending,
    Ready,
    Failed(String),
    Closed,
}

/// One-shot readiness signal every request awaits.
///
/// Leaves `Pending` exactly once, to `Ready` or `Failed`. `close` overrides
/// either and wakes anyone still waiting.
#[derive(Debug)]
pub struct ReadyGate {
    state: watch::Sender<GateState>,
}

impl Default for ReadyGate {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadyGate {
    pub fn new() -> Self {
        let (state, _) = watch::channel(GateState::Pending);
        Self { state }
    }

    pub fn open(&self) {
        self.resolve(GateState::Ready);
    }

    pub fn fail(&self, reason: impl Into<String>) {
        self.resolve(GateState::Failed(reason.into()));
    }

    fn resolve(&self, next: GateState) {
        self.state.send_if_modified(|state| {
            if *state != GateState::Pending {
                return false;
            }
            *state = next;
            true
        });
    }

    pub fn close(&self) {
        self.state.send_replace(GateState::Closed);
    }

    pub fn is_ready(&self) -> bool {
        *self.state.borrow() == GateState::Ready
    }

    pub async fn wait(&self) -> Result<(), KernelError> {
        let mut rx = self.state.subscribe();
        let state = rx
            .wait_for(|state| *state != GateState::Pending)
            .await
            .map_err(|_| KernelError::Disposed)?;
        match &*state {
            GateState::Ready => Ok(()),
            GateState::Failed(reason) => Err(KernelError::StartupFailed(reason.clone())),
            GateState::Closed | GateState::Pending => Err(KernelError::Disposed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_waiters_released_on_open() {
        let gate = Arc::new(ReadyGate::new());
        let waiter = tokio::spawn({
            let gate = gate.clone();
            async move { gate.wait().await }
        });
        tokio::task::yield_now().await;
        assert!(!gate.is_ready());

        gate.open();
        assert_eq!(waiter.await.unwrap(), Ok(()));
        assert!(gate.is_ready());
        // Already open: resolves without waiting
        assert_eq!(gate.wait().now_or_never(), Some(Ok(())));
    }

    #[tokio::test]
    async fn test_resolves_only_once() {
        let gate = ReadyGate::new();
        gate.fail("no interpreter");
        gate.open();
        assert_eq!(
            gate.wait().await,
            Err(KernelError::StartupFailed("no interpreter".to_string()))
        );
    }

    #[tokio::test]
    async fn test_close_wakes_pending_waiters() {
        let gate = Arc::new(ReadyGate::new());
        let waiter = tokio::spawn({
            let gate = gate.clone();
            async move { gate.wait().await }
        });
        tokio::task::yield_now().await;

        gate.close();
        assert_eq!(waiter.await.unwrap(), Err(KernelError::Disposed));
    }

    #[tokio::test]
    async fn test_close_overrides_ready() {
        let gate = ReadyGate::new();
        gate.open();
        gate.close();
        assert!(!gate.is_ready());
        assert_eq!(gate.wait().now_or_never(), Some(Err(KernelError::Disposed)));
    }
}
