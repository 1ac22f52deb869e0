//! Pause gate shared by every wait-point of the scan loop

use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Gate that wait-points block on while paused.
///
/// Pausing never interrupts work in flight; it only holds the loop at its
/// next call to [PauseGate::wait_if_paused].
#[derive(Debug)]
pub struct PauseGate {
    tx: watch::Sender<bool>,
}

impl Default for PauseGate {
    fn default() -> Self {
        Self::new()
    }
}

impl PauseGate {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    /// Close the gate. Returns false if it was already closed.
    pub fn pause(&self) -> bool {
        self.tx.send_if_modified(|paused| !std::mem::replace(paused, true))
    }

    /// Open the gate. Returns false if it was already open.
    pub fn resume(&self) -> bool {
        self.tx.send_if_modified(|paused| std::mem::replace(paused, false))
    }

    pub fn is_paused(&self) -> bool {
        *self.tx.borrow()
    }

    /// Block while paused. Returns false if `cancel` fired first.
    pub async fn wait_if_paused(&self, cancel: &CancellationToken) -> bool {
        let mut rx = self.tx.subscribe();
        loop {
            if cancel.is_cancelled() {
                return false;
            }
            if !*rx.borrow_and_update() {
                return true;
            }
            tokio::select! {
                _ = cancel.cancelled() => return false,
                changed = rx.changed() => {
                    if changed.is_err() {
                        return true;
                    }
                }
            }
        }
    }
}

/// Sleep for `total` in `step` increments, honouring cancellation and pause.
///
/// Time spent paused does not count toward `total`. Returns false if cancelled.
pub async fn interruptible_sleep(
    total: Duration,
    step: Duration,
    gate: &PauseGate,
    cancel: &CancellationToken,
) -> bool {
    let step = step.max(Duration::from_millis(1));
    let mut remaining = total;
    while !remaining.is_zero() {
        if !gate.wait_if_paused(cancel).await {
            return false;
        }
        let chunk = remaining.min(step);
        tokio::select! {
            _ = cancel.cancelled() => return false,
            _ = tokio::time::sleep(chunk) => {}
        }
        remaining = remaining.saturating_sub(chunk);
    }
    !cancel.is_cancelled()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Instant;

    #[tokio::test]
    async fn test_pause_and_resume_toggle() {
        let gate = PauseGate::new();
        assert!(!gate.is_paused());
        assert!(gate.pause());
        assert!(!gate.pause());
        assert!(gate.is_paused());
        assert!(gate.resume());
        assert!(!gate.resume());
    }

    #[tokio::test]
    async fn test_wait_blocks_until_resume() {
        let gate = Arc::new(PauseGate::new());
        let cancel = CancellationToken::new();
        gate.pause();

        let waiter = {
            let gate = gate.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { gate.wait_if_paused(&cancel).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        gate.resume();
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn test_cancel_releases_paused_waiter() {
        let gate = Arc::new(PauseGate::new());
        let cancel = CancellationToken::new();
        gate.pause();

        let waiter = {
            let gate = gate.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { gate.wait_if_paused(&cancel).await })
        };
        cancel.cancel();
        assert!(!waiter.await.unwrap());
    }

    #[tokio::test]
    async fn test_sleep_stops_promptly_on_cancel() {
        let gate = PauseGate::new();
        let cancel = CancellationToken::new();
        let started = Instant::now();

        let sleeper = {
            let cancel = cancel.clone();
            async move {
                interruptible_sleep(Duration::from_secs(60), Duration::from_secs(5), &gate, &cancel)
                    .await
            }
        };
        let canceller = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel.cancel();
        };

        let (completed, ()) = tokio::join!(sleeper, canceller);
        assert!(!completed);
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
