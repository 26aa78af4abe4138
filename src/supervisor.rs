//! Pairing-timeout supervisor.
//!
//! One timer covers a whole pairing attempt. The session task owns the
//! [`PairingTimer`]; cancelling it (or dropping it) resolves the cancellation
//! token and the watchdog task exits without firing.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::oneshot;

pub struct PairingTimer {
    cancel: Option<oneshot::Sender<()>>,
    deadline: DateTime<Utc>,
}

impl PairingTimer {
    /// Runs `on_expire` once after `window` unless cancelled first.
    pub fn arm<F>(window: Duration, on_expire: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let (cancel_tx, cancel_rx) = oneshot::channel::<()>();
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = cancel_rx => {}
                _ = tokio::time::sleep(window) => on_expire(),
            }
        });
        let deadline = chrono::Duration::from_std(window)
            .ok()
            .and_then(|window| Utc::now().checked_add_signed(window))
            .unwrap_or_else(Utc::now);
        Self {
            cancel: Some(cancel_tx),
            deadline,
        }
    }

    pub fn deadline(&self) -> DateTime<Utc> {
        self.deadline
    }

    pub fn is_armed(&self) -> bool {
        self.cancel.is_some()
    }

    /// Returns true only for the call that actually cancelled the timer.
    pub fn cancel(&mut self) -> bool {
        match self.cancel.take() {
            Some(cancel) => {
                let _ = cancel.send(());
                true
            }
            None => false,
        }
    }
}

impl Drop for PairingTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}
