use std::time::Duration;
use tokio::sync::watch;

/// Owner side of the cooperative shutdown signal.
pub struct ShutdownTrigger {
    tx: watch::Sender<bool>,
}

/// Cloneable receiver handed to every long-running loop.
///
/// Loops check it at their suspension points and finish the in-flight unit
/// before exiting.
#[derive(Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

pub fn channel() -> (ShutdownTrigger, ShutdownSignal) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTrigger { tx }, ShutdownSignal { rx })
}

impl ShutdownTrigger {
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.tx.subscribe(),
        }
    }
}

impl ShutdownSignal {
    /// A signal that never fires, for one-shot runs and tests.
    pub fn never() -> Self {
        let (tx, rx) = watch::channel(false);
        // Keep the sender alive for the lifetime of the process so `changed`
        // never resolves with an error.
        std::mem::forget(tx);
        Self { rx }
    }

    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once shutdown has been requested.
    pub async fn triggered(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Sleeps for `dur`; returns `true` if shutdown was requested meanwhile.
    pub async fn sleep(&mut self, dur: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(dur) => self.is_triggered(),
            _ = self.triggered() => true,
        }
    }
}
