use tokio::sync::watch;

/// One-way latch the host opens once audio may start.
///
/// Models the user gesture that unlocks audio output. Clones share the latch.
#[derive(Debug, Clone)]
pub struct AuthorizationGate {
    tx: watch::Sender<bool>,
}

impl AuthorizationGate {
    /// A closed gate.
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    /// A gate that is already open, for hosts without a gesture requirement.
    pub fn open() -> Self {
        let gate = Self::new();
        gate.authorize();
        gate
    }

    pub fn authorize(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_authorized(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once the gate has been opened.
    pub async fn authorized(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so the channel cannot close while waiting.
        let _ = rx.wait_for(|open| *open).await;
    }
}

impl Default for AuthorizationGate {
    fn default() -> Self {
        Self::new()
    }
}
