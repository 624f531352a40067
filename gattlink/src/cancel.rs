use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// The session-wide "quit" signal.
///
/// A clone is handed to every task at launch. Tasks only poll it at coarse
/// boundaries (between the items of an enumeration, before subscribing, per
/// notification) so raising it bounds future work but never interrupts a
/// transport call that's already in flight.
#[derive(Clone, Debug, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Lowers the flag again, ready for the next scan
    pub fn reset(&self) {
        self.cancelled.store(false, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

#[test]
fn shared_between_clones() {
    let token = CancellationToken::new();
    let task_token = token.clone();
    assert!(!task_token.is_cancelled());

    token.cancel();
    assert!(task_token.is_cancelled());

    task_token.reset();
    assert!(!token.is_cancelled());
}
