//! Process-wide serialization of external enforcement changes
//!
//! Every dump-merge-restore cycle and every filter define/undefine runs while
//! holding [`acquire`]. The lock is taken only by the lowest-level mutators
//! and is never held while acquiring it again.

use std::sync::LazyLock;
use tokio::sync::{Mutex, MutexGuard};

static GATE: LazyLock<Mutex<()>> = LazyLock::new(|| Mutex::new(()));

/// Waits for exclusive access to the host's enforcement state.
///
/// Callers queue in FIFO order. No timeout is applied.
pub async fn acquire() -> MutexGuard<'static, ()> {
    GATE.lock().await
}
