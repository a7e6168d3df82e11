use std::future::Future;
use std::sync::Mutex;
use tokio::task::JoinHandle;

/// Single slot holding the countdown task of the current item.
///
/// Scheduling a new task aborts the previous one under the same lock, so two
/// item timers never run at once.
#[derive(Default)]
pub struct ItemTimer {
    slot: Mutex<Option<JoinHandle<()>>>,
}

impl ItemTimer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut slot = self.slot();
        if let Some(previous) = slot.take() {
            previous.abort();
        }
        *slot = Some(tokio::spawn(task));
    }

    pub fn cancel(&self) {
        if let Some(previous) = self.slot().take() {
            previous.abort();
        }
    }

    fn slot(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for ItemTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}
