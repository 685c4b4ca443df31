use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

/// Ephemeral set of sessions whose finalize routine is running.
///
/// Not persisted: a restart forgets in-flight work, and the poll snapshot's
/// `processing` flag follows this set rather than the stored status.
#[derive(Debug, Clone, Default)]
pub struct ProcessingRegistry {
    inner: Arc<Mutex<HashSet<String>>>,
}

impl ProcessingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks `session_id` as processing; `None` when a routine already runs for it.
    pub fn begin(&self, session_id: &str) -> Option<ProcessingGuard> {
        let inserted = self.lock().insert(session_id.to_string());
        inserted.then(|| ProcessingGuard {
            registry: self.clone(),
            session_id: session_id.to_string(),
        })
    }

    pub fn is_processing(&self, session_id: &str) -> bool {
        self.lock().contains(session_id)
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<String>> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Clears the processing mark when dropped.
#[derive(Debug)]
pub struct ProcessingGuard {
    registry: ProcessingRegistry,
    session_id: String,
}

impl Drop for ProcessingGuard {
    fn drop(&mut self) {
        self.registry.lock().remove(&self.session_id);
    }
}
