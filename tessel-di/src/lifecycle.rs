//! Instance lifecycle management

use std::fmt;
use std::sync::Arc;
use tracing::warn;

use crate::error::DiResult;

/// Capability for values that hold resources released on context close
pub trait Disposable: Send + Sync {
    /// Release any resources held by the value
    fn dispose(&self) -> DiResult<()>;
}

/// Deferred disposal of one cached instance
pub(crate) type Disposer = Arc<dyn Fn() -> DiResult<()> + Send + Sync>;

/// Ordered set of pending disposals.
///
/// Disposers run in reverse registration order so that an instance is
/// released before the dependencies it was built from.
#[derive(Default)]
pub struct DisposalQueue {
    disposers: Vec<(String, Disposer)>,
}

impl DisposalQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&mut self, label: impl Into<String>, disposer: Disposer) {
        self.disposers.push((label.into(), disposer));
    }

    /// Add a disposable value
    pub fn add<T: Disposable + 'static>(&mut self, label: impl Into<String>, disposable: Arc<T>) {
        self.push(label, Arc::new(move || disposable.dispose()));
    }

    pub fn len(&self) -> usize {
        self.disposers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.disposers.is_empty()
    }

    /// Run every disposer; the first failure is returned after all have run
    pub fn dispose(&mut self) -> DiResult<()> {
        let mut first_error = None;
        while let Some((label, disposer)) = self.disposers.pop() {
            if let Err(e) = disposer() {
                warn!("Failed to dispose '{}': {}", label, e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

impl Drop for DisposalQueue {
    fn drop(&mut self) {
        // Errors have already been logged
        let _ = self.dispose();
    }
}

impl fmt::Debug for DisposalQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.disposers.iter().map(|(label, _)| label))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DiError;
    use parking_lot::Mutex;

    struct Recorder {
        name: &'static str,
        log: Arc<Mutex<Vec<&'static str>>>,
        fail: bool,
    }

    impl Disposable for Recorder {
        fn dispose(&self) -> DiResult<()> {
            self.log.lock().push(self.name);
            if self.fail {
                Err(DiError::Other(format!("{} refused", self.name)))
            } else {
                Ok(())
            }
        }
    }

    #[test]
    fn test_reverse_order_and_first_error() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut queue = DisposalQueue::new();
        for (name, fail) in [("pool", true), ("cache", false), ("session", true)] {
            queue.add(
                name,
                Arc::new(Recorder {
                    name,
                    log: log.clone(),
                    fail,
                }),
            );
        }

        let err = queue.dispose().unwrap_err();
        assert_eq!(*log.lock(), vec!["session", "cache", "pool"]);
        assert!(err.to_string().contains("session"));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_drop_disposes() {
        let log = Arc::new(Mutex::new(Vec::new()));
        {
            let mut queue = DisposalQueue::new();
            queue.add(
                "socket",
                Arc::new(Recorder {
                    name: "socket",
                    log: log.clone(),
                    fail: false,
                }),
            );
        }
        assert_eq!(*log.lock(), vec!["socket"]);
    }
}
