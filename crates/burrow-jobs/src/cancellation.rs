//! Cooperative cancellation

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Flag checked by wait loops between bounded sleeps.
///
/// Cancelling abandons the wait only; the process being waited for keeps
/// running. Clones share the same flag. [`CancellationToken::none`] never
/// reports cancellation.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Option<Arc<AtomicBool>>,
}

impl CancellationToken {
    /// A token that can be cancelled
    pub fn new() -> Self {
        Self {
            flag: Some(Arc::new(AtomicBool::new(false))),
        }
    }

    /// A token that is never cancelled
    pub fn none() -> Self {
        Self { flag: None }
    }

    /// Request cancellation (no-op for [`CancellationToken::none`])
    pub fn cancel(&self) {
        if let Some(flag) = &self.flag {
            flag.store(true, Ordering::Release);
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::Acquire))
    }
}
