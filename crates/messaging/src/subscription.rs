//! Listener registration handles.

use std::fmt;

type Cancel = Box<dyn FnOnce() + Send + Sync>;

/// Handle for a registered listener.
///
/// The listener stays registered for as long as the handle is alive. Calling
/// [`Subscription::unsubscribe`] or dropping the handle removes it; either way
/// the removal runs exactly once.
#[must_use = "dropping a Subscription removes the listener immediately"]
pub struct Subscription {
    cancel: Option<Cancel>,
}

impl Subscription {
    /// Wrap the removal action of a registered listener.
    pub fn new(cancel: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Remove the listener.
    pub fn unsubscribe(mut self) {
        self.cancel_now();
    }

    fn cancel_now(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel_now();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        std::sync::{
            Arc,
            atomic::{AtomicUsize, Ordering},
        },
    };

    fn counting() -> (Arc<AtomicUsize>, Subscription) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let sub = Subscription::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        (count, sub)
    }

    #[test]
    fn unsubscribe_runs_cancel_once() {
        let (count, sub) = counting();
        sub.unsubscribe();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn drop_runs_cancel() {
        let (count, sub) = counting();
        drop(sub);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
