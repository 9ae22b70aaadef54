// Cooperative cancellation tokens
//
// Every parser invocation gets a child of the queue's root token with its own
// deadline. Cancelling a parent cancels every child; deadlines only narrow.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{MediaError, Result};

const SLEEP_SLICE: Duration = Duration::from_millis(25);

#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    parent: Option<Box<CancelToken>>,
    deadline: Option<Instant>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// A token cancelled together with `self`, or on its own.
    pub fn child(&self) -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            parent: Some(Box::new(self.clone())),
            deadline: self.deadline,
        }
    }

    /// A child token that also expires after `timeout`.
    pub fn child_with_timeout(&self, timeout: Duration) -> Self {
        let mut child = self.child();
        let candidate = Instant::now() + timeout;
        child.deadline = Some(match self.deadline {
            Some(existing) if existing < candidate => existing,
            _ => candidate,
        });
        child
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        if self.flag.load(Ordering::SeqCst) {
            return true;
        }
        match &self.parent {
            Some(parent) => parent.is_cancelled(),
            None => false,
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_expired(&self) -> bool {
        self.deadline.map(|d| Instant::now() >= d).unwrap_or(false)
    }

    /// Err(Cancelled) or Err(DeadlineExceeded) once the token is done.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(MediaError::Cancelled);
        }
        if self.is_expired() {
            return Err(MediaError::DeadlineExceeded);
        }
        Ok(())
    }

    /// Sleep up to `duration`, waking early on cancellation.
    /// Returns false if the token was cancelled.
    pub fn sleep(&self, duration: Duration) -> bool {
        let until = Instant::now() + duration;
        loop {
            if self.is_cancelled() {
                return false;
            }
            let now = Instant::now();
            if now >= until {
                return true;
            }
            std::thread::sleep(SLEEP_SLICE.min(until - now));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parent_cancels_child() {
        let root = CancelToken::new();
        let child = root.child();
        let grandchild = child.child_with_timeout(Duration::from_secs(60));
        assert!(grandchild.check().is_ok());

        root.cancel();
        assert!(child.is_cancelled());
        assert!(matches!(grandchild.check(), Err(MediaError::Cancelled)));
    }

    #[test]
    fn test_child_cancel_does_not_touch_parent() {
        let root = CancelToken::new();
        let child = root.child();
        child.cancel();
        assert!(!root.is_cancelled());
    }

    #[test]
    fn test_deadline() {
        let token = CancelToken::new().child_with_timeout(Duration::from_millis(1));
        std::thread::sleep(Duration::from_millis(5));
        assert!(matches!(token.check(), Err(MediaError::DeadlineExceeded)));
    }

    #[test]
    fn test_deadlines_only_narrow() {
        let short = CancelToken::new().child_with_timeout(Duration::from_millis(10));
        let long = short.child_with_timeout(Duration::from_secs(60));
        assert_eq!(long.deadline(), short.deadline());
    }

    #[test]
    fn test_sleep_wakes_on_cancel() {
        let token = CancelToken::new();
        let other = token.clone();
        let handle = std::thread::spawn(move || other.sleep(Duration::from_secs(30)));
        std::thread::sleep(Duration::from_millis(50));
        token.cancel();
        assert!(!handle.join().unwrap());
    }
}
