//! Predicate waits with deadlines.
//!
//! A [`Monitor`] pairs a lock-protected value with a change signal. Writers
//! mutate under the lock and then bump the signal; waiters mark the signal
//! seen, evaluate their predicate under the lock, and only then park on the
//! signal. A mutation can therefore never slip between a check and the park.

use crate::error::{HarnessError, Result};
use parking_lot::Mutex;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// Outcome of one predicate evaluation inside [`Monitor::wait_until`].
pub enum Check<R> {
    /// Condition satisfied, stop waiting.
    Ready(R),
    /// Condition can no longer become true.
    Failed(HarnessError),
    /// Keep waiting.
    Pending,
}

/// Shared state guarded by a lock plus a condition signal.
#[derive(Debug)]
pub struct Monitor<T> {
    state: Mutex<T>,
    version: watch::Sender<u64>,
}

impl<T> Monitor<T> {
    pub fn new(initial: T) -> Self {
        let (version, _) = watch::channel(0);
        Self {
            state: Mutex::new(initial),
            version,
        }
    }

    /// Mutate the state and wake every waiter.
    pub fn update<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let result = {
            let mut state = self.state.lock();
            f(&mut state)
        };
        self.version.send_modify(|v| *v = v.wrapping_add(1));
        result
    }

    /// Read the state without waking anybody.
    pub fn read<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.state.lock())
    }

    /// Wait until `check` returns [`Check::Ready`] or [`Check::Failed`], or
    /// until `timeout` elapses.
    ///
    /// `check` runs under the lock; it may mutate the state (for example to
    /// pop an element off a queue) as part of claiming the result.
    ///
    /// A timeout too large to be represented as a deadline waits forever.
    pub async fn wait_until<R>(
        &self,
        what: &str,
        timeout: Duration,
        check: impl FnMut(&mut T) -> Check<R>,
    ) -> Result<R> {
        let deadline = Instant::now().checked_add(timeout).map(|at| (at, timeout));
        self.wait(what, deadline, check).await
    }

    /// Like [`wait_until`](Self::wait_until) without a deadline, for
    /// background tasks that are cancelled some other way.
    pub(crate) async fn wait_unbounded<R>(
        &self,
        what: &str,
        check: impl FnMut(&mut T) -> Check<R>,
    ) -> Result<R> {
        self.wait(what, None, check).await
    }

    async fn wait<R>(
        &self,
        what: &str,
        deadline: Option<(Instant, Duration)>,
        mut check: impl FnMut(&mut T) -> Check<R>,
    ) -> Result<R> {
        let mut changes = self.version.subscribe();
        loop {
            changes.borrow_and_update();
            let outcome = {
                let mut state = self.state.lock();
                check(&mut state)
            };
            match outcome {
                Check::Ready(value) => return Ok(value),
                Check::Failed(err) => return Err(err),
                Check::Pending => {}
            }
            let changed = match deadline {
                Some((at, timeout)) => match tokio::time::timeout_at(at, changes.changed()).await {
                    Ok(changed) => changed,
                    Err(_) => return Err(HarnessError::timeout(what, timeout)),
                },
                None => changes.changed().await,
            };
            // Sender lives inside self, so this only happens mid-drop.
            if changed.is_err() {
                return Err(HarnessError::usage(format!("{what}: monitor dropped")));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_satisfied_predicate_returns_immediately() {
        let monitor = Monitor::new(5usize);
        let value = monitor
            .wait_until("five", Duration::from_millis(0), |n| {
                if *n >= 5 {
                    Check::Ready(*n)
                } else {
                    Check::Pending
                }
            })
            .await
            .unwrap();
        assert_eq!(value, 5);
    }

    #[tokio::test]
    async fn test_wait_times_out() {
        let monitor = Monitor::new(0usize);
        let err = monitor
            .wait_until("never", Duration::from_millis(20), |_| Check::<()>::Pending)
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert!(err.to_string().contains("never"));
    }

    #[tokio::test]
    async fn test_wakes_on_update() {
        let monitor = Arc::new(Monitor::new(Vec::<u8>::new()));
        let writer = Arc::clone(&monitor);
        tokio::spawn(async move {
            for b in 0..4u8 {
                tokio::time::sleep(Duration::from_millis(5)).await;
                writer.update(|buf| buf.push(b));
            }
        });

        let len = monitor
            .wait_until("four bytes", Duration::from_secs(5), |buf| {
                if buf.len() >= 4 {
                    Check::Ready(buf.len())
                } else {
                    Check::Pending
                }
            })
            .await
            .unwrap();
        assert_eq!(len, 4);
        assert_eq!(monitor.read(|buf| buf.clone()), vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_failed_check_stops_waiting() {
        let monitor = Monitor::new(true);
        let err = monitor
            .wait_until("closed", Duration::from_secs(5), |closed| {
                if *closed {
                    Check::<()>::Failed(HarnessError::IncompleteRequest)
                } else {
                    Check::Pending
                }
            })
            .await
            .unwrap_err();
        assert!(matches!(err, HarnessError::IncompleteRequest));
    }

    #[tokio::test]
    async fn test_check_can_claim_state() {
        let monitor = Monitor::new(vec![1, 2, 3]);
        let first = monitor
            .wait_until("item", Duration::from_millis(10), |items| {
                if items.is_empty() {
                    Check::Pending
                } else {
                    Check::Ready(items.remove(0))
                }
            })
            .await
            .unwrap();
        assert_eq!(first, 1);
        assert_eq!(monitor.read(|items| items.len()), 2);
    }

    #[tokio::test]
    async fn test_unrepresentable_timeout_waits_without_deadline() {
        let monitor = Arc::new(Monitor::new(false));
        let ready = monitor
            .wait_until("ready", Duration::MAX, |_| Check::Ready(()))
            .await;
        assert!(ready.is_ok());

        let writer = Arc::clone(&monitor);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            writer.update(|flag| *flag = true);
        });
        let flag = monitor
            .wait_until("flag", Duration::MAX, |flag| {
                if *flag {
                    Check::Ready(*flag)
                } else {
                    Check::Pending
                }
            })
            .await
            .unwrap();
        assert!(flag);
    }
}
