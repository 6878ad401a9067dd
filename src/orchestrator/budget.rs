//! Cancellation, per-interval deadlines, retries and the inference gate.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};

/// How often a caller waiting on a detached call looks at the cancel flag.
const CANCEL_POLL: Duration = Duration::from_millis(20);

/// Shared cancellation flag. Cloning shares the flag.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(JobCancelled.into());
        }
        Ok(())
    }
}

/// Returned (inside `anyhow::Error`) when a run is cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobCancelled;

impl fmt::Display for JobCancelled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("job cancelled")
    }
}

impl std::error::Error for JobCancelled {}

/// Raised when an interval's time budget runs out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntervalTimedOut;

impl fmt::Display for IntervalTimedOut {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("interval time budget exhausted")
    }
}

impl std::error::Error for IntervalTimedOut {}

#[derive(Clone, Copy, Debug)]
pub struct Deadline {
    at: Instant,
}

impl Deadline {
    pub fn after(budget: Duration) -> Self {
        Self {
            at: Instant::now() + budget,
        }
    }

    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }

    pub fn expired(&self) -> bool {
        Instant::now() >= self.at
    }

    pub fn check(&self) -> Result<()> {
        if self.expired() {
            return Err(IntervalTimedOut.into());
        }
        Ok(())
    }
}

/// Optional single-concurrency guard around detector and embedder calls.
///
/// Clones share the lock, so a detached call thread can hold it.
#[derive(Clone)]
pub struct InferenceGate {
    lock: Option<Arc<Mutex<()>>>,
}

impl InferenceGate {
    pub fn new(serialize: bool) -> Self {
        Self {
            lock: serialize.then(|| Arc::new(Mutex::new(()))),
        }
    }

    pub fn is_serialized(&self) -> bool {
        self.lock.is_some()
    }

    pub fn run<T>(&self, f: impl FnOnce() -> Result<T>) -> Result<T> {
        match &self.lock {
            Some(lock) => {
                // A panicked call leaves nothing behind a `()` lock.
                let _held = lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                f()
            }
            None => f(),
        }
    }
}

/// How an interval failed, recovered from an `anyhow::Error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Cancelled,
    TimedOut,
    Failed,
}

pub fn classify(err: &anyhow::Error) -> FailureKind {
    if err.downcast_ref::<JobCancelled>().is_some() {
        FailureKind::Cancelled
    } else if err.downcast_ref::<IntervalTimedOut>().is_some() {
        FailureKind::TimedOut
    } else {
        FailureKind::Failed
    }
}

/// Everything one interval's fallible calls are checked against.
pub struct CallGuard<'a> {
    pub deadline: Deadline,
    pub cancel: &'a CancelToken,
    pub gate: &'a InferenceGate,
    pub backoff: Duration,
}

impl<'a> CallGuard<'a> {
    /// Cancellation and deadline check for a suspension point.
    pub fn checkpoint(&self) -> Result<()> {
        self.cancel.check()?;
        self.deadline.check()
    }

    /// A decode or other I/O call, retried once.
    pub fn io<T>(&self, what: &str, f: impl FnMut() -> Result<T>) -> Result<T> {
        self.with_retry(what, f)
    }

    /// A detector or embedder call, run through the inference gate and
    /// retried once.
    ///
    /// Each attempt runs on its own thread and is waited on for at most the
    /// remaining budget. A call still running at the deadline is abandoned
    /// and the interval times out; its thread finishes in the background.
    pub fn inference<T, F>(&self, what: &str, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: Fn() -> Result<T> + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        self.with_retry(what, || {
            let f = Arc::clone(&f);
            self.detached(what, move || (*f)())
        })
    }

    fn detached<T: Send + 'static>(
        &self,
        what: &str,
        f: impl FnOnce() -> Result<T> + Send + 'static,
    ) -> Result<T> {
        let (tx, rx) = mpsc::sync_channel(1);
        let gate = self.gate.clone();
        thread::Builder::new()
            .name(format!("call: {}", what))
            .spawn(move || {
                // The receiver is gone when the caller gave up.
                let _ = tx.send(gate.run(f));
            })
            .with_context(|| format!("failed to spawn thread for {}", what))?;
        loop {
            self.cancel.check()?;
            let remaining = self.deadline.remaining();
            if remaining.is_zero() {
                log::warn!("{} still running at the interval deadline; abandoned", what);
                return Err(IntervalTimedOut.into());
            }
            match rx.recv_timeout(remaining.min(CANCEL_POLL)) {
                Ok(result) => return result,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => bail!("{} panicked", what),
            }
        }
    }

    fn with_retry<T>(&self, what: &str, mut f: impl FnMut() -> Result<T>) -> Result<T> {
        self.checkpoint()?;
        let first = match f() {
            Ok(v) => return self.checkpoint().map(|_| v),
            Err(e) => e,
        };
        if classify(&first) != FailureKind::Failed {
            return Err(first);
        }
        if self.deadline.remaining() <= self.backoff {
            return Err(first.context(format!("{} failed with no budget left to retry", what)));
        }
        log::debug!("{} failed, retrying once: {:#}", what, first);
        std::thread::sleep(self.backoff);
        self.checkpoint()?;
        let v = f().map_err(|e| e.context(format!("{} failed twice", what)))?;
        self.checkpoint()?;
        Ok(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use std::sync::atomic::AtomicUsize;

    fn guard<'a>(cancel: &'a CancelToken, gate: &'a InferenceGate, budget: Duration) -> CallGuard<'a> {
        CallGuard {
            deadline: Deadline::after(budget),
            cancel,
            gate,
            backoff: Duration::from_millis(1),
        }
    }

    #[test]
    fn single_failure_is_retried() {
        let cancel = CancelToken::new();
        let gate = InferenceGate::new(true);
        let g = guard(&cancel, &gate, Duration::from_secs(5));
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let v = g
            .inference("detect", move || {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(anyhow!("flaky"))
                } else {
                    Ok(7)
                }
            })
            .unwrap();
        assert_eq!(v, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn hung_call_is_abandoned_at_the_deadline() {
        let cancel = CancelToken::new();
        let gate = InferenceGate::new(true);
        let g = guard(&cancel, &gate, Duration::from_millis(50));
        let started = Instant::now();
        let err = g
            .inference("detect", || {
                thread::sleep(Duration::from_secs(10));
                Ok(())
            })
            .unwrap_err();
        assert_eq!(classify(&err), FailureKind::TimedOut);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn cancel_interrupts_a_running_call() {
        let cancel = CancelToken::new();
        let gate = InferenceGate::new(false);
        let g = guard(&cancel, &gate, Duration::from_secs(30));
        let trigger = cancel.clone();
        let err = g
            .inference("embed", move || {
                trigger.cancel();
                thread::sleep(Duration::from_secs(10));
                Ok(())
            })
            .unwrap_err();
        assert_eq!(classify(&err), FailureKind::Cancelled);
    }

    #[test]
    fn panicking_call_is_an_ordinary_failure() {
        let cancel = CancelToken::new();
        let gate = InferenceGate::new(false);
        let g = guard(&cancel, &gate, Duration::from_secs(5));
        let err = g
            .inference("detect", || -> Result<()> { panic!("backend crashed") })
            .unwrap_err();
        assert_eq!(classify(&err), FailureKind::Failed);
    }

    #[test]
    fn second_failure_is_returned() {
        let cancel = CancelToken::new();
        let gate = InferenceGate::new(false);
        let g = guard(&cancel, &gate, Duration::from_secs(5));
        let err = g.io("decode", || -> Result<()> { Err(anyhow!("broken")) }).unwrap_err();
        assert_eq!(classify(&err), FailureKind::Failed);
    }

    #[test]
    fn cancellation_and_timeout_are_typed() {
        let cancel = CancelToken::new();
        let gate = InferenceGate::new(false);
        cancel.cancel();
        let g = guard(&cancel, &gate, Duration::from_secs(5));
        let err = g.io("decode", || Ok(())).unwrap_err();
        assert_eq!(classify(&err), FailureKind::Cancelled);
        assert!(err.downcast_ref::<JobCancelled>().is_some());

        let fresh = CancelToken::new();
        let g = guard(&fresh, &gate, Duration::ZERO);
        let err = g.io("decode", || Ok(())).unwrap_err();
        assert_eq!(classify(&err), FailureKind::TimedOut);
    }
}
