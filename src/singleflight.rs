//! In-flight query deduplication: concurrent identical questions share
//! one upstream resolution

use crate::dns::message::Message;
use crate::error::ResolveError;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::debug;

/// Flights older than this are forgotten by the sweeper so a hung call
/// cannot pin waiters forever.
pub const STUCK_AFTER: Duration = Duration::from_secs(15);

/// Sweep cadence.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// The shared outcome of one upstream resolution.
pub type FlightResult = Result<Arc<Message>, ResolveError>;

struct Flight {
    tx: broadcast::Sender<FlightResult>,
    started: Instant,
}

struct WaiterGuard<'a> {
    sf: &'a SingleFlight,
    key: u64,
    armed: bool,
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.sf.forget(self.key);
        }
    }
}

/// Coalesces concurrent calls sharing a key into a single execution.
pub struct SingleFlight {
    calls: Mutex<HashMap<u64, Flight>>,
}

impl SingleFlight {
    pub fn new() -> Self {
        SingleFlight {
            calls: Mutex::new(HashMap::new()),
        }
    }

    /// Run `work` once per live `key`; every concurrent caller receives
    /// the same result. A caller whose `deadline` passes while waiting
    /// forgets the key and errors out; the executing task keeps running
    /// until its own deadline and still feeds earlier waiters.
    pub async fn timed_do<F, Fut>(
        self: &Arc<Self>,
        key: u64,
        deadline: Instant,
        work: F,
    ) -> FlightResult
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Message, ResolveError>> + Send + 'static,
    {
        let mut rx = {
            let mut calls = self.calls.lock();
            if let Some(flight) = calls.get(&key) {
                flight.tx.subscribe()
            } else {
                let (tx, rx) = broadcast::channel(1);
                calls.insert(
                    key,
                    Flight {
                        tx: tx.clone(),
                        started: Instant::now(),
                    },
                );
                drop(calls);

                let sf = self.clone();
                let fut = work();
                tokio::spawn(async move {
                    let result = fut.await.map(Arc::new);
                    sf.forget(key);
                    let _ = tx.send(result);
                });
                rx
            }
        };

        // a waiter that is cancelled or times out forgets the key so new
        // callers start a fresh flight; the orphan task runs on
        let mut guard = WaiterGuard {
            sf: self,
            key,
            armed: true,
        };
        tokio::select! {
            result = rx.recv() => {
                guard.armed = false;
                match result {
                    Ok(outcome) => outcome,
                    Err(_) => Err(ResolveError::Network("in-flight call abandoned".into())),
                }
            }
            _ = tokio::time::sleep_until(deadline.into()) => {
                Err(ResolveError::Network("timed out waiting for in-flight call".into()))
            }
        }
    }

    /// Drop the in-flight record so the next caller starts fresh.
    pub fn forget(&self, key: u64) {
        self.calls.lock().remove(&key);
    }

    /// Forget flights older than [`STUCK_AFTER`].
    pub fn sweep(&self) {
        self.sweep_at(Instant::now());
    }

    pub fn sweep_at(&self, now: Instant) {
        let mut calls = self.calls.lock();
        let before = calls.len();
        calls.retain(|_, flight| now.duration_since(flight.started) < STUCK_AFTER);
        let dropped = before - calls.len();
        if dropped > 0 {
            debug!("singleflight forgot {} stuck calls", dropped);
        }
    }

    pub fn len(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Detached task forgetting stuck calls every 30 seconds.
    pub fn start_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let sf = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            interval.tick().await;
            loop {
                interval.tick().await;
                sf.sweep();
            }
        })
    }
}

impl Default for SingleFlight {
    fn default() -> Self {
        SingleFlight::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::name::Name;
    use crate::dns::rdata::RrType;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn deadline() -> Instant {
        Instant::now() + Duration::from_secs(5)
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_execution() {
        let sf = Arc::new(SingleFlight::new());
        let executions = Arc::new(AtomicU32::new(0));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let sf = sf.clone();
                let executions = executions.clone();
                tokio::spawn(async move {
                    sf.timed_do(42, deadline(), move || async move {
                        executions.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(Message::query(Name::parse("example.com.").unwrap(), RrType::A))
                    })
                    .await
                })
            })
            .collect();

        let mut answers = Vec::new();
        for task in tasks {
            answers.push(task.await.unwrap().unwrap());
        }
        assert_eq!(executions.load(Ordering::SeqCst), 1);
        for msg in &answers {
            assert_eq!(msg.q(), answers[0].q());
        }
    }

    #[tokio::test]
    async fn test_key_removed_after_completion() {
        let sf = Arc::new(SingleFlight::new());
        let _ = sf
            .timed_do(7, deadline(), || async {
                Ok(Message::query(Name::root(), RrType::Ns))
            })
            .await;
        assert!(sf.is_empty());
    }

    #[tokio::test]
    async fn test_errors_are_shared() {
        let sf = Arc::new(SingleFlight::new());
        let result = sf
            .timed_do(9, deadline(), || async { Err(ResolveError::MaxDepth) })
            .await;
        assert_eq!(result.unwrap_err(), ResolveError::MaxDepth);
    }

    #[tokio::test]
    async fn test_waiter_deadline_forgets_key() {
        let sf = Arc::new(SingleFlight::new());
        let result = sf
            .timed_do(11, Instant::now() + Duration::from_millis(20), || async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(Message::new())
            })
            .await;
        assert!(result.is_err());
        assert!(sf.is_empty());
    }

    #[tokio::test]
    async fn test_sweep_forgets_stuck_calls() {
        let sf = Arc::new(SingleFlight::new());
        {
            let (tx, _rx) = broadcast::channel(1);
            sf.calls.lock().insert(
                99,
                Flight {
                    tx,
                    started: Instant::now(),
                },
            );
        }
        sf.sweep_at(Instant::now() + Duration::from_secs(16));
        assert!(sf.is_empty());
    }
}
