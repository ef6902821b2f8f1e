//! Per-extension throttling scheduler.
//!
//! One logical limiter per extension, pooled across every event the
//! extension declares a policy for. The limiter enforces a minimum spacing
//! between task releases and a maximum number of in-flight tasks, releasing
//! waiters in FIFO order. Removing an extension drains its queue: waiting
//! jobs fail with [`HostError::LimiterStopped`], executing jobs run to
//! completion.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore, mpsc, oneshot, watch};
use tokio::time::{Duration, Instant, sleep_until};
use tracing::debug;

use pictor_model::manifest::{EventName, ThrottlingPolicy};
use pictor_model::ExtensionId;

use crate::error::{HostError, Result};

/// Spacing applied when a policy bounds neither dimension explicitly.
const DEFAULT_MIN_INTERVAL: Duration = Duration::from_millis(100);

/// In-flight cap high enough to act as "unbounded" for permit accounting.
const UNBOUNDED_CONCURRENCY: usize = Semaphore::MAX_PERMITS >> 3;

fn derive_limits(policy: &ThrottlingPolicy) -> (Duration, usize) {
    let min_interval = match (
        policy.duration_in_milliseconds,
        policy.maximum_count,
    ) {
        (Some(ms), _) => Duration::from_millis(ms.max(1)),
        (None, Some(count)) if count > 0 => {
            Duration::from_millis((1000 / u64::from(count)).max(1))
        }
        _ => DEFAULT_MIN_INTERVAL,
    };
    let max_concurrent = policy
        .maximum_count
        .map(|count| count.max(1) as usize)
        .unwrap_or(UNBOUNDED_CONCURRENCY);
    (min_interval, max_concurrent)
}

struct Job {
    permit_tx: oneshot::Sender<Result<OwnedSemaphorePermit>>,
}

/// Limiter shared by all events of one extension.
struct ExtensionLimiter {
    queue_tx: mpsc::UnboundedSender<Job>,
    stop_tx: watch::Sender<bool>,
}

impl ExtensionLimiter {
    fn new(min_interval: Duration, max_concurrent: usize) -> Arc<Self> {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = watch::channel(false);
        let semaphore = Arc::new(Semaphore::new(max_concurrent));
        tokio::spawn(pump(queue_rx, stop_rx, semaphore, min_interval));
        Arc::new(Self { queue_tx, stop_tx })
    }

    async fn acquire(&self) -> Result<OwnedSemaphorePermit> {
        let (permit_tx, permit_rx) = oneshot::channel();
        self.queue_tx
            .send(Job { permit_tx })
            .map_err(|_| HostError::LimiterStopped)?;
        match permit_rx.await {
            Ok(outcome) => outcome,
            // Pump exited without answering: it was stopped.
            Err(_) => Err(HostError::LimiterStopped),
        }
    }

    fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }
}

/// Release loop: pops jobs FIFO, honouring the spacing window and the
/// concurrency cap, and fails everything still queued once stopped.
async fn pump(
    mut queue_rx: mpsc::UnboundedReceiver<Job>,
    mut stop_rx: watch::Receiver<bool>,
    semaphore: Arc<Semaphore>,
    min_interval: Duration,
) {
    let mut last_release: Option<Instant> = None;

    loop {
        let job = tokio::select! {
            biased;
            _ = stop_rx.changed() => {
                drain(&mut queue_rx);
                return;
            }
            job = queue_rx.recv() => match job {
                Some(job) => job,
                None => return,
            },
        };

        if let Some(last) = last_release {
            let due = last + min_interval;
            tokio::select! {
                biased;
                _ = stop_rx.changed() => {
                    let _ = job.permit_tx.send(Err(HostError::LimiterStopped));
                    drain(&mut queue_rx);
                    return;
                }
                _ = sleep_until(due) => {}
            }
        }

        let permit = tokio::select! {
            biased;
            _ = stop_rx.changed() => {
                let _ = job.permit_tx.send(Err(HostError::LimiterStopped));
                drain(&mut queue_rx);
                return;
            }
            permit = semaphore.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return,
            },
        };

        last_release = Some(Instant::now());
        // A receiver dropped mid-wait releases its permit right here.
        let _ = job.permit_tx.send(Ok(permit));
    }
}

fn drain(queue_rx: &mut mpsc::UnboundedReceiver<Job>) {
    queue_rx.close();
    while let Ok(job) = queue_rx.try_recv() {
        let _ = job.permit_tx.send(Err(HostError::LimiterStopped));
    }
}

struct ExtensionEntry {
    per_event_policy: HashMap<EventName, ThrottlingPolicy>,
    limiter: Option<Arc<ExtensionLimiter>>,
}

#[derive(Default)]
struct SchedulerState {
    extensions: HashMap<ExtensionId, ExtensionEntry>,
}

/// Process-wide limiter table keyed by extension.
#[derive(Clone, Default)]
pub struct ThrottleScheduler {
    state: Arc<Mutex<SchedulerState>>,
}

impl fmt::Debug for ThrottleScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("ThrottleScheduler");
        match self.state.try_lock() {
            Ok(state) => {
                debug.field("extension_count", &state.extensions.len());
            }
            Err(_) => {
                debug.field("state", &"<locked>");
            }
        }
        debug.finish()
    }
}

impl ThrottleScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the policies an extension declared; called when its process
    /// starts. The limiter itself is built lazily on first use.
    pub async fn register<'a, I>(&self, extension_id: ExtensionId, policies: I)
    where
        I: IntoIterator<Item = &'a ThrottlingPolicy>,
    {
        let mut per_event_policy = HashMap::new();
        for policy in policies {
            for event in &policy.events {
                per_event_policy.insert(*event, policy.clone());
            }
        }
        let mut state = self.state.lock().await;
        state.extensions.insert(
            extension_id,
            ExtensionEntry {
                per_event_policy,
                limiter: None,
            },
        );
    }

    /// Remove the extension's limiter from the table and drain it. Waiting
    /// jobs fail with `LimiterStopped`; in-flight jobs run to completion.
    pub async fn remove(&self, extension_id: &ExtensionId) {
        let entry = {
            let mut state = self.state.lock().await;
            state.extensions.remove(extension_id)
        };
        if let Some(entry) = entry {
            if let Some(limiter) = entry.limiter {
                debug!(extension = %extension_id, "draining limiter");
                limiter.stop();
            }
        }
    }

    /// Tear down every limiter.
    pub async fn destroy(&self) {
        let mut state = self.state.lock().await;
        for (_, entry) in state.extensions.drain() {
            if let Some(limiter) = entry.limiter {
                limiter.stop();
            }
        }
    }

    async fn limiter_for(
        &self,
        extension_id: &ExtensionId,
        event: EventName,
    ) -> Option<Arc<ExtensionLimiter>> {
        let mut state = self.state.lock().await;
        let entry = state.extensions.get_mut(extension_id)?;
        let policy = entry.per_event_policy.get(&event)?.clone();
        if entry.limiter.is_none() {
            let (min_interval, max_concurrent) = derive_limits(&policy);
            entry.limiter =
                Some(ExtensionLimiter::new(min_interval, max_concurrent));
        }
        entry.limiter.clone()
    }

    /// Run `task`, subject to the extension's limiter when one applies.
    ///
    /// Without an extension id, or when the extension declares no policy for
    /// `event`, the task runs directly.
    pub async fn run<F, T>(
        &self,
        extension_id: Option<&ExtensionId>,
        event: EventName,
        task: F,
    ) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let Some(extension_id) = extension_id else {
            return task.await;
        };
        let Some(limiter) = self.limiter_for(extension_id, event).await
        else {
            return task.await;
        };
        let permit = limiter.acquire().await?;
        let outcome = task.await;
        drop(permit);
        outcome
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn policy(
        events: &[EventName],
        maximum_count: Option<u32>,
        duration_ms: Option<u64>,
    ) -> ThrottlingPolicy {
        ThrottlingPolicy {
            events: BTreeSet::from_iter(events.iter().copied()),
            maximum_count,
            duration_in_milliseconds: duration_ms,
        }
    }

    fn ext(id: &str) -> ExtensionId {
        ExtensionId::parse(id).unwrap()
    }

    #[tokio::test]
    async fn tasks_without_policy_run_directly() {
        let scheduler = ThrottleScheduler::new();
        let out = scheduler
            .run(None, EventName::ImageCreated, async { Ok(7) })
            .await
            .unwrap();
        assert_eq!(out, 7);

        scheduler
            .register(ext("plain"), std::iter::empty::<&ThrottlingPolicy>())
            .await;
        let out = scheduler
            .run(Some(&ext("plain")), EventName::ImageCreated, async {
                Ok(8)
            })
            .await
            .unwrap();
        assert_eq!(out, 8);
    }

    #[tokio::test(start_paused = true)]
    async fn spacing_is_enforced_across_all_declared_events() {
        let scheduler = ThrottleScheduler::new();
        let id = ext("spaced");
        scheduler
            .register(
                id.clone(),
                [&policy(
                    &[
                        EventName::ImageComputeTags,
                        EventName::ImageComputeFeatures,
                    ],
                    Some(1),
                    Some(1_000),
                )],
            )
            .await;

        let started = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for event in [
            EventName::ImageComputeTags,
            EventName::ImageComputeFeatures,
            EventName::ImageComputeTags,
        ] {
            let scheduler = scheduler.clone();
            let id = id.clone();
            let started = Arc::clone(&started);
            handles.push(tokio::spawn(async move {
                scheduler
                    .run(Some(&id), event, async {
                        started.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    })
                    .await
            }));
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(started.load(Ordering::SeqCst), 1);
        tokio::time::sleep(Duration::from_millis(1_000)).await;
        assert_eq!(started.load(Ordering::SeqCst), 2);
        tokio::time::sleep(Duration::from_millis(1_000)).await;
        assert_eq!(started.load(Ordering::SeqCst), 3);
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
    }

    #[tokio::test]
    async fn drain_fails_waiters_and_lets_runner_finish() {
        let scheduler = ThrottleScheduler::new();
        let id = ext("drained");
        scheduler
            .register(
                id.clone(),
                [&policy(
                    &[EventName::ImageComputeFeatures],
                    Some(1),
                    Some(100),
                )],
            )
            .await;

        let (release_tx, release_rx) = oneshot::channel::<()>();
        let completed = Arc::new(AtomicUsize::new(0));

        // First task occupies the single slot until released.
        let first = {
            let scheduler = scheduler.clone();
            let id = id.clone();
            let completed = Arc::clone(&completed);
            tokio::spawn(async move {
                scheduler
                    .run(Some(&id), EventName::ImageComputeFeatures, async {
                        let _ = release_rx.await;
                        completed.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    })
                    .await
            })
        };

        // Four more queue up behind it.
        let mut waiters = Vec::new();
        for _ in 0..4 {
            let scheduler = scheduler.clone();
            let id = id.clone();
            let completed = Arc::clone(&completed);
            waiters.push(tokio::spawn(async move {
                scheduler
                    .run(Some(&id), EventName::ImageComputeFeatures, async {
                        completed.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    })
                    .await
            }));
        }

        // Give the first task time to claim the slot.
        tokio::time::sleep(Duration::from_millis(50)).await;

        scheduler.remove(&id).await;
        let _ = release_tx.send(());

        first.await.unwrap().unwrap();
        for waiter in waiters {
            assert!(matches!(
                waiter.await.unwrap(),
                Err(HostError::LimiterStopped)
            ));
        }
        assert_eq!(completed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn fifo_release_order_is_preserved() {
        let scheduler = ThrottleScheduler::new();
        let id = ext("ordered");
        scheduler
            .register(
                id.clone(),
                [&policy(&[EventName::ImageComputeTags], Some(1), Some(5))],
            )
            .await;

        let order = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for n in 0..5u32 {
            let scheduler = scheduler.clone();
            let id = id.clone();
            let order = Arc::clone(&order);
            handles.push(tokio::spawn(async move {
                scheduler
                    .run(Some(&id), EventName::ImageComputeTags, async {
                        order.lock().await.push(n);
                        Ok(())
                    })
                    .await
            }));
            // Submission order defines expected release order.
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(*order.lock().await, vec![0, 1, 2, 3, 4]);
    }
}
