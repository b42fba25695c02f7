//! Progress Hub (C6, §4.6). Fan-out broker between the engine's progress
//! callback and whatever is subscribed to a job (the daemon's SSE route
//! today; tests and the CLI's own polling loop tomorrow).
//!
//! One `broadcast` channel per job, created lazily on first publish or
//! subscribe. A slow subscriber never blocks `publish` or the other
//! subscribers — `tokio::sync::broadcast` already isolates each receiver's
//! ring buffer, so a lagging one just drops its own backlog.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures_util::Stream;
use tokio::sync::broadcast;
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tokio_stream::StreamExt;
use uuid::Uuid;

use shipctl_schemas::ProgressEvent;

const CHANNEL_CAPACITY: usize = 256;
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

struct JobChannel {
    tx: broadcast::Sender<ProgressEvent>,
    last_publish: Mutex<Instant>,
}

/// Process-wide fan-out broker. One `Hub` is shared (via `Arc`) across the
/// daemon's handlers and the engine's progress callback.
pub struct Hub {
    jobs: Mutex<HashMap<Uuid, Arc<JobChannel>>>,
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}

impl Hub {
    pub fn new() -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
        }
    }

    fn get_or_create(&self, job_id: Uuid) -> Arc<JobChannel> {
        let mut jobs = self.jobs.lock().unwrap();
        jobs.entry(job_id)
            .or_insert_with(|| {
                let (tx, _rx) = broadcast::channel(CHANNEL_CAPACITY);
                let channel = Arc::new(JobChannel {
                    tx,
                    last_publish: Mutex::new(Instant::now()),
                });
                spawn_keep_alive(Arc::clone(&channel));
                channel
            })
            .clone()
    }

    /// Called by the engine's progress callback. Never blocks: `broadcast`
    /// send only fails when there are no receivers, which is not an error
    /// here — the job simply has no subscribers yet.
    pub fn publish(&self, job_id: Uuid, event: ProgressEvent) {
        let channel = self.get_or_create(job_id);
        *channel.last_publish.lock().unwrap() = Instant::now();
        let _ = channel.tx.send(event);
    }

    pub fn subscribe(&self, job_id: Uuid) -> Subscription {
        let channel = self.get_or_create(job_id);
        Subscription {
            job_id,
            rx: channel.tx.subscribe(),
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Drops per-job state with no subscribers left. The hub does this
    /// lazily rather than on every unsubscribe — call periodically from a
    /// background sweep (the daemon ties this to its own heartbeat timer).
    pub fn sweep(&self) {
        let mut jobs = self.jobs.lock().unwrap();
        jobs.retain(|_, channel| channel.tx.receiver_count() > 0);
    }

    pub fn job_count(&self) -> usize {
        self.jobs.lock().unwrap().len()
    }
}

fn spawn_keep_alive(channel: Arc<JobChannel>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        loop {
            ticker.tick().await;
            if channel.tx.receiver_count() == 0 {
                return;
            }
            let silent_for = channel.last_publish.lock().unwrap().elapsed();
            if silent_for >= KEEP_ALIVE_INTERVAL {
                if channel.tx.send(ProgressEvent::Ping).is_err() {
                    return;
                }
                *channel.last_publish.lock().unwrap() = Instant::now();
            }
        }
    });
}

/// A subscriber's handle to one job's event stream. Tracks how many events
/// this subscriber missed due to lag (§4.6: "dropped for that subscriber
/// with a counter increment").
pub struct Subscription {
    job_id: Uuid,
    rx: broadcast::Receiver<ProgressEvent>,
    dropped: Arc<AtomicU64>,
}

impl Subscription {
    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Awaits the next event, transparently skipping past lag gaps.
    pub async fn recv(&mut self) -> Option<ProgressEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    self.dropped.fetch_add(n, Ordering::Relaxed);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Adapts this subscription into a `Stream`, for the daemon's SSE route.
    pub fn into_stream(self) -> impl Stream<Item = ProgressEvent> {
        let dropped = self.dropped;
        BroadcastStream::new(self.rx).filter_map(move |msg| {
            let dropped = Arc::clone(&dropped);
            match msg {
                Ok(event) => Some(event),
                Err(BroadcastStreamRecvError::Lagged(n)) => {
                    dropped.fetch_add(n, Ordering::Relaxed);
                    None
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_reaches_a_live_subscriber() {
        let hub = Hub::new();
        let job_id = Uuid::new_v4();
        let mut sub = hub.subscribe(job_id);

        hub.publish(job_id, ProgressEvent::BatchStarted { total: 3 });

        let event = sub.recv().await.unwrap();
        assert!(matches!(event, ProgressEvent::BatchStarted { total: 3 }));
    }

    #[tokio::test]
    async fn publish_with_no_subscribers_does_not_error() {
        let hub = Hub::new();
        hub.publish(Uuid::new_v4(), ProgressEvent::Ping);
    }

    #[tokio::test]
    async fn one_lagging_subscriber_does_not_affect_another() {
        let hub = Hub::new();
        let job_id = Uuid::new_v4();
        let mut fast = hub.subscribe(job_id);
        let mut slow = hub.subscribe(job_id);

        for i in 0..(CHANNEL_CAPACITY as i64 + 10) {
            hub.publish(job_id, ProgressEvent::RowStarted { row_number: i });
        }

        // Drain the fast subscriber immediately; it should see the tail of
        // the stream without ever lagging.
        let last = loop {
            match fast.recv().await {
                Some(ProgressEvent::RowStarted { row_number }) if row_number == CHANNEL_CAPACITY as i64 + 9 => {
                    break row_number
                }
                Some(_) => continue,
                None => panic!("fast subscriber channel closed unexpectedly"),
            }
        };
        assert_eq!(last, CHANNEL_CAPACITY as i64 + 9);

        // The slow subscriber, having never polled, must report a lag
        // rather than hang or panic.
        let event = slow.recv().await;
        assert!(event.is_some());
        assert!(slow.dropped_count() > 0);
    }

    #[tokio::test]
    async fn sweep_removes_jobs_with_no_subscribers() {
        let hub = Hub::new();
        let job_id = Uuid::new_v4();
        {
            let _sub = hub.subscribe(job_id);
            assert_eq!(hub.job_count(), 1);
        }
        hub.sweep();
        assert_eq!(hub.job_count(), 0);
    }
}
