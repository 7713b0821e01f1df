//! Integration tests for polling workers and the supervisor.

use async_trait::async_trait;
use parking_lot::Mutex;
use routeslip::channel::{Address, Channel, MemoryBroker, MemoryChannel};
use routeslip::config::WorkerConfig;
use routeslip::engine::{RoutingStep, StepHandler, Supervisor, Worker, WorkerOutcome};
use routeslip::error::{Error, Result};
use routeslip::producer::Producer;
use routeslip::slip::RoutingSlip;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Job {
    n: u32,
}

/// Sleeps, then records which worker handled the slip.
struct Slow {
    worker: usize,
    delay: Duration,
    seen: Arc<Mutex<Vec<(usize, u32)>>>,
}

#[async_trait]
impl StepHandler<Job> for Slow {
    async fn handle(&self, slip: &mut RoutingSlip<Job>) -> Result<()> {
        tokio::time::sleep(self.delay).await;
        self.seen.lock().push((self.worker, slip.payload.n));
        Ok(())
    }
}

fn fast_config() -> WorkerConfig {
    WorkerConfig {
        idle_interval: Duration::from_millis(5),
        cancel_wait: Duration::from_millis(1),
        shutdown_timeout: Duration::from_secs(2),
        prefetch: 1,
    }
}

async fn publish_jobs(broker: &MemoryBroker, address: &str, count: u32) {
    let mut producer = Producer::new(broker.connect().unwrap());
    for n in 0..count {
        producer
            .send(&RoutingSlip::from_addresses(Job { n }, [address]))
            .await
            .unwrap();
    }
    producer.close().await.unwrap();
}

async fn slow_worker(
    broker: &MemoryBroker,
    address: &Address,
    worker: usize,
    delay: Duration,
    seen: &Arc<Mutex<Vec<(usize, u32)>>>,
    config: WorkerConfig,
) -> Worker<MemoryChannel, Job, Slow> {
    let channel = broker.open(address).await.unwrap();
    let handler = Slow {
        worker,
        delay,
        seen: Arc::clone(seen),
    };
    Worker::new(
        format!("worker-{worker}"),
        RoutingStep::new(channel, address, handler),
        config,
    )
}

async fn wait_until(mut done: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !done() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

// ---------------------------------------------------------------------------
// Fair dispatch
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "current_thread")]
async fn competing_workers_share_an_address() {
    const JOBS: u32 = 10;
    let broker = MemoryBroker::new();
    let address = Address::new("work");
    publish_jobs(&broker, "work", JOBS).await;

    let seen = Arc::new(Mutex::new(Vec::new()));
    let delay = Duration::from_millis(10);
    let mut supervisor = Supervisor::new(fast_config().shutdown_timeout);
    supervisor.spawn(slow_worker(&broker, &address, 0, delay, &seen, fast_config()).await);
    supervisor.spawn(slow_worker(&broker, &address, 1, delay, &seen, fast_config()).await);

    wait_until(|| broker.stats(&address).accepted == u64::from(JOBS)).await;
    let report = supervisor.shutdown().await;
    assert!(report.all_stopped());

    let completed: Vec<u64> = report
        .exits
        .iter()
        .map(|exit| match &exit.outcome {
            WorkerOutcome::Stopped(r) => r.completed,
            other => panic!("{} ended with {other:?}", exit.name),
        })
        .collect();
    assert_eq!(completed.iter().sum::<u64>(), u64::from(JOBS));
    assert!(completed.iter().all(|&c| c > 0), "uneven split {completed:?}");

    // Never more than one unacknowledged delivery per worker.
    assert!(broker.peak_in_flight() <= 1);

    // Every job handled exactly once.
    let mut handled: Vec<u32> = seen.lock().iter().map(|&(_, n)| n).collect();
    handled.sort_unstable();
    assert_eq!(handled, (0..JOBS).collect::<Vec<_>>());
}

#[tokio::test]
async fn worker_picks_up_messages_published_after_start() {
    let broker = MemoryBroker::new();
    let address = Address::new("late");
    let seen = Arc::new(Mutex::new(Vec::new()));

    // Declared up front so the worker's first poll finds an empty queue.
    broker.open(&address).await.unwrap();
    let worker = slow_worker(&broker, &address, 0, Duration::ZERO, &seen, fast_config()).await;
    let cancel = CancellationToken::new();
    let handle = tokio::spawn(worker.run(cancel.clone()));

    tokio::time::sleep(Duration::from_millis(20)).await;
    publish_jobs(&broker, "late", 3).await;
    wait_until(|| seen.lock().len() == 3).await;

    cancel.cancel();
    let report = handle.await.unwrap().unwrap();
    assert_eq!(report.completed, 3);
    assert!(report.idle_polls > 0);
}

// ---------------------------------------------------------------------------
// Cancellation and shutdown
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cancelled_worker_stops_polling() {
    let broker = MemoryBroker::new();
    let address = Address::new("quiet");
    let seen = Arc::new(Mutex::new(Vec::new()));

    let mut supervisor = Supervisor::new(Duration::from_secs(1));
    supervisor.spawn(slow_worker(&broker, &address, 0, Duration::ZERO, &seen, fast_config()).await);
    tokio::time::sleep(Duration::from_millis(30)).await;

    let report = supervisor.shutdown().await;
    assert!(report.all_stopped());
    assert!(matches!(
        report.exits[0].outcome,
        WorkerOutcome::Stopped(ref r) if r.idle_polls > 0
    ));

    let polls = broker.stats(&address).receive_calls;
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(broker.stats(&address).receive_calls, polls);
}

#[tokio::test]
async fn stuck_worker_times_out_on_shutdown() {
    let broker = MemoryBroker::new();
    let address = Address::new("stuck");
    publish_jobs(&broker, "stuck", 1).await;
    let seen = Arc::new(Mutex::new(Vec::new()));

    let mut supervisor = Supervisor::new(Duration::from_millis(50));
    supervisor.spawn(
        slow_worker(&broker, &address, 0, Duration::from_secs(30), &seen, fast_config()).await,
    );
    wait_until(|| broker.unacked(&address) == 1).await;

    let report = supervisor.shutdown().await;
    assert!(!report.all_stopped());
    assert!(matches!(report.exits[0].outcome, WorkerOutcome::TimedOut));
    assert!(seen.lock().is_empty());
}

#[tokio::test]
async fn failed_worker_is_reaped_and_its_message_released() {
    let broker = MemoryBroker::new();
    let address = Address::new("fragile");
    publish_jobs(&broker, "fragile", 1).await;

    let channel = broker.open(&address).await.unwrap();
    let step = RoutingStep::new(channel, &address, |_: &mut RoutingSlip<Job>| -> Result<()> {
        Err(Error::Handler("boom".to_string()))
    });
    let mut supervisor = Supervisor::new(Duration::from_secs(1));
    supervisor.spawn(Worker::new("fragile-0", step, fast_config()));

    let mut exits = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), async {
        while exits.is_empty() {
            exits = supervisor.reap().await;
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    assert_eq!(exits[0].name, "fragile-0");
    assert!(matches!(exits[0].outcome, WorkerOutcome::Failed(Error::Handler(_))));
    assert!(supervisor.is_empty());

    // Back on the queue for another worker, not dead-lettered.
    assert_eq!(broker.depth(&address), 1);
    assert_eq!(broker.unacked(&address), 0);
    assert_eq!(broker.depth(&address.dead_letter()), 0);
}

#[tokio::test]
async fn worker_closes_its_channel_on_stop() {
    let broker = MemoryBroker::new();
    let address = Address::new("closing");
    let mut probe = broker.open(&address).await.unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));

    let worker = slow_worker(&broker, &address, 0, Duration::ZERO, &seen, fast_config()).await;
    let cancel = CancellationToken::new();
    cancel.cancel();
    let report = worker.run(cancel).await.unwrap();
    assert_eq!(report.processed(), 0);

    // The queue is still usable by other sessions.
    probe.publish(&address, b"{}", true).await.unwrap();
    assert_eq!(broker.depth(&address), 1);
}
