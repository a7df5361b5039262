//! Worker pool that executes due deliveries.
//!
//! A single scheduler task claims envelopes whose `next_attempt_at` has
//! passed and spawns one task per delivery, bounded by a semaphore sized to
//! `max_in_flight_deliveries`. Backoff never occupies a task: a delivery
//! waiting for its next attempt is just an entry in the pending queue.

use std::{sync::Arc, time::Duration};

use herald_core::Envelope;
use tokio::{
    sync::Semaphore,
    task::{JoinHandle, JoinSet},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    dispatcher::Dispatcher,
    error::{DeliveryError, Result},
};

/// Running worker pool.
#[derive(Debug)]
pub struct WorkerPool {
    cancellation_token: CancellationToken,
    scheduler: Option<JoinHandle<()>>,
    in_flight: Arc<Semaphore>,
    max_in_flight: usize,
}

impl WorkerPool {
    /// Starts the scheduler loop for `dispatcher`.
    pub fn start(dispatcher: Dispatcher) -> Self {
        Self::start_with_token(dispatcher, CancellationToken::new())
    }

    /// Starts the scheduler loop, stopping when `cancellation_token` fires.
    pub fn start_with_token(dispatcher: Dispatcher, cancellation_token: CancellationToken) -> Self {
        let max_in_flight = dispatcher.max_in_flight();
        let in_flight = Arc::new(Semaphore::new(max_in_flight));

        info!(max_in_flight, "starting delivery worker pool");
        let scheduler = tokio::spawn(run_scheduler(
            dispatcher,
            in_flight.clone(),
            cancellation_token.clone(),
        ));

        Self { cancellation_token, scheduler: Some(scheduler), in_flight, max_in_flight }
    }

    /// Deliveries currently executing.
    pub fn in_flight(&self) -> usize {
        self.max_in_flight - self.in_flight.available_permits()
    }

    /// Whether the scheduler loop is still running.
    pub fn is_running(&self) -> bool {
        self.scheduler.as_ref().is_some_and(|handle| !handle.is_finished())
    }

    /// Token that stops the pool when cancelled.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation_token
    }

    /// Stops claiming new work and waits for in-flight deliveries.
    ///
    /// Deliveries still running when `timeout` expires are aborted; their
    /// envelopes are lost from the queue.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ShutdownTimeout` if in-flight deliveries did
    /// not finish in time.
    pub async fn shutdown_graceful(mut self, timeout: Duration) -> Result<()> {
        info!(
            in_flight = self.in_flight(),
            timeout_seconds = timeout.as_secs(),
            "initiating graceful worker pool shutdown"
        );

        self.cancellation_token.cancel();
        let Some(mut scheduler) = self.scheduler.take() else {
            return Ok(());
        };

        match tokio::time::timeout(timeout, &mut scheduler).await {
            Ok(Ok(())) => {
                info!("worker pool shutdown completed");
                Ok(())
            },
            Ok(Err(join_error)) => {
                error!(error = %join_error, "scheduler task panicked during shutdown");
                Err(DeliveryError::internal(format!("scheduler task failed: {join_error}")))
            },
            Err(_elapsed) => {
                scheduler.abort();
                error!(
                    timeout_seconds = timeout.as_secs(),
                    "worker pool shutdown timed out, aborting in-flight deliveries"
                );
                Err(DeliveryError::ShutdownTimeout { timeout })
            },
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.cancellation_token.cancel();
    }
}

async fn run_scheduler(
    dispatcher: Dispatcher,
    in_flight: Arc<Semaphore>,
    cancellation_token: CancellationToken,
) {
    let queue = dispatcher.queue().clone();
    let clock = dispatcher.clock().clone();
    let poll_interval = dispatcher.poll_interval();
    let mut tasks = JoinSet::new();

    while !cancellation_token.is_cancelled() {
        let capacity = in_flight.available_permits();
        if capacity > 0 {
            let claimed = queue.claim_due(clock.now_utc(), capacity).await;
            spawn_claimed(&dispatcher, &in_flight, claimed, &mut tasks).await;
        }

        let wait = match queue.next_due_at().await {
            Some(due_at) => (due_at - clock.now_utc()).to_std().unwrap_or(Duration::ZERO),
            None => poll_interval,
        }
        .min(poll_interval);

        // Saturated: only a finishing delivery can free a slot.
        let saturated = in_flight.available_permits() == 0;
        if wait.is_zero() && !saturated {
            tokio::task::yield_now().await;
            continue;
        }

        tokio::select! {
            () = cancellation_token.cancelled() => break,
            Some(joined) = tasks.join_next() => {
                if let Err(join_error) = joined {
                    error!(error = %join_error, "delivery task panicked");
                }
            },
            () = queue.notified() => {},
            () = clock.sleep(wait), if !saturated => {},
        }
    }

    debug!(remaining = tasks.len(), "scheduler stopped, draining in-flight deliveries");
    while let Some(joined) = tasks.join_next().await {
        if let Err(join_error) = joined {
            error!(error = %join_error, "delivery task panicked during shutdown");
        }
    }
}

/// Spawns one task per claimed envelope while permits last.
///
/// Envelopes that find no free permit go back on the queue. Returns how many
/// were requeued.
async fn spawn_claimed(
    dispatcher: &Dispatcher,
    in_flight: &Arc<Semaphore>,
    claimed: Vec<Envelope>,
    tasks: &mut JoinSet<()>,
) -> usize {
    let mut claimed = claimed.into_iter();
    while let Some(envelope) = claimed.next() {
        let Ok(permit) = in_flight.clone().try_acquire_owned() else {
            let queue = dispatcher.queue();
            let mut requeued = 1;
            queue.push(envelope).await;
            for rest in claimed {
                queue.push(rest).await;
                requeued += 1;
            }
            debug!(requeued, "no delivery slot free, requeued claimed envelopes");
            return requeued;
        };
        let dispatcher = dispatcher.clone();
        tasks.spawn(async move {
            let key = envelope.key();
            if let Err(e) = dispatcher.process(envelope).await {
                warn!(
                    event_id = %key.event_id,
                    destination = %key.destination,
                    error = %e,
                    "delivery step failed"
                );
            }
            drop(permit);
        });
    }
    0
}
