//! Per-pipe worker loop

use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::distributor::PipeDistributor;
use crate::pipe::{BatchResult, Pipe};

/// Where the worker currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    WaitingForHealthyClient,
    WaitingForMessage,
    Processing,
    Stopped,
}

/// Drives one pipe: wait for a consumer, wait for messages, drain
pub struct PipeScheduler {
    pipe: Arc<Pipe>,
    distributor: Arc<PipeDistributor>,
    state: watch::Sender<SchedulerState>,
}

impl PipeScheduler {
    pub fn new(distributor: Arc<PipeDistributor>) -> Self {
        let (state, _) = watch::channel(SchedulerState::WaitingForMessage);
        Self {
            pipe: Arc::clone(distributor.pipe()),
            distributor,
            state,
        }
    }

    pub fn state(&self) -> SchedulerState {
        *self.state.borrow()
    }

    /// Observe state transitions
    pub fn subscribe(&self) -> watch::Receiver<SchedulerState> {
        self.state.subscribe()
    }

    /// Run the loop on the runtime until the pipe is stopped
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move { scheduler.run().await })
    }

    pub async fn run(&self) {
        let interval = self.pipe.config().monitor_interval;
        info!(pipe = %self.pipe.name(), "Pipe worker started");

        while !self.pipe.is_scheduler_stopped() {
            if !self.distributor.has_healthy_client() {
                self.set_state(SchedulerState::WaitingForHealthyClient);
                self.pipe.wait_for_message(interval).await;
                continue;
            }

            if self.pipe.size().await == 0 {
                self.set_state(SchedulerState::WaitingForMessage);
                self.pipe.wait_for_message(interval).await;
                continue;
            }

            self.set_state(SchedulerState::Processing);
            if !self.drain().await {
                self.pipe.wait_for_message(interval).await;
            }
        }

        self.set_state(SchedulerState::Stopped);
        info!(pipe = %self.pipe.name(), "Pipe worker stopped");
    }

    /// Dispatch batches until the queue is empty or one is held back
    ///
    /// Returns `false` when the loop should back off before trying again.
    async fn drain(&self) -> bool {
        let batch_size = self.pipe.config().batch_size;
        loop {
            if self.pipe.is_scheduler_stopped() {
                return true;
            }

            let distributor = &self.distributor;
            let result = self
                .pipe
                .lock_handle_batch(batch_size, |batch| async move {
                    distributor.send_message_batch(batch).await.removable()
                })
                .await;

            match result {
                BatchResult::Removed(n) => {
                    debug!(pipe = %self.pipe.name(), removed = n, "Batch delivered");
                }
                BatchResult::Empty => return true,
                BatchResult::Retained | BatchResult::LockNotAcquired => return false,
            }
        }
    }

    fn set_state(&self, state: SchedulerState) {
        self.state.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
    }
}
