//! Periodic execution of sync engines.
//!
//! One tokio task per engine, each on its own interval. A tick that overruns
//! its period is never cancelled and never overlapped; missed periods are
//! skipped. Shutdown stops new ticks and waits for running ones.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info};

use super::engine::SyncEngine;
use crate::error::error_chain;

pub struct Scheduler {
    tasks: Vec<(Arc<SyncEngine>, Duration)>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self { tasks: Vec::new() }
    }

    pub fn add(&mut self, engine: Arc<SyncEngine>, period: Duration) {
        self.tasks.push((engine, period));
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Run until `shutdown` flips to `true` (or its sender is dropped).
    pub async fn run(self, shutdown: watch::Receiver<bool>) {
        let mut set = JoinSet::new();
        for (engine, period) in self.tasks {
            let mut shutdown = shutdown.clone();
            set.spawn(async move {
                let mut ticker = interval(period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                info!(task = engine.name(), period_secs = period.as_secs(), "Task scheduled");

                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            // The next tick retries.
                            if let Err(e) = engine.tick().await {
                                error!(task = engine.name(), "Tick failed: {}", error_chain(&e));
                            }
                        }
                        changed = shutdown.changed() => {
                            if changed.is_err() || *shutdown.borrow() {
                                break;
                            }
                        }
                    }
                }
                debug!(task = engine.name(), "Task stopped");
            });
        }

        while set.join_next().await.is_some() {}
        info!("Scheduler stopped");
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}
