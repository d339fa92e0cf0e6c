//! Periodic task scheduling
//!
//! Every pipeline stage is a `PeriodicTask`. Tests drive `run_cycle` directly;
//! the node hands the tasks to a `Scheduler`, which runs each on its own tokio
//! interval and reports every cycle on an outcome channel.

use crate::error::PipelineError;
use async_trait::async_trait;
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use tokio::{
    sync::{mpsc, Notify},
    task::JoinHandle,
};

/// Work done in one cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Items that completed their transition
    pub processed: usize,
    /// Items that failed and were left for a later cycle
    pub failed: usize,
}

impl CycleReport {
    pub fn new(processed: usize, failed: usize) -> Self {
        Self { processed, failed }
    }

    pub fn is_idle(&self) -> bool {
        self.processed == 0 && self.failed == 0
    }
}

/// A unit of periodic work
#[async_trait]
pub trait PeriodicTask: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    async fn run_cycle(&self) -> Result<CycleReport, PipelineError>;
}

/// Result of one scheduled cycle
#[derive(Debug, Clone)]
pub struct CycleOutcome {
    pub task: &'static str,
    pub cycle: u64,
    pub result: Result<CycleReport, PipelineError>,
    pub elapsed_us: u64,
}

/// Runs periodic tasks until stopped
pub struct Scheduler {
    running: Arc<AtomicBool>,
    wakeup: Arc<Notify>,
    outcomes: mpsc::Sender<CycleOutcome>,
    handles: Vec<(&'static str, JoinHandle<()>)>,
}

impl Scheduler {
    /// Create a scheduler and the receiving end of its outcome channel
    pub fn new(outcome_capacity: usize) -> (Self, mpsc::Receiver<CycleOutcome>) {
        let (outcomes, receiver) = mpsc::channel(outcome_capacity.max(1));
        let scheduler = Self {
            running: Arc::new(AtomicBool::new(true)),
            wakeup: Arc::new(Notify::new()),
            outcomes,
            handles: Vec::new(),
        };
        (scheduler, receiver)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn task_count(&self) -> usize {
        self.handles.len()
    }

    /// Spawn a task on its own fixed interval
    pub fn spawn(&mut self, task: Arc<dyn PeriodicTask>, period: Duration) {
        let name = task.name();
        let running = self.running.clone();
        let wakeup = self.wakeup.clone();
        let outcomes = self.outcomes.clone();

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut cycle = 0u64;

            tracing::info!("Task {} started ({}ms interval)", name, period.as_millis());

            while running.load(Ordering::SeqCst) {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = wakeup.notified() => break,
                }
                if !running.load(Ordering::SeqCst) {
                    break;
                }

                cycle += 1;
                let started = Instant::now();
                let result = task.run_cycle().await;
                let elapsed = started.elapsed();

                match &result {
                    Ok(report) if !report.is_idle() => {
                        tracing::debug!(
                            "{} cycle {}: {} processed, {} failed",
                            name,
                            cycle,
                            report.processed,
                            report.failed
                        );
                    }
                    Ok(_) => {}
                    Err(e) if e.is_transient() => {
                        tracing::warn!("{} cycle {} deferred: {}", name, cycle, e);
                    }
                    Err(e) => {
                        tracing::error!("{} cycle {} failed: {}", name, cycle, e);
                    }
                }

                if elapsed > period {
                    tracing::warn!(
                        "{} cycle {} took {:.2}ms (interval: {}ms)",
                        name,
                        cycle,
                        elapsed.as_secs_f64() * 1000.0,
                        period.as_millis()
                    );
                }

                // A slow or absent consumer must not stall the task
                let _ = outcomes.try_send(CycleOutcome {
                    task: name,
                    cycle,
                    result,
                    elapsed_us: elapsed.as_micros() as u64,
                });
            }

            tracing::info!("Task {} stopped after {} cycles", name, cycle);
        });

        self.handles.push((name, handle));
    }

    /// Signal all tasks to stop after their current cycle
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.wakeup.notify_waiters();
    }

    /// Stop and wait for every task to finish its current cycle
    pub async fn shutdown(self, grace: Duration) {
        self.stop();

        let names: Vec<&'static str> = self.handles.iter().map(|(name, _)| *name).collect();
        let joined = futures::future::join_all(self.handles.into_iter().map(|(_, handle)| handle));

        match tokio::time::timeout(grace, joined).await {
            Ok(results) => {
                for (name, result) in names.iter().zip(results) {
                    if let Err(e) = result {
                        tracing::error!("Task {} ended abnormally: {}", name, e);
                    }
                }
            }
            Err(_) => {
                tracing::warn!("Tasks did not stop within {}ms, abandoning", grace.as_millis());
            }
        }
    }
}
