//! The polling engine: a fixed-rate scheduler feeding a single processor
//! worker through a bounded handoff queue.
//!
//! Two flows of control run per session. The scheduler owns the adapter
//! and performs protocol I/O, marking the pull clock at the top of every
//! cycle and enqueuing each fetched payload with its compiled process
//! plan. The worker owns the data-point store, the speed cache and the
//! sink, and drains the queue in FIFO order, so emissions of cycle N are
//! totally ordered before cycle N+1. The queue holds at most one cycle's
//! payloads; a full queue blocks the scheduler, which is the only
//! backpressure in the system.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::PollConfig;
use crate::datapoint::DataPointStore;
use crate::error::{Error, Result};
use crate::output::{LineOutput, Output};
use crate::pipeline::{ProcessStep, ProcessorContext, PullClock};
use crate::proto::{self, Adapter, Payload};
use crate::transform::SpeedCache;

enum Job {
    Process {
        payload: Payload,
        steps: Arc<Vec<ProcessStep>>,
    },
    /// Drain-then-exit marker; FIFO order guarantees everything enqueued
    /// before it is fully processed first.
    Shutdown,
}

pub struct Engine {
    interval: Duration,
    beacon: f64,
    adapter: Box<dyn Adapter>,
    plans: Vec<Arc<Vec<ProcessStep>>>,
    output: Arc<dyn Output>,
    clock: PullClock,
}

impl Engine {
    /// Build the engine from a validated configuration: adapter selection,
    /// pull-plan compilation and the stdout sink.
    pub fn from_config(cfg: &PollConfig) -> Result<Self> {
        cfg.validate()?;
        let (adapter, plans) = proto::build(cfg)?;
        let output = LineOutput::stdout(cfg.output.kind, cfg.time_format);
        Ok(Self::new(
            Duration::from_secs_f64(cfg.interval()),
            cfg.beacon,
            adapter,
            plans.into_iter().map(|p| Arc::new(p.steps)).collect(),
            output,
        ))
    }

    /// Assemble an engine from parts; used directly by integration tests
    /// that script the adapter and capture the sink.
    pub fn new(
        interval: Duration,
        beacon: f64,
        adapter: Box<dyn Adapter>,
        plans: Vec<Arc<Vec<ProcessStep>>>,
        output: Arc<dyn Output>,
    ) -> Self {
        Self {
            interval,
            beacon,
            adapter,
            plans,
            output,
            clock: PullClock::new(),
        }
    }

    /// Run to completion. Single-shot mode performs one cycle; loop mode
    /// polls until interrupted. With `auto_restart`, a failed loop session
    /// is reinitialized after a one-interval pause instead of terminating.
    pub async fn run(&mut self, loop_mode: bool, auto_restart: bool) -> Result<()> {
        loop {
            match self.run_session(loop_mode).await {
                Ok(()) => return Ok(()),
                Err(Error::Interrupted) => {
                    tracing::info!("interrupted, shutting down");
                    return Ok(());
                }
                Err(e) if auto_restart && loop_mode && !e.is_fatal() => {
                    tracing::error!("poll cycle failed: {e}; restarting");
                    tokio::time::sleep(self.interval).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// One engine session: connect, spawn a fresh worker (which clears the
    /// data points and the speed cache), cycle, then tear down in shutdown
    /// order: sentinel, join, adapter release.
    async fn run_session(&mut self, loop_mode: bool) -> Result<()> {
        self.adapter.connect().await?;
        let (tx, worker) = self.spawn_worker();

        let result = tokio::select! {
            r = self.run_cycles(&tx, &worker, loop_mode) => r,
            _ = tokio::signal::ctrl_c() => Err(Error::Interrupted),
        };

        let _ = tx.send(Job::Shutdown).await;
        drop(tx);
        let _ = worker.await;
        self.adapter.shutdown().await?;
        result
    }

    fn spawn_worker(&self) -> (mpsc::Sender<Job>, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<Job>(self.plans.len().max(1));
        let output = self.output.clone();
        let clock = self.clock.clone();
        let handle = tokio::spawn(async move {
            let mut ctx = ProcessorContext {
                store: DataPointStore::new(output),
                speed: SpeedCache::default(),
                clock,
            };
            while let Some(job) = rx.recv().await {
                match job {
                    Job::Shutdown => break,
                    Job::Process { payload, steps } => {
                        for step in steps.iter() {
                            if let Err(e) = step.apply(&payload, &mut ctx) {
                                tracing::error!("processor failed: {e}");
                                return;
                            }
                        }
                    }
                }
            }
        });
        (tx, handle)
    }

    async fn run_cycles(
        &mut self,
        tx: &mpsc::Sender<Job>,
        worker: &JoinHandle<()>,
        loop_mode: bool,
    ) -> Result<()> {
        if !loop_mode {
            return self.cycle(tx, worker).await;
        }

        let interval = self.interval;
        let mut next_iter = Instant::now() + interval;

        let beacon_interval = Duration::from_secs_f64(self.beacon.max(f64::EPSILON));
        let beacon_enabled = self.beacon > 0.0;
        let mut next_beacon = Instant::now() + beacon_interval;

        loop {
            self.cycle(tx, worker).await?;

            if beacon_enabled {
                let now = Instant::now();
                if next_beacon <= now {
                    self.output.beacon()?;
                    while next_beacon <= now {
                        next_beacon += beacon_interval;
                    }
                }
            }

            // Phase-preserving pacing: the deadline always advances by
            // exactly one interval. An overrun cycle starts the next one
            // immediately and keeps the original phase.
            let now = Instant::now();
            if next_iter > now {
                tokio::time::sleep_until(next_iter).await;
            } else {
                tracing::warn!("main loop timeout");
            }
            next_iter += interval;
        }
    }

    /// Fetch every configured pull in registration order and hand the
    /// payloads to the worker.
    async fn cycle(&mut self, tx: &mpsc::Sender<Job>, worker: &JoinHandle<()>) -> Result<()> {
        self.clock.mark();
        for (index, steps) in self.plans.iter().enumerate() {
            let payload = self.adapter.fetch(index).await?;
            let job = Job::Process {
                payload,
                steps: Arc::clone(steps),
            };
            if tx.send(job).await.is_err() {
                return Err(Error::WorkerDead);
            }
        }
        if worker.is_finished() {
            return Err(Error::WorkerDead);
        }
        Ok(())
    }
}
