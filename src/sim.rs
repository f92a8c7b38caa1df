//! Simulated acquisition objects
//!
//! Software-only drivers used by the `acq-chain` binary and by integration
//! tests. All waits use `tokio::time::sleep`.
//!
//! # Available drivers
//!
//! - [`SoftwareTimerMaster`]: integrates for `count_time` on every trigger and
//!   triggers its slaves meanwhile
//! - [`LinearStepMaster`]: positioner stepping through evenly spaced positions,
//!   one per point
//! - [`SimCounter`]: counter device; every trigger produces one value
//!
//! [`step_scan`] assembles the classic `motor → timer → counters` chain.

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::time::{sleep, Duration, Instant};
use tracing::{debug, trace};

use crate::acquisition::{
    AcqObject, AcqParams, AcquisitionDevice, AcquisitionMaster, Advance, PointIteration, Slaves,
};
use crate::channel::{Channel, DType};
use crate::chain::Chain;
use crate::config::{ChainSettings, SimulationSettings};
use crate::error::AcqResult;

// =============================================================================
// SoftwareTimerMaster
// =============================================================================

/// Timer master counting for a fixed time per trigger.
///
/// Publishes the elapsed time since its first trigger on `elapsed_time`. When it
/// sits directly under the chain root it triggers itself from `start`.
pub struct SoftwareTimerMaster {
    count_time: Duration,
    started: Mutex<Option<Instant>>,
    triggers: AtomicUsize,
    elapsed: Arc<Channel>,
}

impl SoftwareTimerMaster {
    pub fn new(count_time: Duration) -> Self {
        Self {
            count_time,
            started: Mutex::new(None),
            triggers: AtomicUsize::new(0),
            elapsed: Arc::new(Channel::new("elapsed_time", DType::Float, vec![])),
        }
    }

    pub fn count_time(&self) -> Duration {
        self.count_time
    }

    /// Number of completed triggers.
    pub fn triggers(&self) -> usize {
        self.triggers.load(Ordering::SeqCst)
    }

    pub fn channel(&self) -> Arc<Channel> {
        self.elapsed.clone()
    }

    pub fn object(self: &Arc<Self>, name: &str, params: AcqParams) -> AcqObject {
        AcqObject::master(name, self.clone())
            .params(params)
            .channel(self.channel())
            .build()
    }
}

#[async_trait]
impl AcquisitionMaster for SoftwareTimerMaster {
    async fn prepare(&self, _slaves: &Slaves) -> Result<()> {
        *self.started.lock() = None;
        Ok(())
    }

    async fn start(&self, slaves: &Slaves) -> Result<()> {
        if slaves.is_top_level() {
            self.trigger(slaves).await?;
        }
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        Ok(())
    }

    async fn trigger(&self, slaves: &Slaves) -> Result<()> {
        let started = *self.started.lock().get_or_insert_with(Instant::now);
        slaves.trigger_slaves().await?;
        sleep(self.count_time).await;
        self.elapsed.emit(started.elapsed().as_secs_f64())?;
        slaves.wait_slaves().await?;
        self.triggers.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// =============================================================================
// LinearStepMaster
// =============================================================================

/// Positioner master moving through `npoints` evenly spaced positions.
///
/// The move happens in `prepare`; `trigger` publishes the position and
/// triggers the slaves. As a top-level master it triggers itself from `start`.
pub struct LinearStepMaster {
    positions: Vec<f64>,
    index: AtomicUsize,
    position: Mutex<f64>,
    move_time: Duration,
    channel: Arc<Channel>,
}

impl LinearStepMaster {
    pub fn new(name: &str, start: f64, stop: f64, npoints: usize) -> Self {
        let positions = match npoints {
            0 => Vec::new(),
            1 => vec![start],
            n => (0..n)
                .map(|i| start + (stop - start) * i as f64 / (n - 1) as f64)
                .collect(),
        };
        Self {
            position: Mutex::new(positions.first().copied().unwrap_or(start)),
            positions,
            index: AtomicUsize::new(0),
            move_time: Duration::from_millis(1),
            channel: Arc::new(Channel::new(name, DType::Float, vec![])),
        }
    }

    /// Simulated motion time per step.
    pub fn with_move_time(mut self, move_time: Duration) -> Self {
        self.move_time = move_time;
        self
    }

    pub fn positions(&self) -> &[f64] {
        &self.positions
    }

    /// Position reached by the last `prepare`.
    pub fn position(&self) -> f64 {
        *self.position.lock()
    }

    pub fn channel(&self) -> Arc<Channel> {
        self.channel.clone()
    }

    pub fn object(self: &Arc<Self>, name: &str) -> AcqObject {
        AcqObject::master(name, self.clone())
            .params(AcqParams::new().npoints(self.positions.len()))
            .channel(self.channel())
            .iterating(self.clone())
            .build()
    }

    fn target(&self) -> Option<f64> {
        self.positions.get(self.index.load(Ordering::SeqCst)).copied()
    }
}

impl PointIteration for LinearStepMaster {
    fn rewind(&self) -> Advance {
        self.index.store(0, Ordering::SeqCst);
        if self.positions.is_empty() {
            Advance::Exhausted
        } else {
            Advance::Point
        }
    }

    fn advance(&self) -> Advance {
        let next = self.index.fetch_add(1, Ordering::SeqCst) + 1;
        if next < self.positions.len() {
            Advance::Point
        } else {
            Advance::Exhausted
        }
    }
}

#[async_trait]
impl AcquisitionMaster for LinearStepMaster {
    async fn prepare(&self, _slaves: &Slaves) -> Result<()> {
        let Some(target) = self.target() else {
            anyhow::bail!("no position left");
        };
        sleep(self.move_time).await;
        *self.position.lock() = target;
        debug!(position = target, "moved");
        Ok(())
    }

    async fn start(&self, slaves: &Slaves) -> Result<()> {
        if slaves.is_top_level() {
            self.trigger(slaves).await?;
        }
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        Ok(())
    }

    async fn trigger(&self, slaves: &Slaves) -> Result<()> {
        self.channel.emit(self.position())?;
        slaves.trigger_slaves().await?;
        slaves.wait_slaves().await?;
        Ok(())
    }
}

// =============================================================================
// SimCounter
// =============================================================================

/// Counter device producing one value per trigger.
///
/// The reading task started with the object collects `npoints` values (or runs
/// until `stop` when `npoints` is 0). Every value takes `count_time` to
/// integrate.
pub struct SimCounter {
    count_time: Duration,
    npoints: usize,
    level: f64,
    pending: Semaphore,
    stopped: AtomicBool,
    counted: AtomicUsize,
    channel: Arc<Channel>,
}

impl SimCounter {
    pub fn new(name: &str, count_time: Duration, npoints: usize) -> Self {
        Self {
            count_time,
            npoints,
            level: 100.0,
            pending: Semaphore::new(0),
            stopped: AtomicBool::new(false),
            counted: AtomicUsize::new(0),
            channel: Arc::new(Channel::new(name, DType::Float, vec![])),
        }
    }

    /// Mean count value.
    pub fn with_level(mut self, level: f64) -> Self {
        self.level = level;
        self
    }

    pub fn channel(&self) -> Arc<Channel> {
        self.channel.clone()
    }

    pub fn counted(&self) -> usize {
        self.counted.load(Ordering::SeqCst)
    }

    /// Acquisition object preparing and starting once for the whole scan.
    pub fn object(self: &Arc<Self>, name: &str) -> AcqObject {
        AcqObject::device(name, self.clone())
            .params(
                AcqParams::new()
                    .prepare_once(true)
                    .start_once(true)
                    .npoints(self.npoints),
            )
            .channel(self.channel())
            .build()
    }

    fn done(&self) -> bool {
        self.npoints > 0 && self.counted() >= self.npoints
    }
}

#[async_trait]
impl AcquisitionDevice for SimCounter {
    async fn prepare(&self) -> Result<()> {
        self.stopped.store(false, Ordering::SeqCst);
        self.counted.store(0, Ordering::SeqCst);
        // drop triggers left over from an aborted run
        let stale = self.pending.available_permits();
        if stale > 0 {
            self.pending.forget_permits(stale);
        }
        Ok(())
    }

    async fn start(&self) -> Result<()> {
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.stopped.store(true, Ordering::SeqCst);
        // wake the reading task
        self.pending.add_permits(1);
        Ok(())
    }

    async fn trigger(&self) -> Result<()> {
        self.pending.add_permits(1);
        Ok(())
    }

    async fn reading(&self) -> Result<()> {
        while !self.done() {
            self.pending.acquire().await?.forget();
            if self.stopped.load(Ordering::SeqCst) {
                break;
            }
            sleep(self.count_time).await;
            let noise: f64 = rand::thread_rng().gen_range(-1.0..1.0);
            self.channel.emit(self.level + noise * self.level.sqrt())?;
            let counted = self.counted.fetch_add(1, Ordering::SeqCst) + 1;
            trace!(counted, "value read");
        }
        Ok(())
    }
}

// =============================================================================
// Step scan
// =============================================================================

/// Handles on the drivers of a simulated step scan.
pub struct StepScan {
    pub chain: Chain,
    pub motor: Arc<LinearStepMaster>,
    pub timer: Arc<SoftwareTimerMaster>,
    pub counters: Vec<Arc<SimCounter>>,
}

/// Build `motor → timer → counters` from the simulation settings.
pub fn step_scan(simulation: &SimulationSettings, chain: &ChainSettings) -> AcqResult<StepScan> {
    let npoints = simulation.npoints;
    let count_time = simulation.count_time();

    let motor = Arc::new(LinearStepMaster::new(
        "motor",
        simulation.start,
        simulation.stop,
        npoints,
    ));
    let timer = Arc::new(SoftwareTimerMaster::new(count_time));
    let counters: Vec<Arc<SimCounter>> = simulation
        .counters
        .iter()
        .map(|name| Arc::new(SimCounter::new(name, Duration::ZERO, npoints)))
        .collect();

    let mut scan_chain = Chain::from_settings(chain);
    let motor_object = motor.object("motor");
    let timer_object = timer.object(
        "timer",
        AcqParams::new()
            .prepare_once(true)
            .start_once(true)
            .npoints(npoints),
    );
    scan_chain.add(&motor_object, &timer_object)?;
    for (name, counter) in simulation.counters.iter().zip(&counters) {
        scan_chain.add(&timer_object, &counter.object(name))?;
    }

    Ok(StepScan {
        chain: scan_chain,
        motor,
        timer,
        counters,
    })
}
