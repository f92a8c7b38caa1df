//! Shared test drivers.
//!
//! `Recorder` implements every driver trait and writes each call into a shared
//! `Journal` as `"<name>.<phase>"`, so tests can assert on call counts and on
//! the order of calls across the tree.

#![allow(dead_code)]

use acq_chain::acquisition::{
    AcqObject, AcqParams, AcquisitionDevice, AcquisitionMaster, Advance, PointIteration, Slaves,
};
use acq_chain::chain::ChainView;
use acq_chain::channel::{Channel, DType};
use acq_chain::preset::{ChainPreset, IterationPreset, IterationPresets};
use anyhow::{bail, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::time::{sleep, Duration};

#[derive(Default)]
pub struct Journal {
    entries: Mutex<Vec<String>>,
}

impl Journal {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn record(&self, name: &str, phase: &str) {
        self.entries.lock().push(format!("{}.{}", name, phase));
    }

    pub fn entries(&self) -> Vec<String> {
        self.entries.lock().clone()
    }

    pub fn count(&self, name: &str, phase: &str) -> usize {
        let key = format!("{}.{}", name, phase);
        self.entries.lock().iter().filter(|e| **e == key).count()
    }

    /// Index of the first occurrence of `name.phase`.
    pub fn first(&self, name: &str, phase: &str) -> Option<usize> {
        let key = format!("{}.{}", name, phase);
        self.entries.lock().iter().position(|e| *e == key)
    }

    /// Index of the last occurrence of `name.phase`.
    pub fn last(&self, name: &str, phase: &str) -> Option<usize> {
        let key = format!("{}.{}", name, phase);
        self.entries.lock().iter().rposition(|e| *e == key)
    }
}

pub struct Recorder {
    name: String,
    journal: Arc<Journal>,
    prepare_time: Duration,
    start_time: Duration,
    trigger_time: Duration,
    reading_time: Duration,
    waits_for_slaves: bool,
    channel: Option<Arc<Channel>>,
    failing: Option<&'static str>,
    points: Option<usize>,
    cursor: AtomicUsize,
    ready: AtomicBool,
    self_trigger: bool,
}

impl Recorder {
    pub fn new(name: &str, journal: &Arc<Journal>) -> Self {
        Self {
            name: name.to_string(),
            journal: journal.clone(),
            prepare_time: Duration::ZERO,
            start_time: Duration::ZERO,
            trigger_time: Duration::ZERO,
            reading_time: Duration::ZERO,
            waits_for_slaves: false,
            channel: None,
            failing: None,
            points: None,
            cursor: AtomicUsize::new(0),
            ready: AtomicBool::new(true),
            self_trigger: false,
        }
    }

    /// Time spent in `prepare`, journaled as "prepare_done" once elapsed.
    pub fn prepare_time(mut self, time: Duration) -> Self {
        self.prepare_time = time;
        self
    }

    /// Time spent in `start`, journaled as "start_done" once elapsed.
    pub fn start_time(mut self, time: Duration) -> Self {
        self.start_time = time;
        self
    }

    /// Master only: wait for the slaves' prepare before preparing.
    pub fn waiting_for_slaves(mut self) -> Self {
        self.waits_for_slaves = true;
        self
    }

    /// Declare a scalar float channel `value`, emitting the reading count on
    /// every reading.
    pub fn emitting(mut self) -> Self {
        self.channel = Some(Arc::new(Channel::new("value", DType::Float, vec![])));
        self
    }

    pub fn trigger_time(mut self, time: Duration) -> Self {
        self.trigger_time = time;
        self
    }

    pub fn reading_time(mut self, time: Duration) -> Self {
        self.reading_time = time;
        self
    }

    /// Fail every call of `phase` ("prepare", "start", "trigger", "stop", "reading").
    pub fn failing(mut self, phase: &'static str) -> Self {
        self.failing = Some(phase);
        self
    }

    /// Register a per-point sequence of `points` points (possibly none).
    pub fn points(mut self, points: usize) -> Self {
        self.points = Some(points);
        self
    }

    /// Top-level master triggering itself from `start`.
    pub fn self_triggering(mut self) -> Self {
        self.self_trigger = true;
        self
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    fn step(&self, phase: &'static str) -> Result<()> {
        self.journal.record(&self.name, phase);
        if self.failing == Some(phase) {
            bail!("{} failed on purpose", phase);
        }
        Ok(())
    }

    async fn timed(&self, phase: &'static str, time: Duration, done: &'static str) -> Result<()> {
        self.step(phase)?;
        sleep(time).await;
        self.journal.record(&self.name, done);
        Ok(())
    }

    pub fn master(self, params: AcqParams) -> AcqObject {
        let iterating = self.points.is_some();
        let name = self.name.clone();
        let recorder = Arc::new(self);
        let mut builder = AcqObject::master(name, recorder.clone()).params(params);
        if let Some(channel) = &recorder.channel {
            builder = builder.channel(channel.clone());
        }
        if iterating {
            builder.iterating(recorder).build()
        } else {
            builder.build()
        }
    }

    pub fn device(self, params: AcqParams) -> AcqObject {
        let iterating = self.points.is_some();
        let name = self.name.clone();
        let recorder = Arc::new(self);
        let mut builder = AcqObject::device(name, recorder.clone()).params(params);
        if let Some(channel) = &recorder.channel {
            builder = builder.channel(channel.clone());
        }
        if iterating {
            builder.iterating(recorder).build()
        } else {
            builder.build()
        }
    }
}

impl PointIteration for Recorder {
    fn rewind(&self) -> Advance {
        self.cursor.store(0, Ordering::SeqCst);
        if self.points.unwrap_or(0) > 0 {
            Advance::Point
        } else {
            Advance::Exhausted
        }
    }

    fn advance(&self) -> Advance {
        let next = self.cursor.fetch_add(1, Ordering::SeqCst) + 1;
        if next < self.points.unwrap_or(0) {
            Advance::Point
        } else {
            Advance::Exhausted
        }
    }
}

#[async_trait]
impl AcquisitionMaster for Recorder {
    async fn prepare(&self, slaves: &Slaves) -> Result<()> {
        self.step("prepare")?;
        if self.waits_for_slaves {
            slaves.wait_slaves_prepare().await?;
        }
        sleep(self.prepare_time).await;
        self.journal.record(&self.name, "prepare_done");
        Ok(())
    }

    async fn start(&self, slaves: &Slaves) -> Result<()> {
        self.timed("start", self.start_time, "start_done").await?;
        if self.self_trigger && slaves.is_top_level() {
            AcquisitionMaster::trigger(self, slaves).await?;
        }
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.step("stop")
    }

    async fn trigger(&self, slaves: &Slaves) -> Result<()> {
        self.step("trigger")?;
        slaves.trigger_slaves().await?;
        sleep(self.trigger_time).await;
        slaves.wait_slaves().await?;
        self.journal.record(&self.name, "trigger_done");
        Ok(())
    }

    fn trigger_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AcquisitionDevice for Recorder {
    async fn prepare(&self) -> Result<()> {
        self.timed("prepare", self.prepare_time, "prepare_done").await
    }

    async fn start(&self) -> Result<()> {
        self.timed("start", self.start_time, "start_done").await
    }

    async fn stop(&self) -> Result<()> {
        self.step("stop")
    }

    async fn trigger(&self) -> Result<()> {
        self.step("trigger")?;
        sleep(self.trigger_time).await;
        self.journal.record(&self.name, "trigger_done");
        Ok(())
    }

    async fn reading(&self) -> Result<()> {
        self.step("reading")?;
        sleep(self.reading_time).await;
        if let Some(channel) = &self.channel {
            let count = self.journal.count(&self.name, "reading") as f64;
            channel.emit(count)?;
        }
        self.journal.record(&self.name, "reading_done");
        Ok(())
    }

    fn trigger_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }
}

/// Chain preset recording its calls and handing out `per_point` per-point
/// presets (unbounded when `None`).
pub struct RecordingPreset {
    name: String,
    journal: Arc<Journal>,
    per_point: Option<usize>,
    point_prepare_time: Duration,
    failing: Option<&'static str>,
}

impl RecordingPreset {
    pub fn new(name: &str, journal: &Arc<Journal>) -> Self {
        Self {
            name: name.to_string(),
            journal: journal.clone(),
            per_point: Some(0),
            point_prepare_time: Duration::ZERO,
            failing: None,
        }
    }

    pub fn per_point(mut self, count: Option<usize>) -> Self {
        self.per_point = count;
        self
    }

    /// Time spent in each per-point `prepare`. One dropped before the end is
    /// journaled as "prepare_cancelled".
    pub fn point_prepare_time(mut self, time: Duration) -> Self {
        self.point_prepare_time = time;
        self
    }

    pub fn failing(mut self, phase: &'static str) -> Self {
        self.failing = Some(phase);
        self
    }

    fn step(&self, phase: &'static str) -> Result<()> {
        self.journal.record(&self.name, phase);
        if self.failing == Some(phase) {
            bail!("preset {} failed", phase);
        }
        Ok(())
    }
}

#[async_trait]
impl ChainPreset for RecordingPreset {
    async fn prepare(&self, _chain: &ChainView) -> Result<()> {
        self.step("prepare")
    }

    async fn start(&self, _chain: &ChainView) -> Result<()> {
        self.step("start")
    }

    async fn stop(&self, _chain: &ChainView) -> Result<()> {
        self.step("stop")
    }

    fn iteration_presets(&self, _chain: &ChainView) -> Option<IterationPresets> {
        let name = format!("{}#point", self.name);
        let journal = self.journal.clone();
        let prepare_time = self.point_prepare_time;
        let points = std::iter::repeat_with(move || -> Box<dyn IterationPreset> {
            Box::new(PointPreset {
                name: name.clone(),
                journal: journal.clone(),
                prepare_time,
            })
        });
        match self.per_point {
            Some(0) => None,
            Some(count) => Some(Box::new(points.take(count))),
            None => Some(Box::new(points)),
        }
    }
}

struct PointPreset {
    name: String,
    journal: Arc<Journal>,
    prepare_time: Duration,
}

/// Journals "prepare_cancelled" unless disarmed before being dropped.
struct CancelMark<'a> {
    preset: &'a PointPreset,
    armed: bool,
}

impl CancelMark<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for CancelMark<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.preset
                .journal
                .record(&self.preset.name, "prepare_cancelled");
        }
    }
}

#[async_trait]
impl IterationPreset for PointPreset {
    async fn prepare(&self) -> Result<()> {
        self.journal.record(&self.name, "prepare");
        let mark = CancelMark {
            preset: self,
            armed: true,
        };
        sleep(self.prepare_time).await;
        mark.disarm();
        Ok(())
    }

    async fn start(&self) -> Result<()> {
        self.journal.record(&self.name, "start");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.journal.record(&self.name, "stop");
        Ok(())
    }
}
