//! Per-object iteration state inside one chain iterator.
//!
//! A simple object repeats itself for every point. An object registered with a
//! [`PointIteration`] is moved to the next point on every advance. Exhausting a
//! top-level object ends the scan; a nested object waits for its reading task,
//! rewinds and carries on.

use tracing::debug;

use crate::acquisition::{AcqObject, Advance};
use crate::error::AcqResult;

#[derive(Debug)]
pub(crate) struct DeviceIter {
    object: AcqObject,
    top_level: bool,
    index: usize,
    exhausted: bool,
}

impl DeviceIter {
    pub fn new(object: AcqObject, top_level: bool) -> Self {
        // position the first point
        let exhausted = object
            .iteration()
            .is_some_and(|iteration| iteration.rewind().is_exhausted());
        Self {
            object,
            top_level,
            index: 0,
            exhausted,
        }
    }

    pub fn object(&self) -> &AcqObject {
        &self.object
    }

    pub fn name(&self) -> &str {
        self.object.name()
    }

    /// True when the object had no point at all.
    pub fn is_empty(&self) -> bool {
        self.exhausted
    }

    pub async fn advance(&mut self) -> AcqResult<Advance> {
        let step = match self.object.iteration() {
            None if self.top_level => Advance::Exhausted,
            None => {
                if !self.object.prepare_once() && !self.object.start_once() {
                    self.object.wait_reading().await?;
                }
                Advance::Point
            }
            Some(iteration) => match iteration.advance() {
                Advance::Point => Advance::Point,
                Advance::Exhausted if self.top_level => Advance::Exhausted,
                Advance::Exhausted => {
                    self.object.wait_reading().await?;
                    debug!(object = self.object.name(), "nested sequence rewound");
                    iteration.rewind()
                }
            },
        };
        if step == Advance::Point {
            self.index += 1;
        }
        Ok(step)
    }

    pub async fn wait_ready(&self) -> AcqResult<bool> {
        self.object.wait_ready().await
    }

    pub fn skips_prepare(&self) -> bool {
        self.index > 0 && self.object.prepare_once()
    }

    pub fn skips_start(&self) -> bool {
        self.index > 0 && self.object.start_once()
    }

    pub async fn prepare(&self) -> AcqResult<()> {
        if self.skips_prepare() {
            return Ok(());
        }
        self.object.prepare().await
    }

    pub async fn start(&self) -> AcqResult<()> {
        if self.skips_start() {
            return Ok(());
        }
        self.object.start().await
    }
}
