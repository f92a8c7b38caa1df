//! Capability traits implemented by hardware drivers.
//!
//! The engine consumes two driver shapes:
//!
//! - [`AcquisitionMaster`]: owns slaves and triggers them (timers, motor step
//!   masters, multichannel cards acting as a trigger source).
//! - [`AcquisitionDevice`]: a leaf producing data through channels, usually from a
//!   background [`reading`](AcquisitionDevice::reading) routine.
//!
//! A driver that reconfigures itself before every point (a positioner moving to
//! position N before point N) also implements [`PointIteration`] and registers it
//! when the acquisition object is built.
//!
//! # Contract
//!
//! - All methods take `&self`; drivers keep their state behind interior
//!   mutability (`Mutex`, `RwLock`, atomics).
//! - Errors are reported through `anyhow::Result`; the engine adds the object
//!   name and the phase.
//! - `prepare`, `start`, `stop` and `trigger` default to
//!   [`AcqError::NotImplemented`]; a driver must override the ones it takes part in.
//!
//! # Example
//!
//! ```rust,ignore
//! struct Shutter { open: AtomicBool }
//!
//! #[async_trait]
//! impl AcquisitionDevice for Shutter {
//!     async fn prepare(&self) -> Result<()> { Ok(()) }
//!     async fn start(&self) -> Result<()> { Ok(()) }
//!     async fn stop(&self) -> Result<()> {
//!         self.open.store(false, Ordering::SeqCst);
//!         Ok(())
//!     }
//!     async fn trigger(&self) -> Result<()> {
//!         self.open.store(true, Ordering::SeqCst);
//!         Ok(())
//!     }
//! }
//! ```

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::slaves::Slaves;
use crate::error::AcqError;

/// How an acquisition object receives its triggers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerType {
    /// Fired by an external hardware signal; masters never trigger it explicitly.
    Hardware,
    /// Triggered by its master through `Slaves::trigger_slaves`.
    #[default]
    Software,
}

/// Result of moving a per-point sequence forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advance {
    /// The object is configured for a new point.
    Point,
    /// No point left.
    Exhausted,
}

impl Advance {
    pub fn is_exhausted(self) -> bool {
        self == Advance::Exhausted
    }
}

/// Capability: master of a sub-tree.
#[async_trait]
pub trait AcquisitionMaster: Send + Sync {
    /// With parallel prepare enabled, a master that must come after its
    /// slaves calls `slaves.wait_slaves_prepare()` first.
    async fn prepare(&self, slaves: &Slaves) -> Result<()> {
        let _ = slaves;
        Err(AcqError::NotImplemented("prepare").into())
    }

    /// Top-level masters usually trigger themselves from here
    /// (see [`Slaves::is_top_level`]).
    async fn start(&self, slaves: &Slaves) -> Result<()> {
        let _ = slaves;
        Err(AcqError::NotImplemented("start").into())
    }

    async fn stop(&self) -> Result<()> {
        Err(AcqError::NotImplemented("stop").into())
    }

    /// One trigger round. Implementations call `slaves.trigger_slaves()`, do
    /// their own work, then `slaves.wait_slaves()`.
    async fn trigger(&self, slaves: &Slaves) -> Result<()> {
        let _ = slaves;
        Err(AcqError::NotImplemented("trigger").into())
    }

    /// Whether the master can accept a new trigger.
    fn trigger_ready(&self) -> bool {
        true
    }

    /// Suspend until ready for the next point (slaves not considered).
    async fn wait_ready(&self) -> Result<bool> {
        Ok(true)
    }
}

/// Capability: leaf device.
#[async_trait]
pub trait AcquisitionDevice: Send + Sync {
    async fn prepare(&self) -> Result<()> {
        Err(AcqError::NotImplemented("prepare").into())
    }

    async fn start(&self) -> Result<()> {
        Err(AcqError::NotImplemented("start").into())
    }

    async fn stop(&self) -> Result<()> {
        Err(AcqError::NotImplemented("stop").into())
    }

    async fn trigger(&self) -> Result<()> {
        Err(AcqError::NotImplemented("trigger").into())
    }

    /// Background routine spawned on `start` and after every trigger that found
    /// the previous routine finished. Typically reads the hardware and emits into
    /// the device channels until the expected number of points is reached.
    async fn reading(&self) -> Result<()> {
        Ok(())
    }

    fn trigger_ready(&self) -> bool {
        true
    }

    async fn wait_ready(&self) -> Result<bool> {
        Ok(true)
    }
}

/// Capability: per-point reconfiguration.
///
/// Both methods configure the driver for the point they land on, so that the
/// following `prepare`/`start` act on it.
pub trait PointIteration: Send + Sync {
    /// Go back to the first point.
    fn rewind(&self) -> Advance;

    /// Move to the next point.
    fn advance(&self) -> Advance;
}
