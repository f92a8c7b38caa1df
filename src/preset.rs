//! Scan-scope and per-point hooks.
//!
//! A [`ChainPreset`] runs around a whole iteration of the chain: typically it
//! opens a shutter at `start` and closes it at `stop`, or switches a beamline
//! multiplexer. If it also needs to act around every point, it hands out
//! [`IterationPreset`]s from [`ChainPreset::iteration_presets`]: one is pulled
//! per point, prepared/started with the tree and stopped when the iterator
//! moves on. The returned iterator may be infinite; once it is exhausted no
//! further per-point hooks run for that preset.
//!
//! Hooks report failures through `anyhow::Result`. The engine surfaces them
//! unchanged as [`AcqError::Preset`](crate::error::AcqError::Preset).

use anyhow::Result;
use async_trait::async_trait;

use crate::chain::ChainView;

/// Lazy source of per-point hooks.
pub type IterationPresets = Box<dyn Iterator<Item = Box<dyn IterationPreset>> + Send>;

#[async_trait]
pub trait ChainPreset: Send + Sync {
    /// Called once at the first point, concurrently with the other presets.
    async fn prepare(&self, chain: &ChainView) -> Result<()> {
        let _ = chain;
        Ok(())
    }

    async fn start(&self, chain: &ChainView) -> Result<()> {
        let _ = chain;
        Ok(())
    }

    /// Called from the stop sweep, even when the run failed.
    async fn stop(&self, chain: &ChainView) -> Result<()> {
        let _ = chain;
        Ok(())
    }

    fn iteration_presets(&self, chain: &ChainView) -> Option<IterationPresets> {
        let _ = chain;
        None
    }
}

/// Hook bound to a single point.
#[async_trait]
pub trait IterationPreset: Send + Sync {
    async fn prepare(&self) -> Result<()> {
        Ok(())
    }

    async fn start(&self) -> Result<()> {
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        Ok(())
    }
}
