//! Scheduler driving one (sub-)tree through a run.
//!
//! The [`ChainIterator`] is the executor behind a scan. It walks its tree level
//! by level and runs every lifecycle phase on all objects of a depth
//! concurrently:
//!
//! ```text
//! next()     wait_ready, top-down        advance adapters, stop per-point presets
//! prepare()  presets + hook, bottom-up   (strict: barrier per depth)
//! start()    presets, bottom-up          (barrier per depth)
//! trigger()  top-level masters
//! stop()     top-down, then reading/slave joins, `end` events, presets
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! let mut it = chain.iter();
//! while it.next().await? == Advance::Point {
//!     it.prepare().await?;
//!     it.start().await?;
//! }
//! ```
//!
//! On the progress paths (`prepare`, `start`, `trigger`) every task of a round
//! runs to completion before the first error is returned. On the termination
//! path (`stop`) every step runs even if an earlier one failed; the first
//! error of the sweep is returned at the end.

use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

use super::adapter::DeviceIter;
use super::tree::{NodeId, Tree};
use super::ChainView;
use crate::acquisition::Advance;
use crate::error::{AcqError, AcqResult};
use crate::preset::{ChainPreset, IterationPreset, IterationPresets};

/// Lifecycle of a [`ChainIterator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterState {
    Init,
    Preparing,
    Ready,
    Triggering,
    Stopping,
    Stopped,
}

impl std::fmt::Display for IterState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            IterState::Init => "init",
            IterState::Preparing => "preparing",
            IterState::Ready => "ready",
            IterState::Triggering => "triggering",
            IterState::Stopping => "stopping",
            IterState::Stopped => "stopped",
        };
        write!(f, "{}", label)
    }
}

pub struct ChainIterator {
    view: ChainView,
    tree: Tree,
    /// Adapters in depth-first order.
    adapters: Vec<DeviceIter>,
    /// Adapter indexes grouped by depth, shallowest first.
    levels: Vec<Vec<usize>>,
    presets: Vec<Arc<dyn ChainPreset>>,
    preset_sources: Mutex<Vec<IterationPresets>>,
    live_presets: Vec<Arc<dyn IterationPreset>>,
    parallel_prepare: bool,
    index: Option<usize>,
    state: IterState,
}

impl ChainIterator {
    pub(crate) fn new(
        view: ChainView,
        tree: Tree,
        presets: Vec<Arc<dyn ChainPreset>>,
        parallel_prepare: bool,
    ) -> Self {
        let order = tree.depth_first();
        let position: HashMap<NodeId, usize> =
            order.iter().enumerate().map(|(i, node)| (*node, i)).collect();
        let adapters = order
            .iter()
            .filter_map(|node| {
                let object = tree.object(*node)?.clone();
                let top_level = tree.parent(*node) == Some(NodeId::ROOT);
                Some(DeviceIter::new(object, top_level))
            })
            .collect();
        let levels = tree
            .levels()
            .iter()
            .map(|level| level.iter().filter_map(|n| position.get(n).copied()).collect())
            .collect();
        let state = if tree.is_empty() {
            IterState::Stopped
        } else {
            IterState::Init
        };

        Self {
            view,
            tree,
            adapters,
            levels,
            presets,
            preset_sources: Mutex::new(Vec::new()),
            live_presets: Vec::new(),
            parallel_prepare,
            index: None,
            state,
        }
    }

    pub fn state(&self) -> IterState {
        self.state
    }

    /// Current point, `None` before the first `next()`.
    pub fn index(&self) -> Option<usize> {
        self.index
    }

    /// Tree driven by this iterator.
    pub fn tree(&self) -> &Tree {
        &self.tree
    }

    /// Name of the first top-level master.
    pub fn top_master(&self) -> Option<&str> {
        self.tree
            .top_level()
            .first()
            .and_then(|node| self.tree.object(*node))
            .map(|object| object.name())
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.state, IterState::Stopping | IterState::Stopped)
    }

    fn ensure_active(&self, operation: &str) -> AcqResult<()> {
        if self.is_finished() {
            return Err(AcqError::Configuration(format!(
                "cannot {} a {} iterator",
                operation, self.state
            )));
        }
        if self.index.is_none() {
            return Err(AcqError::Configuration(format!(
                "cannot {} before the first next()",
                operation
            )));
        }
        Ok(())
    }

    /// Move to the next point.
    ///
    /// Returns [`Advance::Exhausted`] once the top-level sequence ran out; by
    /// then the full stop sweep has already run.
    #[instrument(skip_all, fields(index), err)]
    pub async fn next(&mut self) -> AcqResult<Advance> {
        if self.is_finished() {
            return Ok(Advance::Exhausted);
        }
        let index = self.index.map_or(0, |i| i + 1);
        self.index = Some(index);
        tracing::Span::current().record("index", index);

        if index == 0 && self.adapters.iter().any(DeviceIter::is_empty) {
            info!("empty sequence");
            self.stop().await?;
            return Ok(Advance::Exhausted);
        }

        for level in &self.levels {
            let results = join_all(level.iter().map(|i| self.adapters[*i].wait_ready())).await;
            for result in results {
                result?;
            }
        }

        if index > 0 {
            for i in 0..self.adapters.len() {
                if self.adapters[i].advance().await?.is_exhausted() {
                    debug!(object = self.adapters[i].name(), "sequence exhausted");
                    self.stop().await?;
                    return Ok(Advance::Exhausted);
                }
            }
        }

        let live = std::mem::take(&mut self.live_presets);
        settle(join_all(live.iter().map(|p| preset_call(p.stop()))).await)?;

        self.state = IterState::Ready;
        Ok(Advance::Point)
    }

    /// Prepare the current point.
    pub async fn prepare(&mut self) -> AcqResult<()> {
        self.prepare_with(async { Ok(()) }).await
    }

    /// Prepare the current point, running `hook` concurrently with the chain
    /// presets.
    #[instrument(skip_all, fields(index = ?self.index), err)]
    pub async fn prepare_with<F>(&mut self, hook: F) -> AcqResult<()>
    where
        F: Future<Output = anyhow::Result<()>> + Send,
    {
        self.ensure_active("prepare")?;
        self.state = IterState::Preparing;

        if self.index == Some(0) {
            for adapter in &self.adapters {
                adapter.object().channels().clear();
            }

            let view = &self.view;
            let presets = join_all(self.presets.iter().map(|p| preset_call(p.prepare(view))));
            let (results, hooked) = tokio::join!(presets, preset_call(hook));
            settle(results)?;
            hooked?;

            let sources = self
                .presets
                .iter()
                .filter_map(|p| p.iteration_presets(&self.view))
                .collect();
            *self.preset_sources.lock() = sources;
        } else {
            preset_call(hook).await?;
        }

        // one per-point preset from every source still alive
        let live: Vec<Arc<dyn IterationPreset>> = {
            let mut sources = self.preset_sources.lock();
            let mut live = Vec::new();
            sources.retain_mut(|source| match source.next() {
                Some(preset) => {
                    live.push(Arc::from(preset));
                    true
                }
                None => false,
            });
            live
        };
        self.live_presets = live.clone();

        let mut preset_tasks = JoinSet::new();
        for preset in live {
            preset_tasks.spawn(async move { preset_call(preset.prepare()).await });
        }

        if let Err(err) = self.prepare_tree().await {
            // no preset prepare may outlive the error into the stop sweep
            preset_tasks.abort_all();
            while preset_tasks.join_next().await.is_some() {}
            return Err(err);
        }

        let mut results = Vec::new();
        while let Some(joined) = preset_tasks.join_next().await {
            results.push(joined.unwrap_or_else(|e| Err(e.into())));
        }
        settle(results)?;

        self.state = IterState::Ready;
        Ok(())
    }

    async fn prepare_tree(&self) -> AcqResult<()> {
        if !self.parallel_prepare {
            for level in self.levels.iter().rev() {
                settle(join_all(level.iter().map(|i| self.adapters[*i].prepare())).await)?;
            }
            return Ok(());
        }

        let objects: Vec<_> = self
            .levels
            .iter()
            .rev()
            .flatten()
            .map(|i| &self.adapters[*i])
            .filter(|adapter| !adapter.skips_prepare())
            .map(|adapter| adapter.object().clone())
            .collect();
        // flagged before any task runs, for masters waiting on their slaves
        for object in &objects {
            object.mark_preparing();
        }
        let mut tasks = JoinSet::new();
        for object in objects {
            tasks.spawn(async move { object.prepare().await });
        }
        let mut results = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            results.push(joined.unwrap_or_else(|e| Err(e.into())));
        }
        settle(results)
    }

    /// Start the current point.
    #[instrument(skip_all, fields(index = ?self.index), err)]
    pub async fn start(&mut self) -> AcqResult<()> {
        self.ensure_active("start")?;

        let view = &self.view;
        let mut hooks = Vec::new();
        if self.index == Some(0) {
            hooks.extend(self.presets.iter().map(|p| preset_call(p.start(view))));
        }
        hooks.extend(self.live_presets.iter().map(|p| preset_call(p.start())));
        settle(join_all(hooks).await)?;

        for level in self.levels.iter().rev() {
            settle(join_all(level.iter().map(|i| self.adapters[*i].start())).await)?;
        }
        Ok(())
    }

    /// Software trigger of every top-level master.
    #[instrument(skip_all, fields(index = ?self.index), err)]
    pub async fn trigger(&mut self) -> AcqResult<()> {
        self.ensure_active("trigger")?;
        self.state = IterState::Triggering;

        let masters: Vec<&DeviceIter> = self
            .levels
            .first()
            .map(|level| level.iter().map(|i| &self.adapters[*i]).collect())
            .unwrap_or_default();
        let result = settle(join_all(masters.iter().map(|m| m.object().trigger())).await);

        self.state = IterState::Ready;
        result
    }

    /// Stop the run. Only the first call has an effect.
    #[instrument(skip_all, fields(index = ?self.index), err)]
    pub async fn stop(&mut self) -> AcqResult<()> {
        if self.is_finished() {
            return Ok(());
        }
        self.state = IterState::Stopping;
        let mut sweep = Sweep::default();

        for level in &self.levels {
            let results = join_all(level.iter().map(|i| self.adapters[*i].object().stop())).await;
            for result in results {
                sweep.keep(result);
            }
        }

        for adapter in &self.adapters {
            let object = adapter.object();
            sweep.keep(object.wait_reading().await);
            if let Some(slaves) = object.slaves() {
                sweep.keep(slaves.wait_slaves().await);
            }
            object.publish_end();
        }

        let view = &self.view;
        let mut hooks = Vec::new();
        hooks.extend(self.presets.iter().map(|p| preset_call(p.stop(view))));
        hooks.extend(self.live_presets.iter().map(|p| preset_call(p.stop())));
        for result in join_all(hooks).await {
            sweep.keep(result);
        }
        self.live_presets.clear();

        self.state = IterState::Stopped;
        info!(errors = sweep.count, "iterator stopped");
        sweep.finish()
    }
}

impl std::fmt::Debug for ChainIterator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainIterator")
            .field("top_master", &self.top_master())
            .field("state", &self.state)
            .field("index", &self.index)
            .field("objects", &self.adapters.len())
            .field("presets", &self.presets.len())
            .finish()
    }
}

async fn preset_call<F>(call: F) -> AcqResult<()>
where
    F: Future<Output = anyhow::Result<()>>,
{
    call.await.map_err(AcqError::from_preset)
}

/// First error of a round whose tasks have all completed.
fn settle(results: Vec<AcqResult<()>>) -> AcqResult<()> {
    let mut sweep = Sweep::default();
    for result in results {
        sweep.keep(result);
    }
    sweep.finish()
}

/// Error accumulator for rounds that must run to the end.
#[derive(Default)]
struct Sweep {
    first: Option<AcqError>,
    count: usize,
}

impl Sweep {
    fn keep(&mut self, result: AcqResult<()>) {
        if let Err(err) = result {
            self.count += 1;
            if self.first.is_none() {
                self.first = Some(err);
            } else {
                warn!(error = %err, "additional failure");
            }
        }
    }

    fn finish(self) -> AcqResult<()> {
        match self.first {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
