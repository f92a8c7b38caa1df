//! Acquisition chain builder.
//!
//! A [`Chain`] accumulates master → slave edges into a [`Tree`], together with
//! presets, the stopper policy of every top-level master, the event bus and the
//! timing statistics shared by all of its objects. Runs are driven by the
//! [`ChainIterator`]s it produces.
//!
//! ```rust,ignore
//! let mut chain = Chain::new();
//! chain.add(&timer, &diode)?;
//! chain.add(&timer, &mca)?;
//! chain.add_preset(Arc::new(Shutter::default()));
//!
//! for mut it in chain.iter_list() {
//!     // drive it, or hand the list to `Scan`
//! }
//! ```

pub mod adapter;
pub mod iter;
pub mod tree;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::acquisition::{AcqObject, ChainContext, ObjectId};
use crate::config::ChainSettings;
use crate::error::{AcqError, AcqResult};
use crate::events::{AcqEvent, EventBus};
use crate::preset::ChainPreset;
use crate::stats::ChainStats;

pub use iter::{ChainIterator, IterState};
pub use tree::{NodeId, Tree};

/// Read-only snapshot of a chain, handed to presets.
#[derive(Debug, Clone)]
pub struct ChainView {
    tree: Arc<Tree>,
}

impl ChainView {
    pub fn tree(&self) -> &Tree {
        &self.tree
    }

    /// Objects in depth-first order.
    pub fn nodes(&self) -> Vec<AcqObject> {
        objects(&self.tree, &self.tree.depth_first())
    }

    pub fn top_masters(&self) -> Vec<AcqObject> {
        objects(&self.tree, self.tree.top_level())
    }

    pub fn find(&self, name: &str) -> Option<AcqObject> {
        self.tree
            .find(name)
            .and_then(|node| self.tree.object(node).cloned())
    }

    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }
}

impl fmt::Display for ChainView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&*self.tree, f)
    }
}

fn objects(tree: &Tree, nodes: &[NodeId]) -> Vec<AcqObject> {
    nodes
        .iter()
        .filter_map(|node| tree.object(*node).cloned())
        .collect()
}

pub struct Chain {
    tree: Tree,
    context: ChainContext,
    presets: Vec<Arc<dyn ChainPreset>>,
    master_presets: HashMap<ObjectId, Vec<Arc<dyn ChainPreset>>>,
    stoppers: HashMap<ObjectId, bool>,
    parallel_prepare: bool,
}

impl Default for Chain {
    fn default() -> Self {
        Self::new()
    }
}

impl Chain {
    pub fn new() -> Self {
        Self::from_settings(&ChainSettings::default())
    }

    pub fn from_settings(settings: &ChainSettings) -> Self {
        Self {
            tree: Tree::new(),
            context: ChainContext {
                bus: EventBus::new(settings.event_capacity),
                stats: Arc::new(ChainStats::new()),
            },
            presets: Vec::new(),
            master_presets: HashMap::new(),
            stoppers: HashMap::new(),
            parallel_prepare: settings.parallel_prepare,
        }
    }

    /// Prepare every depth at once instead of level by level.
    pub fn with_parallel_prepare(mut self, parallel: bool) -> Self {
        self.parallel_prepare = parallel;
        self
    }

    pub fn parallel_prepare(&self) -> bool {
        self.parallel_prepare
    }

    /// Put `slave` under `master`.
    ///
    /// Adding a slave to its current master again is a no-op. A top-level
    /// object becomes a slave of `master`, bringing its sub-tree along. Any
    /// other already-parented slave is rejected: use [`Chain::reparent`].
    pub fn add(&mut self, master: &AcqObject, slave: &AcqObject) -> AcqResult<()> {
        self.check_edge(master, slave)?;
        let master_node = self.tree.node_of(master);

        if let Some(slave_node) = self.tree.node_of(slave) {
            let parent = self.tree.parent(slave_node).unwrap_or(NodeId::ROOT);
            if master_node == Some(parent) {
                debug!(master = %master, slave = %slave, "edge already present");
                return Ok(());
            }
            if !parent.is_root() {
                let current = self.tree.object(parent).map_or("?", |o| o.name());
                return Err(AcqError::Configuration(format!(
                    "cannot add {} to multiple masters, current master is {}",
                    slave, current
                )));
            }
        }

        self.insert_edge(master, slave);
        Ok(())
    }

    /// Move `slave`, already in the tree, under `master`.
    pub fn reparent(&mut self, master: &AcqObject, slave: &AcqObject) -> AcqResult<()> {
        self.check_edge(master, slave)?;
        if !self.tree.contains(slave) {
            return Err(AcqError::Configuration(format!(
                "{} is not part of the chain",
                slave
            )));
        }
        self.insert_edge(master, slave);
        Ok(())
    }

    fn check_edge(&self, master: &AcqObject, slave: &AcqObject) -> AcqResult<()> {
        if !master.is_master() {
            return Err(AcqError::Configuration(format!(
                "{} is a device and cannot have slaves",
                master
            )));
        }
        if master == slave {
            return Err(AcqError::Configuration(format!(
                "{} cannot be its own slave",
                master
            )));
        }
        self.check_name(master)?;
        self.check_name(slave)?;

        if let (Some(master_node), Some(slave_node)) =
            (self.tree.node_of(master), self.tree.node_of(slave))
        {
            if self.tree.is_ancestor(slave_node, master_node) {
                return Err(AcqError::Configuration(format!(
                    "adding {} under {} would create a cycle",
                    slave, master
                )));
            }
        }
        Ok(())
    }

    fn check_name(&self, object: &AcqObject) -> AcqResult<()> {
        match self.tree.find(object.name()) {
            Some(node) if self.tree.object(node) != Some(object) => Err(AcqError::Configuration(
                format!("another object is already named {}", object.name()),
            )),
            _ => Ok(()),
        }
    }

    fn insert_edge(&mut self, master: &AcqObject, slave: &AcqObject) {
        let master_node = match self.tree.node_of(master) {
            Some(node) => node,
            None => {
                master.attach(self.context.clone());
                self.tree.insert(NodeId::ROOT, master.clone())
            }
        };
        match self.tree.node_of(slave) {
            Some(slave_node) => {
                self.tree.move_node(slave_node, master_node);
                // only top-level masters carry presets and stopper flags
                self.master_presets.remove(&slave.id());
                self.stoppers.remove(&slave.id());
            }
            None => {
                slave.attach(self.context.clone());
                self.tree.insert(master_node, slave.clone());
            }
        }
        debug!(master = %master, slave = %slave, "edge added");
    }

    fn top_level_node(&self, master: &AcqObject) -> AcqResult<NodeId> {
        self.tree
            .node_of(master)
            .filter(|node| self.tree.parent(*node) == Some(NodeId::ROOT))
            .ok_or_else(|| {
                let top: Vec<String> = self.top_masters().iter().map(|m| m.to_string()).collect();
                AcqError::Configuration(format!("master {} not in {:?}", master, top))
            })
    }

    /// Preset of the whole chain. With several top-level masters it runs with
    /// the first one.
    pub fn add_preset(&mut self, preset: Arc<dyn ChainPreset>) {
        self.presets.push(preset);
    }

    /// Preset bound to the iterator of one top-level master.
    pub fn add_preset_for(
        &mut self,
        master: &AcqObject,
        preset: Arc<dyn ChainPreset>,
    ) -> AcqResult<()> {
        self.top_level_node(master)?;
        self.master_presets
            .entry(master.id())
            .or_default()
            .push(preset);
        Ok(())
    }

    /// Whether running out of points on `master` ends the whole scan.
    pub fn set_stopper(&mut self, master: &AcqObject, stops_scan: bool) -> AcqResult<()> {
        self.top_level_node(master)?;
        self.stoppers.insert(master.id(), stops_scan);
        Ok(())
    }

    /// Top-level masters are stoppers unless told otherwise.
    pub fn is_stopper(&self, master: &AcqObject) -> bool {
        self.stoppers.get(&master.id()).copied().unwrap_or(true)
    }

    /// Re-emit the channels of `master` each time channel `to_channel` of
    /// `object` emits, so both record the same number of points. `master`
    /// must be an ancestor of `object`, and should emit once per point before
    /// `object` does.
    pub fn attach_channels(
        &self,
        master: &AcqObject,
        object: &AcqObject,
        to_channel: &str,
    ) -> AcqResult<()> {
        let is_ancestor = match (self.tree.node_of(master), self.tree.node_of(object)) {
            (Some(master_node), Some(node)) => self.tree.is_ancestor(master_node, node),
            _ => false,
        };
        if !is_ancestor {
            return Err(AcqError::Configuration(format!(
                "{} is not a master of {}",
                master, object
            )));
        }
        let emitter = object.channels().get(to_channel).ok_or_else(|| {
            AcqError::Configuration(format!(
                "the device {} does not have a channel called {}",
                object, to_channel
            ))
        })?;
        master.channels().attach_to(emitter)?;
        debug!(master = %master, object = %object, channel = to_channel, "channels attached");
        Ok(())
    }

    /// Merge the edges of `other`. Its chain-scope presets follow when
    /// `add_presets` is set.
    pub fn append(&mut self, other: &Chain, add_presets: bool) -> AcqResult<()> {
        for node in other.tree.depth_first() {
            let Some(master) = other.tree.object(node) else {
                continue;
            };
            for slave in other.tree.child_objects(node) {
                self.add(master, &slave)?;
            }
        }
        if add_presets {
            self.presets.extend(other.presets.iter().cloned());
        }
        info!(objects = self.tree.len(), "chain appended");
        Ok(())
    }

    /// Refresh every master's slave list from the tree.
    fn sync_slaves(&self) {
        for node in self.tree.depth_first() {
            let Some(object) = self.tree.object(node) else {
                continue;
            };
            if let Some(slaves) = object.slaves() {
                let top_level = self.tree.parent(node) == Some(NodeId::ROOT);
                slaves.sync(self.tree.child_objects(node), top_level);
            }
        }
    }

    /// One iterator over the whole tree, with every preset.
    pub fn iter(&self) -> ChainIterator {
        self.sync_slaves();
        let mut presets = self.presets.clone();
        for node in self.tree.top_level() {
            if let Some(master) = self.tree.object(*node) {
                presets.extend(self.presets_of(master));
            }
        }
        ChainIterator::new(self.view(), self.tree.clone(), presets, self.parallel_prepare)
    }

    /// One iterator per top-level master. The first one also carries the
    /// chain-scope presets. Empty for a chain without edges.
    pub fn iter_list(&self) -> Vec<ChainIterator> {
        if self.tree.is_empty() {
            return Vec::new();
        }
        self.sync_slaves();
        let view = self.view();
        self.tree
            .top_level()
            .iter()
            .enumerate()
            .filter_map(|(i, node)| {
                let master = self.tree.object(*node)?;
                let mut presets = if i == 0 {
                    self.presets.clone()
                } else {
                    Vec::new()
                };
                presets.extend(self.presets_of(master));
                Some(ChainIterator::new(
                    view.clone(),
                    self.tree.subtree(*node),
                    presets,
                    self.parallel_prepare,
                ))
            })
            .collect()
    }

    fn presets_of(&self, master: &AcqObject) -> Vec<Arc<dyn ChainPreset>> {
        self.master_presets
            .get(&master.id())
            .cloned()
            .unwrap_or_default()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AcqEvent> {
        self.context.bus.subscribe()
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.context.bus
    }

    pub fn stats(&self) -> Arc<ChainStats> {
        self.context.stats.clone()
    }

    pub fn reset_stats(&self) {
        self.context.stats.reset();
    }

    /// Objects in depth-first order.
    pub fn nodes(&self) -> Vec<AcqObject> {
        objects(&self.tree, &self.tree.depth_first())
    }

    pub fn top_masters(&self) -> Vec<AcqObject> {
        objects(&self.tree, self.tree.top_level())
    }

    pub fn tree(&self) -> &Tree {
        &self.tree
    }

    pub fn view(&self) -> ChainView {
        ChainView {
            tree: Arc::new(self.tree.clone()),
        }
    }
}

impl fmt::Display for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.tree, f)
    }
}

impl fmt::Debug for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chain")
            .field("objects", &self.tree.len())
            .field("presets", &self.presets.len())
            .field("parallel_prepare", &self.parallel_prepare)
            .finish()
    }
}
