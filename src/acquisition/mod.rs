//! Acquisition objects.
//!
//! An [`AcqObject`] is the engine-side handle over one hardware driver. It carries
//! the static metadata the scheduler needs (name, [`AcqParams`], channels,
//! optional [`PointIteration`]) and the wrapped entry points that add the
//! bookkeeping drivers never see:
//!
//! - `prepare`: stamps the owner name on every channel, connects external
//!   channels on the first call of a run, refuses to run while a device's
//!   previous reading task is still going, and publishes its progress so a
//!   master can wait on its slaves ([`Slaves::wait_slaves_prepare`]);
//! - `start`: publishes `start`, spawns a device's reading task;
//! - `stop`: disconnects external channels;
//! - `trigger`: re-arms a device whose reading task finished;
//! - timing statistics and tracing for every call.
//!
//! The variant {master, device} × {simple, per-point} is fixed when the object is
//! built and never probed at runtime.
//!
//! ```rust,ignore
//! let stage = Arc::new(StepStage::new(0.0, 10.0, 11));
//! let motor = AcqObject::master("stage", stage.clone())
//!     .params(AcqParams::new().prepare_once(false))
//!     .channel(stage.position_channel())
//!     .iterating(stage)
//!     .build();
//! ```

pub mod slaves;
pub mod traits;

use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, Instrument};

use crate::channel::{Channel, ChannelLink, ChannelList, ExternalChannel};
use crate::error::{AcqError, AcqResult, Phase};
use crate::events::{AcqEvent, EventBus};
use crate::stats::{profile, ChainStats};

pub use slaves::Slaves;
pub use traits::{AcquisitionDevice, AcquisitionMaster, Advance, PointIteration, TriggerType};

static NEXT_OBJECT_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of an acquisition object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(u64);

impl ObjectId {
    fn next() -> Self {
        ObjectId(NEXT_OBJECT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Scheduling parameters of an acquisition object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AcqParams {
    pub trigger_type: TriggerType,
    /// Skip `prepare` after the first point.
    pub prepare_once: bool,
    /// Skip `start` after the first point.
    pub start_once: bool,
    /// Expected number of points, 0 for unbounded.
    pub npoints: usize,
}

impl AcqParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger_type(mut self, trigger_type: TriggerType) -> Self {
        self.trigger_type = trigger_type;
        self
    }

    pub fn prepare_once(mut self, prepare_once: bool) -> Self {
        self.prepare_once = prepare_once;
        self
    }

    pub fn start_once(mut self, start_once: bool) -> Self {
        self.start_once = start_once;
        self
    }

    pub fn npoints(mut self, npoints: usize) -> Self {
        self.npoints = npoints;
        self
    }
}

/// Master or device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    Master,
    Device,
}

/// Shared services of the chain an object belongs to.
#[derive(Debug, Clone)]
pub(crate) struct ChainContext {
    pub bus: EventBus,
    pub stats: Arc<ChainStats>,
}

type ReadingTask = JoinHandle<AcqResult<()>>;

/// Progress of the latest `prepare` call.
#[derive(Debug, Clone, PartialEq, Eq)]
enum PrepareState {
    Idle,
    Running,
    Failed(String),
}

/// Marks a `prepare` as running until finished. Dropped unfinished, it
/// reports a failure so waiters never hang.
struct PrepareGuard<'a> {
    state: &'a watch::Sender<PrepareState>,
    finished: bool,
}

impl<'a> PrepareGuard<'a> {
    fn begin(state: &'a watch::Sender<PrepareState>) -> Self {
        state.send_replace(PrepareState::Running);
        Self {
            state,
            finished: false,
        }
    }

    fn finish(mut self, result: &AcqResult<()>) {
        let next = match result {
            Ok(()) => PrepareState::Idle,
            Err(AcqError::Device { source, .. }) => PrepareState::Failed(format!("{:#}", source)),
            Err(err) => PrepareState::Failed(err.to_string()),
        };
        self.state.send_replace(next);
        self.finished = true;
    }
}

impl Drop for PrepareGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.state
                .send_replace(PrepareState::Failed("prepare did not complete".to_string()));
        }
    }
}

enum Role {
    Master {
        driver: Arc<dyn AcquisitionMaster>,
        slaves: Slaves,
    },
    Device {
        driver: Arc<dyn AcquisitionDevice>,
        reading: Mutex<Option<ReadingTask>>,
    },
}

struct Inner {
    id: ObjectId,
    name: String,
    params: AcqParams,
    channels: ChannelList,
    external: Vec<ChannelLink>,
    /// External channels are connected.
    linked: AtomicBool,
    prepare_state: watch::Sender<PrepareState>,
    iteration: Option<Arc<dyn PointIteration>>,
    context: RwLock<Option<ChainContext>>,
    role: Role,
}

/// Handle over one acquisition participant. Cloning is cheap and clones refer
/// to the same object.
#[derive(Clone)]
pub struct AcqObject {
    inner: Arc<Inner>,
}

enum DriverSlot {
    Master(Arc<dyn AcquisitionMaster>),
    Device(Arc<dyn AcquisitionDevice>),
}

/// Builder returned by [`AcqObject::master`] and [`AcqObject::device`].
pub struct AcqObjectBuilder {
    name: String,
    params: AcqParams,
    channels: ChannelList,
    external: Vec<ChannelLink>,
    iteration: Option<Arc<dyn PointIteration>>,
    driver: DriverSlot,
}

impl AcqObjectBuilder {
    pub fn params(mut self, params: AcqParams) -> Self {
        self.params = params;
        self
    }

    pub fn channel(mut self, channel: Arc<Channel>) -> Self {
        self.channels.push(channel);
        self
    }

    pub fn channels(mut self, channels: impl IntoIterator<Item = Arc<Channel>>) -> Self {
        for channel in channels {
            self.channels.push(channel);
        }
        self
    }

    /// Re-publish a channel of `device` as a channel of this object. The two
    /// are linked from the first `prepare` of a run until `stop`.
    ///
    /// Fails with [`AcqError::Configuration`] when `device` has no such channel.
    pub fn external_channel(
        mut self,
        device: &AcqObject,
        external: ExternalChannel,
    ) -> AcqResult<Self> {
        let link = external.resolve(device.name(), device.channels())?;
        self.channels.push(link.target().clone());
        self.external.push(link);
        Ok(self)
    }

    /// Register the per-point reconfiguration capability.
    pub fn iterating<I: PointIteration + 'static>(mut self, iteration: Arc<I>) -> Self {
        self.iteration = Some(iteration);
        self
    }

    pub fn build(self) -> AcqObject {
        let (prepare_state, _) = watch::channel(PrepareState::Idle);
        let role = match self.driver {
            DriverSlot::Master(driver) => Role::Master {
                driver,
                slaves: Slaves::new(&self.name),
            },
            DriverSlot::Device(driver) => Role::Device {
                driver,
                reading: Mutex::new(None),
            },
        };
        AcqObject {
            inner: Arc::new(Inner {
                id: ObjectId::next(),
                name: self.name,
                params: self.params,
                channels: self.channels,
                external: self.external,
                linked: AtomicBool::new(false),
                prepare_state,
                iteration: self.iteration,
                context: RwLock::new(None),
                role,
            }),
        }
    }
}

impl AcqObject {
    /// Start building a master around `driver`.
    pub fn master<D: AcquisitionMaster + 'static>(
        name: impl Into<String>,
        driver: Arc<D>,
    ) -> AcqObjectBuilder {
        Self::builder(name.into(), DriverSlot::Master(driver))
    }

    /// Start building a device around `driver`.
    pub fn device<D: AcquisitionDevice + 'static>(
        name: impl Into<String>,
        driver: Arc<D>,
    ) -> AcqObjectBuilder {
        Self::builder(name.into(), DriverSlot::Device(driver))
    }

    fn builder(name: String, driver: DriverSlot) -> AcqObjectBuilder {
        AcqObjectBuilder {
            name,
            params: AcqParams::default(),
            channels: ChannelList::new(),
            external: Vec::new(),
            iteration: None,
            driver,
        }
    }

    pub fn id(&self) -> ObjectId {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn params(&self) -> AcqParams {
        self.inner.params
    }

    pub fn trigger_type(&self) -> TriggerType {
        self.inner.params.trigger_type
    }

    pub fn prepare_once(&self) -> bool {
        self.inner.params.prepare_once
    }

    pub fn start_once(&self) -> bool {
        self.inner.params.start_once
    }

    pub fn npoints(&self) -> usize {
        self.inner.params.npoints
    }

    pub fn channels(&self) -> &ChannelList {
        &self.inner.channels
    }

    pub fn kind(&self) -> ObjectKind {
        match self.inner.role {
            Role::Master { .. } => ObjectKind::Master,
            Role::Device { .. } => ObjectKind::Device,
        }
    }

    pub fn is_master(&self) -> bool {
        self.kind() == ObjectKind::Master
    }

    /// Trigger bookkeeping of a master, `None` for devices.
    pub fn slaves(&self) -> Option<&Slaves> {
        match &self.inner.role {
            Role::Master { slaves, .. } => Some(slaves),
            Role::Device { .. } => None,
        }
    }

    pub fn iteration(&self) -> Option<&Arc<dyn PointIteration>> {
        self.inner.iteration.as_ref()
    }

    pub fn is_iterable(&self) -> bool {
        self.inner.iteration.is_some()
    }

    pub(crate) fn attach(&self, context: ChainContext) {
        *self.inner.context.write() = Some(context);
    }

    fn context(&self) -> Option<ChainContext> {
        self.inner.context.read().clone()
    }

    fn stats(&self) -> Option<Arc<ChainStats>> {
        self.inner.context.read().as_ref().map(|c| c.stats.clone())
    }

    fn publish(&self, event: AcqEvent) {
        if let Some(context) = self.inner.context.read().as_ref() {
            context.bus.publish(event);
        }
    }

    pub(crate) fn publish_end(&self) {
        self.publish(AcqEvent::End {
            object: self.inner.name.clone(),
        });
    }

    fn publish_start(&self) {
        self.publish(AcqEvent::Start {
            object: self.inner.name.clone(),
        });
    }

    fn driver_error(&self, phase: Phase) -> impl FnOnce(anyhow::Error) -> AcqError + '_ {
        move |err| AcqError::from_driver(&self.inner.name, phase, err)
    }

    /// Wrapped `prepare`.
    pub async fn prepare(&self) -> AcqResult<()> {
        let guard = PrepareGuard::begin(&self.inner.prepare_state);
        let bus = self.context().map(|c| c.bus);
        self.inner.channels.bind_all(&self.inner.name, bus);
        if !self.inner.linked.swap(true, Ordering::SeqCst) {
            for link in &self.inner.external {
                link.connect();
            }
        }

        let call = async {
            match &self.inner.role {
                Role::Master { driver, slaves } => driver
                    .prepare(slaves)
                    .await
                    .map_err(self.driver_error(Phase::Prepare)),
                Role::Device { driver, reading } => {
                    if !self.reap_reading(reading).await? {
                        return Err(AcqError::NotReady(self.inner.name.clone()));
                    }
                    driver.prepare().await.map_err(self.driver_error(Phase::Prepare))
                }
            }
        };
        let result = profile(self.stats(), &self.inner.name, Phase::Prepare, call).await;
        guard.finish(&result);
        result
    }

    /// Flag a `prepare` about to be spawned, so a master waiting on this
    /// object cannot miss it.
    pub(crate) fn mark_preparing(&self) {
        self.inner.prepare_state.send_replace(PrepareState::Running);
    }

    /// Suspend while a `prepare` of this object is in flight. A failed one is
    /// reported as a `Device` error of the prepare phase.
    pub async fn wait_prepared(&self) -> AcqResult<()> {
        let mut rx = self.inner.prepare_state.subscribe();
        let state = rx
            .wait_for(|state| *state != PrepareState::Running)
            .await
            .map_err(|_| AcqError::TaskFailed(format!("{}: prepare state lost", self.inner.name)))?
            .clone();
        match state {
            PrepareState::Failed(reason) => Err(AcqError::Device {
                object: self.inner.name.clone(),
                phase: Phase::Prepare,
                source: anyhow::anyhow!(reason),
            }),
            PrepareState::Idle | PrepareState::Running => Ok(()),
        }
    }

    /// Wrapped `start`.
    pub async fn start(&self) -> AcqResult<()> {
        let call = async {
            match &self.inner.role {
                Role::Master { driver, slaves } => {
                    driver
                        .start(slaves)
                        .await
                        .map_err(self.driver_error(Phase::Start))?;
                    self.publish_start();
                }
                Role::Device { driver, reading } => {
                    driver.start().await.map_err(self.driver_error(Phase::Start))?;
                    self.publish_start();
                    if self.reap_reading(reading).await? {
                        self.spawn_reading(driver, reading);
                    }
                }
            }
            Ok(())
        };
        profile(self.stats(), &self.inner.name, Phase::Start, call).await
    }

    /// Wrapped `trigger`.
    pub async fn trigger(&self) -> AcqResult<()> {
        let call = async {
            match &self.inner.role {
                Role::Master { driver, slaves } => driver
                    .trigger(slaves)
                    .await
                    .map_err(self.driver_error(Phase::Trigger)),
                Role::Device { driver, reading } => {
                    driver
                        .trigger()
                        .await
                        .map_err(self.driver_error(Phase::Trigger))?;
                    if self.reap_reading(reading).await? {
                        self.publish_start();
                        self.spawn_reading(driver, reading);
                    }
                    Ok(())
                }
            }
        };
        profile(self.stats(), &self.inner.name, Phase::Trigger, call).await
    }

    /// Wrapped `stop`.
    pub async fn stop(&self) -> AcqResult<()> {
        if self.inner.linked.swap(false, Ordering::SeqCst) {
            for link in &self.inner.external {
                link.disconnect();
            }
            debug!(object = %self.inner.name, "external channels disconnected");
        }
        let call = async {
            match &self.inner.role {
                Role::Master { driver, .. } => {
                    driver.stop().await.map_err(self.driver_error(Phase::Stop))
                }
                Role::Device { driver, .. } => {
                    driver.stop().await.map_err(self.driver_error(Phase::Stop))
                }
            }
        };
        profile(self.stats(), &self.inner.name, Phase::Stop, call).await
    }

    pub fn trigger_ready(&self) -> bool {
        match &self.inner.role {
            Role::Master { driver, .. } => driver.trigger_ready(),
            Role::Device { driver, .. } => driver.trigger_ready(),
        }
    }

    /// Wait until ready for the next point. A device whose reading task already
    /// failed reports that failure here.
    pub async fn wait_ready(&self) -> AcqResult<bool> {
        let call = async {
            match &self.inner.role {
                Role::Master { driver, .. } => driver
                    .wait_ready()
                    .await
                    .map_err(self.driver_error(Phase::WaitReady)),
                Role::Device { driver, reading } => {
                    self.reap_reading(reading).await?;
                    driver
                        .wait_ready()
                        .await
                        .map_err(self.driver_error(Phase::WaitReady))
                }
            }
        };
        profile(self.stats(), &self.inner.name, Phase::WaitReady, call).await
    }

    /// Suspend until the reading task finishes and return its result.
    /// Immediate for masters and for devices without a reading task.
    pub async fn wait_reading(&self) -> AcqResult<()> {
        let Role::Device { reading, .. } = &self.inner.role else {
            return Ok(());
        };
        let task = reading.lock().take();
        match task {
            Some(handle) => handle.await?,
            None => Ok(()),
        }
    }

    /// True while the device's reading task is running.
    pub fn is_reading(&self) -> bool {
        match &self.inner.role {
            Role::Device { reading, .. } => reading
                .lock()
                .as_ref()
                .is_some_and(|handle| !handle.is_finished()),
            Role::Master { .. } => false,
        }
    }

    /// Collect a finished reading task. Returns `false` while one is still
    /// running, `true` when the device is idle; a failed task surfaces its error.
    async fn reap_reading(&self, reading: &Mutex<Option<ReadingTask>>) -> AcqResult<bool> {
        let finished = {
            let mut slot = reading.lock();
            match slot.as_ref() {
                Some(handle) if !handle.is_finished() => return Ok(false),
                _ => slot.take(),
            }
        };
        if let Some(handle) = finished {
            handle.await??;
        }
        Ok(true)
    }

    fn spawn_reading(
        &self,
        driver: &Arc<dyn AcquisitionDevice>,
        reading: &Mutex<Option<ReadingTask>>,
    ) {
        let driver = Arc::clone(driver);
        let name = self.inner.name.clone();
        let stats = self.stats();
        let span = tracing::debug_span!("reading", object = %name);
        let handle = tokio::spawn(
            async move {
                let call = async {
                    driver
                        .reading()
                        .await
                        .map_err(|err| AcqError::from_driver(&name, Phase::Reading, err))
                };
                profile(stats, &name, Phase::Reading, call).await
            }
            .instrument(span),
        );
        *reading.lock() = Some(handle);
    }
}

impl PartialEq for AcqObject {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for AcqObject {}

impl std::hash::Hash for AcqObject {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.inner.id.hash(state);
    }
}

impl std::fmt::Debug for AcqObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcqObject")
            .field("name", &self.inner.name)
            .field("kind", &self.kind())
            .field("params", &self.inner.params)
            .field("iterable", &self.is_iterable())
            .finish()
    }
}

impl std::fmt::Display for AcqObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.inner.name)
    }
}
