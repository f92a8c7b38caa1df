//! Acquisition channels.
//!
//! A [`Channel`] is the named, typed conduit through which one acquisition object
//! hands data to the rest of the system. Every accepted emission is validated
//! against the declared element type and shape, appended to the channel buffer
//! and published as [`AcqEvent::NewData`] on the owner's event bus.
//!
//! # Shape rules
//!
//! For a channel declared with shape `S`:
//!
//! - data of shape `S` is one point,
//! - data of shape `[n, S...]` is a batch of `n` points,
//! - anything else is rejected with [`AcqError::ChannelValidation`].
//!
//! Reference channels (image handles, file references, irregular payloads) skip
//! every check.
//!
//! # Links between channels
//!
//! - A *duplicate* ([`Channel::duplicate`], usually through
//!   [`ExternalChannel`]) re-emits everything its source accepts once
//!   [`Channel::forward_to`] connected them, optionally through a [`Conversion`].
//! - An *attached* channel ([`ChannelList::attach_to`]) keeps its emissions on
//!   hold and publishes the latest one each time its emitter channel emits, so
//!   both end up with the same number of points.
//!
//! ```rust
//! use acq_chain::channel::{Channel, DType, Values};
//!
//! let channel = Channel::new("diode", DType::Float, vec![]);
//! channel.emit(3.14).unwrap();
//! channel.emit(vec![1.0, 2.0, 3.0]).unwrap();
//! assert_eq!(channel.data(), Some(Values::Float(vec![3.14, 1.0, 2.0, 3.0])));
//! ```

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::{AcqError, AcqResult};
use crate::events::{AcqEvent, EventBus};

/// Element type of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    Float,
    Int,
}

impl std::fmt::Display for DType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DType::Float => write!(f, "float"),
            DType::Int => write!(f, "int"),
        }
    }
}

/// Flat element storage.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Values {
    Float(Vec<f64>),
    Int(Vec<i64>),
}

impl Values {
    pub fn len(&self) -> usize {
        match self {
            Values::Float(v) => v.len(),
            Values::Int(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dtype(&self) -> DType {
        match self {
            Values::Float(_) => DType::Float,
            Values::Int(_) => DType::Int,
        }
    }

    /// Converts to the requested element type. Only int to float widening is allowed.
    fn cast(self, dtype: DType) -> Option<Values> {
        match (self, dtype) {
            (Values::Float(v), DType::Float) => Some(Values::Float(v)),
            (Values::Int(v), DType::Int) => Some(Values::Int(v)),
            (Values::Int(v), DType::Float) => {
                Some(Values::Float(v.into_iter().map(|x| x as f64).collect()))
            }
            (Values::Float(_), DType::Int) => None,
        }
    }

    fn extend_from(&mut self, other: &Values) {
        match (self, other) {
            (Values::Float(a), Values::Float(b)) => a.extend_from_slice(b),
            (Values::Int(a), Values::Int(b)) => a.extend_from_slice(b),
            // cast() guarantees both sides share the channel dtype
            _ => {}
        }
    }
}

/// N-dimensional block of values in row-major order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArrayData {
    shape: Vec<usize>,
    values: Values,
}

impl ArrayData {
    /// Build an array, checking that the number of values matches the shape.
    pub fn with_shape(shape: Vec<usize>, values: Values) -> AcqResult<Self> {
        let expected: usize = shape.iter().product();
        if expected != values.len() {
            return Err(AcqError::validation(
                "<array>",
                format!(
                    "shape {:?} needs {} values, got {}",
                    shape,
                    expected,
                    values.len()
                ),
            ));
        }
        Ok(Self { shape, values })
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn values(&self) -> &Values {
        &self.values
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }
}

impl From<f64> for ArrayData {
    fn from(value: f64) -> Self {
        Self {
            shape: vec![],
            values: Values::Float(vec![value]),
        }
    }
}

impl From<i64> for ArrayData {
    fn from(value: i64) -> Self {
        Self {
            shape: vec![],
            values: Values::Int(vec![value]),
        }
    }
}

impl From<Vec<f64>> for ArrayData {
    fn from(values: Vec<f64>) -> Self {
        Self {
            shape: vec![values.len()],
            values: Values::Float(values),
        }
    }
}

impl From<Vec<i64>> for ArrayData {
    fn from(values: Vec<i64>) -> Self {
        Self {
            shape: vec![values.len()],
            values: Values::Int(values),
        }
    }
}

/// Anything a channel can carry.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Payload {
    Array(ArrayData),
    /// Opaque reference (image handle, file path, ...) for reference channels.
    Reference(serde_json::Value),
}

impl From<ArrayData> for Payload {
    fn from(data: ArrayData) -> Self {
        Payload::Array(data)
    }
}

impl From<f64> for Payload {
    fn from(value: f64) -> Self {
        Payload::Array(value.into())
    }
}

impl From<i64> for Payload {
    fn from(value: i64) -> Self {
        Payload::Array(value.into())
    }
}

impl From<Vec<f64>> for Payload {
    fn from(values: Vec<f64>) -> Self {
        Payload::Array(values.into())
    }
}

impl From<Vec<i64>> for Payload {
    fn from(values: Vec<i64>) -> Self {
        Payload::Array(values.into())
    }
}

impl From<serde_json::Value> for Payload {
    fn from(value: serde_json::Value) -> Self {
        Payload::Reference(value)
    }
}

/// Serializable description of a channel, consumed by writer backends to create
/// their persistence node.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelDescriptor {
    pub name: String,
    pub fullname: String,
    pub dtype: DType,
    pub shape: Vec<usize>,
    pub reference: bool,
    pub description: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Default)]
struct Binding {
    owner: Option<String>,
    bus: Option<EventBus>,
}

#[derive(Debug, Default)]
struct Buffer {
    values: Option<Values>,
    references: Vec<Payload>,
    points: usize,
}

/// Maps a source payload onto the payload of a duplicated channel.
pub type Conversion = Arc<dyn Fn(Payload) -> AcqResult<Payload> + Send + Sync>;

#[derive(Clone)]
struct Forward {
    target: Arc<Channel>,
    conversion: Option<Conversion>,
}

#[derive(Default)]
struct Links {
    forwards: Vec<Forward>,
    attached: Vec<Arc<Channel>>,
    /// Name of the channel this one is attached to.
    emitter: Option<String>,
    held: Option<(Payload, usize)>,
}

impl std::fmt::Debug for Links {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let forwards: Vec<&str> = self.forwards.iter().map(|fw| fw.target.name()).collect();
        let attached: Vec<&str> = self.attached.iter().map(|c| c.name()).collect();
        f.debug_struct("Links")
            .field("forwards", &forwards)
            .field("attached", &attached)
            .field("emitter", &self.emitter)
            .finish()
    }
}

/// Named, typed data conduit owned by one acquisition object.
#[derive(Debug)]
pub struct Channel {
    name: String,
    dtype: DType,
    shape: Vec<usize>,
    reference: bool,
    description: BTreeMap<String, serde_json::Value>,
    binding: RwLock<Binding>,
    buffer: Mutex<Buffer>,
    links: Mutex<Links>,
}

impl Channel {
    /// Declare a data channel. `shape` is the shape of one point (`vec![]` for scalars).
    pub fn new(name: impl Into<String>, dtype: DType, shape: Vec<usize>) -> Self {
        Self {
            name: name.into(),
            dtype,
            shape,
            reference: false,
            description: BTreeMap::new(),
            binding: RwLock::new(Binding::default()),
            buffer: Mutex::new(Buffer::default()),
            links: Mutex::new(Links::default()),
        }
    }

    /// New unbound channel with the same declaration, renamed if asked, and
    /// with another element type if `dtype` is given.
    pub fn duplicate(&self, rename: Option<&str>, dtype: Option<DType>) -> Channel {
        Channel {
            reference: self.reference,
            description: self.description.clone(),
            ..Channel::new(
                rename.unwrap_or(&self.name),
                dtype.unwrap_or(self.dtype),
                self.shape.clone(),
            )
        }
    }

    /// Declare a reference channel; emitted payloads are not validated.
    pub fn reference(name: impl Into<String>) -> Self {
        Self {
            reference: true,
            ..Self::new(name, DType::Int, vec![])
        }
    }

    /// Attach a description entry (unit, label, ...).
    pub fn with_description(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.description.insert(key.into(), value);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn is_reference(&self) -> bool {
        self.reference
    }

    pub fn description(&self) -> &BTreeMap<String, serde_json::Value> {
        &self.description
    }

    /// Name of the owning acquisition object, once stamped by `prepare`.
    pub fn owner(&self) -> Option<String> {
        self.binding.read().owner.clone()
    }

    /// `owner:name`, or just `name` while unbound.
    pub fn fullname(&self) -> String {
        match self.binding.read().owner.as_deref() {
            Some(owner) => format!("{}:{}", owner, self.name),
            None => self.name.clone(),
        }
    }

    /// Persistence-node descriptor for writer backends.
    pub fn descriptor(&self) -> ChannelDescriptor {
        ChannelDescriptor {
            name: self.name.clone(),
            fullname: self.fullname(),
            dtype: self.dtype,
            shape: self.shape.clone(),
            reference: self.reference,
            description: self.description.clone(),
        }
    }

    /// Stamp the owner name and the bus to publish on. Only the owning object
    /// calls this, right before its `prepare()`.
    pub(crate) fn bind(&self, owner: &str, bus: Option<EventBus>) {
        let mut binding = self.binding.write();
        binding.owner = Some(owner.to_string());
        binding.bus = bus;
    }

    /// Validate, store and publish `data`. Returns the number of points accepted.
    ///
    /// An attached channel only keeps the data on hold until its emitter emits.
    pub fn emit(&self, data: impl Into<Payload>) -> AcqResult<usize> {
        let (payload, points) = self.validate(data.into())?;
        {
            let mut links = self.links.lock();
            if links.emitter.is_some() {
                links.held = Some((payload, points));
                return Ok(points);
            }
        }
        self.deliver(payload, points)?;
        Ok(points)
    }

    /// Store and publish an accepted payload, then feed the linked channels.
    fn deliver(&self, payload: Payload, points: usize) -> AcqResult<()> {
        let (forwards, attached) = {
            let links = self.links.lock();
            (links.forwards.clone(), links.attached.clone())
        };
        self.accept(payload.clone(), points);
        for forward in &forwards {
            let data = match &forward.conversion {
                Some(convert) => convert(payload.clone())?,
                None => payload.clone(),
            };
            forward.target.emit(data)?;
        }
        for channel in &attached {
            channel.release()?;
        }
        Ok(())
    }

    /// Publish the payload on hold again, if any.
    fn release(&self) -> AcqResult<()> {
        let held = self.links.lock().held.clone();
        match held {
            Some((payload, points)) => self.deliver(payload, points),
            None => Ok(()),
        }
    }

    fn accept(&self, payload: Payload, points: usize) {
        {
            let mut buffer = self.buffer.lock();
            match &payload {
                Payload::Array(array) if !self.reference => match buffer.values.as_mut() {
                    Some(values) => values.extend_from(array.values()),
                    None => buffer.values = Some(array.values().clone()),
                },
                _ => buffer.references.push(payload.clone()),
            }
            buffer.points += points;
        }

        let (owner, bus) = {
            let binding = self.binding.read();
            (binding.owner.clone(), binding.bus.clone())
        };
        if let Some(bus) = bus {
            bus.publish(AcqEvent::NewData {
                object: owner.unwrap_or_default(),
                channel: self.name.clone(),
                data: Arc::new(payload),
            });
        }
    }

    fn validate(&self, payload: Payload) -> AcqResult<(Payload, usize)> {
        if self.reference {
            let points = match &payload {
                Payload::Array(array) if array.rank() > 0 => array.shape()[0],
                _ => 1,
            };
            return Ok((payload, points));
        }

        let array = match payload {
            Payload::Array(array) => array,
            Payload::Reference(_) => {
                return Err(AcqError::validation(
                    &self.name,
                    "reference payload emitted on a data channel",
                ))
            }
        };

        let points = if array.shape() == self.shape.as_slice() {
            1
        } else if array.rank() == self.shape.len() + 1 && array.shape()[1..] == self.shape[..] {
            array.shape()[0]
        } else {
            return Err(AcqError::validation(
                &self.name,
                format!(
                    "data shape {:?} does not match declared shape {:?}",
                    array.shape(),
                    self.shape
                ),
            ));
        };

        let source_dtype = array.values.dtype();
        let ArrayData { shape, values } = array;
        let values = values.cast(self.dtype).ok_or_else(|| {
            AcqError::validation(
                &self.name,
                format!("cannot store {} data in a {} channel", source_dtype, self.dtype),
            )
        })?;

        Ok((Payload::Array(ArrayData { shape, values }), points))
    }

    /// Every value accepted so far, flattened. `None` before the first emission
    /// and for reference channels.
    pub fn data(&self) -> Option<Values> {
        self.buffer.lock().values.clone()
    }

    /// Payloads accepted by a reference channel.
    pub fn references(&self) -> Vec<Payload> {
        self.buffer.lock().references.clone()
    }

    /// Number of points accepted so far.
    pub fn points(&self) -> usize {
        self.buffer.lock().points
    }

    /// Drop the accumulated data and any payload on hold.
    pub fn clear(&self) {
        *self.buffer.lock() = Buffer::default();
        self.links.lock().held = None;
    }

    /// Re-emit everything this channel accepts into `target`.
    pub fn forward_to(&self, target: Arc<Channel>, conversion: Option<Conversion>) {
        self.links.lock().forwards.push(Forward { target, conversion });
    }

    /// Undo [`forward_to`](Self::forward_to) for `target`.
    pub fn stop_forwarding(&self, target: &Arc<Channel>) {
        self.links
            .lock()
            .forwards
            .retain(|forward| !Arc::ptr_eq(&forward.target, target));
    }

    /// Name of the channel this one is attached to.
    pub fn emitter(&self) -> Option<String> {
        self.links.lock().emitter.clone()
    }
}

/// Channel of another object re-published by the object being built.
///
/// ```rust,ignore
/// let timer = AcqObject::master("timer", timer_driver)
///     .external_channel(&counter, ExternalChannel::new("value").rename("counts"))?
///     .build();
/// ```
#[derive(Clone)]
pub struct ExternalChannel {
    name: String,
    rename: Option<String>,
    dtype: Option<DType>,
    conversion: Option<Conversion>,
}

impl ExternalChannel {
    /// Refer to the source channel called `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rename: None,
            dtype: None,
            conversion: None,
        }
    }

    pub fn rename(mut self, name: impl Into<String>) -> Self {
        self.rename = Some(name.into());
        self
    }

    pub fn dtype(mut self, dtype: DType) -> Self {
        self.dtype = Some(dtype);
        self
    }

    pub fn conversion<F>(mut self, convert: F) -> Self
    where
        F: Fn(Payload) -> AcqResult<Payload> + Send + Sync + 'static,
    {
        self.conversion = Some(Arc::new(convert));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Find the source in `channels` and declare its duplicate.
    pub(crate) fn resolve(self, owner: &str, channels: &ChannelList) -> AcqResult<ChannelLink> {
        let source = channels.get(&self.name).cloned().ok_or_else(|| {
            AcqError::Configuration(format!(
                "the device {} does not have a channel called {}",
                owner, self.name
            ))
        })?;
        let target = Arc::new(source.duplicate(self.rename.as_deref(), self.dtype));
        Ok(ChannelLink {
            source,
            target,
            conversion: self.conversion,
        })
    }
}

impl std::fmt::Debug for ExternalChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExternalChannel")
            .field("name", &self.name)
            .field("rename", &self.rename)
            .field("dtype", &self.dtype)
            .field("converted", &self.conversion.is_some())
            .finish()
    }
}

/// Source channel and its duplicate, connected while a run is prepared.
#[derive(Clone)]
pub(crate) struct ChannelLink {
    source: Arc<Channel>,
    target: Arc<Channel>,
    conversion: Option<Conversion>,
}

impl ChannelLink {
    pub(crate) fn target(&self) -> &Arc<Channel> {
        &self.target
    }

    pub(crate) fn connect(&self) {
        self.source
            .forward_to(self.target.clone(), self.conversion.clone());
    }

    pub(crate) fn disconnect(&self) {
        self.source.stop_forwarding(&self.target);
    }
}

/// Ordered list of the channels owned by one acquisition object.
#[derive(Debug, Clone, Default)]
pub struct ChannelList {
    channels: Vec<Arc<Channel>>,
}

impl ChannelList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, channel: Arc<Channel>) {
        self.channels.push(channel);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<Channel>> {
        self.channels.iter().find(|c| c.name() == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Channel>> {
        self.channels.iter()
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Emit one payload per channel, in channel order. Nothing is emitted when
    /// the payload count differs from the channel count.
    pub fn emit_all<I, P>(&self, payloads: I) -> AcqResult<()>
    where
        I: IntoIterator<Item = P>,
        P: Into<Payload>,
    {
        let payloads: Vec<P> = payloads.into_iter().collect();
        if payloads.len() != self.channels.len() {
            let names: Vec<&str> = self.channels.iter().map(|c| c.name()).collect();
            return Err(AcqError::validation(
                &names.join(","),
                format!(
                    "{} payloads for {} channels",
                    payloads.len(),
                    self.channels.len()
                ),
            ));
        }
        for (channel, payload) in self.channels.iter().zip(payloads) {
            channel.emit(payload)?;
        }
        Ok(())
    }

    /// Attach every channel of this list to `emitter`: from now on their
    /// emissions are held and published again each time `emitter` emits.
    pub fn attach_to(&self, emitter: &Arc<Channel>) -> AcqResult<()> {
        if emitter.emitter().is_some() {
            return Err(AcqError::Configuration(format!(
                "channel {} is itself attached and cannot take attachments",
                emitter.name()
            )));
        }
        if let Some(channel) = self.channels.iter().find(|c| Arc::ptr_eq(c, emitter)) {
            return Err(AcqError::Configuration(format!(
                "channel {} cannot be attached to itself",
                channel.name()
            )));
        }
        if let Some(channel) = self.channels.iter().find(|c| c.emitter().is_some()) {
            return Err(AcqError::Configuration(format!(
                "channel {} is already attached",
                channel.name()
            )));
        }
        for channel in &self.channels {
            channel.links.lock().emitter = Some(emitter.name().to_string());
            emitter.links.lock().attached.push(channel.clone());
        }
        Ok(())
    }

    /// Drop the accumulated data of every channel.
    pub fn clear(&self) {
        for channel in &self.channels {
            channel.clear();
        }
    }

    pub(crate) fn bind_all(&self, owner: &str, bus: Option<EventBus>) {
        for channel in &self.channels {
            channel.bind(owner, bus.clone());
        }
    }
}

impl FromIterator<Arc<Channel>> for ChannelList {
    fn from_iter<T: IntoIterator<Item = Arc<Channel>>>(iter: T) -> Self {
        Self {
            channels: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[allow(clippy::approx_constant)]
    fn test_scalar_then_batch_accumulates() {
        let channel = Channel::new("diode", DType::Float, vec![]);
        assert_eq!(channel.emit(3.14).unwrap(), 1);
        assert_eq!(channel.emit(vec![1.0, 2.0, 3.0]).unwrap(), 3);
        assert_eq!(
            channel.data(),
            Some(Values::Float(vec![3.14, 1.0, 2.0, 3.0]))
        );
        assert_eq!(channel.points(), 4);
    }

    #[test]
    fn test_trailing_shape_mismatch_is_rejected() {
        let channel = Channel::new("spectrum", DType::Float, vec![2]);
        let data = ArrayData::with_shape(vec![3, 3], Values::Float(vec![0.0; 9])).unwrap();
        let err = channel.emit(data).unwrap_err();
        assert!(matches!(err, AcqError::ChannelValidation { ref channel, .. } if channel == "spectrum"));
        assert_eq!(channel.points(), 0);
    }

    #[test]
    fn test_rank_two_higher_is_rejected() {
        let channel = Channel::new("diode", DType::Float, vec![]);
        let data = ArrayData::with_shape(vec![2, 2], Values::Float(vec![0.0; 4])).unwrap();
        assert!(channel.emit(data).is_err());
    }

    #[test]
    fn test_image_batch() {
        let channel = Channel::new("image", DType::Int, vec![2, 2]);
        let one = ArrayData::with_shape(vec![2, 2], Values::Int(vec![1, 2, 3, 4])).unwrap();
        let two = ArrayData::with_shape(vec![2, 2, 2], Values::Int(vec![0; 8])).unwrap();
        assert_eq!(channel.emit(one).unwrap(), 1);
        assert_eq!(channel.emit(two).unwrap(), 2);
        assert_eq!(channel.points(), 3);
    }

    #[test]
    fn test_int_widens_into_float_channel() {
        let channel = Channel::new("position", DType::Float, vec![]);
        channel.emit(7_i64).unwrap();
        assert_eq!(channel.data(), Some(Values::Float(vec![7.0])));
    }

    #[test]
    fn test_float_into_int_channel_is_rejected() {
        let channel = Channel::new("count", DType::Int, vec![]);
        assert!(channel.emit(1.5).is_err());
    }

    #[test]
    fn test_reference_channel_skips_validation() {
        let channel = Channel::reference("image_ref");
        channel
            .emit(serde_json::json!({"file": "scan_0001.edf", "index": 0}))
            .unwrap();
        let odd = ArrayData::with_shape(vec![5, 7], Values::Float(vec![0.0; 35])).unwrap();
        channel.emit(odd).unwrap();
        assert_eq!(channel.references().len(), 2);
        assert_eq!(channel.data(), None);
    }

    #[test]
    fn test_reference_payload_on_data_channel_is_rejected() {
        let channel = Channel::new("diode", DType::Float, vec![]);
        assert!(channel.emit(serde_json::json!("handle")).is_err());
    }

    #[test]
    fn test_array_shape_must_match_values() {
        assert!(ArrayData::with_shape(vec![2, 3], Values::Int(vec![1, 2])).is_err());
    }

    #[tokio::test]
    async fn test_emit_publishes_on_bound_bus() {
        let bus = EventBus::new(4);
        let mut rx = bus.subscribe();
        let channel = Channel::new("diode", DType::Float, vec![]);
        channel.bind("counter", Some(bus));

        channel.emit(1.0).unwrap();

        match rx.recv().await.unwrap() {
            AcqEvent::NewData {
                object, channel, ..
            } => {
                assert_eq!(object, "counter");
                assert_eq!(channel, "diode");
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_descriptor_uses_owner_stamp() {
        let channel = Channel::new("diode", DType::Float, vec![])
            .with_description("unit", serde_json::json!("V"));
        assert_eq!(channel.fullname(), "diode");
        channel.bind("counter", None);
        let descriptor = channel.descriptor();
        assert_eq!(descriptor.fullname, "counter:diode");
        assert_eq!(descriptor.description["unit"], "V");
    }

    #[test]
    fn test_emit_all_follows_channel_order() {
        let list: ChannelList = vec![
            Arc::new(Channel::new("x", DType::Float, vec![])),
            Arc::new(Channel::new("y", DType::Float, vec![])),
        ]
        .into_iter()
        .collect();
        list.emit_all([1.0, 2.0]).unwrap();
        assert_eq!(list.get("y").unwrap().data(), Some(Values::Float(vec![2.0])));
    }
    #[test]
    fn test_emit_all_rejects_count_mismatch() {
        let list: ChannelList = vec![
            Arc::new(Channel::new("x", DType::Float, vec![])),
            Arc::new(Channel::new("y", DType::Float, vec![])),
        ]
        .into_iter()
        .collect();
        let err = list.emit_all([1.0]).unwrap_err();
        assert!(matches!(err, AcqError::ChannelValidation { .. }));
        assert!(list.emit_all([1.0, 2.0, 3.0]).is_err());
        assert_eq!(list.get("x").unwrap().points(), 0);
    }

    #[test]
    fn test_duplicate_forwards_converted_data() {
        let source = Channel::new("counts", DType::Int, vec![]);
        let copy = Arc::new(source.duplicate(Some("rate"), Some(DType::Float)));
        assert_eq!(copy.name(), "rate");

        let halve: Conversion = Arc::new(|payload: Payload| -> AcqResult<Payload> {
            match payload {
                Payload::Array(ArrayData {
                    values: Values::Int(v),
                    shape,
                }) => Ok(Payload::Array(ArrayData {
                    shape,
                    values: Values::Float(v.into_iter().map(|x| x as f64 / 2.0).collect()),
                })),
                other => Ok(other),
            }
        });
        source.forward_to(copy.clone(), Some(halve));
        source.emit(10_i64).unwrap();
        assert_eq!(copy.data(), Some(Values::Float(vec![5.0])));

        source.stop_forwarding(&copy);
        source.emit(4_i64).unwrap();
        assert_eq!(copy.points(), 1);
        assert_eq!(source.points(), 2);
    }

    #[test]
    fn test_attached_channels_follow_emitter() {
        let outer = Arc::new(Channel::new("pos_m0", DType::Float, vec![]));
        let inner = Arc::new(Channel::new("pos_m1", DType::Float, vec![]));
        let list: ChannelList = vec![outer.clone()].into_iter().collect();
        list.attach_to(&inner).unwrap();
        assert_eq!(outer.emitter().as_deref(), Some("pos_m1"));

        // held until the emitter fires
        outer.emit(1.0).unwrap();
        assert_eq!(outer.points(), 0);

        inner.emit(10.0).unwrap();
        inner.emit(11.0).unwrap();
        inner.emit(12.0).unwrap();
        assert_eq!(outer.data(), Some(Values::Float(vec![1.0, 1.0, 1.0])));

        outer.emit(2.0).unwrap();
        inner.emit(13.0).unwrap();
        assert_eq!(outer.points(), inner.points());
        assert_eq!(outer.data(), Some(Values::Float(vec![1.0, 1.0, 1.0, 2.0])));
    }

    #[test]
    fn test_attach_rejects_chained_or_repeated_attachment() {
        let a = Arc::new(Channel::new("a", DType::Float, vec![]));
        let b = Arc::new(Channel::new("b", DType::Float, vec![]));
        let c = Arc::new(Channel::new("c", DType::Float, vec![]));
        let only_a: ChannelList = vec![a.clone()].into_iter().collect();
        let only_b: ChannelList = vec![b.clone()].into_iter().collect();

        only_a.attach_to(&b).unwrap();
        assert!(only_b.attach_to(&a).is_err());
        assert!(only_a.attach_to(&c).is_err());
        assert!(only_b.attach_to(&b).is_err());
    }

    #[test]
    fn test_clear_drops_data_and_held_payload() {
        let outer = Arc::new(Channel::new("x", DType::Float, vec![]));
        let inner = Arc::new(Channel::new("y", DType::Float, vec![]));
        let list: ChannelList = vec![outer.clone()].into_iter().collect();
        list.attach_to(&inner).unwrap();
        outer.emit(1.0).unwrap();
        inner.emit(1.0).unwrap();

        list.clear();
        inner.clear();
        assert_eq!(outer.points(), 0);
        assert_eq!(outer.data(), None);
        inner.emit(2.0).unwrap();
        assert_eq!(outer.points(), 0);
    }
}
