//! # acq_chain
//!
//! Acquisition orchestration engine: drives a tree of hardware-control objects
//! through coordinated *prepare → start → trigger → stop* phases for the
//! duration of a scan.
//!
//! ## Crate Structure
//!
//! - **`acquisition`**: the [`AcqObject`] handle, the driver traits
//!   (`AcquisitionMaster`, `AcquisitionDevice`, `PointIteration`) and the
//!   per-master trigger propagation (`Slaves`).
//! - **`channel`**: typed data conduits owned by acquisition objects.
//! - **`chain`**: the [`Chain`] builder, its arena tree and the
//!   [`ChainIterator`] scheduler.
//! - **`preset`**: scan-scope and per-point hooks.
//! - **`scan`**: the [`Scan`] driver running every top-level master
//!   concurrently.
//! - **`events`**: chain-scoped broadcast bus of `start`/`end`/`new_data`.
//! - **`stats`**: per-call timing statistics.
//! - **`sim`**: simulated timer, positioner and counter drivers.
//! - **`config`** / **`logging`**: figment settings and tracing setup.
//! - **`error`**: the [`AcqError`] enum.

pub mod acquisition;
pub mod chain;
pub mod channel;
pub mod config;
pub mod error;
pub mod events;
pub mod logging;
pub mod preset;
pub mod scan;
pub mod sim;
pub mod stats;

pub use acquisition::{
    AcqObject, AcqParams, AcquisitionDevice, AcquisitionMaster, Advance, PointIteration, Slaves,
    TriggerType,
};
pub use chain::{Chain, ChainIterator, ChainView};
pub use channel::{Channel, DType, ExternalChannel};
pub use error::{AcqError, AcqResult};
pub use events::AcqEvent;
pub use preset::{ChainPreset, IterationPreset};
pub use scan::{Scan, ScanState};
