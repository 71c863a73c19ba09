//! Stream layer (spec §4.E–§4.G): the per-Representation, per-Adaptation, and
//! per-Period state machines that turn a Manifest and buffer observations
//! into segment requests.

pub mod adaptation;
pub mod period;
pub mod representation;

pub use adaptation::{AdaptationStream, SwitchReason};
pub use period::{PeriodStream, PeriodStreamLifecycle};
pub use representation::{BufferStatus, RepresentationStream, RepresentationStreamState, StatusUpdate, Terminate};
