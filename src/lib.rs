//! # dash-engine: Adaptive Bitrate Streaming Orchestrator
//!
//! `dash-engine` is a transport-agnostic ABR (adaptive bitrate) streaming
//! engine. It owns the manifest model, segment indices, buffering policy,
//! representation selection, and live-refresh scheduling for a DASH- or
//! HLS-shaped media presentation, while delegating everything
//! transport-specific — manifest parsing, segment fetching, demuxing,
//! decryption, and actual media buffer management — to a host-supplied
//! [`transport::TransportPipeline`] implementation.
//!
//! ## Overview
//!
//! The engine is organized around the Period → Adaptation → Representation
//! tree described in [`manifest`]:
//! - **Manifest model** ([`manifest`]): the typed tree plus live timing and
//!   codec-support/decipherability bookkeeping.
//! - **Segment Index** ([`manifest::segment_index`]): per-Representation
//!   time→segment mapping, shared by template-derived and list-based
//!   sources.
//! - **Buffering** ([`sink`], [`queue`]): the append-only segment sink plus
//!   the lookahead queue that decides what to fetch next.
//! - **Streams** ([`stream`]): per-Representation, per-Adaptation and
//!   per-Period driver loops that turn queue decisions into transport calls.
//! - **Orchestration** ([`orchestrator`]): wires Period streams together
//!   across a whole presentation, including Period transitions.
//! - **Adaptive Estimator** ([`estimator`]): bandwidth/latency-driven
//!   Representation selection.
//! - **Freeze Resolver** ([`freeze`]): stall detection and recovery policy.
//! - **Manifest Fetcher** ([`fetcher`]): refresh scheduling for dynamic
//!   manifests.
//!
//! Cancellation ([`cancel`]) and value-plus-subscriber observables
//! ([`shared_ref`]) are the two concurrency primitives used throughout.

pub mod cancel;
pub mod cmcd;
pub mod config;
pub mod engine;
pub mod error;
pub mod estimator;
pub mod events;
pub mod fetcher;
pub mod freeze;
pub mod manifest;
pub mod orchestrator;
pub mod queue;
#[cfg(feature = "reference-transport")]
pub mod reference_transport;
pub mod shared_ref;
pub mod sink;
pub mod stream;
pub mod transport;
pub mod types;

#[cfg(test)]
mod tests_e2e;

pub use error::{Error, Result};
pub use manifest::{Manifest, ManifestModel};
