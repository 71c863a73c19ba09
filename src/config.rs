//! Engine configuration (spec §6: "applied at start; some mutable via shared
//! references").

use serde::{Deserialize, Serialize};

use crate::shared_ref::SharedRef;
use crate::types::RetryPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CodecSwitchBehavior {
	Continue,
	Reload,
}

/// Resolution cap applied by the estimator (spec §4.I `limit_resolution`).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResolutionLimit {
	pub width: u32,
	pub height: u32,
}

/// CMCD options (spec §6 `cmcd?`); `None` disables the header/query builder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CmcdOptions {
	pub session_id: String,
	pub content_id: String,
	/// `query` appends a `CMCD=` query parameter; `header` is left to the
	/// transport to place in a `CMCD-*` header set — the engine only builds
	/// the key-value pairs (spec §6: "no wire format owned by the engine").
	pub as_query_param: bool,
}

/// Scalar fields fixed at engine construction (spec §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticConfig {
	pub enable_fast_switching: bool,
	pub on_codec_switch: CodecSwitchBehavior,
	pub enable_representation_avoidance: bool,
	pub low_latency_mode: bool,
	pub manifest_retry_options: RetryPolicy,
	pub segment_retry_options: RetryPolicy,
	pub initial_audio_bitrate: u64,
	pub initial_video_bitrate: u64,
	pub cmcd: Option<CmcdOptions>,
}

impl Default for StaticConfig {
	fn default() -> Self {
		Self {
			enable_fast_switching: true,
			on_codec_switch: CodecSwitchBehavior::Reload,
			enable_representation_avoidance: false,
			low_latency_mode: false,
			manifest_retry_options: RetryPolicy::default(),
			segment_retry_options: RetryPolicy::default(),
			initial_audio_bitrate: 0,
			initial_video_bitrate: 0,
			cmcd: None,
		}
	}
}

/// Fields mutable at runtime through [`SharedRef`]s (spec §6: "some mutable
/// via shared references"), e.g. a host UI dragging a bitrate cap slider.
pub struct Config {
	pub static_config: StaticConfig,
	pub wanted_buffer_ahead: SharedRef<f64>,
	pub max_buffer_ahead: SharedRef<f64>,
	pub max_buffer_behind: SharedRef<f64>,
	pub max_video_buffer_size: SharedRef<u64>,
	pub limit_resolution: SharedRef<Option<ResolutionLimit>>,
	pub throttle_video_bitrate: SharedRef<Option<u64>>,
}

impl Config {
	pub fn new(static_config: StaticConfig) -> Self {
		Self {
			static_config,
			wanted_buffer_ahead: SharedRef::new(30.0),
			max_buffer_ahead: SharedRef::new(f64::INFINITY),
			max_buffer_behind: SharedRef::new(30.0),
			max_video_buffer_size: SharedRef::new(u64::MAX),
			limit_resolution: SharedRef::new(None),
			throttle_video_bitrate: SharedRef::new(None),
		}
	}
}

impl Default for Config {
	fn default() -> Self {
		Self::new(StaticConfig::default())
	}
}

/// Spec §4.C/§4.E `UPTO_CURRENT_POSITION_CLEANUP`: how far behind the wanted
/// position a buffer-full cleanup reaches back to.
pub const UPTO_CURRENT_POSITION_CLEANUP: f64 = 5.0;

/// Spec §4.L: delay before retrying a manifest refresh after an
/// out-of-sync signal.
pub const OUT_OF_SYNC_MANIFEST_REFRESH_DELAY: std::time::Duration = std::time::Duration::from_secs(3);

/// Spec §9 Open Question, resolved: inventory synchronization tolerance.
pub const INVENTORY_SYNC_EPSILON: f64 = 0.05;
