//! Small shared value types used across the manifest model and streams.

use serde::{Deserialize, Serialize};

/// A three-state boolean (spec §3: `is_supported`, `decipherable`,
/// `is_decipherable`, `has_supported_codec` are all described in prose as
/// true/false/unknown). One shared type instead of four bespoke enums.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Tri {
	True,
	False,
	#[default]
	Unknown,
}

impl Tri {
	pub fn from_bool(b: bool) -> Self {
		if b {
			Tri::True
		} else {
			Tri::False
		}
	}

	pub fn is_true(self) -> bool {
		matches!(self, Tri::True)
	}

	pub fn is_false(self) -> bool {
		matches!(self, Tri::False)
	}

	pub fn is_unknown(self) -> bool {
		matches!(self, Tri::Unknown)
	}
}

/// The three track types named throughout the spec (§2–§4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackType {
	Audio,
	Video,
	Text,
}

impl std::fmt::Display for TrackType {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			TrackType::Audio => write!(f, "audio"),
			TrackType::Video => write!(f, "video"),
			TrackType::Text => write!(f, "text"),
		}
	}
}

/// Retry policy shared by the manifest fetcher and the segment queue (spec
/// §6: `manifest_retry_options`, `segment_retry_options`). The spec names
/// both options bags but never spells out their shape; this is the smallest
/// shape that satisfies every retry behavior described in §4.D and §4.L.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetryPolicy {
	/// Maximum retry attempts for ordinary (e.g. 4xx/5xx) errors.
	pub max_retry: u32,
	/// Maximum retry attempts for errors classified as "offline"
	/// (connection refused / DNS failure / timeout with no partial data).
	pub offline_max_retry: u32,
	pub base_delay_ms: u64,
	pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
	fn default() -> Self {
		Self {
			max_retry: 4,
			offline_max_retry: u32::MAX,
			base_delay_ms: 200,
			max_delay_ms: 8_000,
		}
	}
}

impl RetryPolicy {
	/// Exponential backoff with jitter, bounded by `max_delay_ms` (spec
	/// §4.L: "backoff with jitter").
	pub fn delay_for_attempt(&self, attempt: u32, jitter: f64) -> std::time::Duration {
		debug_assert!((0.0..1.0).contains(&jitter));
		let exp = self.base_delay_ms.saturating_mul(1u64 << attempt.min(20));
		let capped = exp.min(self.max_delay_ms);
		let jittered = (capped as f64 * (0.5 + jitter * 0.5)) as u64;
		std::time::Duration::from_millis(jittered.max(1))
	}
}
