//! Manifest model (spec §3, §4.A): the typed Period → Adaptation →
//! Representation tree plus live timing, parses-once and mutated in place by
//! [`model::ManifestModel`] as updates arrive.

pub mod adaptation;
pub mod model;
pub mod period;
pub mod representation;
pub mod segment_index;

pub use adaptation::{Adaptation, AdaptationId, SupportStatus};
pub use model::{CodecSupportInfo, ManifestEvent, ManifestModel};
pub use period::{Period, PeriodAdaptations, PeriodId, StreamEvent};
pub use representation::{CdnMetadata, ContentProtection, HdrInfo, KeyId, Representation, RepresentationId, RepresentationUniqueId};
pub use segment_index::{list_index, template_index, Segment, SegmentIndex, SegmentIndexData};

use serde::{Deserialize, Serialize};
use std::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, derive_more::From, derive_more::Display)]
pub struct ManifestId(pub String);

/// Spec §3: `maximum_time_data { maximum_safe_position, live_position?,
/// is_linear, time }`. `time` anchors the monotonic extrapolation described
/// in the Manifest invariants; it is never (de)serialized meaningfully across
/// process boundaries, only within one engine's lifetime, so it defaults to
/// "now" on deserialize (the round-trip test in spec §8 only asserts lookup
/// operations, not this wall-clock anchor).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaximumTimeData {
	pub maximum_safe_position: f64,
	pub live_position: Option<f64>,
	pub is_linear: bool,
	#[serde(skip, default = "Instant::now")]
	pub time: Instant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeBounds {
	pub minimum_safe_position: Option<f64>,
	pub timeshift_depth: Option<f64>,
	pub maximum_time_data: MaximumTimeData,
}

impl TimeBounds {
	/// Spec §3: "the derived minimum seekable position is
	/// `max(minimum_safe_position, maximum_safe_position − timeshift_depth)`
	/// when `timeshift_depth` set, else `minimum_safe_position`."
	pub fn minimum_seekable_position(&self) -> f64 {
		let base = self.minimum_safe_position.unwrap_or(0.0);
		match self.timeshift_depth {
			Some(depth) => base.max(self.maximum_time_data.maximum_safe_position - depth),
			None => base,
		}
	}

	/// Spec §3: "when `is_linear`, the maximum seekable position grows
	/// monotonically with the engine's monotonic clock."
	pub fn maximum_seekable_position(&self) -> f64 {
		if self.maximum_time_data.is_linear {
			let elapsed = self.maximum_time_data.time.elapsed().as_secs_f64();
			self.maximum_time_data.maximum_safe_position + elapsed
		} else {
			self.maximum_time_data.maximum_safe_position
		}
	}

	pub fn live_position(&self) -> Option<f64> {
		if self.maximum_time_data.is_linear {
			let elapsed = self.maximum_time_data.time.elapsed().as_secs_f64();
			self.maximum_time_data.live_position.map(|p| p + elapsed)
		} else {
			self.maximum_time_data.live_position
		}
	}
}

/// Root container (spec §3). Pure data: cloneable and serializable so that a
/// metadata snapshot can be shipped elsewhere and rehydrated (spec §8
/// round-trip test). Event emission and codec-support bookkeeping live in
/// [`model::ManifestModel`], which owns a `Manifest` rather than being one,
/// keeping this struct free of un-serializable subscriber state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
	pub id: ManifestId,
	pub is_dynamic: bool,
	pub is_live: bool,
	pub is_last_period_known: bool,
	pub clock_offset: f64,
	pub availability_start_time: f64,
	pub suggested_presentation_delay: Option<f64>,
	pub lifetime: Option<f64>,
	pub expired: bool,
	/// Strictly ordered by `start` (spec §3 invariant).
	pub periods: Vec<Period>,
	pub time_bounds: TimeBounds,
	pub uris: Vec<url::Url>,
}

impl Manifest {
	/// Spec §3 invariant: "Periods are strictly ordered; if two Periods
	/// overlap, the overlap is exactly zero-length."
	pub fn periods_are_well_ordered(&self) -> bool {
		self.periods.windows(2).all(|w| {
			let (a, b) = (&w[0], &w[1]);
			match a.end() {
				Some(end) => end <= b.start,
				None => false, // an open-ended period cannot be followed by another
			}
		})
	}

	pub fn get_period_for_time(&self, time: f64) -> Option<&Period> {
		self.periods
			.iter()
			.find(|p| p.start <= time && p.end().map(|e| time < e).unwrap_or(true))
	}

	pub fn get_period(&self, id: &PeriodId) -> Option<&Period> {
		self.periods.iter().find(|p| &p.id == id)
	}

	pub fn get_period_mut(&mut self, id: &PeriodId) -> Option<&mut Period> {
		self.periods.iter_mut().find(|p| &p.id == id)
	}

	pub fn get_adaptation(&self, period: &PeriodId, track_type: crate::types::TrackType, adaptation: &AdaptationId) -> Option<&Adaptation> {
		self.get_period(period)?
			.adaptations
			.of(track_type)
			.iter()
			.find(|a| &a.id == adaptation)
	}

	pub fn get_representation(&self, unique_id: &RepresentationUniqueId) -> Option<&Representation> {
		self.periods
			.iter()
			.flat_map(|p| p.adaptations.all())
			.flat_map(|a| a.representations.iter())
			.find(|r| &r.unique_id == unique_id)
	}

	/// The period immediately following `period`, if any.
	pub fn next_period(&self, period: &PeriodId) -> Option<&Period> {
		let idx = self.periods.iter().position(|p| &p.id == period)?;
		self.periods.get(idx + 1)
	}
}
