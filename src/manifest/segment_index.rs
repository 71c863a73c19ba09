//! Segment Index: per-Representation time→segment mapping (spec §3, §4.B).
//!
//! Two families exist in real manifests — template-derived (DASH
//! `SegmentTemplate`) and explicit lists (DASH `SegmentList`/`SegmentTimeline`,
//! HLS media playlists). Both are expressed through the same [`SegmentIndex`]
//! trait; [`SegmentIndexData`] is the serializable, engine-owned state that
//! backs either implementation.

use std::sync::Arc;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// A retrievable byte-range of media (spec §3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
	pub id: String,
	pub is_init: bool,
	pub time: f64,
	pub end: f64,
	pub duration: f64,
	pub timescale: u64,
	pub url_template: String,
	pub byte_range: Option<(u64, u64)>,
	/// Opaque, transport-owned metadata (spec: "no wire format owned by the
	/// engine" — this is passed straight through to `TransportPipeline`).
	pub private_infos: serde_json::Value,
}

impl Segment {
	/// Invariant from spec §3: `end - time == duration` (within floating
	/// point tolerance).
	pub fn is_well_formed(&self) -> bool {
		(self.end - self.time - self.duration).abs() < 1e-6
	}

	/// Resolve `$Number$`, `$Number%0Nd$`, `$Time$`, `$Bandwidth$` and
	/// `$RepresentationID$` placeholders against this segment (spec §4.B
	/// template-based indices), grounded in the `$Number$`-substitution
	/// helper used by the reference DASH player in the example pack.
	pub fn resolve_url(&self, number: u64, representation_id: &str, bandwidth: u64) -> String {
		let mut s = number_re()
			.replace_all(&self.url_template, |caps: &regex::Captures| {
				let width: usize = caps
					.get(1)
					.or_else(|| caps.get(2))
					.and_then(|m| m.as_str().parse().ok())
					.unwrap_or(1);
				format!("{number:0width$}")
			})
			.into_owned();
		s = s.replace("$Time$", &((self.time * self.timescale as f64).round() as i64).to_string());
		s = s.replace("$Bandwidth$", &bandwidth.to_string());
		s = s.replace("$RepresentationID$", representation_id);
		s
	}
}

fn number_re() -> &'static Regex {
	static RE: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
	RE.get_or_init(|| Regex::new(r"\$Number(?:%0(\d+)d|:%0(\d+)d)?\$").unwrap())
}

/// The contract every Segment Index implementation satisfies (spec §3, §4.B).
pub trait SegmentIndex: std::fmt::Debug + Send + Sync {
	fn init_segment(&self) -> Option<Segment>;

	/// All segments whose `[time, end)` intersects `[start, end)`, ordered
	/// and continuous when available, filtered to currently-available
	/// segments (spec §4.B).
	fn segments_for_range(&self, start: f64, end: f64) -> Vec<Segment>;

	fn first_available_position(&self) -> Option<f64>;
	fn last_available_position(&self) -> Option<f64>;

	/// True when the requested range goes past the last known segment of a
	/// dynamic (live) index (spec §4.B).
	fn should_refresh(&self, tip: f64, wanted_end: f64) -> bool;

	/// `None` when the index cannot tell (e.g. the position predates the
	/// index's knowledge); `Some(false)` means "this segment has aged out of
	/// the availability window".
	fn is_segment_still_available(&self, segment: &Segment) -> Option<bool>;

	/// Distinguishes a 404 on a segment the manifest claims should be
	/// available (a likely out-of-sync manifest, spec §4.B, S6) from a
	/// permanent 404 on a segment the index itself doubts.
	fn can_be_out_of_sync_error(&self, segment: &Segment, is_not_found: bool) -> bool {
		is_not_found && self.is_segment_still_available(segment) != Some(false)
	}

	/// `Some(next_time)` when there's a gap right at `time` the engine must
	/// jump over.
	fn check_discontinuity(&self, time: f64) -> Option<f64>;

	fn is_finished(&self) -> bool;

	fn add_predicted_segments(&mut self, predicted: Vec<Segment>);

	fn initialize(&mut self, segments: Vec<Segment>);

	/// Replace the index wholesale (full manifest update, spec §4.A/§4.B).
	fn replace(&mut self, new: &dyn SegmentIndex);

	/// Merge in a partial update, splicing by segment time (spec §4.B).
	fn update(&mut self, new: &dyn SegmentIndex);

	/// Expose the underlying segment list for replace/update/serialization.
	fn snapshot(&self) -> SegmentIndexData;
}

/// Serializable snapshot of either index family; also the concrete
/// implementation used by both `TemplateIndex` and `ListIndex`, since in
/// practice both reduce to "a sorted segment list plus dynamic-window
/// bookkeeping" once the manifest has been parsed by the host transport.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SegmentIndexData {
	pub init: Option<Segment>,
	/// Sorted ascending by `time`.
	pub segments: Vec<Segment>,
	/// `true` for a DASH `SegmentTemplate`-only index with no `@duration`
	/// list yet resolved (spec §4.B "template-based").
	pub is_template_derived: bool,
	/// A live/dynamic index keeps growing; a static one is complete once
	/// populated.
	pub is_dynamic: bool,
	/// For a dynamic index, the position before which segments are presumed
	/// to have fallen out of the availability window.
	pub availability_time_offset: f64,
	pub manifest_declared_end: Option<f64>,
}

impl SegmentIndexData {
	pub fn empty_list() -> Self {
		Self::default()
	}

	fn bisect_insertion_point(&self, time: f64) -> usize {
		self.segments.partition_point(|s| s.time < time)
	}
}

impl SegmentIndex for SegmentIndexData {
	fn init_segment(&self) -> Option<Segment> {
		self.init.clone()
	}

	fn segments_for_range(&self, start: f64, end: f64) -> Vec<Segment> {
		self.segments
			.iter()
			.filter(|s| s.time < end && s.end > start)
			.filter(|s| self.is_segment_still_available(s) != Some(false))
			.cloned()
			.collect()
	}

	fn first_available_position(&self) -> Option<f64> {
		self.segments.first().map(|s| s.time)
	}

	fn last_available_position(&self) -> Option<f64> {
		self.segments.last().map(|s| s.end)
	}

	fn should_refresh(&self, _tip: f64, wanted_end: f64) -> bool {
		if !self.is_dynamic {
			return false;
		}
		match self.last_available_position() {
			None => true,
			Some(last) => wanted_end > last,
		}
	}

	fn is_segment_still_available(&self, segment: &Segment) -> Option<bool> {
		if !self.is_dynamic {
			return Some(true);
		}
		Some(segment.time >= self.availability_time_offset)
	}

	fn check_discontinuity(&self, time: f64) -> Option<f64> {
		let idx = self.bisect_insertion_point(time);
		let current = self.segments.get(idx.saturating_sub(1))?;
		if time < current.end - 1e-6 {
			return None;
		}
		let next = self.segments.get(idx)?;
		if (next.time - current.end).abs() > 1e-3 {
			Some(next.time)
		} else {
			None
		}
	}

	fn is_finished(&self) -> bool {
		!self.is_dynamic && !self.segments.is_empty()
	}

	fn add_predicted_segments(&mut self, predicted: Vec<Segment>) {
		for seg in predicted {
			let idx = self.bisect_insertion_point(seg.time);
			if self.segments.get(idx).map(|s| s.time) != Some(seg.time) {
				self.segments.insert(idx, seg);
			}
		}
	}

	fn initialize(&mut self, segments: Vec<Segment>) {
		self.segments = segments;
		self.segments.sort_by(|a, b| a.time.partial_cmp(&b.time).unwrap());
	}

	fn replace(&mut self, new: &dyn SegmentIndex) {
		*self = new.snapshot();
	}

	fn update(&mut self, new: &dyn SegmentIndex) {
		let new = new.snapshot();
		self.is_dynamic = new.is_dynamic;
		self.availability_time_offset = new.availability_time_offset;
		self.manifest_declared_end = new.manifest_declared_end;
		if new.init.is_some() {
			self.init = new.init;
		}
		if new.segments.is_empty() {
			return;
		}
		// Splice by bisecting on the first new segment's time (spec §4.B).
		let splice_from = self.bisect_insertion_point(new.segments[0].time);
		self.segments.truncate(splice_from);
		self.segments.extend(new.segments);
	}

	fn snapshot(&self) -> SegmentIndexData {
		self.clone()
	}
}

/// Convenience constructor mirroring DASH's `SegmentTemplate` + `@duration`
/// / `SegmentTimeline` shapes: the host transport resolves the template into
/// concrete segments before handing them to the engine (manifest parsing
/// itself stays out of scope, spec §1).
pub fn template_index(
	init: Option<Segment>,
	segments: Vec<Segment>,
	is_dynamic: bool,
) -> Arc<dyn SegmentIndex> {
	let mut data = SegmentIndexData {
		is_template_derived: true,
		is_dynamic,
		..Default::default()
	};
	data.init = init;
	data.initialize(segments);
	Arc::new(data)
}

pub fn list_index(init: Option<Segment>, segments: Vec<Segment>) -> Arc<dyn SegmentIndex> {
	let mut data = SegmentIndexData::default();
	data.init = init;
	data.initialize(segments);
	Arc::new(data)
}
