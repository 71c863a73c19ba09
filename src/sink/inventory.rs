//! Segment inventory: the sink's ordered record of which segments occupy
//! which buffered ranges (spec §3 "Segment Sink / Inventory").

use crate::config::INVENTORY_SYNC_EPSILON;
use crate::manifest::segment_index::Segment;
use crate::manifest::{AdaptationId, PeriodId, RepresentationUniqueId};
use crate::transport::BufferedRange;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InventoryEntryStatus {
	Pending,
	Partial,
	Complete,
}

/// Identifies which (Period, Adaptation, Representation, Segment) an
/// inventory entry belongs to (spec §3 `InventoryEntry.info`).
#[derive(Debug, Clone)]
pub struct SegmentInfo {
	pub period: PeriodId,
	pub adaptation: AdaptationId,
	pub representation: RepresentationUniqueId,
	pub segment: Segment,
}

#[derive(Debug, Clone)]
pub struct InventoryEntry {
	pub info: SegmentInfo,
	pub buffered_start: Option<f64>,
	pub buffered_end: Option<f64>,
	pub segment_start: f64,
	pub segment_end: f64,
	pub status: InventoryEntryStatus,
}

/// Per-Representation reference count for a declared init segment (spec §3:
/// "At most one init segment per `representation.unique_id` is declared; it
/// can be freed explicitly").
#[derive(Default)]
struct InitSegmentRefs {
	count: u32,
}

#[derive(Default)]
pub struct Inventory {
	/// Ordered by `segment_start` (spec §3 invariant).
	entries: Vec<InventoryEntry>,
	init_segments: std::collections::HashMap<RepresentationUniqueId, InitSegmentRefs>,
}

impl Inventory {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn entries(&self) -> &[InventoryEntry] {
		&self.entries
	}

	fn insertion_point(&self, start: f64) -> usize {
		self.entries.partition_point(|e| e.segment_start < start)
	}

	/// Creates a pending entry for a requested push (spec §3: "Entries are
	/// created on a push request").
	pub fn begin_push(&mut self, info: SegmentInfo) {
		let start = info.segment.time;
		let end = info.segment.end;
		let idx = self.insertion_point(start);
		// A retried push for the same segment replaces its own stale entry
		// rather than duplicating it.
		if let Some(existing) = self.entries.get(idx) {
			if existing.info.representation == info.representation && (existing.segment_start - start).abs() < 1e-9 {
				self.entries.remove(idx);
			}
		}
		self.entries.insert(
			idx,
			InventoryEntry {
				info,
				buffered_start: None,
				buffered_end: None,
				segment_start: start,
				segment_end: end,
				status: InventoryEntryStatus::Pending,
			},
		);
	}

	/// Annotates the entry for `representation`/`segment_start` once the
	/// underlying buffer append resolves (spec §3: "annotated on push
	/// completion").
	pub fn on_push_resolved(&mut self, representation: &RepresentationUniqueId, segment_start: f64, buffered_start: f64, buffered_end: f64) {
		if let Some(entry) = self
			.entries
			.iter_mut()
			.find(|e| &e.info.representation == representation && (e.segment_start - segment_start).abs() < 1e-9)
		{
			entry.buffered_start = Some(buffered_start);
			entry.buffered_end = Some(buffered_end);
			entry.status = InventoryEntryStatus::Partial;
		}
	}

	/// Spec §4.C `signal_segment_complete`.
	pub fn signal_complete(&mut self, representation: &RepresentationUniqueId, segment_start: f64) {
		if let Some(entry) = self
			.entries
			.iter_mut()
			.find(|e| &e.info.representation == representation && (e.segment_start - segment_start).abs() < 1e-9)
		{
			entry.status = InventoryEntryStatus::Complete;
		}
	}

	/// Reconciles recorded entries with the platform's real buffered ranges
	/// (spec §3: "an entry retains its identity only if overlap with the real
	/// buffered range is ≥ a configurable epsilon").
	pub fn synchronize(&mut self, real_buffered_ranges: &[BufferedRange]) {
		self.entries.retain_mut(|entry| {
			let overlap = real_buffered_ranges
				.iter()
				.map(|r| overlap_len(r.start, r.end, entry.segment_start, entry.segment_end))
				.fold(0.0_f64, f64::max);
			if overlap < INVENTORY_SYNC_EPSILON {
				return false;
			}
			if let Some(range) = real_buffered_ranges
				.iter()
				.find(|r| overlap_len(r.start, r.end, entry.segment_start, entry.segment_end) >= INVENTORY_SYNC_EPSILON)
			{
				entry.buffered_start = Some(range.start.max(entry.segment_start));
				entry.buffered_end = Some(range.end.min(entry.segment_end));
			}
			true
		});
	}

	/// Drops entries fully contained in `[start, end)`, mirroring an
	/// eviction already issued against the real buffer.
	pub fn prune_removed(&mut self, start: f64, end: f64) {
		self.entries.retain(|e| e.segment_end <= start || e.segment_start >= end);
	}

	pub fn declare_init_segment(&mut self, representation: RepresentationUniqueId) -> bool {
		let refs = self.init_segments.entry(representation).or_default();
		refs.count += 1;
		refs.count == 1
	}

	/// Returns `true` once the last reference is released, meaning the
	/// caller may actually free the underlying init data.
	pub fn free_init_segment(&mut self, representation: &RepresentationUniqueId) -> bool {
		if let Some(refs) = self.init_segments.get_mut(representation) {
			refs.count = refs.count.saturating_sub(1);
			if refs.count == 0 {
				self.init_segments.remove(representation);
				return true;
			}
		}
		false
	}
}

fn overlap_len(a_start: f64, a_end: f64, b_start: f64, b_end: f64) -> f64 {
	(a_end.min(b_end) - a_start.max(b_start)).max(0.0)
}
