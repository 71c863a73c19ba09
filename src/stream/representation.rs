//! Representation Stream (spec §4.E): for one `(Period, Adaptation,
//! Representation)` triple and one Sink, decides which segments to load
//! next and drives the request/push cycle.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::UPTO_CURRENT_POSITION_CLEANUP;
use crate::manifest::representation::Representation;
use crate::manifest::segment_index::{Segment, SegmentIndex};
use crate::manifest::{AdaptationId, PeriodId, RepresentationUniqueId};
use crate::queue::{PendingSegment, SegmentQueue};
use crate::sink::inventory::Inventory;
use crate::types::TrackType;

/// Spec §4.E state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepresentationStreamState {
	Active,
	/// Non-urgent terminate: draining the in-flight/pending queue before
	/// transitioning to `Terminated`.
	Terminating,
	Terminated,
	Errored,
}

/// A non-null `terminate` input (spec §4.E inputs).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Terminate {
	Urgent,
	NonUrgent,
}

/// Output of `check_status` (spec §4.E step 1).
#[derive(Debug, Clone)]
pub struct BufferStatus {
	pub needed_segments: Vec<Segment>,
	pub imminent_discontinuity: Option<f64>,
	pub has_finished_loading: bool,
	pub is_buffer_full: bool,
	pub should_refresh_manifest: bool,
}

/// Spec §4.E step 5 `stream_status_update` plus the cleanup/refresh
/// side-signals from steps 6-7, returned from one `check_status` call so
/// the owning Adaptation Stream can react.
#[derive(Debug, Clone)]
pub struct StatusUpdate {
	pub state: RepresentationStreamState,
	pub buffer_status: BufferStatus,
	/// Spec §4.E step 6: cleanup up to `wanted_position -
	/// UPTO_CURRENT_POSITION_CLEANUP` when the buffer is full.
	pub cleanup_up_to: Option<f64>,
	pub should_schedule_manifest_refresh: bool,
	pub terminating_emitted: bool,
}

/// Computes [`BufferStatus`] from the inventory and segment index around the
/// wanted position (spec §4.E step 1).
pub fn compute_buffer_status(index: &dyn SegmentIndex, inventory: &Inventory, representation: &RepresentationUniqueId, wanted_position: f64, buffer_goal: f64, max_buffer_size_segments: usize) -> BufferStatus {
	let wanted_end = wanted_position + buffer_goal;
	let candidates = index.segments_for_range(wanted_position, wanted_end);

	let already_buffered: Vec<f64> = inventory
		.entries()
		.iter()
		.filter(|e| &e.info.representation == representation)
		.map(|e| e.segment_start)
		.collect();

	let needed_segments: Vec<Segment> = candidates
		.into_iter()
		.filter(|s| !already_buffered.iter().any(|t| (t - s.time).abs() < 1e-6))
		.collect();

	let imminent_discontinuity = index.check_discontinuity(wanted_position);
	let has_finished_loading = needed_segments.is_empty() && index.is_finished();
	let is_buffer_full = inventory.entries().iter().filter(|e| &e.info.representation == representation).count() >= max_buffer_size_segments;
	let should_refresh_manifest = index.should_refresh(wanted_position, wanted_end);

	BufferStatus {
		needed_segments,
		imminent_discontinuity,
		has_finished_loading,
		is_buffer_full,
		should_refresh_manifest,
	}
}

/// One `(Period, Adaptation, Representation)` driver (spec §4.E).
pub struct RepresentationStream {
	pub period: PeriodId,
	pub adaptation: AdaptationId,
	pub representation: RepresentationUniqueId,
	pub track_type: TrackType,
	state: RepresentationStreamState,
	queue: SegmentQueue,
	init_loaded: bool,
	cancel: Arc<crate::cancel::TaskCanceller>,
	terminate: Option<Terminate>,
	fast_switch_threshold: f64,
}

impl RepresentationStream {
	pub fn new(period: PeriodId, adaptation: AdaptationId, representation: &Representation, track_type: TrackType, queue: SegmentQueue, fast_switch_threshold: f64) -> Self {
		Self {
			period,
			adaptation,
			representation: representation.unique_id.clone(),
			track_type,
			state: RepresentationStreamState::Active,
			queue,
			init_loaded: false,
			cancel: Arc::new(crate::cancel::TaskCanceller::new()),
			terminate: None,
			fast_switch_threshold,
		}
	}

	pub fn state(&self) -> RepresentationStreamState {
		self.state
	}

	pub fn canceller(&self) -> &Arc<crate::cancel::TaskCanceller> {
		&self.cancel
	}

	pub fn fast_switch_threshold(&self) -> f64 {
		self.fast_switch_threshold
	}

	/// Spec §4.F: mark for non-urgent teardown once the queue drains, or
	/// urgent to drop everything immediately.
	pub fn request_terminate(&mut self, kind: Terminate) {
		self.terminate = Some(kind);
		if kind == Terminate::Urgent {
			self.queue.cancel_all();
			self.cancel.cancel();
			self.state = RepresentationStreamState::Terminated;
		}
	}

	/// Spec §4.E `check_status`, run on every trigger (manifest update,
	/// playback observation, parsed chunk, terminate request).
	pub fn check_status(&mut self, index: &dyn SegmentIndex, inventory: &Inventory, wanted_position: f64, buffer_goal: f64, max_buffer_size_segments: usize) -> StatusUpdate {
		if self.state == RepresentationStreamState::Terminated || self.state == RepresentationStreamState::Errored {
			return StatusUpdate {
				state: self.state,
				buffer_status: BufferStatus {
					needed_segments: vec![],
					imminent_discontinuity: None,
					has_finished_loading: true,
					is_buffer_full: false,
					should_refresh_manifest: false,
				},
				cleanup_up_to: None,
				should_schedule_manifest_refresh: false,
				terminating_emitted: false,
			};
		}

		let buffer_status = compute_buffer_status(index, inventory, &self.representation, wanted_position, buffer_goal, max_buffer_size_segments);

		// Step 2/3: init-first ordering. The init segment inherits the
		// priority of the first needed media segment; when both are
		// pending, init wins the tie.
		let init_segment = if !self.init_loaded { index.init_segment() } else { None };
		let elected_media: Vec<PendingSegment> = if init_segment.is_some() {
			Vec::new()
		} else {
			buffer_status
				.needed_segments
				.iter()
				.enumerate()
				.map(|(i, s)| PendingSegment { segment: s.clone(), priority: i as i64 })
				.collect()
		};
		self.queue.set_elected(init_segment, elected_media);

		let mut terminating_emitted = false;
		if let Some(Terminate::NonUrgent) = self.terminate {
			if self.queue.is_empty() && !self.queue.is_media_request_in_flight() && !self.queue.is_init_request_in_flight() {
				self.state = RepresentationStreamState::Terminated;
				terminating_emitted = true;
			}
		}

		let cleanup_up_to = if buffer_status.is_buffer_full {
			Some((wanted_position - UPTO_CURRENT_POSITION_CLEANUP).max(0.0))
		} else {
			None
		};

		StatusUpdate {
			state: self.state,
			should_schedule_manifest_refresh: buffer_status.should_refresh_manifest,
			cleanup_up_to,
			terminating_emitted,
			buffer_status,
		}
	}

	/// Spec §4.E: "On parsed init chunk: install the data in the Sink, mark
	/// init as loaded, immediately re-run `check_status`."
	pub fn on_init_loaded(&mut self) {
		self.init_loaded = true;
		self.queue.on_init_request_settled();
	}

	pub fn on_media_request_settled(&mut self) {
		self.queue.on_media_request_settled();
	}

	pub fn queue_mut(&mut self) -> &mut SegmentQueue {
		&mut self.queue
	}

	pub fn mark_errored(&mut self) {
		self.state = RepresentationStreamState::Errored;
		self.queue.cancel_all();
	}
}
