//! Adaptation (Track) Stream (spec §4.F): switches among Representations
//! within one Adaptation as the estimator's choice changes.

use crate::manifest::representation::Representation;
use crate::manifest::{AdaptationId, PeriodId, RepresentationUniqueId};
use crate::queue::SegmentQueue;
use crate::shared_ref::{SharedRef, SubscribeOptions};
use crate::stream::representation::{RepresentationStream, Terminate};
use crate::types::{RetryPolicy, TrackType};

/// Why a Representation switch is happening, deciding urgency (spec §4.F:
/// "unless switching is declared urgent: codec change requiring immediate
/// flush; major bitrate drop due to stall").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchReason {
	EstimatorUpswitch,
	EstimatorDownswitch,
	UserOverride,
	CodecChange,
	StallRecovery,
}

impl SwitchReason {
	pub fn is_urgent(self) -> bool {
		matches!(self, SwitchReason::CodecChange | SwitchReason::StallRecovery)
	}
}

/// One `(Period, Adaptation)` driver (spec §4.F). Owns at most one "current"
/// [`RepresentationStream`] plus any older ones still draining.
pub struct AdaptationStream {
	pub period: PeriodId,
	pub adaptation: AdaptationId,
	pub track_type: TrackType,
	current: Option<RepresentationStream>,
	/// Representation Streams mid-teardown: kept alive only until their
	/// queue drains (spec §4.F: "old streams stay alive only until their
	/// queue drains").
	draining: Vec<RepresentationStream>,
	retry_policy: RetryPolicy,
}

impl AdaptationStream {
	pub fn new(period: PeriodId, adaptation: AdaptationId, track_type: TrackType, retry_policy: RetryPolicy) -> Self {
		Self {
			period,
			adaptation,
			track_type,
			current: None,
			draining: Vec::new(),
			retry_policy,
		}
	}

	pub fn current_representation(&self) -> Option<&RepresentationUniqueId> {
		self.current.as_ref().map(|s| &s.representation)
	}

	/// Spec §4.F: start a new Representation Stream for the chosen
	/// Representation, terminating the previous one per `reason`'s urgency.
	pub fn switch_to(&mut self, representation: &Representation, reason: SwitchReason, wanted_position: f64, enable_fast_switching: bool) {
		if let Some(current_id) = self.current_representation() {
			if current_id == &representation.unique_id {
				return;
			}
		}

		let fast_switch_threshold = if enable_fast_switching { wanted_position + 1e-3 } else { f64::INFINITY };

		let new_stream = RepresentationStream::new(
			self.period.clone(),
			self.adaptation.clone(),
			representation,
			self.track_type,
			SegmentQueue::new(self.retry_policy),
			fast_switch_threshold,
		);

		if let Some(mut old) = self.current.replace(new_stream) {
			if reason.is_urgent() {
				old.request_terminate(Terminate::Urgent);
			} else {
				old.request_terminate(Terminate::NonUrgent);
				self.draining.push(old);
			}
		}
	}

	/// Drop draining streams that have fully terminated (spec §4.F: "old
	/// streams stay alive only until their queue drains").
	pub fn reap_drained(&mut self) {
		self.draining.retain(|s| s.state() != crate::stream::representation::RepresentationStreamState::Terminated);
	}

	pub fn current_mut(&mut self) -> Option<&mut RepresentationStream> {
		self.current.as_mut()
	}

	pub fn draining_mut(&mut self) -> impl Iterator<Item = &mut RepresentationStream> {
		self.draining.iter_mut()
	}

	/// Spec §4.H: true when no Representation is eligible (codec/DRM
	/// constraints), i.e. the caller found no candidate to pass to
	/// [`Self::switch_to`].
	pub fn is_locked(candidates: &[&Representation]) -> bool {
		candidates.iter().all(|r| !r.is_loadable())
	}
}

/// Wires a [`SharedRef`] Representation choice to an [`AdaptationStream`]
/// (spec §4.F: "Subscribes to the current Representation choice"). The
/// `on_choice` callback is expected to call [`AdaptationStream::switch_to`]
/// with the chosen Representation resolved by the caller (a `SharedRef`
/// alone only carries an id; resolving it against the live Manifest is the
/// caller's job since this module has no Manifest reference).
pub fn subscribe_representation_choice(choice: &SharedRef<Option<RepresentationUniqueId>>, on_choice: impl FnMut(Option<RepresentationUniqueId>) + Send + 'static) {
	choice.on_update(
		on_choice,
		SubscribeOptions {
			emit_current: true,
			clear_signal: None,
		},
	);
}
