//! Freeze resolver (spec §4.J): detects playback stalls from observations
//! and decides how to recover.

use std::time::{Duration, Instant};

use crate::manifest::RepresentationUniqueId;
use crate::transport::{PlaybackObservation, ReadyState};

/// Spec §4.J decision ladder outputs.
#[derive(Debug, Clone, PartialEq)]
pub enum FreezeDecision {
	/// Step 1: avoid the current Representation and trigger a reload,
	/// provided `enable_representation_avoidance=true`.
	AvoidRepresentation { representation: RepresentationUniqueId },
	/// Step 2: nudge playback forward slightly.
	Flush { relative_seek: f64 },
	/// Step 3: hard reload from scratch.
	Reload { time_offset: f64 },
}

/// Tuning knobs named in spec §9 ("F₁, F₂, F₃ ... expose as tuning config").
#[derive(Debug, Clone, Copy)]
pub struct FreezeThresholds {
	/// F₁: seconds `currentTime` may fail to advance before it's a freeze.
	pub freeze_detection_secs: f64,
	/// F₂: a representation switch within this many seconds of the freeze
	/// makes `avoid-representations` the first rung of the ladder.
	pub recent_switch_window_secs: f64,
	/// F₃: freezes shorter than this try a flush before a full reload.
	pub short_freeze_secs: f64,
	/// Forward nudge applied by [`FreezeDecision::Flush`].
	pub flush_epsilon: f64,
}

impl Default for FreezeThresholds {
	fn default() -> Self {
		Self {
			freeze_detection_secs: 2.0,
			recent_switch_window_secs: 5.0,
			short_freeze_secs: 8.0,
			flush_epsilon: 0.1,
		}
	}
}

struct FreezeCandidate {
	position: f64,
	since: Instant,
}

/// Consumes playback observations and raises a [`FreezeDecision`] once a
/// stall is confirmed and resolved (spec §4.J).
pub struct FreezeResolver {
	thresholds: FreezeThresholds,
	enable_representation_avoidance: bool,
	candidate: Option<FreezeCandidate>,
	last_representation_switch: Option<(RepresentationUniqueId, Instant)>,
	/// Rank of the strongest decision already raised for the current stall, so
	/// repeated observations at the same rung don't re-fire but a later
	/// observation crossing into a stronger rung (Flush → Reload, spec §4.J
	/// "first flush; if it persists, reload") still does. Cleared once
	/// playback advances again.
	decided_rank: Option<u8>,
}

fn decision_rank(decision: &FreezeDecision) -> u8 {
	match decision {
		FreezeDecision::AvoidRepresentation { .. } => 0,
		FreezeDecision::Flush { .. } => 1,
		FreezeDecision::Reload { .. } => 2,
	}
}

impl FreezeResolver {
	pub fn new(thresholds: FreezeThresholds, enable_representation_avoidance: bool) -> Self {
		Self {
			thresholds,
			enable_representation_avoidance,
			candidate: None,
			last_representation_switch: None,
			decided_rank: None,
		}
	}

	pub fn on_representation_switch(&mut self, representation: RepresentationUniqueId, now: Instant) {
		self.last_representation_switch = Some((representation, now));
	}

	/// Feeds one playback observation. Returns `None` unless a freeze has
	/// just been confirmed and a decision raised; property "currentTime
	/// advancing clears freeze state" holds because any position delta
	/// beyond `position_epsilon` resets tracking.
	pub fn on_new_observation(&mut self, obs: &PlaybackObservation, now: Instant, lower_quality_sibling_exists: bool, position_epsilon: f64) -> Option<FreezeDecision> {
		let playable = matches!(obs.ready_state, ReadyState::HaveFutureData | ReadyState::HaveEnoughData);
		let buffered_ahead = obs.current_range.map(|r| r.end - obs.position.polled).unwrap_or(0.0);
		let candidate_conditions_met = !obs.paused && buffered_ahead > 0.0 && playable;

		match &self.candidate {
			Some(c) if (obs.position.polled - c.position).abs() < position_epsilon => {
				// Same position: still a candidate (or confirmed freeze).
				if !candidate_conditions_met {
					self.candidate = None;
					self.decided_rank = None;
					return None;
				}
			}
			_ => {
				// Position advanced (or this is the first observation):
				// reset tracking.
				self.decided_rank = None;
				if candidate_conditions_met {
					self.candidate = Some(FreezeCandidate { position: obs.position.polled, since: now });
				} else {
					self.candidate = None;
				}
				return None;
			}
		}

		let elapsed = now.duration_since(self.candidate.as_ref()?.since);
		if elapsed < Duration::from_secs_f64(self.thresholds.freeze_detection_secs) {
			return None;
		}

		let decision = self.decide(now, lower_quality_sibling_exists, elapsed);
		let rank = decision_rank(&decision);
		if self.decided_rank.is_some_and(|prev| rank <= prev) {
			return None;
		}
		self.decided_rank = Some(rank);
		Some(decision)
	}

	fn decide(&self, now: Instant, lower_quality_sibling_exists: bool, elapsed: Duration) -> FreezeDecision {
		if self.enable_representation_avoidance && lower_quality_sibling_exists {
			if let Some((representation, switched_at)) = &self.last_representation_switch {
				if now.duration_since(*switched_at) <= Duration::from_secs_f64(self.thresholds.recent_switch_window_secs) {
					return FreezeDecision::AvoidRepresentation { representation: representation.clone() };
				}
			}
		}

		if elapsed.as_secs_f64() < self.thresholds.short_freeze_secs {
			FreezeDecision::Flush { relative_seek: self.thresholds.flush_epsilon }
		} else {
			FreezeDecision::Reload { time_offset: 0.0 }
		}
	}
}
