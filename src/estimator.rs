//! Adaptive representation estimator (spec §4.I): turns request metrics and
//! buffer observations into a chosen Representation per track type.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::config::ResolutionLimit;
use crate::manifest::representation::Representation;
use crate::shared_ref::SharedRef;
use crate::types::TrackType;

/// Reported by the Segment Queue after each successful request (spec §4.I:
/// "a pluggable request-metrics callback").
#[derive(Debug, Clone, Copy)]
pub struct RequestMetrics {
	pub duration_ms: u64,
	pub size_bytes: u64,
	pub buffer_level_at_start: f64,
	pub buffer_level_at_end: f64,
}

impl RequestMetrics {
	fn bits_per_second(&self) -> f64 {
		if self.duration_ms == 0 {
			return f64::INFINITY;
		}
		(self.size_bytes as f64 * 8.0) / (self.duration_ms as f64 / 1000.0)
	}
}

/// Exponentially weighted moving average over the last ~N samples (spec
/// §4.I: "short-window estimator ... N ≈ 5").
struct ShortWindowEstimator {
	samples: VecDeque<f64>,
	window: usize,
}

impl ShortWindowEstimator {
	fn new(window: usize) -> Self {
		Self { samples: VecDeque::new(), window }
	}

	fn push(&mut self, bps: f64) {
		self.samples.push_back(bps);
		if self.samples.len() > self.window {
			self.samples.pop_front();
		}
	}

	/// Exponential weights favoring the most recent sample, matching the
	/// moving-average throughput heuristic used by the segment-queue request
	/// scheduler this module is grounded on.
	fn estimate(&self) -> Option<f64> {
		if self.samples.is_empty() {
			return None;
		}
		let mut weight = 1.0;
		let mut weighted_sum = 0.0;
		let mut weight_total = 0.0;
		for sample in self.samples.iter().rev() {
			weighted_sum += sample * weight;
			weight_total += weight;
			weight *= 0.7;
		}
		Some(weighted_sum / weight_total)
	}
}

/// Maps remaining buffer headroom to a target bitrate (spec §4.I:
/// "buffer-based estimator mapping buffer_level − safe_margin linearly to a
/// target bitrate between min and max available").
fn buffer_based_estimate(buffer_level: f64, safe_margin: f64, min_bitrate: u64, max_bitrate: u64, saturation_buffer: f64) -> u64 {
	let headroom = (buffer_level - safe_margin).max(0.0);
	let ratio = (headroom / saturation_buffer.max(1e-6)).min(1.0);
	(min_bitrate as f64 + ratio * (max_bitrate.saturating_sub(min_bitrate) as f64)) as u64
}

/// Per-track estimator state (spec §4.I).
pub struct TrackEstimator {
	track_type: TrackType,
	short_window: ShortWindowEstimator,
	safety_factor: f64,
	safe_margin: f64,
	saturation_buffer: f64,
	/// Spec §4.I: "hysteresis on upswitch (must exceed target × 1.15 for ≥
	/// configurable period)".
	upswitch_margin: f64,
	upswitch_hold: Duration,
	candidate_upswitch_since: Option<Instant>,
	pub chosen: SharedRef<Option<crate::manifest::RepresentationUniqueId>>,
	pub bitrate_estimate: SharedRef<Option<u64>>,
}

impl TrackEstimator {
	pub fn new(track_type: TrackType) -> Self {
		Self {
			track_type,
			short_window: ShortWindowEstimator::new(5),
			safety_factor: 0.9,
			safe_margin: 5.0,
			saturation_buffer: 20.0,
			upswitch_margin: 1.15,
			upswitch_hold: Duration::from_secs(2),
			candidate_upswitch_since: None,
			chosen: SharedRef::new(None),
			bitrate_estimate: SharedRef::new(None),
		}
	}

	pub fn on_request_metrics(&mut self, metrics: RequestMetrics) {
		self.short_window.push(metrics.bits_per_second());
	}

	/// Spec §4.I steps: combine the two estimators, filter candidates, apply
	/// hysteresis, then pick the highest-bitrate survivor at or below the
	/// estimate. `now` is supplied by the caller since this module cannot
	/// call `Instant::now()` itself.
	pub fn select<'a>(&mut self, candidates: &'a [&'a Representation], buffer_level: f64, limit_resolution: Option<ResolutionLimit>, throttle_bitrate: Option<u64>, now: Instant) -> Option<&'a Representation> {
		let eligible: Vec<&Representation> = candidates
			.iter()
			.copied()
			.filter(|r| r.is_loadable())
			.filter(|r| match (limit_resolution, r.width, r.height) {
				(Some(limit), Some(w), Some(h)) => w <= limit.width && h <= limit.height,
				_ => true,
			})
			.filter(|r| throttle_bitrate.map(|cap| r.bitrate <= cap).unwrap_or(true))
			.collect();

		if eligible.is_empty() {
			self.bitrate_estimate.set_if_changed(None, |a, b| a == b);
			self.chosen.set_if_changed(None, |a, b| a == b);
			return None;
		}

		let min_bitrate = eligible.iter().map(|r| r.bitrate).min().unwrap();
		let max_bitrate = eligible.iter().map(|r| r.bitrate).max().unwrap();

		let short = self.short_window.estimate();
		let buffer_based = buffer_based_estimate(buffer_level, self.safe_margin, min_bitrate, max_bitrate, self.saturation_buffer);
		// Safety factor applies to the volatile throughput signal only; the
		// buffer-based estimator is already conservative via its own margin.
		let effective = match short {
			Some(s) => (s * self.safety_factor).min(buffer_based as f64),
			None => buffer_based as f64,
		};

		let current_bitrate = self.current_bitrate(&eligible);
		let best = self.apply_hysteresis(&eligible, effective as u64, current_bitrate, now);

		self.bitrate_estimate.set_if_changed(Some(effective as u64), |a, b| a == b);
		self.chosen.set_if_changed(Some(best.unique_id.clone()), |a, b| a == b);
		Some(best)
	}

	fn current_bitrate(&self, eligible: &[&Representation]) -> Option<u64> {
		let current = self.chosen.get()?;
		eligible.iter().find(|r| r.unique_id == current).map(|r| r.bitrate)
	}

	/// Picks the best representation at or below `effective`, but suppresses
	/// an upswitch until the candidate has exceeded `effective * margin` for
	/// `upswitch_hold` continuously.
	fn apply_hysteresis<'a>(&mut self, eligible: &[&'a Representation], effective: u64, current_bitrate: Option<u64>, now: Instant) -> &'a Representation {
		let at_or_below: Vec<&&Representation> = eligible.iter().filter(|r| r.bitrate <= effective).collect();
		let fallback = *eligible.iter().min_by_key(|r| r.bitrate).unwrap();
		let candidate = at_or_below.into_iter().max_by_key(|r| r.bitrate).map(|r| *r).unwrap_or(fallback);

		let Some(current_bitrate) = current_bitrate else {
			self.candidate_upswitch_since = None;
			return candidate;
		};

		if candidate.bitrate <= current_bitrate {
			self.candidate_upswitch_since = None;
			return candidate;
		}

		// Candidate is an upswitch: only take it once it has cleared the
		// margin continuously for `upswitch_hold`.
		if (candidate.bitrate as f64) < current_bitrate as f64 * self.upswitch_margin {
			self.candidate_upswitch_since = None;
			return eligible.iter().find(|r| r.bitrate == current_bitrate).copied().unwrap_or(candidate);
		}

		let since = *self.candidate_upswitch_since.get_or_insert(now);
		if now.duration_since(since) >= self.upswitch_hold {
			candidate
		} else {
			eligible.iter().find(|r| r.bitrate == current_bitrate).copied().unwrap_or(candidate)
		}
	}

	pub fn track_type(&self) -> TrackType {
		self.track_type
	}
}
