//! Stream Orchestrator (spec §4.H): the top-level control loop. Keeps enough
//! Period Streams alive to cover `wanted_buffer_ahead`, reacts to playback
//! crossing a Period boundary, detects locked Adaptations, and decides
//! whether a codec change needs a full `MediaSource` reload.

use std::collections::HashSet;
use std::time::Instant;

use tokio::sync::mpsc;

use crate::config::{CodecSwitchBehavior, ResolutionLimit};
use crate::estimator::TrackEstimator;
use crate::events::{EngineEvent, MediaSourceReloadRequest};
use crate::manifest::{Manifest, PeriodId};
use crate::stream::adaptation::SwitchReason;
use crate::stream::period::PeriodStream;
use crate::types::{RetryPolicy, TrackType};

/// Owns the live Period Streams and coordinates Representation selection,
/// buffering, and Period transitions across them (spec §4.H).
pub struct StreamOrchestrator {
	retry_policy: RetryPolicy,
	on_codec_switch: CodecSwitchBehavior,
	enable_fast_switching: bool,
	/// Ordered the same as `manifest.periods`: oldest-covering-position first.
	periods: Vec<PeriodStream>,
	active_period: Option<PeriodId>,
	/// Spec §4.H: "no Representation is selectable ... emits `lockedStream`,
	/// does not retry, waits for an external choice." Tracked so the event
	/// fires once per lock, not on every re-evaluation.
	locked: HashSet<(PeriodId, TrackType)>,
	events: mpsc::UnboundedSender<EngineEvent>,
}

impl StreamOrchestrator {
	pub fn new(retry_policy: RetryPolicy, on_codec_switch: CodecSwitchBehavior, enable_fast_switching: bool, events: mpsc::UnboundedSender<EngineEvent>) -> Self {
		Self {
			retry_policy,
			on_codec_switch,
			enable_fast_switching,
			periods: Vec::new(),
			active_period: None,
			locked: HashSet::new(),
			events,
		}
	}

	pub fn periods(&self) -> &[PeriodStream] {
		&self.periods
	}

	pub fn active_period(&self) -> Option<&PeriodId> {
		self.active_period.as_ref()
	}

	fn emit(&self, event: EngineEvent) {
		let _ = self.events.send(event);
	}

	/// Spec §4.H: "keep creating Period Streams while the cumulative duration
	/// of upcoming Period Streams is less than `wanted_buffer_ahead`", and
	/// dispose Period Streams that have fallen entirely behind the wanted
	/// position.
	pub fn sync_period_lineup(&mut self, manifest: &Manifest, wanted_position: f64, wanted_buffer_ahead: f64) {
		self.periods.retain_mut(|stream| {
			let still_relevant = manifest.get_period(&stream.period_id).map(|p| p.end().map(|e| e > wanted_position).unwrap_or(true)).unwrap_or(false);
			if !still_relevant {
				for track_type in stream.track_types() {
					self.events
						.send(EngineEvent::PeriodStreamCleared { period: stream.period_id.clone(), track_type })
						.ok();
				}
				stream.clear();
				false
			} else {
				true
			}
		});

		let Some(mut current) = manifest.get_period_for_time(wanted_position) else {
			return;
		};
		let mut covered = 0.0_f64;
		loop {
			if !self.periods.iter().any(|s| s.period_id == current.id) {
				let stream = PeriodStream::start(current, self.retry_policy);
				if stream.is_ready() {
					for track_type in stream.track_types() {
						self.emit(EngineEvent::PeriodStreamReady { period: stream.period_id.clone(), track_type });
					}
				}
				self.periods.push(stream);
			}

			covered += current.duration.unwrap_or(f64::INFINITY);
			if covered >= wanted_buffer_ahead {
				break;
			}
			match manifest.next_period(&current.id) {
				Some(next) => current = next,
				None => break,
			}
		}
	}

	/// Spec §4.H: react to playback crossing into a different Period. Returns
	/// `true` when the caller must tear down and recreate the `MediaSource`
	/// (a codec change with `on_codec_switch=reload`); `false` for an
	/// in-place continuation.
	pub fn set_active_period(&mut self, manifest: &Manifest, new_period: PeriodId) -> bool {
		if self.active_period.as_ref() == Some(&new_period) {
			return false;
		}

		let mut needs_reload = false;
		if let (Some(old_id), Some(new_period_data)) = (&self.active_period, manifest.get_period(&new_period)) {
			if let Some(old_period_data) = manifest.get_period(old_id) {
				for track_type in [TrackType::Audio, TrackType::Video] {
					let old_codecs = first_loadable_codecs(old_period_data, track_type);
					let new_codecs = first_loadable_codecs(new_period_data, track_type);
					if let (Some(old_codecs), Some(new_codecs)) = (old_codecs, new_codecs) {
						if old_codecs != new_codecs {
							needs_reload = true;
						}
					}
				}
			}
		}

		self.active_period = Some(new_period.clone());
		self.emit(EngineEvent::ActivePeriodChanged(new_period.clone()));

		if needs_reload && self.on_codec_switch == CodecSwitchBehavior::Reload {
			if let Some(period) = manifest.get_period(&new_period) {
				self.emit(EngineEvent::ReloadingMediaSource(MediaSourceReloadRequest {
					time_offset: 0.0,
					minimum_position: period.start,
					maximum_position: period.end().unwrap_or(f64::INFINITY),
				}));
				return true;
			}
		}
		false
	}

	/// Spec §4.H/§4.F/§4.I: resolve the estimator's choice for `track_type` in
	/// the active Period and apply it, emitting `lockedStream` if nothing is
	/// loadable and `representationChange`/`adaptationChange` otherwise.
	pub fn select_representation(&mut self, manifest: &Manifest, track_type: TrackType, estimator: &mut TrackEstimator, buffer_level: f64, limit_resolution: Option<ResolutionLimit>, throttle_bitrate: Option<u64>, now: Instant) {
		let Some(period_id) = self.active_period.clone() else { return };
		let Some(period_data) = manifest.get_period(&period_id) else { return };
		let Some(adaptation) = period_data.adaptations.of(track_type).first() else { return };
		let candidates: Vec<&crate::manifest::Representation> = adaptation.representations.iter().collect();

		let key = (period_id.clone(), track_type);
		// Clone the winning Representation so it outlives the `candidates`
		// borrow of `manifest`: the switch below needs to borrow `self`
		// mutably, which `candidates`/`adaptation` (borrowed from `manifest`,
		// not `self`) don't conflict with, but holding them alongside a
		// `self.periods` borrow would.
		let chosen = estimator.select(&candidates, buffer_level, limit_resolution, throttle_bitrate, now).cloned();
		let enable_fast_switching = self.enable_fast_switching;

		match chosen {
			None => {
				if self.locked.insert(key) {
					self.emit(EngineEvent::LockedStream { period: period_id, track_type });
				}
			}
			Some(chosen) => {
				self.locked.remove(&key);
				let changed = self.periods.iter_mut().find(|s| s.period_id == period_id).and_then(|s| s.of_mut(track_type)).map(|adaptation_stream| {
					let previous_bitrate = adaptation_stream.current_representation().and_then(|id| adaptation.representations.iter().find(|r| &r.unique_id == id)).map(|r| r.bitrate);
					let reason = match previous_bitrate {
						Some(prev) if chosen.bitrate > prev => SwitchReason::EstimatorUpswitch,
						Some(prev) if chosen.bitrate < prev => SwitchReason::EstimatorDownswitch,
						_ => SwitchReason::EstimatorUpswitch,
					};
					let changed = adaptation_stream.current_representation() != Some(&chosen.unique_id);
					adaptation_stream.switch_to(&chosen, reason, buffer_level, enable_fast_switching);
					changed
				});

				if changed == Some(true) {
					self.emit(EngineEvent::RepresentationChange {
						period: period_id,
						track_type,
						representation: Some(chosen.unique_id.clone()),
					});
				}
			}
		}
	}

	/// Drops Representation Streams that have fully drained (spec §4.F: "old
	/// streams stay alive only until their queue drains"). The engine drives
	/// `RepresentationStream::check_status` itself, since that call needs a
	/// live `&dyn SegmentIndex` borrowed out of the Manifest the orchestrator
	/// does not hold between calls (spec §9 "cyclic ownership").
	pub fn reap_drained_streams(&mut self) {
		for stream in &mut self.periods {
			for track_type in [TrackType::Audio, TrackType::Video, TrackType::Text] {
				if let Some(adaptation_stream) = stream.of_mut(track_type) {
					adaptation_stream.reap_drained();
				}
			}
		}
	}

	pub fn period_mut(&mut self, id: &PeriodId) -> Option<&mut PeriodStream> {
		self.periods.iter_mut().find(|s| &s.period_id == id)
	}

	pub fn on_manifest_update(&mut self, manifest: &Manifest, wanted_position: f64, wanted_buffer_ahead: f64) {
		self.sync_period_lineup(manifest, wanted_position, wanted_buffer_ahead);
	}
}

fn first_loadable_codecs(period: &crate::manifest::Period, track_type: TrackType) -> Option<Vec<String>> {
	period.adaptations.of(track_type).first()?.representations.iter().find(|r| r.is_loadable()).map(|r| r.codecs.clone())
}
