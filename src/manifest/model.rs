//! `ManifestModel`: owns a [`Manifest`] and performs the mutate-in-place
//! operations of spec §4.A — `replace`/`update`, codec support refresh,
//! decipherability updates, and Representation avoidance — emitting events
//! synchronously to subscribers as each operation completes.

use std::collections::HashMap;

use tracing::error;

use crate::error::MediaError;
use crate::manifest::{Adaptation, Manifest, Period, PeriodId, RepresentationUniqueId};
use crate::types::{Tri, TrackType};

/// Events emitted by [`ManifestModel`] (spec §4.A).
#[derive(Debug, Clone)]
pub enum ManifestEvent {
	/// Periods that were added or had their scalar/segment data merged.
	ManifestUpdate(Vec<PeriodId>),
	DecipherabilityUpdate(Vec<RepresentationUniqueId>),
	SupportUpdate,
	RepresentationAvoidanceUpdate(Vec<RepresentationUniqueId>),
	/// A whole Adaptation of audio or video lost every Representation to
	/// `updateCodecSupport` (spec §4.A: "fatal if an entire Adaptation of
	/// audio or video is unsupported").
	FatalIncompatibleCodecs(MediaError),
	/// Non-fatal: some Representations became unsupported, but the
	/// Adaptation retains at least one loadable Representation.
	WarningIncompatibleCodecs,
}

/// `{mime, codec, supported, supportedIfEncrypted}` (spec §4.A).
#[derive(Debug, Clone)]
pub struct CodecSupportInfo {
	pub mime: String,
	pub codec: String,
	pub supported: bool,
	pub supported_if_encrypted: bool,
}

/// Monotonic codec-support cache key.
type CacheKey = (String, String);

pub struct ManifestModel {
	manifest: Manifest,
	/// Monotonic map: entries are added, never contradicted (spec §5).
	codec_cache: HashMap<CacheKey, bool>,
	subscribers: Vec<Box<dyn FnMut(&ManifestEvent) + Send>>,
}

impl ManifestModel {
	pub fn new(manifest: Manifest) -> Self {
		Self {
			manifest,
			codec_cache: HashMap::new(),
			subscribers: Vec::new(),
		}
	}

	pub fn manifest(&self) -> &Manifest {
		&self.manifest
	}

	pub fn subscribe(&mut self, cb: impl FnMut(&ManifestEvent) + Send + 'static) {
		self.subscribers.push(Box::new(cb));
	}

	fn emit(&mut self, event: ManifestEvent) {
		for sub in self.subscribers.iter_mut() {
			sub(&event);
		}
	}

	/// Full update: replace the Period list wholesale (spec §4.A).
	pub fn replace(&mut self, new: Manifest) {
		self.manifest.is_dynamic = new.is_dynamic;
		self.manifest.is_live = new.is_live;
		self.manifest.is_last_period_known = new.is_last_period_known;
		self.manifest.clock_offset = new.clock_offset;
		self.manifest.availability_start_time = new.availability_start_time;
		self.manifest.suggested_presentation_delay = new.suggested_presentation_delay;
		self.manifest.lifetime = new.lifetime;
		self.manifest.expired = new.expired;
		self.manifest.time_bounds = new.time_bounds;
		self.manifest.uris = new.uris;
		let ids: Vec<PeriodId> = new.periods.iter().map(|p| p.id.clone()).collect();
		self.manifest.periods = new.periods;
		self.emit(ManifestEvent::ManifestUpdate(ids));
	}

	/// Partial (shortened) update (spec §4.A):
	/// 1. update scalar fields,
	/// 2. merge periods by id (delegating to `Period::merge_partial`),
	/// 3. prune periods whose `end <= minimum_safe_position`.
	pub fn update(&mut self, new: Manifest) {
		self.manifest.is_dynamic = new.is_dynamic;
		self.manifest.is_live = new.is_live;
		self.manifest.is_last_period_known = new.is_last_period_known;
		self.manifest.clock_offset = new.clock_offset;
		self.manifest.availability_start_time = new.availability_start_time;
		self.manifest.suggested_presentation_delay = new.suggested_presentation_delay;
		self.manifest.lifetime = new.lifetime;
		self.manifest.expired = new.expired;
		self.manifest.time_bounds = new.time_bounds;
		self.manifest.uris = new.uris;

		let mut touched = Vec::new();
		for new_period in &new.periods {
			match self.manifest.get_period_mut(&new_period.id) {
				Some(existing) => {
					existing.merge_partial(new_period);
					touched.push(new_period.id.clone());
				}
				None => {
					touched.push(new_period.id.clone());
				}
			}
		}
		// Periods present in `new` but not in `self`: append in manifest order
		// — testable property 2 requires "no Period id is duplicated".
		for new_period in new.periods {
			if !self.manifest.periods.iter().any(|p| p.id == new_period.id) {
				self.manifest.periods.push(new_period);
			}
		}
		self.manifest.periods.sort_by(|a, b| a.start.partial_cmp(&b.start).unwrap());

		let min_safe = self.manifest.time_bounds.minimum_seekable_position();
		self.manifest
			.periods
			.retain(|p| p.end().map(|e| e > min_safe).unwrap_or(true));

		self.emit(ManifestEvent::ManifestUpdate(touched));
	}

	/// Spec §4.A `updateCodecSupport`.
	pub fn update_codec_support(&mut self, infos: &[CodecSupportInfo]) {
		for info in infos {
			let key = (info.mime.clone(), info.codec.clone());
			match self.codec_cache.get(&key) {
				Some(existing) if *existing != info.supported => {
					error!(mime = %info.mime, codec = %info.codec, "contradictory codec support signal ignored");
				}
				_ => {
					self.codec_cache.insert(key, info.supported);
				}
			}
		}
		self.refresh_codec_support();
	}

	/// Recompute every Representation's `is_supported` from the current
	/// codec-support cache (spec §4.A: "consulted during every
	/// refreshCodecSupport").
	pub fn refresh_codec_support(&mut self) {
		let mut any_fatal = false;
		let mut any_warning = false;

		for period in &mut self.manifest.periods {
			for adaptation in period.adaptations.all_mut() {
				let was_unsupported = adaptation.is_unsupported();
				for rep in &mut adaptation.representations {
					rep.is_supported = classify_codec_support(&self.codec_cache, rep.mime_type.as_deref(), &rep.codecs);
				}
				adaptation.recompute_support_status();
				let now_unsupported = adaptation.is_unsupported();
				if now_unsupported && !was_unsupported {
					if matches!(adaptation.r#type, TrackType::Audio | TrackType::Video) {
						any_fatal = true;
					} else {
						any_warning = true;
					}
				} else if adaptation.representations.iter().any(|r| r.is_supported.is_false()) {
					any_warning = true;
				}
			}
		}

		if any_fatal {
			self.emit(ManifestEvent::FatalIncompatibleCodecs(MediaError::IncompatibleCodecs));
		} else if any_warning {
			self.emit(ManifestEvent::WarningIncompatibleCodecs);
		}
		self.emit(ManifestEvent::SupportUpdate);
	}

	/// Spec §4.A `updateRepresentationsDeciperability(fn)`.
	pub fn update_representations_decipherability(&mut self, f: impl Fn(&crate::manifest::Representation) -> Tri) -> Vec<RepresentationUniqueId> {
		let mut changed = Vec::new();
		for period in &mut self.manifest.periods {
			for adaptation in period.adaptations.all_mut() {
				for rep in &mut adaptation.representations {
					let new = f(rep);
					if new != rep.decipherable {
						rep.decipherable = new;
						changed.push(rep.unique_id.clone());
					}
				}
				adaptation.recompute_support_status();
			}
		}
		if !changed.is_empty() {
			self.emit(ManifestEvent::DecipherabilityUpdate(changed.clone()));
		}
		changed
	}

	/// Spec §4.A `addRepresentationsToAvoid`: marks `should_be_avoided=true`,
	/// never auto-clears.
	pub fn add_representations_to_avoid(&mut self, items: &[RepresentationUniqueId]) {
		let mut changed = Vec::new();
		for period in &mut self.manifest.periods {
			for adaptation in period.adaptations.all_mut() {
				for rep in &mut adaptation.representations {
					if items.contains(&rep.unique_id) && !rep.should_be_avoided {
						rep.should_be_avoided = true;
						changed.push(rep.unique_id.clone());
					}
				}
			}
		}
		if !changed.is_empty() {
			self.emit(ManifestEvent::RepresentationAvoidanceUpdate(changed));
		}
	}

	/// Spec §3 Period invariant, checked across the whole manifest; useful in
	/// tests and as a host-facing sanity check after any mutation.
	pub fn all_periods_satisfy_invariant(&self) -> bool {
		self.manifest.periods.iter().all(Period::satisfies_invariant)
	}

	/// Appends segments predicted by the transport while parsing a media
	/// chunk to the owning Representation's own index, ahead of the next
	/// manifest refresh confirming them (spec §4.B `addPredictedSegments`).
	pub fn add_predicted_segments(&mut self, representation: &RepresentationUniqueId, predicted: Vec<crate::manifest::segment_index::Segment>) {
		use crate::manifest::segment_index::SegmentIndex;
		for period in &mut self.manifest.periods {
			for adaptation in period.adaptations.all_mut() {
				for rep in &mut adaptation.representations {
					if &rep.unique_id == representation {
						rep.index.add_predicted_segments(predicted);
						return;
					}
				}
			}
		}
	}
}

fn classify_codec_support(cache: &HashMap<CacheKey, bool>, mime: Option<&str>, codecs: &[String]) -> Tri {
	let mime = mime.unwrap_or("");
	let mut any_unknown = false;
	for codec in codecs {
		match cache.get(&(mime.to_string(), codec.clone())) {
			Some(true) => return Tri::True,
			Some(false) => {}
			None => any_unknown = true,
		}
	}
	if any_unknown {
		Tri::Unknown
	} else if codecs.is_empty() {
		Tri::Unknown
	} else {
		Tri::False
	}
}
