//! Adaptation (Track): a set of Representations for one type (spec §3).

use serde::{Deserialize, Serialize};

use crate::manifest::representation::Representation;
use crate::types::{Tri, TrackType};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, derive_more::From, derive_more::Display)]
pub struct AdaptationId(pub String);

/// Three-state codec/decipherability support summary for an Adaptation
/// (spec §3: `support_status`).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SupportStatus {
	pub is_decipherable: Tri,
	pub has_supported_codec: Tri,
	pub has_codec_with_undefined_support: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Adaptation {
	pub id: AdaptationId,
	pub r#type: TrackType,
	pub language: Option<String>,
	pub normalized_language: Option<String>,
	pub is_audio_description: bool,
	pub is_closed_caption: bool,
	pub is_forced_subtitles: bool,
	pub is_dub: bool,
	pub is_sign_interpreted: bool,
	pub is_trick_mode_track: bool,
	pub trick_mode_tracks: Vec<AdaptationId>,
	pub representations: Vec<Representation>,
	pub support_status: SupportStatus,
}

impl Adaptation {
	/// Spec §4.A: "An Adaptation is `unsupported` iff every Representation is
	/// `is_supported=false`."
	pub fn is_unsupported(&self) -> bool {
		!self.representations.is_empty()
			&& self.representations.iter().all(|r| r.is_supported.is_false())
	}

	/// Spec §3 Period invariant: "either it has at least one Representation
	/// that both has a supported codec and is decipherable, or the
	/// Adaptation is flagged unsupported."
	pub fn satisfies_period_invariant(&self) -> bool {
		self.is_unsupported() || self.representations.iter().any(|r| r.is_loadable())
	}

	pub fn loadable_representations(&self) -> impl Iterator<Item = &Representation> {
		self.representations.iter().filter(|r| r.is_loadable())
	}

	/// Recompute `support_status` from the current Representations (spec
	/// §4.A `updateCodecSupport` / `updateRepresentationsDeciperability`
	/// aggregation rule).
	pub fn recompute_support_status(&mut self) {
		let mut has_true = false;
		let mut has_unknown = false;
		let mut all_false = true;
		let mut decipherable_true = false;
		let mut decipherable_unknown = false;
		let mut decipherable_all_false = true;

		for rep in &self.representations {
			match rep.is_supported {
				Tri::True => has_true = true,
				Tri::Unknown => has_unknown = true,
				Tri::False => {}
			}
			if !rep.is_supported.is_false() {
				all_false = false;
			}
			match rep.decipherable {
				Tri::True => decipherable_true = true,
				Tri::Unknown => decipherable_unknown = true,
				Tri::False => {}
			}
			if !rep.decipherable.is_false() {
				decipherable_all_false = false;
			}
		}

		self.support_status.has_supported_codec = if has_true {
			Tri::True
		} else if all_false && !self.representations.is_empty() {
			Tri::False
		} else {
			Tri::Unknown
		};
		self.support_status.has_codec_with_undefined_support = has_unknown;

		self.support_status.is_decipherable = if decipherable_true {
			Tri::True
		} else if decipherable_all_false && !self.representations.is_empty() {
			Tri::False
		} else if decipherable_unknown {
			Tri::Unknown
		} else {
			Tri::Unknown
		};
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::manifest::representation::{RepresentationId, RepresentationUniqueId};
	use crate::manifest::segment_index::SegmentIndexData;

	fn make_rep(supported: Tri) -> Representation {
		Representation {
			id: RepresentationId("r".into()),
			unique_id: RepresentationUniqueId("u".into()),
			bitrate: 1,
			codecs: vec!["avc1".into()],
			mime_type: None,
			width: None,
			height: None,
			frame_rate: None,
			hdr_info: None,
			content_protections: vec![],
			cdn_metadata: None,
			index: SegmentIndexData::empty_list(),
			is_supported: supported,
			decipherable: Tri::True,
			should_be_avoided: false,
		}
	}

	fn adaptation(reps: Vec<Representation>) -> Adaptation {
		Adaptation {
			id: AdaptationId("a".into()),
			r#type: TrackType::Video,
			language: None,
			normalized_language: None,
			is_audio_description: false,
			is_closed_caption: false,
			is_forced_subtitles: false,
			is_dub: false,
			is_sign_interpreted: false,
			is_trick_mode_track: false,
			trick_mode_tracks: vec![],
			representations: reps,
			support_status: SupportStatus::default(),
		}
	}

	#[test]
	fn unsupported_iff_all_representations_unsupported() {
		let a = adaptation(vec![make_rep(Tri::False), make_rep(Tri::False)]);
		assert!(a.is_unsupported());

		let b = adaptation(vec![make_rep(Tri::False), make_rep(Tri::True)]);
		assert!(!b.is_unsupported());
	}

	#[test]
	fn recompute_support_status_prefers_true_over_unknown() {
		let mut a = adaptation(vec![make_rep(Tri::Unknown), make_rep(Tri::True)]);
		a.recompute_support_status();
		assert!(a.support_status.has_supported_codec.is_true());
	}

	#[test]
	fn recompute_support_status_false_only_when_all_false() {
		let mut a = adaptation(vec![make_rep(Tri::False), make_rep(Tri::False)]);
		a.recompute_support_status();
		assert!(a.support_status.has_supported_codec.is_false());
	}
}
