//! Period: a contiguous timespan with a fixed set of Adaptations (spec §3).

use serde::{Deserialize, Serialize};

use crate::manifest::adaptation::Adaptation;
use crate::manifest::segment_index::SegmentIndex;
use crate::types::TrackType;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, derive_more::From, derive_more::Display)]
pub struct PeriodId(pub String);

/// An in-band event declared on a Period (spec §4.H forwards `inband_event`,
/// §6 lists `stream_event`/`stream_event_skip`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamEvent {
	pub id: String,
	pub start: f64,
	pub duration: Option<f64>,
	pub scheme_id_uri: String,
	pub data: serde_json::Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PeriodAdaptations {
	pub audio: Vec<Adaptation>,
	pub video: Vec<Adaptation>,
	pub text: Vec<Adaptation>,
}

impl PeriodAdaptations {
	pub fn of(&self, track_type: TrackType) -> &[Adaptation] {
		match track_type {
			TrackType::Audio => &self.audio,
			TrackType::Video => &self.video,
			TrackType::Text => &self.text,
		}
	}

	pub fn of_mut(&mut self, track_type: TrackType) -> &mut Vec<Adaptation> {
		match track_type {
			TrackType::Audio => &mut self.audio,
			TrackType::Video => &mut self.video,
			TrackType::Text => &mut self.text,
		}
	}

	pub fn all(&self) -> impl Iterator<Item = &Adaptation> {
		self.audio.iter().chain(self.video.iter()).chain(self.text.iter())
	}

	pub fn all_mut(&mut self) -> impl Iterator<Item = &mut Adaptation> {
		self.audio
			.iter_mut()
			.chain(self.video.iter_mut())
			.chain(self.text.iter_mut())
	}

	pub fn has_video(&self) -> bool {
		!self.video.is_empty()
	}

	pub fn has_text(&self) -> bool {
		!self.text.is_empty()
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Period {
	pub id: PeriodId,
	pub start: f64,
	pub duration: Option<f64>,
	pub adaptations: PeriodAdaptations,
	pub stream_events: Vec<StreamEvent>,
}

impl Period {
	pub fn end(&self) -> Option<f64> {
		self.duration.map(|d| self.start + d)
	}

	/// Spec §3 invariant, checked per Adaptation in the Period.
	pub fn satisfies_invariant(&self) -> bool {
		self.adaptations.all().all(|a| a.satisfies_period_invariant())
	}

	/// Merge scalar fields + delegate Adaptation/Representation merging on a
	/// partial manifest update (spec §4.A step 2). Adaptations are matched
	/// positionally within each type's list, since the spec does not name an
	/// Adaptation id-matching rule (unlike Periods and, by extension,
	/// Representations via `unique_id`).
	pub fn merge_partial(&mut self, new: &Period) {
		self.duration = new.duration;
		for (track_type, old_list, new_list) in [
			(TrackType::Audio, &mut self.adaptations.audio, &new.adaptations.audio),
			(TrackType::Video, &mut self.adaptations.video, &new.adaptations.video),
			(TrackType::Text, &mut self.adaptations.text, &new.adaptations.text),
		] {
			let _ = track_type;
			for (old_adaptation, new_adaptation) in old_list.iter_mut().zip(new_list.iter()) {
				merge_adaptation(old_adaptation, new_adaptation);
			}
		}
	}
}

fn merge_adaptation(old: &mut Adaptation, new: &Adaptation) {
	for (old_rep, new_rep) in old.representations.iter_mut().zip(new.representations.iter()) {
		if old_rep.unique_id != new_rep.unique_id {
			continue;
		}
		old_rep.index.update(&new_rep.index);
	}
}
