//! Period Stream (spec §4.G): one Adaptation Stream per declared type for a
//! single Period, with lifecycle events for external track-choice wiring.

use crate::manifest::period::Period;
use crate::manifest::PeriodId;
use crate::stream::adaptation::AdaptationStream;
use crate::types::{RetryPolicy, TrackType};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeriodStreamLifecycle {
	/// No Adaptation Streams created yet.
	Pending,
	/// Spec §4.G: "Emits `periodStreamReady` once its first Adaptation
	/// Streams have started."
	Ready,
	Cleared,
}

/// One Period's worth of Adaptation Streams (spec §4.G).
pub struct PeriodStream {
	pub period_id: PeriodId,
	lifecycle: PeriodStreamLifecycle,
	audio: Option<AdaptationStream>,
	video: Option<AdaptationStream>,
	text: Option<AdaptationStream>,
}

impl PeriodStream {
	/// Creates Adaptation Streams for audio/video (when present) and for
	/// text only when `period.adaptations.has_text()` (spec §4.G:
	/// "respecting `hasVideo`, `hasText`").
	pub fn start(period: &Period, retry_policy: RetryPolicy) -> Self {
		let mk = |tt: TrackType| AdaptationStream::new(period.id.clone(), crate::manifest::AdaptationId(format!("{tt}")), tt, retry_policy);

		let audio = (!period.adaptations.audio.is_empty()).then(|| mk(TrackType::Audio));
		let video = period.adaptations.has_video().then(|| mk(TrackType::Video));
		let text = period.adaptations.has_text().then(|| mk(TrackType::Text));

		let lifecycle = if audio.is_some() || video.is_some() || text.is_some() {
			PeriodStreamLifecycle::Ready
		} else {
			PeriodStreamLifecycle::Pending
		};

		Self {
			period_id: period.id.clone(),
			lifecycle,
			audio,
			video,
			text,
		}
	}

	pub fn lifecycle(&self) -> &PeriodStreamLifecycle {
		&self.lifecycle
	}

	pub fn is_ready(&self) -> bool {
		self.lifecycle == PeriodStreamLifecycle::Ready
	}

	pub fn of(&self, track_type: TrackType) -> Option<&AdaptationStream> {
		match track_type {
			TrackType::Audio => self.audio.as_ref(),
			TrackType::Video => self.video.as_ref(),
			TrackType::Text => self.text.as_ref(),
		}
	}

	pub fn of_mut(&mut self, track_type: TrackType) -> Option<&mut AdaptationStream> {
		match track_type {
			TrackType::Audio => self.audio.as_mut(),
			TrackType::Video => self.video.as_mut(),
			TrackType::Text => self.text.as_mut(),
		}
	}

	pub fn track_types(&self) -> impl Iterator<Item = TrackType> {
		[
			self.audio.as_ref().map(|_| TrackType::Audio),
			self.video.as_ref().map(|_| TrackType::Video),
			self.text.as_ref().map(|_| TrackType::Text),
		]
		.into_iter()
		.flatten()
	}

	/// Spec §4.G: "Disposes everything on `periodStreamCleared`."
	pub fn clear(&mut self) {
		self.audio = None;
		self.video = None;
		self.text = None;
		self.lifecycle = PeriodStreamLifecycle::Cleared;
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::manifest::period::PeriodAdaptations;

	fn period_with_video_only() -> Period {
		Period {
			id: PeriodId("p1".into()),
			start: 0.0,
			duration: Some(600.0),
			adaptations: PeriodAdaptations {
				audio: vec![],
				video: vec![],
				text: vec![],
			},
			stream_events: vec![],
		}
	}

	#[test]
	fn no_adaptations_means_pending_not_ready() {
		let stream = PeriodStream::start(&period_with_video_only(), RetryPolicy::default());
		assert_eq!(*stream.lifecycle(), PeriodStreamLifecycle::Pending);
		assert!(!stream.is_ready());
	}

	#[test]
	fn clear_disposes_all_adaptation_streams() {
		let mut stream = PeriodStream::start(&period_with_video_only(), RetryPolicy::default());
		stream.clear();
		assert_eq!(*stream.lifecycle(), PeriodStreamLifecycle::Cleared);
		assert!(stream.of_mut(TrackType::Video).is_none());
	}

	#[test]
	fn of_is_read_only_view_of_of_mut() {
		let mut period = period_with_video_only();
		period.adaptations.video.push(crate::manifest::Adaptation {
			id: crate::manifest::AdaptationId("v".into()),
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
			representations: vec![],
			support_status: crate::manifest::SupportStatus::default(),
		});
		let stream = PeriodStream::start(&period, RetryPolicy::default());

		assert!(stream.of(TrackType::Video).is_some());
		assert!(stream.of(TrackType::Audio).is_none());
		assert!(stream.of(TrackType::Text).is_none());
	}
}
