//! Events the engine emits to its host (spec §6 "Exposed events").

use serde_json::Value;

use crate::manifest::{AdaptationId, ManifestId, PeriodId, RepresentationUniqueId};
use crate::types::TrackType;
use crate::Error;

#[derive(Debug, Clone)]
pub struct MediaSourceReloadRequest {
	pub time_offset: f64,
	pub minimum_position: f64,
	pub maximum_position: f64,
}

#[derive(Debug, Clone)]
pub enum EngineEvent {
	ManifestReady(ManifestId),
	ManifestUpdate(Vec<PeriodId>),
	Loaded,
	Warning(Error),
	Error(Error),
	Stalled,
	Unstalled,
	PeriodStreamReady { period: PeriodId, track_type: TrackType },
	PeriodStreamCleared { period: PeriodId, track_type: TrackType },
	AdaptationChange { period: PeriodId, track_type: TrackType, adaptation: Option<AdaptationId> },
	RepresentationChange { period: PeriodId, track_type: TrackType, representation: Option<RepresentationUniqueId> },
	BitrateEstimateChange { track_type: TrackType, bitrate: Option<u64> },
	InbandEvents(Vec<Value>),
	StreamEvent { period: PeriodId, id: String },
	StreamEventSkip { period: PeriodId, id: String },
	ReloadingMediaSource(MediaSourceReloadRequest),
	CodecSupportUpdate,
	DecipherabilityUpdate(Vec<RepresentationUniqueId>),
	EncryptionDataEncountered { system_id: String },
	ActivePeriodChanged(PeriodId),
	/// Spec §4.H: "no Representation is selectable due to codec or
	/// decipherability constraints".
	LockedStream { period: PeriodId, track_type: TrackType },
	NeedsBufferFlush { relative_seek: f64 },
	NeedsManifestRefresh,
	ManifestMightBeOutOfSync,
	NeedsDecipherabilityFlush,
}
