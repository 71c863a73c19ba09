//! External collaborator interfaces (spec §6). The engine never parses a
//! manifest, speaks HTTP, touches a platform media buffer, or talks to a CDM
//! directly — it calls through these traits and a host implements them.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;

use crate::manifest::segment_index::Segment;
use crate::manifest::representation::CdnMetadata;
use crate::manifest::Manifest;
use crate::types::TrackType;
use crate::Result;

/// Raw bytes plus whatever metadata the transport captured while fetching
/// them (response headers, final URL after redirects, etc. — opaque to the
/// engine).
#[derive(Debug, Clone)]
pub struct LoadedBytes {
	pub data: Bytes,
	pub url: url::Url,
}

/// Options influencing manifest parsing (spec §6: `parse_manifest(bytes,
/// opts)`).
#[derive(Debug, Clone, Default)]
pub struct ParseManifestOptions {
	pub is_initial: bool,
	pub previous_manifest_uri: Option<url::Url>,
}

/// The "init" or "media" segment payload a transport hands back after
/// parsing a downloaded chunk (spec §6 `parse_segment`).
#[derive(Debug, Clone)]
pub enum ParsedSegment {
	Init {
		data: Bytes,
		protection_data: Vec<Bytes>,
	},
	Media {
		data: Bytes,
		protection_data: Vec<Bytes>,
		inband_events: Vec<Value>,
		predicted_segments: Vec<Segment>,
		needs_manifest_refresh: bool,
	},
}

/// A stream of chunks for one in-flight segment download. The engine drives
/// this to completion, feeding each chunk to `parse_segment` as it arrives
/// (spec §4.D: "media and init requests may proceed in parallel").
#[async_trait]
pub trait ChunkStream: Send {
	/// `None` signals the download is complete.
	async fn next_chunk(&mut self) -> Result<Option<Bytes>>;
}

/// Spec §6: "Four callbacks per transport (DASH, Smooth, local)."
#[async_trait]
pub trait TransportPipeline: Send + Sync {
	async fn load_manifest(&self, url: &url::Url) -> Result<LoadedBytes>;

	fn parse_manifest(&self, bytes: &Bytes, opts: &ParseManifestOptions) -> Result<Manifest>;

	async fn load_segment(&self, segment: &Segment, cdn: &CdnMetadata) -> Result<Box<dyn ChunkStream>>;

	fn parse_segment(&self, chunk: &Bytes, init_state: Option<&Bytes>) -> Result<ParsedSegment>;
}

/// Spec §6: platform media buffer, one handle per track type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BufferedRange {
	pub start: f64,
	pub end: f64,
}

#[derive(Debug, Clone, Default)]
pub struct AppendOptions {
	pub time_offset: Option<f64>,
	pub append_window: Option<(f64, f64)>,
}

#[async_trait]
pub trait MediaBufferDriver: Send + Sync {
	async fn create(&self, track_type: TrackType, codec_string: &str) -> Result<BufferHandle>;
	async fn append(&self, handle: BufferHandle, data: Bytes, opts: AppendOptions) -> Result<Vec<BufferedRange>>;
	async fn remove(&self, handle: BufferHandle, start: f64, end: f64) -> Result<Vec<BufferedRange>>;
	async fn abort(&self, handle: BufferHandle) -> Result<()>;
	async fn dispose(&self, handle: BufferHandle) -> Result<()>;
	/// Signals logical end of stream across every created handle.
	async fn maintain_end_of_stream(&self) -> Result<()>;
}

/// Spec §6: DRM / decrypt collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrmAttachmentState {
	WaitingForAttachment,
	Initializing,
	ReadyForContent,
}

#[async_trait]
pub trait DrmAgent: Send + Sync {
	async fn on_initialization_data(&self, system_id: &str, data: Bytes) -> Result<()>;
	async fn attach(&self) -> Result<()>;
	fn state(&self) -> DrmAttachmentState;
	/// `None` when support is not yet known.
	fn is_codec_supported(&self, mime: &str, codec: &str) -> Option<bool>;
}

/// Spec §6: playback observer snapshot, polled roughly every 200ms and on
/// every media event.
#[derive(Debug, Clone, Copy)]
pub struct PlaybackPosition {
	pub polled: f64,
	pub wanted: f64,
	pub awaiting_future: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
	HaveNothing,
	HaveMetadata,
	HaveCurrentData,
	HaveFutureData,
	HaveEnoughData,
}

#[derive(Debug, Clone)]
pub struct PlaybackObservation {
	pub position: PlaybackPosition,
	pub duration: Option<f64>,
	pub paused: bool,
	pub buffered_ranges_per_type: Vec<(TrackType, Vec<BufferedRange>)>,
	pub ready_state: ReadyState,
	pub current_range: Option<BufferedRange>,
}

impl PlaybackObservation {
	pub fn buffered_ahead(&self, track_type: TrackType) -> f64 {
		self.buffered_ranges_per_type
			.iter()
			.find(|(t, _)| *t == track_type)
			.and_then(|(_, ranges)| ranges.iter().find(|r| r.start <= self.position.wanted && r.end > self.position.wanted))
			.map(|r| r.end - self.position.wanted)
			.unwrap_or(0.0)
	}
}

pub trait PlaybackObserverSource: Send + Sync {
	fn observe(&mut self, cb: Box<dyn FnMut(&PlaybackObservation) + Send>);
	fn set_current_time(&self, t: f64);
	fn set_playback_rate(&self, r: f64);
	fn get_is_paused(&self) -> bool;
}

/// The polling interval named in spec §6 ("at every media event and every
/// ~200 ms").
pub const PLAYBACK_OBSERVER_POLL_INTERVAL: Duration = Duration::from_millis(200);
