//! End-to-end scenarios (spec §8): the S1-S6 flows and a handful of
//! cross-module properties, driven against in-memory fakes for
//! [`TransportPipeline`]/[`MediaBufferDriver`]/[`PlaybackObserverSource`] —
//! no real network, demuxer, or DRM. Properties already exercised by a
//! single module's own unit tests (no two media requests in flight, LIFO
//! cancellation callbacks, freeze-clears-on-advance) aren't repeated here.

use std::sync::Arc;
use std::time::{Duration, Instant};

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;

use crate::config::{CodecSwitchBehavior, Config, StaticConfig};
use crate::engine::{Engine, EngineDeps};
use crate::error::Error;
use crate::events::EngineEvent;
use crate::freeze::{FreezeDecision, FreezeResolver, FreezeThresholds};
use crate::manifest::adaptation::{Adaptation, AdaptationId, SupportStatus};
use crate::manifest::period::{Period, PeriodAdaptations};
use crate::manifest::representation::{CdnMetadata, Representation, RepresentationId, RepresentationUniqueId};
use crate::manifest::segment_index::{Segment, SegmentIndex, SegmentIndexData};
use crate::manifest::{Manifest, ManifestId, ManifestModel, MaximumTimeData, PeriodId, TimeBounds};
use crate::orchestrator::StreamOrchestrator;
use crate::sink::inventory::{Inventory, InventoryEntryStatus, SegmentInfo};
use crate::transport::{
	AppendOptions, BufferHandle, BufferedRange, ChunkStream, LoadedBytes, MediaBufferDriver, ParseManifestOptions,
	ParsedSegment, PlaybackObservation, PlaybackPosition, ReadyState, TransportPipeline,
};
use crate::types::{RetryPolicy, Tri, TrackType};

fn seg(time: f64, is_init: bool) -> Segment {
	Segment {
		id: format!("s{time}-{is_init}"),
		is_init,
		time,
		end: time + 2.0,
		duration: 2.0,
		timescale: 1,
		url_template: "c-$Number$.m4s".into(),
		byte_range: None,
		private_infos: serde_json::Value::Null,
	}
}

fn rep(id: &str, codec: &str, bitrate: u64) -> Representation {
	let mut index = SegmentIndexData::default();
	index.init = Some(seg(-1.0, true));
	index.initialize(vec![seg(0.0, false), seg(2.0, false)]);
	Representation {
		id: RepresentationId(id.into()),
		unique_id: RepresentationUniqueId(id.into()),
		bitrate,
		codecs: vec![codec.into()],
		mime_type: Some("video/mp4".into()),
		width: Some(1280),
		height: Some(720),
		frame_rate: None,
		hdr_info: None,
		content_protections: vec![],
		cdn_metadata: None,
		index,
		is_supported: Tri::True,
		decipherable: Tri::True,
		should_be_avoided: false,
	}
}

fn adaptation(track_type: TrackType, reps: Vec<Representation>) -> Adaptation {
	Adaptation {
		id: AdaptationId(format!("{track_type}")),
		r#type: track_type,
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

fn period(id: &str, start: f64, duration: f64, video: Vec<Representation>, audio: Vec<Representation>) -> Period {
	Period {
		id: PeriodId(id.into()),
		start,
		duration: Some(duration),
		adaptations: PeriodAdaptations {
			audio: if audio.is_empty() { vec![] } else { vec![adaptation(TrackType::Audio, audio)] },
			video: if video.is_empty() { vec![] } else { vec![adaptation(TrackType::Video, video)] },
			text: vec![],
		},
		stream_events: vec![],
	}
}

fn manifest(periods: Vec<Period>) -> Manifest {
	Manifest {
		id: ManifestId("m".into()),
		is_dynamic: false,
		is_live: false,
		is_last_period_known: true,
		clock_offset: 0.0,
		availability_start_time: 0.0,
		suggested_presentation_delay: None,
		lifetime: None,
		expired: false,
		periods,
		time_bounds: TimeBounds {
			minimum_safe_position: Some(0.0),
			timeshift_depth: None,
			maximum_time_data: MaximumTimeData {
				maximum_safe_position: 600.0,
				live_position: None,
				is_linear: false,
				time: Instant::now(),
			},
		},
		uris: vec![],
	}
}

/// Spec §8 round-trip property: "Serialize a Manifest metadata snapshot,
/// rehydrate into another context, then assert lookup operations ... return
/// the same answers on identical inputs."
#[test]
fn round_trip_manifest_preserves_lookup_answers() {
	let original = manifest(vec![
		period("p1", 0.0, 100.0, vec![rep("v1", "avc1.64001f", 1_000_000), rep("v2", "avc1.64001f", 2_000_000)], vec![rep("a1", "mp4a.40.2", 128_000)]),
		period("p2", 100.0, 100.0, vec![rep("v3", "avc1.64001f", 1_000_000)], vec![]),
	]);

	let bytes = serde_json::to_vec(&original).unwrap();
	let rehydrated: Manifest = serde_json::from_slice(&bytes).unwrap();

	for probe in [0.0, 50.0, 100.0, 150.0, 250.0] {
		let a = original.get_period_for_time(probe).map(|p| p.id.clone());
		let b = rehydrated.get_period_for_time(probe).map(|p| p.id.clone());
		assert_eq!(a, b, "get_period_for_time({probe}) diverged after round-trip");
	}

	let p1 = PeriodId("p1".into());
	let a1 = AdaptationId(format!("{}", TrackType::Video));
	assert_eq!(
		original.get_adaptation(&p1, TrackType::Video, &a1).map(|a| a.representations.len()),
		rehydrated.get_adaptation(&p1, TrackType::Video, &a1).map(|a| a.representations.len()),
	);

	let v2 = RepresentationUniqueId("v2".into());
	assert_eq!(original.get_representation(&v2).map(|r| r.bitrate), rehydrated.get_representation(&v2).map(|r| r.bitrate));
}

struct FakeChunkStream {
	data: Option<Bytes>,
}

#[async_trait]
impl ChunkStream for FakeChunkStream {
	async fn next_chunk(&mut self) -> crate::error::Result<Option<Bytes>> {
		Ok(self.data.take())
	}
}

/// A transport whose manifest is fixed at construction and whose segments
/// always resolve successfully, optionally flagging `needs_manifest_refresh`
/// on every media payload (used by the S6 out-of-sync scenario) or failing
/// the next media segment load with a 404 (used by the S6 load-failure
/// scenario).
struct ScriptedTransport {
	manifest: Manifest,
	flag_out_of_sync: bool,
	fail_next_media_not_found: AtomicBool,
}

#[async_trait]
impl TransportPipeline for ScriptedTransport {
	async fn load_manifest(&self, url: &url::Url) -> crate::error::Result<LoadedBytes> {
		Ok(LoadedBytes { data: Bytes::new(), url: url.clone() })
	}
	fn parse_manifest(&self, _bytes: &Bytes, _opts: &ParseManifestOptions) -> crate::error::Result<Manifest> {
		Ok(self.manifest.clone())
	}
	async fn load_segment(&self, segment: &Segment, _cdn: &CdnMetadata) -> crate::error::Result<Box<dyn ChunkStream>> {
		if !segment.is_init && self.fail_next_media_not_found.swap(false, Ordering::SeqCst) {
			return Err(Error::not_found(anyhow::anyhow!("404 fetching segment {}", segment.id)));
		}
		let payload = if segment.is_init { "init" } else { "media" };
		Ok(Box::new(FakeChunkStream { data: Some(Bytes::from_static(payload.as_bytes())) }))
	}
	fn parse_segment(&self, chunk: &Bytes, init_state: Option<&Bytes>) -> crate::error::Result<ParsedSegment> {
		if chunk.as_ref() == b"init" {
			Ok(ParsedSegment::Init { data: chunk.clone(), protection_data: vec![] })
		} else {
			let _ = init_state;
			Ok(ParsedSegment::Media {
				data: chunk.clone(),
				protection_data: vec![],
				inband_events: vec![],
				predicted_segments: vec![],
				needs_manifest_refresh: self.flag_out_of_sync,
			})
		}
	}
}

struct FakeBufferDriver;

#[async_trait]
impl MediaBufferDriver for FakeBufferDriver {
	async fn create(&self, _track_type: TrackType, _codec_string: &str) -> crate::error::Result<BufferHandle> {
		Ok(BufferHandle(1))
	}
	async fn append(&self, _handle: BufferHandle, data: Bytes, opts: AppendOptions) -> crate::error::Result<Vec<BufferedRange>> {
		let offset = opts.time_offset.unwrap_or(0.0);
		Ok(vec![BufferedRange { start: offset, end: offset + data.len() as f64 }])
	}
	async fn remove(&self, _handle: BufferHandle, _start: f64, _end: f64) -> crate::error::Result<Vec<BufferedRange>> {
		Ok(vec![])
	}
	async fn abort(&self, _handle: BufferHandle) -> crate::error::Result<()> {
		Ok(())
	}
	async fn dispose(&self, _handle: BufferHandle) -> crate::error::Result<()> {
		Ok(())
	}
	async fn maintain_end_of_stream(&self) -> crate::error::Result<()> {
		Ok(())
	}
}

fn deps_with(manifest: Manifest, flag_out_of_sync: bool) -> EngineDeps {
	EngineDeps {
		transport: Arc::new(ScriptedTransport { manifest, flag_out_of_sync, fail_next_media_not_found: AtomicBool::new(false) }),
		buffer_driver: Arc::new(FakeBufferDriver),
		drm: None,
		default_cdn: CdnMetadata { id: "default".into(), base_url: url::Url::parse("https://example.com/").unwrap(), priority: 0 },
	}
}

fn deps_with_404_once(manifest: Manifest) -> EngineDeps {
	EngineDeps {
		transport: Arc::new(ScriptedTransport { manifest, flag_out_of_sync: false, fail_next_media_not_found: AtomicBool::new(true) }),
		buffer_driver: Arc::new(FakeBufferDriver),
		drm: None,
		default_cdn: CdnMetadata { id: "default".into(), base_url: url::Url::parse("https://example.com/").unwrap(), priority: 0 },
	}
}

fn observation_at(position: f64) -> PlaybackObservation {
	PlaybackObservation {
		position: PlaybackPosition { polled: position, wanted: position, awaiting_future: false },
		duration: None,
		paused: false,
		buffered_ranges_per_type: vec![],
		ready_state: ReadyState::HaveEnoughData,
		current_range: None,
	}
}

fn config_with_buffer_goal(goal: f64) -> Config {
	let config = Config::new(StaticConfig::default());
	config.wanted_buffer_ahead.set(goal);
	config
}

/// Non-blocking drain: every event so far is already queued by the time an
/// `await` point returns control here, since the engine sends synchronously.
async fn drain_pending_events(engine: &mut Engine) -> Vec<EngineEvent> {
	use futures::FutureExt;
	let mut events = Vec::new();
	while let Some(Some(event)) = engine.next_event().now_or_never() {
		events.push(event);
	}
	events
}

/// S1: static VOD, one Period, 3 video + 2 audio Representations, small
/// buffer goal. After bringing the engine up and running the per-track pump
/// a few times, both tracks should have picked a Representation, and no
/// Warning/Error/ReloadingMediaSource should have fired.
#[tokio::test]
async fn s1_static_vod_selects_representations_without_warnings() {
	let video = vec![rep("v-low", "avc1.64001f", 500_000), rep("v-mid", "avc1.64001f", 1_500_000), rep("v-high", "avc1.64001f", 4_000_000)];
	let audio = vec![rep("a-low", "mp4a.40.2", 64_000), rep("a-high", "mp4a.40.2", 128_000)];
	let m = manifest(vec![period("p1", 0.0, 120.0, video, audio)]);

	let mut engine = Engine::connect(config_with_buffer_goal(2.0), deps_with(m, false), vec![url::Url::parse("https://example.com/m.mpd").unwrap()]).await.unwrap();

	assert!(matches!(engine.next_event().await.unwrap(), EngineEvent::ManifestReady(_)));
	assert!(matches!(engine.next_event().await.unwrap(), EngineEvent::Loaded));

	engine.on_playback_observation(&observation_at(0.0), Instant::now()).await;
	for _ in 0..6 {
		engine.drive(TrackType::Video, 0.0).await.unwrap();
		engine.drive(TrackType::Audio, 0.0).await.unwrap();
	}

	assert!(engine.manifest().get_period_for_time(0.0).is_some());

	let mut saw_warning = false;
	let mut saw_error = false;
	let mut saw_reload = false;
	for event in drain_pending_events(&mut engine).await {
		match event {
			EngineEvent::Warning(_) => saw_warning = true,
			EngineEvent::Error(_) => saw_error = true,
			EngineEvent::ReloadingMediaSource(_) => saw_reload = true,
			_ => {}
		}
	}
	assert!(!saw_warning, "static VOD playback shouldn't warn");
	assert!(!saw_error, "static VOD playback shouldn't error");
	assert!(!saw_reload, "no codec change occurred, so no reload should be requested");
}

/// S3: a stall that resolves itself decides `Flush` the first time, then a
/// second stall past F3 at the nudged position escalates to `Reload`
/// (spec §4.J's F1/F2/F3 ladder composed across two back-to-back episodes).
#[test]
fn s3_freeze_flushes_then_escalates_to_reload_on_the_next_stall() {
	let mut resolver = FreezeResolver::new(FreezeThresholds::default(), false);
	let t0 = Instant::now();

	let obs = |position: f64, buffered_end: f64| PlaybackObservation {
		position: PlaybackPosition { polled: position, wanted: position, awaiting_future: false },
		duration: None,
		paused: false,
		buffered_ranges_per_type: vec![],
		ready_state: ReadyState::HaveFutureData,
		current_range: Some(BufferedRange { start: position - 1.0, end: buffered_end }),
	};

	assert!(resolver.on_new_observation(&obs(5.0, 10.0), t0, false, 1e-3).is_none());
	let first = resolver.on_new_observation(&obs(5.0, 10.0), t0 + Duration::from_secs(3), false, 1e-3);
	assert_eq!(first, Some(FreezeDecision::Flush { relative_seek: 0.1 }));

	// The flush's relative seek nudges currentTime forward; it sticks again
	// at the new position, this time long enough to cross F3.
	let t1 = t0 + Duration::from_secs(4);
	assert!(resolver.on_new_observation(&obs(5.1, 10.0), t1, false, 1e-3).is_none());
	let second = resolver.on_new_observation(&obs(5.1, 10.0), t1 + Duration::from_secs(9), false, 1e-3);
	assert_eq!(second, Some(FreezeDecision::Reload { time_offset: 0.0 }));
}

/// S4: crossing into a Period whose first loadable video codec differs
/// requests a reload bounded to the new Period's own time range.
#[test]
fn s4_codec_switch_reload_request_is_bounded_to_new_period() {
	let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
	let mut orch = StreamOrchestrator::new(RetryPolicy::default(), CodecSwitchBehavior::Reload, true, tx);

	let p1 = period("p1", 0.0, 100.0, vec![rep("v1", "avc1.64001F", 1_000_000)], vec![]);
	let p2 = period("p2", 100.0, 50.0, vec![rep("v2", "hvc1.1.6.L93.B0", 1_000_000)], vec![]);
	let m = manifest(vec![p1, p2]);

	orch.sync_period_lineup(&m, 0.0, 200.0);
	orch.set_active_period(&m, PeriodId("p1".into()));
	let reload_requested = orch.set_active_period(&m, PeriodId("p2".into()));
	assert!(reload_requested);

	let mut request = None;
	while let Ok(event) = rx.try_recv() {
		if let EngineEvent::ReloadingMediaSource(req) = event {
			request = Some(req);
		}
	}
	let request = request.expect("expected a ReloadingMediaSource event");
	assert_eq!(request.minimum_position, 100.0);
	assert_eq!(request.maximum_position, 150.0);
}

/// S5: demoting the current Representation's decipherability removes it
/// from the estimator's eligible set, and the update is reported for
/// exactly that one Representation.
#[test]
fn s5_decipherability_demotion_excludes_only_that_representation() {
	let keep = rep("v-fallback", "avc1.64001f", 1_000_000);
	let demote = rep("v-current", "avc1.64001f", 2_000_000);
	let m = manifest(vec![period("p1", 0.0, 100.0, vec![keep, demote], vec![])]);
	let mut model = ManifestModel::new(m);

	let target = RepresentationUniqueId("v-current".into());
	let changed = model.update_representations_decipherability(|r| if r.unique_id == target { Tri::False } else { Tri::True });

	assert_eq!(changed, vec![target.clone()]);
	let reps = &model.manifest().periods[0].adaptations.video[0].representations;
	let current = reps.iter().find(|r| r.unique_id == target).unwrap();
	assert!(!current.is_loadable());
	let fallback = reps.iter().find(|r| r.unique_id.0 == "v-fallback").unwrap();
	assert!(fallback.is_loadable());
}

/// S6: a media payload flagged `needs_manifest_refresh` raises
/// `ManifestMightBeOutOfSync` so the host knows a full refresh is coming.
#[tokio::test]
async fn s6_out_of_sync_segment_flag_raises_manifest_might_be_out_of_sync() {
	let m = manifest(vec![period("p1", 0.0, 120.0, vec![rep("v1", "avc1.64001f", 1_000_000)], vec![])]);
	let mut engine = Engine::connect(config_with_buffer_goal(2.0), deps_with(m, true), vec![url::Url::parse("https://example.com/m.mpd").unwrap()]).await.unwrap();

	assert!(matches!(engine.next_event().await.unwrap(), EngineEvent::ManifestReady(_)));
	assert!(matches!(engine.next_event().await.unwrap(), EngineEvent::Loaded));

	engine.on_playback_observation(&observation_at(0.0), Instant::now()).await;
	engine.drive(TrackType::Video, 0.0).await.unwrap(); // init
	engine.drive(TrackType::Video, 0.0).await.unwrap(); // media, flagged

	let mut saw_out_of_sync = false;
	for event in drain_pending_events(&mut engine).await {
		if matches!(event, EngineEvent::ManifestMightBeOutOfSync) {
			saw_out_of_sync = true;
		}
	}
	assert!(saw_out_of_sync);
}

/// S6: a 404 on a segment the Segment Index still believes is available
/// raises `ManifestMightBeOutOfSync` from the load failure itself, not only
/// from a `parse_segment`-reported flag.
#[tokio::test]
async fn s6_404_on_a_still_available_segment_raises_manifest_might_be_out_of_sync() {
	let m = manifest(vec![period("p1", 0.0, 120.0, vec![rep("v1", "avc1.64001f", 1_000_000)], vec![])]);
	let mut engine = Engine::connect(config_with_buffer_goal(2.0), deps_with_404_once(m), vec![url::Url::parse("https://example.com/m.mpd").unwrap()]).await.unwrap();

	assert!(matches!(engine.next_event().await.unwrap(), EngineEvent::ManifestReady(_)));
	assert!(matches!(engine.next_event().await.unwrap(), EngineEvent::Loaded));

	engine.on_playback_observation(&observation_at(0.0), Instant::now()).await;
	engine.drive(TrackType::Video, 0.0).await.unwrap(); // init
	engine.drive(TrackType::Video, 0.0).await.unwrap(); // media: 404

	let mut saw_out_of_sync = false;
	let mut saw_warning_or_error = false;
	for event in drain_pending_events(&mut engine).await {
		match event {
			EngineEvent::ManifestMightBeOutOfSync => saw_out_of_sync = true,
			EngineEvent::Warning(_) | EngineEvent::Error(_) => saw_warning_or_error = true,
			_ => {}
		}
	}
	assert!(saw_out_of_sync);
	assert!(!saw_warning_or_error, "a likely-out-of-sync 404 should trigger a refresh, not representation avoidance");
}

/// Spec §8 testable property 1: a successfully resolved push leaves a
/// `Complete` inventory entry spanning the segment's real buffered range.
#[test]
fn property_push_segment_success_implies_inventory_entry() {
	let mut inventory = Inventory::new();
	let info = SegmentInfo {
		period: PeriodId("p1".into()),
		adaptation: AdaptationId("v".into()),
		representation: RepresentationUniqueId("v1".into()),
		segment: seg(0.0, false),
	};
	inventory.begin_push(info.clone());
	inventory.on_push_resolved(&info.representation, 0.0, 0.0, 2.0);
	inventory.signal_complete(&info.representation, 0.0);

	let entry = inventory.entries().iter().find(|e| e.info.representation == info.representation).unwrap();
	assert_eq!(entry.status, InventoryEntryStatus::Complete);
	assert_eq!(entry.buffered_start, Some(0.0));
	assert_eq!(entry.buffered_end, Some(2.0));
}

/// Spec §8 testable property 7: non-urgent terminate plus natural drainage
/// fires `terminating_emitted` exactly once, and no further segment is
/// elected once terminated.
#[test]
fn property_non_urgent_terminate_fires_exactly_once_and_stops_electing() {
	use crate::queue::SegmentQueue;
	use crate::stream::representation::{RepresentationStream, Terminate};

	let mut idx = SegmentIndexData::default();
	idx.initialize(vec![seg(0.0, false)]);
	let mut inventory = Inventory::new();

	let representation = rep("v1", "avc1", 1_000_000);
	let mut stream = RepresentationStream::new(PeriodId("p".into()), AdaptationId("v".into()), &representation, TrackType::Video, SegmentQueue::new(RetryPolicy::default()), f64::INFINITY);

	stream.check_status(&idx, &inventory, 0.0, 10.0, 100);
	let pending = stream.queue_mut().begin_media_request(tokio_util::sync::CancellationToken::new()).unwrap();
	// Mirrors what the Sink does on a real push: record the entry so
	// `compute_buffer_status` stops treating this segment as needed.
	inventory.begin_push(SegmentInfo {
		period: PeriodId("p".into()),
		adaptation: AdaptationId("v".into()),
		representation: representation.unique_id.clone(),
		segment: pending.segment,
	});
	stream.on_media_request_settled();

	stream.request_terminate(Terminate::NonUrgent);

	let mut terminating_fired = 0;
	for _ in 0..3 {
		let update = stream.check_status(&idx, &inventory, 0.0, 10.0, 100);
		if update.terminating_emitted {
			terminating_fired += 1;
		}
	}
	assert_eq!(terminating_fired, 1);
	assert!(stream.queue_mut().begin_media_request(tokio_util::sync::CancellationToken::new()).is_none());
}
