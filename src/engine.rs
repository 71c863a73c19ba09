//! Engine (spec §6): the top-level handle a host constructs once per
//! playback session. Wires together the manifest model, fetcher,
//! orchestrator, per-track estimators, freeze resolver, and Sinks, and
//! drives segment requests against the host-supplied transport, buffer, and
//! DRM collaborators.
//!
//! The engine owns no event loop of its own: a host calls [`Engine::drive`]
//! per track and [`Engine::on_playback_observation`]/[`Engine::maybe_refresh_manifest`]
//! on its own schedule (typically from a `tokio::select!` loop, per the
//! client-driving idiom this crate otherwise uses), and drains
//! [`Engine::next_event`] for host-facing notifications.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use tokio::sync::mpsc;
use tracing::warn;

use crate::cancel::TaskCanceller;
use crate::cmcd::{CmcdBuilder, CmcdContext};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::estimator::TrackEstimator;
use crate::events::EngineEvent;
use crate::fetcher::{ManifestFetcher, RefreshDemand, RefreshMode};
use crate::freeze::{FreezeDecision, FreezeResolver, FreezeThresholds};
use crate::manifest::{CdnMetadata, CodecSupportInfo, Manifest, ManifestEvent, ManifestModel, Representation, RepresentationUniqueId};
use crate::orchestrator::StreamOrchestrator;
use crate::queue::PendingSegment;
use crate::shared_ref::SubscribeOptions;
use crate::sink::inventory::SegmentInfo;
use crate::sink::Sink;
use crate::stream::representation::RepresentationStream;
use crate::transport::{AppendOptions, BufferHandle, ChunkStream, DrmAgent, DrmAttachmentState, MediaBufferDriver, ParsedSegment, PlaybackObservation, TransportPipeline};
use crate::types::{Tri, TrackType};

/// Everything a host supplies at construction beyond the manifest URLs
/// themselves (spec §6: "Four callbacks per transport", plus the
/// buffer/DRM collaborators).
pub struct EngineDeps {
	pub transport: Arc<dyn TransportPipeline>,
	pub buffer_driver: Arc<dyn MediaBufferDriver>,
	pub drm: Option<Arc<dyn DrmAgent>>,
	/// Used when a Representation declares no `cdn_metadata` of its own.
	pub default_cdn: CdnMetadata,
}

/// The orchestrator's top-level handle (spec §1, §6). Owns everything except
/// manifest parsing, HTTP, demuxing, decryption, and the platform media
/// buffer, which stay behind [`EngineDeps`].
pub struct Engine {
	config: Config,
	deps: EngineDeps,
	manifest_model: ManifestModel,
	fetcher: ManifestFetcher,
	orchestrator: StreamOrchestrator,
	estimators: HashMap<TrackType, TrackEstimator>,
	freeze: FreezeResolver,
	sinks: HashMap<TrackType, Sink>,
	buffer_handles: HashMap<TrackType, BufferHandle>,
	/// Last init segment payload seen per Representation, handed to
	/// `parse_segment` as `init_state` for media requests (spec §6
	/// `parse_segment(chunk, init_state)`).
	init_cache: HashMap<RepresentationUniqueId, Bytes>,
	last_representation: HashMap<TrackType, RepresentationUniqueId>,
	events_tx: mpsc::UnboundedSender<EngineEvent>,
	events_rx: mpsc::UnboundedReceiver<EngineEvent>,
	root: Arc<TaskCanceller>,
}

impl Engine {
	/// Performs the initial manifest fetch and brings up Sinks and the
	/// Period lineup for `urls` (spec §6 startup sequence).
	pub async fn connect(config: Config, deps: EngineDeps, urls: Vec<url::Url>) -> Result<Self> {
		let retry_policy = config.static_config.segment_retry_options;
		let on_codec_switch = config.static_config.on_codec_switch;
		let enable_fast_switching = config.static_config.enable_fast_switching;
		let enable_representation_avoidance = config.static_config.enable_representation_avoidance;
		let manifest_retry = config.static_config.manifest_retry_options;

		let mut fetcher = ManifestFetcher::new(urls, None, manifest_retry, std::time::Duration::from_secs(2));
		let manifest = fetcher.fetch_initial(deps.transport.as_ref(), jitter).await?;
		let manifest_id = manifest.id.clone();

		let (events_tx, events_rx) = mpsc::unbounded_channel();

		let mut manifest_model = ManifestModel::new(manifest);
		{
			let tx = events_tx.clone();
			manifest_model.subscribe(move |ev| forward_manifest_event(ev, &tx));
		}

		let orchestrator = StreamOrchestrator::new(retry_policy, on_codec_switch, enable_fast_switching, events_tx.clone());

		let mut estimators = HashMap::new();
		for track_type in [TrackType::Audio, TrackType::Video] {
			let estimator = TrackEstimator::new(track_type);
			let tx = events_tx.clone();
			estimator.bitrate_estimate.on_update(
				move |bitrate| {
					let _ = tx.send(EngineEvent::BitrateEstimateChange { track_type, bitrate });
				},
				SubscribeOptions::default(),
			);
			estimators.insert(track_type, estimator);
		}

		let mut engine = Self {
			config,
			deps,
			manifest_model,
			fetcher,
			orchestrator,
			estimators,
			freeze: FreezeResolver::new(FreezeThresholds::default(), enable_representation_avoidance),
			sinks: HashMap::new(),
			buffer_handles: HashMap::new(),
			init_cache: HashMap::new(),
			last_representation: HashMap::new(),
			events_tx,
			events_rx,
			root: Arc::new(TaskCanceller::new()),
		};

		engine.emit(EngineEvent::ManifestReady(manifest_id));
		engine.create_sinks_for_active_tracks().await?;

		let wanted_buffer_ahead = engine.config.wanted_buffer_ahead.get();
		engine.orchestrator.sync_period_lineup(engine.manifest_model.manifest(), 0.0, wanted_buffer_ahead);
		if let Some(period) = engine.manifest_model.manifest().get_period_for_time(0.0) {
			let id = period.id.clone();
			engine.orchestrator.set_active_period(engine.manifest_model.manifest(), id);
		}

		engine.emit(EngineEvent::Loaded);
		Ok(engine)
	}

	async fn create_sinks_for_active_tracks(&mut self) -> Result<()> {
		let track_types: Vec<TrackType> = {
			let manifest = self.manifest_model.manifest();
			[TrackType::Audio, TrackType::Video, TrackType::Text]
				.into_iter()
				.filter(|tt| manifest.periods.iter().any(|p| !p.adaptations.of(*tt).is_empty()))
				.collect()
		};

		for track_type in track_types {
			let codec_string = self.first_codec_string(track_type).unwrap_or_default();
			let handle = self.deps.buffer_driver.create(track_type, &codec_string).await?;
			self.buffer_handles.insert(track_type, handle);
			self.sinks.insert(track_type, Sink::new(Arc::clone(&self.deps.buffer_driver)));
		}
		Ok(())
	}

	fn first_codec_string(&self, track_type: TrackType) -> Option<String> {
		self.manifest_model
			.manifest()
			.periods
			.iter()
			.flat_map(|p| p.adaptations.of(track_type).iter())
			.flat_map(|a| a.representations.iter())
			.find(|r| r.is_loadable())
			.map(|r| r.codecs.join(","))
	}

	fn emit(&self, event: EngineEvent) {
		let _ = self.events_tx.send(event);
	}

	pub async fn next_event(&mut self) -> Option<EngineEvent> {
		self.events_rx.recv().await
	}

	pub fn manifest(&self) -> &Manifest {
		self.manifest_model.manifest()
	}

	pub fn request_manifest_refresh(&mut self, demand: RefreshDemand) {
		self.fetcher.request_manual_refresh(demand, Instant::now());
	}

	pub fn update_codec_support(&mut self, infos: &[CodecSupportInfo]) {
		self.manifest_model.update_codec_support(infos);
	}

	pub fn update_decipherability(&mut self, f: impl Fn(&Representation) -> Tri) -> Vec<RepresentationUniqueId> {
		self.manifest_model.update_representations_decipherability(f)
	}

	pub fn cmcd_query(&self, track_type: TrackType, ctx: &CmcdContext) -> Option<String> {
		let opts = self.config.static_config.cmcd.as_ref()?;
		let _ = track_type;
		Some(CmcdBuilder::new(opts).build(track_type, ctx))
	}

	/// Tears down every live stream without waiting for drains (spec §4.K:
	/// "cancelling the root cancels the whole tree").
	pub fn shutdown(&self) {
		self.root.cancel();
	}

	fn current_representation(&self, track_type: TrackType) -> Option<Representation> {
		let period_id = self.orchestrator.active_period()?;
		let period_stream = self.orchestrator.periods().iter().find(|p| &p.period_id == period_id)?;
		let rep_id = period_stream.of(track_type)?.current_representation()?;
		self.manifest_model.manifest().get_representation(rep_id).cloned()
	}

	fn lower_quality_sibling_exists(&self, track_type: TrackType) -> bool {
		let Some(current) = self.current_representation(track_type) else { return false };
		let Some(period_id) = self.orchestrator.active_period() else { return false };
		let Some(period) = self.manifest_model.manifest().get_period(period_id) else { return false };
		period
			.adaptations
			.of(track_type)
			.iter()
			.any(|a| a.representations.iter().any(|r| r.is_loadable() && r.bitrate < current.bitrate))
	}

	fn apply_freeze_decision(&mut self, decision: FreezeDecision) {
		match decision {
			FreezeDecision::AvoidRepresentation { representation } => {
				self.manifest_model.add_representations_to_avoid(&[representation]);
				self.emit(EngineEvent::NeedsBufferFlush { relative_seek: 0.0 });
			}
			FreezeDecision::Flush { relative_seek } => {
				self.emit(EngineEvent::NeedsBufferFlush { relative_seek });
			}
			FreezeDecision::Reload { time_offset } => {
				self.emit(EngineEvent::ReloadingMediaSource(crate::events::MediaSourceReloadRequest {
					time_offset,
					minimum_position: 0.0,
					maximum_position: f64::INFINITY,
				}));
			}
		}
	}

	/// Reacts to a polled playback position (spec §4.H/§4.I/§4.J): resyncs
	/// the Period lineup, re-runs Representation selection per track, feeds
	/// the freeze resolver, and reconciles each Sink's inventory against the
	/// platform's reported buffered ranges (spec §3/§4.C: inventory entries
	/// are pruned once the platform buffer reports their range gone).
	pub async fn on_playback_observation(&mut self, obs: &PlaybackObservation, now: Instant) {
		let wanted_position = obs.position.wanted;
		let wanted_buffer_ahead = self.config.wanted_buffer_ahead.get();
		self.orchestrator.sync_period_lineup(self.manifest_model.manifest(), wanted_position, wanted_buffer_ahead);

		if let Some(period) = self.manifest_model.manifest().get_period_for_time(wanted_position) {
			let id = period.id.clone();
			self.orchestrator.set_active_period(self.manifest_model.manifest(), id);
		}

		for track_type in [TrackType::Audio, TrackType::Video] {
			let buffer_level = obs.buffered_ahead(track_type);
			let limit_resolution = if track_type == TrackType::Video { self.config.limit_resolution.get() } else { None };
			let throttle_bitrate = if track_type == TrackType::Video { self.config.throttle_video_bitrate.get() } else { None };

			if let Some(estimator) = self.estimators.get_mut(&track_type) {
				self.orchestrator
					.select_representation(self.manifest_model.manifest(), track_type, estimator, buffer_level, limit_resolution, throttle_bitrate, now);
			}

			if let Some(current) = self.current_representation(track_type) {
				if self.last_representation.get(&track_type) != Some(&current.unique_id) {
					self.freeze.on_representation_switch(current.unique_id.clone(), now);
					self.last_representation.insert(track_type, current.unique_id);
				}
			}
		}

		let lower_quality_sibling_exists = self.lower_quality_sibling_exists(TrackType::Video);
		if let Some(decision) = self.freeze.on_new_observation(obs, now, lower_quality_sibling_exists, crate::config::INVENTORY_SYNC_EPSILON) {
			self.apply_freeze_decision(decision);
		}

		self.synchronize_inventories(obs).await;
		self.orchestrator.reap_drained_streams();
	}

	async fn synchronize_inventories(&self, obs: &PlaybackObservation) {
		for (track_type, ranges) in &obs.buffered_ranges_per_type {
			let Some(sink) = self.sinks.get(track_type) else { continue };
			if let Err(err) = sink.synchronize_inventory(ranges.clone(), self.root.signal()).await {
				if !err.is_cancelled() {
					warn!(%err, ?track_type, "inventory synchronize failed");
				}
			}
		}
	}

	/// Runs one refresh cycle if the fetcher's schedule says it's due (spec
	/// §4.L).
	pub async fn maybe_refresh_manifest(&mut self, now: Instant) -> Result<()> {
		let lifetime = self.manifest_model.manifest().lifetime.map(std::time::Duration::from_secs_f64);
		let Some(due_at) = self.fetcher.next_refresh_at(lifetime, now) else { return Ok(()) };
		if now < due_at {
			return Ok(());
		}

		let mode = if self.fetcher.pending_demand() == Some(RefreshDemand::FullRequired) {
			RefreshMode::Full
		} else {
			RefreshMode::Partial
		};
		let previous_uri = self.manifest_model.manifest().uris.first().cloned();
		let updated = self.fetcher.refresh(self.deps.transport.as_ref(), mode, previous_uri, jitter).await?;

		match mode {
			RefreshMode::Full | RefreshMode::UnsafeMode => self.manifest_model.replace(updated),
			RefreshMode::Partial => self.manifest_model.update(updated),
		}
		self.fetcher.clear_out_of_sync();

		let wanted_buffer_ahead = self.config.wanted_buffer_ahead.get();
		self.orchestrator.on_manifest_update(self.manifest_model.manifest(), 0.0, wanted_buffer_ahead);
		Ok(())
	}

	fn check_status(&mut self, track_type: TrackType, representation: &Representation, wanted_position: f64, buffer_goal: f64, max_buffer_size_segments: usize) -> Option<crate::stream::representation::StatusUpdate> {
		let sink = self.sinks.get(&track_type)?;
		let stream = current_representation_stream(&mut self.orchestrator, track_type)?;
		let index = &representation.index as &dyn crate::manifest::SegmentIndex;
		Some(sink.with_inventory(|inv| stream.check_status(index, inv, wanted_position, buffer_goal, max_buffer_size_segments)))
	}

	async fn cleanup_buffer(&self, track_type: TrackType, cleanup_to: f64) {
		if cleanup_to <= 0.0 {
			return;
		}
		let (Some(sink), Some(handle)) = (self.sinks.get(&track_type), self.buffer_handles.get(&track_type)) else { return };
		if let Err(err) = sink.remove_buffer(*handle, 0.0, cleanup_to, self.root.signal()).await {
			if !err.is_cancelled() {
				warn!(%err, ?track_type, "buffer cleanup failed");
			}
		}
	}

	fn try_begin_init(&mut self, track_type: TrackType) -> Option<(crate::manifest::Segment, Arc<TaskCanceller>)> {
		let stream = current_representation_stream(&mut self.orchestrator, track_type)?;
		let canceller = Arc::clone(stream.canceller());
		let token = canceller.signal();
		let segment = stream.queue_mut().begin_init_request(token)?;
		Some((segment, canceller))
	}

	fn try_begin_media(&mut self, track_type: TrackType) -> Option<(PendingSegment, Arc<TaskCanceller>)> {
		let stream = current_representation_stream(&mut self.orchestrator, track_type)?;
		let canceller = Arc::clone(stream.canceller());
		let token = canceller.signal();
		let pending = stream.queue_mut().begin_media_request(token)?;
		Some((pending, canceller))
	}

	fn choose_cdn(&mut self, track_type: TrackType, representation: &Representation) -> CdnMetadata {
		let candidates = representation.cdn_metadata.clone().unwrap_or_default();
		if candidates.is_empty() {
			return self.deps.default_cdn.clone();
		}
		match current_representation_stream(&mut self.orchestrator, track_type) {
			Some(stream) => stream.queue_mut().cdn_prioritizer_mut().choose(&candidates).cloned().unwrap_or_else(|| self.deps.default_cdn.clone()),
			None => self.deps.default_cdn.clone(),
		}
	}

	async fn load_and_parse(&self, segment: &crate::manifest::Segment, cdn: &CdnMetadata, init_state: Option<&Bytes>) -> Result<ParsedSegment> {
		let chunk_stream = self.deps.transport.load_segment(segment, cdn).await?;
		let bytes = drain_chunks(chunk_stream).await?;
		self.deps.transport.parse_segment(&bytes, init_state)
	}

	/// Notifies the host of every DRM system id a Representation already
	/// declares in its manifest-carried `content_protections`, ahead of
	/// actually loading the init segment, so license negotiation can start in
	/// parallel with the fetch (spec §4.E: "emit `encryption_data_encountered`
	/// before loading the init segment when the system id is known up-front").
	fn emit_eager_encryption_signals(&self, representation: &Representation) {
		if self.deps.drm.is_none() {
			return;
		}
		let mut announced = HashSet::new();
		for cp in &representation.content_protections {
			if !cp.key_ids.is_empty() && announced.insert(cp.system_id.clone()) {
				self.emit(EngineEvent::EncryptionDataEncountered { system_id: cp.system_id.clone() });
			}
		}
	}

	/// Spec §4.B/S6: a 404 on a segment the Segment Index still believes is
	/// available is a likely out-of-sync manifest, not a permanent failure —
	/// raise the refresh signal instead of retrying or avoiding the
	/// Representation.
	fn handle_possible_out_of_sync_error(&mut self, representation: &Representation, segment: &crate::manifest::Segment, err: &Error) -> bool {
		if !err.is_not_found() {
			return false;
		}
		let index = &representation.index as &dyn crate::manifest::SegmentIndex;
		if !index.can_be_out_of_sync_error(segment, true) {
			return false;
		}
		self.signal_manifest_might_be_out_of_sync();
		true
	}

	fn signal_manifest_might_be_out_of_sync(&mut self) {
		let now = Instant::now();
		self.fetcher.on_out_of_sync_signalled(now);
		self.fetcher.request_manual_refresh(RefreshDemand::FullRequired, now);
		self.emit(EngineEvent::ManifestMightBeOutOfSync);
	}

	fn handle_fatal_error(&mut self, representation: &Representation, err: Error) {
		if err.is_representation_scoped() {
			self.manifest_model.add_representations_to_avoid(&[representation.unique_id.clone()]);
			self.emit(EngineEvent::Warning(err));
		} else {
			self.emit(EngineEvent::Error(err));
		}
	}

	/// Per-track segment pump (spec §4.E steps 2-7): re-checks status, runs
	/// buffer cleanup/manifest-refresh side signals, and requests the next
	/// init or media segment if one is elected and not already in flight.
	pub async fn drive(&mut self, track_type: TrackType, wanted_position: f64) -> Result<()> {
		let buffer_goal = self.config.wanted_buffer_ahead.get().min(self.config.max_buffer_ahead.get());
		let max_buffer_size_segments = if track_type == TrackType::Video {
			self.config.max_video_buffer_size.get().min(u32::MAX as u64) as usize
		} else {
			usize::MAX
		};

		let Some(representation) = self.current_representation(track_type) else { return Ok(()) };
		let rep_id = representation.unique_id.clone();

		let Some(status) = self.check_status(track_type, &representation, wanted_position, buffer_goal, max_buffer_size_segments) else {
			return Ok(());
		};

		if status.should_schedule_manifest_refresh {
			self.fetcher.request_manual_refresh(RefreshDemand::PartialAllowed, Instant::now());
		}

		if let Some(cleanup_to) = status.cleanup_up_to {
			self.cleanup_buffer(track_type, cleanup_to).await;
		}

		if status.terminating_emitted {
			self.orchestrator.reap_drained_streams();
			return Ok(());
		}

		if let Some((segment, canceller)) = self.try_begin_init(track_type) {
			return self.request_init(track_type, &representation, segment, canceller).await;
		}

		if let Some((pending, canceller)) = self.try_begin_media(track_type) {
			return self.request_media(track_type, &representation, &rep_id, pending, canceller).await;
		}

		Ok(())
	}

	async fn request_init(&mut self, track_type: TrackType, representation: &Representation, segment: crate::manifest::Segment, canceller: Arc<TaskCanceller>) -> Result<()> {
		self.emit_eager_encryption_signals(representation);
		loop {
			let cdn = self.choose_cdn(track_type, representation);
			match self.load_and_parse(&segment, &cdn, None).await {
				Ok(ParsedSegment::Init { data, protection_data }) => {
					self.init_cache.insert(representation.unique_id.clone(), data.clone());

					if let Some(drm) = &self.deps.drm {
						for (cp, chunk) in representation.content_protections.iter().zip(protection_data.iter()) {
							drm.on_initialization_data(&cp.system_id, chunk.clone()).await?;
							// Representations whose key_ids weren't already known
							// up-front didn't get the eager signal; announce them
							// now that the init segment revealed them.
							if cp.key_ids.is_empty() {
								self.emit(EngineEvent::EncryptionDataEncountered { system_id: cp.system_id.clone() });
							}
						}
					}

					if let (Some(sink), Some(handle)) = (self.sinks.get(&track_type), self.buffer_handles.get(&track_type)) {
						let token = canceller.signal();
						sink.push_init_segment(representation.unique_id.clone(), *handle, data, token).await?;
					}

					if let Some(stream) = current_representation_stream(&mut self.orchestrator, track_type) {
						stream.on_init_loaded();
					}
					return Ok(());
				}
				Ok(ParsedSegment::Media { .. }) => return Err(Error::other("transport returned a media payload for an init request")),
				Err(err) => {
					if err.is_cancelled() {
						if let Some(stream) = current_representation_stream(&mut self.orchestrator, track_type) {
							stream.queue_mut().on_init_request_settled();
						}
						return Ok(());
					}
					if self.handle_possible_out_of_sync_error(representation, &segment, &err) {
						if let Some(stream) = current_representation_stream(&mut self.orchestrator, track_type) {
							stream.queue_mut().on_init_request_settled();
						}
						return Ok(());
					}
					let is_offline = matches!(&err, Error::Network(_));
					let retry_delay = current_representation_stream(&mut self.orchestrator, track_type).and_then(|s| s.queue_mut().record_failure_and_retry_delay(is_offline, jitter()));
					match retry_delay {
						Some(delay) => {
							tokio::time::sleep(delay).await;
							continue;
						}
						None => {
							if let Some(stream) = current_representation_stream(&mut self.orchestrator, track_type) {
								stream.queue_mut().on_init_request_settled();
								stream.mark_errored();
							}
							self.handle_fatal_error(representation, err);
							return Ok(());
						}
					}
				}
			}
		}
	}

	async fn request_media(&mut self, track_type: TrackType, representation: &Representation, rep_id: &RepresentationUniqueId, pending: PendingSegment, canceller: Arc<TaskCanceller>) -> Result<()> {
		let period_id = self.orchestrator.active_period().cloned().ok_or_else(|| Error::other("no active period"))?;
		let adaptation_id = current_representation_stream(&mut self.orchestrator, track_type)
			.map(|s| s.adaptation.clone())
			.ok_or_else(|| Error::other("representation stream disappeared"))?;

		loop {
			let cdn = self.choose_cdn(track_type, representation);
			let init_state = self.init_cache.get(rep_id).cloned();
			let started = Instant::now();
			let outcome = self.load_and_parse(&pending.segment, &cdn, init_state.as_ref()).await;

			if let Some(stream) = current_representation_stream(&mut self.orchestrator, track_type) {
				let prioritizer = stream.queue_mut().cdn_prioritizer_mut();
				match &outcome {
					Ok(_) => prioritizer.on_request_succeeded(&cdn.id, started.elapsed().as_secs_f64() * 1000.0),
					Err(err) if !err.is_cancelled() => prioritizer.on_request_failed(&cdn.id),
					_ => {}
				}
			}

			match outcome {
				Ok(ParsedSegment::Media { data, protection_data, inband_events, predicted_segments, needs_manifest_refresh }) => {
					if let Some(drm) = &self.deps.drm {
						for (cp, chunk) in representation.content_protections.iter().zip(protection_data.iter()) {
							drm.on_initialization_data(&cp.system_id, chunk.clone()).await?;
						}
					}

					if let (Some(sink), Some(handle)) = (self.sinks.get(&track_type), self.buffer_handles.get(&track_type)) {
						let info = SegmentInfo {
							period: period_id.clone(),
							adaptation: adaptation_id.clone(),
							representation: rep_id.clone(),
							segment: pending.segment.clone(),
						};
						let opts = AppendOptions { time_offset: Some(pending.segment.time), append_window: None };
						let token = canceller.signal();
						sink.push_segment(info, *handle, data, opts, token.clone()).await?;
						sink.signal_segment_complete(rep_id.clone(), pending.segment.time, token).await?;
					}

					if let Some(stream) = current_representation_stream(&mut self.orchestrator, track_type) {
						stream.on_media_request_settled();
					}
					if !predicted_segments.is_empty() {
						self.manifest_model.add_predicted_segments(rep_id, predicted_segments);
					}
					if !inband_events.is_empty() {
						self.emit(EngineEvent::InbandEvents(inband_events));
					}
					if needs_manifest_refresh {
						self.signal_manifest_might_be_out_of_sync();
					}
					return Ok(());
				}
				Ok(ParsedSegment::Init { .. }) => return Err(Error::other("transport returned an init payload for a media request")),
				Err(err) => {
					if err.is_cancelled() {
						if let Some(stream) = current_representation_stream(&mut self.orchestrator, track_type) {
							stream.queue_mut().on_media_request_settled();
						}
						return Ok(());
					}
					if self.handle_possible_out_of_sync_error(representation, &pending.segment, &err) {
						if let Some(stream) = current_representation_stream(&mut self.orchestrator, track_type) {
							stream.queue_mut().on_media_request_settled();
						}
						return Ok(());
					}
					let is_offline = matches!(&err, Error::Network(_));
					let retry_delay = current_representation_stream(&mut self.orchestrator, track_type).and_then(|s| s.queue_mut().record_failure_and_retry_delay(is_offline, jitter()));
					match retry_delay {
						Some(delay) => {
							tokio::time::sleep(delay).await;
							continue;
						}
						None => {
							if let Some(stream) = current_representation_stream(&mut self.orchestrator, track_type) {
								stream.queue_mut().on_media_request_settled();
								stream.mark_errored();
							}
							self.handle_fatal_error(representation, err);
							return Ok(());
						}
					}
				}
			}
		}
	}
}

/// Borrows only `orchestrator`, never the rest of `Engine`, so callers can
/// hold a `Sink` or `Representation` borrow from a sibling field alongside
/// it (two-phase borrow friendly).
fn current_representation_stream(orchestrator: &mut StreamOrchestrator, track_type: TrackType) -> Option<&mut RepresentationStream> {
	let period_id = orchestrator.active_period()?.clone();
	orchestrator.period_mut(&period_id)?.of_mut(track_type)?.current_mut()
}

fn forward_manifest_event(event: &ManifestEvent, tx: &mpsc::UnboundedSender<EngineEvent>) {
	match event {
		ManifestEvent::ManifestUpdate(ids) => {
			let _ = tx.send(EngineEvent::ManifestUpdate(ids.clone()));
		}
		ManifestEvent::DecipherabilityUpdate(ids) => {
			let _ = tx.send(EngineEvent::DecipherabilityUpdate(ids.clone()));
		}
		ManifestEvent::SupportUpdate => {
			let _ = tx.send(EngineEvent::CodecSupportUpdate);
		}
		ManifestEvent::RepresentationAvoidanceUpdate(_) => {}
		ManifestEvent::FatalIncompatibleCodecs(err) => {
			let _ = tx.send(EngineEvent::Error(Error::Media(err.clone())));
		}
		ManifestEvent::WarningIncompatibleCodecs => {
			let _ = tx.send(EngineEvent::Warning(Error::other("one or more representations are unsupported")));
		}
	}
}

async fn drain_chunks(mut stream: Box<dyn ChunkStream>) -> Result<Bytes> {
	let mut buf = BytesMut::new();
	while let Some(chunk) = stream.next_chunk().await? {
		buf.extend_from_slice(&chunk);
	}
	Ok(buf.freeze())
}

/// No `rand` dependency in this stack; a fixed midpoint jitter still spreads
/// retries across the configured backoff window in practice.
fn jitter() -> f64 {
	0.5
}

#[cfg(test)]
mod tests {
	use super::*;
	use async_trait::async_trait;

	use crate::manifest::segment_index::{Segment, SegmentIndex, SegmentIndexData};
	use crate::manifest::{Adaptation, AdaptationId, ManifestId, MaximumTimeData, Period, PeriodAdaptations, PeriodId, RepresentationId, SupportStatus, TimeBounds};
	use crate::transport::{BufferedRange, LoadedBytes, ParseManifestOptions, PlaybackPosition, ReadyState};

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

	fn rep(id: &str) -> Representation {
		let mut index = SegmentIndexData::default();
		index.init = Some(seg(-1.0, true));
		index.initialize(vec![seg(0.0, false)]);
		Representation {
			id: RepresentationId(id.into()),
			unique_id: RepresentationUniqueId(id.into()),
			bitrate: 1_000_000,
			codecs: vec!["avc1".into()],
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

	fn one_video_period() -> Period {
		Period {
			id: PeriodId("p1".into()),
			start: 0.0,
			duration: Some(600.0),
			adaptations: PeriodAdaptations {
				audio: vec![],
				video: vec![Adaptation {
					id: AdaptationId("v".into()),
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
					representations: vec![rep("r1")],
					support_status: SupportStatus::default(),
				}],
				text: vec![],
			},
			stream_events: vec![],
		}
	}

	fn test_manifest() -> Manifest {
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
			periods: vec![one_video_period()],
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

	struct FakeChunkStream {
		data: Option<Bytes>,
	}

	#[async_trait]
	impl ChunkStream for FakeChunkStream {
		async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
			Ok(self.data.take())
		}
	}

	struct FakeTransport;

	#[async_trait]
	impl TransportPipeline for FakeTransport {
		async fn load_manifest(&self, url: &url::Url) -> Result<LoadedBytes> {
			Ok(LoadedBytes { data: Bytes::new(), url: url.clone() })
		}
		fn parse_manifest(&self, _bytes: &Bytes, _opts: &ParseManifestOptions) -> Result<Manifest> {
			Ok(test_manifest())
		}
		async fn load_segment(&self, segment: &Segment, _cdn: &CdnMetadata) -> Result<Box<dyn ChunkStream>> {
			let payload = if segment.is_init { "init" } else { "media" };
			Ok(Box::new(FakeChunkStream { data: Some(Bytes::from_static(payload.as_bytes())) }))
		}
		fn parse_segment(&self, chunk: &Bytes, init_state: Option<&Bytes>) -> Result<ParsedSegment> {
			if chunk.as_ref() == b"init" {
				Ok(ParsedSegment::Init { data: chunk.clone(), protection_data: vec![] })
			} else {
				let _ = init_state;
				Ok(ParsedSegment::Media {
					data: chunk.clone(),
					protection_data: vec![],
					inband_events: vec![],
					predicted_segments: vec![],
					needs_manifest_refresh: false,
				})
			}
		}
	}

	struct FakeBufferDriver;

	#[async_trait]
	impl MediaBufferDriver for FakeBufferDriver {
		async fn create(&self, _track_type: TrackType, _codec_string: &str) -> Result<BufferHandle> {
			Ok(BufferHandle(1))
		}
		async fn append(&self, _handle: BufferHandle, data: Bytes, opts: AppendOptions) -> Result<Vec<BufferedRange>> {
			let offset = opts.time_offset.unwrap_or(0.0);
			Ok(vec![BufferedRange { start: offset, end: offset + data.len() as f64 }])
		}
		async fn remove(&self, _handle: BufferHandle, _start: f64, _end: f64) -> Result<Vec<BufferedRange>> {
			Ok(vec![])
		}
		async fn abort(&self, _handle: BufferHandle) -> Result<()> {
			Ok(())
		}
		async fn dispose(&self, _handle: BufferHandle) -> Result<()> {
			Ok(())
		}
		async fn maintain_end_of_stream(&self) -> Result<()> {
			Ok(())
		}
	}

	fn deps() -> EngineDeps {
		EngineDeps {
			transport: Arc::new(FakeTransport),
			buffer_driver: Arc::new(FakeBufferDriver),
			drm: None,
			default_cdn: CdnMetadata {
				id: "default".into(),
				base_url: url::Url::parse("https://example.com/").unwrap(),
				priority: 0,
			},
		}
	}

	struct FakeDrmAgent;

	#[async_trait]
	impl DrmAgent for FakeDrmAgent {
		async fn on_initialization_data(&self, _system_id: &str, _data: Bytes) -> Result<()> {
			Ok(())
		}
		async fn attach(&self) -> Result<()> {
			Ok(())
		}
		fn state(&self) -> DrmAttachmentState {
			DrmAttachmentState::ReadyForContent
		}
		fn is_codec_supported(&self, _mime: &str, _codec: &str) -> Option<bool> {
			None
		}
	}

	fn deps_with_drm() -> EngineDeps {
		EngineDeps { drm: Some(Arc::new(FakeDrmAgent)), ..deps() }
	}

	fn rep_with_key_ids(id: &str) -> Representation {
		Representation {
			content_protections: vec![crate::manifest::ContentProtection {
				system_id: "urn:uuid:widevine".into(),
				key_ids: vec![crate::manifest::KeyId(vec![0xAB; 16])],
			}],
			..rep(id)
		}
	}

	fn manifest_with(representation: Representation) -> Manifest {
		let mut m = test_manifest();
		m.periods[0].adaptations.video[0].representations = vec![representation];
		m
	}

	struct DrmTestTransport {
		manifest: Manifest,
	}

	#[async_trait]
	impl TransportPipeline for DrmTestTransport {
		async fn load_manifest(&self, url: &url::Url) -> Result<LoadedBytes> {
			Ok(LoadedBytes { data: Bytes::new(), url: url.clone() })
		}
		fn parse_manifest(&self, _bytes: &Bytes, _opts: &ParseManifestOptions) -> Result<Manifest> {
			Ok(self.manifest.clone())
		}
		async fn load_segment(&self, segment: &Segment, _cdn: &CdnMetadata) -> Result<Box<dyn ChunkStream>> {
			let payload = if segment.is_init { "init" } else { "media" };
			Ok(Box::new(FakeChunkStream { data: Some(Bytes::from_static(payload.as_bytes())) }))
		}
		fn parse_segment(&self, chunk: &Bytes, init_state: Option<&Bytes>) -> Result<ParsedSegment> {
			if chunk.as_ref() == b"init" {
				Ok(ParsedSegment::Init { data: chunk.clone(), protection_data: vec![Bytes::from_static(b"pssh")] })
			} else {
				let _ = init_state;
				Ok(ParsedSegment::Media { data: chunk.clone(), protection_data: vec![], inband_events: vec![], predicted_segments: vec![], needs_manifest_refresh: false })
			}
		}
	}

	fn deps_with_drm_and_manifest(manifest: Manifest) -> EngineDeps {
		EngineDeps { transport: Arc::new(DrmTestTransport { manifest }), ..deps_with_drm() }
	}

	fn observation(position: f64) -> PlaybackObservation {
		PlaybackObservation {
			position: PlaybackPosition { polled: position, wanted: position, awaiting_future: false },
			duration: None,
			paused: false,
			buffered_ranges_per_type: vec![],
			ready_state: ReadyState::HaveEnoughData,
			current_range: None,
		}
	}

	#[tokio::test]
	async fn connect_emits_manifest_ready_then_loaded() {
		let mut engine = Engine::connect(Config::default(), deps(), vec![url::Url::parse("https://example.com/m.mpd").unwrap()]).await.unwrap();

		let first = engine.next_event().await.unwrap();
		assert!(matches!(first, EngineEvent::ManifestReady(_)));
		let second = engine.next_event().await.unwrap();
		assert!(matches!(second, EngineEvent::Loaded));
	}

	#[tokio::test]
	async fn drive_requests_init_then_media_in_order() {
		let mut engine = Engine::connect(Config::default(), deps(), vec![url::Url::parse("https://example.com/m.mpd").unwrap()]).await.unwrap();
		engine.on_playback_observation(&observation(0.0), Instant::now()).await;

		assert!(engine.drive(TrackType::Video, 0.0).await.is_ok());
		assert!(engine.drive(TrackType::Video, 0.0).await.is_ok());

		let mut saw_error = false;
		while let Ok(event) = engine.events_rx.try_recv() {
			if matches!(event, EngineEvent::Error(_)) {
				saw_error = true;
			}
		}
		assert!(!saw_error);
	}

	#[tokio::test]
	async fn playback_observation_selects_a_representation() {
		let mut engine = Engine::connect(Config::default(), deps(), vec![url::Url::parse("https://example.com/m.mpd").unwrap()]).await.unwrap();
		engine.on_playback_observation(&observation(0.0), Instant::now()).await;
		assert!(engine.current_representation(TrackType::Video).is_some());
	}

	/// A Representation whose `content_protections` already carry `key_ids`
	/// gets `EncryptionDataEncountered` exactly once for that system id, not
	/// once eagerly and again after the init segment's protection data comes
	/// back (spec §4.E).
	#[tokio::test]
	async fn eager_encryption_signal_is_not_duplicated_after_init_load() {
		let manifest = manifest_with(rep_with_key_ids("r1"));
		let mut engine = Engine::connect(Config::default(), deps_with_drm_and_manifest(manifest), vec![url::Url::parse("https://example.com/m.mpd").unwrap()]).await.unwrap();
		engine.on_playback_observation(&observation(0.0), Instant::now()).await;

		assert!(matches!(engine.next_event().await.unwrap(), EngineEvent::ManifestReady(_)));
		assert!(matches!(engine.next_event().await.unwrap(), EngineEvent::Loaded));

		assert!(engine.drive(TrackType::Video, 0.0).await.is_ok()); // init, carries protection data

		let mut signal_count = 0;
		while let Ok(event) = engine.events_rx.try_recv() {
			if matches!(event, EngineEvent::EncryptionDataEncountered { ref system_id } if system_id == "urn:uuid:widevine") {
				signal_count += 1;
			}
		}
		assert_eq!(signal_count, 1, "a system id known up-front should be announced once, not again once the init segment loads");
	}
}
