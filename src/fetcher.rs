//! Manifest fetcher & refresh scheduler (spec §4.L): initial fetch across
//! mirrors, scheduled refreshes, and manual refresh request collapsing.

use std::time::{Duration, Instant};

use tracing::warn;

use crate::config::OUT_OF_SYNC_MANIFEST_REFRESH_DELAY;
use crate::error::{Error, Result};
use crate::manifest::Manifest;
use crate::transport::{ParseManifestOptions, TransportPipeline};
use crate::types::RetryPolicy;

/// Spec §4.L refresh modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshMode {
	/// Re-fetch the full document and `Manifest::replace`.
	Full,
	/// Fetch a shorter update document (when `update_url` is set) and
	/// `Manifest::update`.
	Partial,
	/// Reuse unsanitized values to go faster on the live edge.
	UnsafeMode,
}

/// Strength of a manual refresh demand, used to collapse a pending request
/// with a stronger or equal one already scheduled (spec §4.L: "a manual
/// refresh request collapses with a pending one if its demand is strictly
/// weaker").
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RefreshDemand {
	PartialAllowed,
	FullRequired,
}

struct PendingRequest {
	demand: RefreshDemand,
	not_before: Instant,
}

/// Drives the initial manifest fetch and subsequent scheduled/manual
/// refreshes (spec §4.L).
pub struct ManifestFetcher {
	urls: Vec<url::Url>,
	update_url: Option<url::Url>,
	retry_policy: RetryPolicy,
	minimum_update_interval: Duration,
	last_fetch_at: Option<Instant>,
	out_of_sync_signalled_at: Option<Instant>,
	pending_manual: Option<PendingRequest>,
}

impl ManifestFetcher {
	pub fn new(urls: Vec<url::Url>, update_url: Option<url::Url>, retry_policy: RetryPolicy, minimum_update_interval: Duration) -> Self {
		Self {
			urls,
			update_url,
			retry_policy,
			minimum_update_interval,
			last_fetch_at: None,
			out_of_sync_signalled_at: None,
			pending_manual: None,
		}
	}

	/// Spec §4.L: "try each URL in order until a success; apply retry policy
	/// (max_retry, backoff with jitter, separate offline budget)".
	pub async fn fetch_initial(&mut self, transport: &dyn TransportPipeline, jitter: impl Fn() -> f64) -> Result<Manifest> {
		let manifest = self.fetch_from_mirrors(transport, &self.urls.clone(), ParseManifestOptions { is_initial: true, previous_manifest_uri: None }, jitter).await?;
		self.last_fetch_at = Some(now());
		Ok(manifest)
	}

	/// Runs one refresh cycle in the requested mode (spec §4.L).
	pub async fn refresh(&mut self, transport: &dyn TransportPipeline, mode: RefreshMode, previous_uri: Option<url::Url>, jitter: impl Fn() -> f64) -> Result<Manifest> {
		let urls = match mode {
			RefreshMode::Partial if self.update_url.is_some() => vec![self.update_url.clone().unwrap()],
			_ => self.urls.clone(),
		};
		let opts = ParseManifestOptions {
			is_initial: false,
			previous_manifest_uri: previous_uri,
		};
		let manifest = self.fetch_from_mirrors(transport, &urls, opts, jitter).await?;
		self.last_fetch_at = Some(now());
		self.pending_manual = None;
		Ok(manifest)
	}

	async fn fetch_from_mirrors(&self, transport: &dyn TransportPipeline, urls: &[url::Url], opts: ParseManifestOptions, jitter: impl Fn() -> f64) -> Result<Manifest> {
		let mut last_err = None;
		for url in urls {
			match self.fetch_one(transport, url, &opts, &jitter).await {
				Ok(manifest) => return Ok(manifest),
				Err(err) => {
					warn!(%url, error = %err, "manifest mirror failed, trying next");
					last_err = Some(err);
				}
			}
		}
		Err(last_err.unwrap_or_else(|| Error::other("no manifest URLs configured")))
	}

	async fn fetch_one(&self, transport: &dyn TransportPipeline, url: &url::Url, opts: &ParseManifestOptions, jitter: &impl Fn() -> f64) -> Result<Manifest> {
		let mut attempt = 0;
		loop {
			match transport.load_manifest(url).await {
				Ok(loaded) => return transport.parse_manifest(&loaded.data, opts),
				Err(err) => {
					let is_offline = matches!(&err, Error::Network(_));
					let max = if is_offline { self.retry_policy.offline_max_retry } else { self.retry_policy.max_retry };
					if attempt >= max {
						return Err(err);
					}
					attempt += 1;
					tokio::time::sleep(self.retry_policy.delay_for_attempt(attempt, jitter())).await;
				}
			}
		}
	}

	pub fn on_out_of_sync_signalled(&mut self, now: Instant) {
		self.out_of_sync_signalled_at = Some(now);
	}

	/// Spec §4.L: "a manual refresh request collapses with a pending one if
	/// its demand is strictly weaker".
	pub fn request_manual_refresh(&mut self, demand: RefreshDemand, now: Instant) {
		let not_before = now + self.minimum_update_interval;
		match &mut self.pending_manual {
			Some(existing) if existing.demand >= demand => {
				existing.not_before = existing.not_before.min(not_before);
			}
			_ => {
				self.pending_manual = Some(PendingRequest { demand, not_before });
			}
		}
	}

	/// Spec §4.L schedule policy: soonest of `lifetime` after last fetch, the
	/// out-of-sync delay, the manual-request floor, or an already-due
	/// request. Returns `None` when nothing is scheduled.
	pub fn next_refresh_at(&self, lifetime: Option<Duration>, now: Instant) -> Option<Instant> {
		let mut candidates = Vec::new();

		if let (Some(lifetime), Some(last)) = (lifetime, self.last_fetch_at) {
			candidates.push(last + lifetime);
		}
		if let Some(signalled) = self.out_of_sync_signalled_at {
			candidates.push(signalled + OUT_OF_SYNC_MANIFEST_REFRESH_DELAY);
		}
		if let Some(pending) = &self.pending_manual {
			candidates.push(pending.not_before);
		}

		let _ = now;
		candidates.into_iter().min()
	}

	pub fn pending_demand(&self) -> Option<RefreshDemand> {
		self.pending_manual.as_ref().map(|p| p.demand)
	}

	pub fn clear_out_of_sync(&mut self) {
		self.out_of_sync_signalled_at = None;
	}
}

fn now() -> Instant {
	Instant::now()
}
