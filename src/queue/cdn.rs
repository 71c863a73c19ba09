//! CDN Prioritizer (spec §4.D): chooses among a Representation's CDN
//! options using moving-average latency/error counters plus optional
//! steering hints.

use std::collections::HashMap;

use crate::manifest::representation::CdnMetadata;

#[derive(Debug, Clone, Copy)]
struct CdnStats {
	/// Exponential moving average of request latency, milliseconds.
	avg_latency_ms: f64,
	/// Exponential moving average of the error rate, in `[0, 1]`.
	error_rate: f64,
}

impl Default for CdnStats {
	fn default() -> Self {
		Self { avg_latency_ms: 0.0, error_rate: 0.0 }
	}
}

const EMA_ALPHA: f64 = 0.3;

/// Picks a CDN for each request attempt and learns from the outcome (spec
/// §4.D: "the queue asks for a CDN at each request attempt").
#[derive(Default)]
pub struct CdnPrioritizer {
	stats: HashMap<String, CdnStats>,
	/// Host-supplied ordering override; lower is preferred, consulted before
	/// the learned stats (spec §4.D: "optional steering hints").
	steering_hints: HashMap<String, u32>,
}

impl CdnPrioritizer {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn set_steering_hints(&mut self, hints: HashMap<String, u32>) {
		self.steering_hints = hints;
	}

	pub fn on_request_succeeded(&mut self, cdn_id: &str, latency_ms: f64) {
		let stats = self.stats.entry(cdn_id.to_string()).or_default();
		stats.avg_latency_ms = EMA_ALPHA * latency_ms + (1.0 - EMA_ALPHA) * stats.avg_latency_ms;
		stats.error_rate = (1.0 - EMA_ALPHA) * stats.error_rate;
	}

	pub fn on_request_failed(&mut self, cdn_id: &str) {
		let stats = self.stats.entry(cdn_id.to_string()).or_default();
		stats.error_rate = EMA_ALPHA * 1.0 + (1.0 - EMA_ALPHA) * stats.error_rate;
	}

	/// Lower score wins. Steering hints dominate; ties (or absent hints) fall
	/// back to `priority`, then learned latency/error stats.
	fn score(&self, cdn: &CdnMetadata) -> (u32, i64, i64) {
		let hint = self.steering_hints.get(&cdn.id).copied().unwrap_or(u32::MAX);
		let stats = self.stats.get(&cdn.id).copied().unwrap_or_default();
		// Penalize errors heavily: a CDN with any recent failures should
		// rarely beat one with none, regardless of latency.
		let penalty = (stats.error_rate * 100_000.0) as i64 + stats.avg_latency_ms as i64;
		(hint.min(cdn.priority), hint as i64, penalty)
	}

	pub fn choose<'a>(&self, available: &'a [CdnMetadata]) -> Option<&'a CdnMetadata> {
		available.iter().min_by(|a, b| {
			let (ha, _, pa) = self.score(a);
			let (hb, _, pb) = self.score(b);
			ha.cmp(&hb).then(pa.cmp(&pb))
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn cdn(id: &str, priority: u32) -> CdnMetadata {
		CdnMetadata {
			id: id.into(),
			base_url: url::Url::parse("https://example.com/").unwrap(),
			priority,
		}
	}

	#[test]
	fn chooses_lowest_priority_absent_history() {
		let p = CdnPrioritizer::new();
		let cdns = vec![cdn("b", 2), cdn("a", 1)];
		assert_eq!(p.choose(&cdns).unwrap().id, "a");
	}

	#[test]
	fn steering_hint_overrides_priority() {
		let mut p = CdnPrioritizer::new();
		p.set_steering_hints(HashMap::from([("b".to_string(), 0)]));
		let cdns = vec![cdn("a", 1), cdn("b", 2)];
		assert_eq!(p.choose(&cdns).unwrap().id, "b");
	}

	#[test]
	fn failing_cdn_is_deprioritized_among_equal_priority() {
		let mut p = CdnPrioritizer::new();
		p.on_request_failed("a");
		let cdns = vec![cdn("a", 1), cdn("b", 1)];
		assert_eq!(p.choose(&cdns).unwrap().id, "b");
	}
}
