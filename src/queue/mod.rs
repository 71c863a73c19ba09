//! Segment Queue (spec §3, §4.D): per-Representation priority queue of
//! pending segments, with bounded retries and a pluggable CDN prioritizer.

pub mod cdn;

use std::collections::VecDeque;

use tokio_util::sync::CancellationToken;

use crate::manifest::segment_index::Segment;
use crate::types::RetryPolicy;

pub use cdn::CdnPrioritizer;

#[derive(Debug, Clone)]
pub struct PendingSegment {
	pub segment: Segment,
	/// Lower is more urgent. The init segment, when pending alongside media
	/// segments, always inherits the first needed media segment's priority
	/// and is chosen first on a tie (spec §4.E step 3).
	pub priority: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestKind {
	Init,
	Media,
}

struct InFlight {
	kind: RequestKind,
	segment_time: f64,
	attempt: u32,
	cancel: CancellationToken,
}

/// Spec §3: "at most one in-flight init request; at most one in-flight media
/// request; the in-flight media request corresponds to `pending[0]` at the
/// time it started."
pub struct SegmentQueue {
	init_segment: Option<Segment>,
	pending: VecDeque<PendingSegment>,
	current_media_request: Option<InFlight>,
	current_init_request: Option<InFlight>,
	retry_policy: RetryPolicy,
	/// Default 1 (spec §4.D: "bounded by a configurable pipeline depth
	/// (default 1 in-flight media segment)").
	pipeline_depth: usize,
	cdn: CdnPrioritizer,
}

/// Spec §4.D event contract, named from the Queue outward (an Adaptation
/// Stream annotates these with Period/Representation context).
#[derive(Debug, Clone)]
pub enum QueueEvent {
	ParsedInitSegment,
	ParsedMediaSegment { segment: Segment },
	EmptyQueue,
	FullyLoadedSegment { segment: Segment },
	RequestRetry { segment: Segment, attempt: u32 },
	Error { fatal: bool },
}

impl SegmentQueue {
	pub fn new(retry_policy: RetryPolicy) -> Self {
		Self {
			init_segment: None,
			pending: VecDeque::new(),
			current_media_request: None,
			current_init_request: None,
			retry_policy,
			pipeline_depth: 1,
			cdn: CdnPrioritizer::new(),
		}
	}

	pub fn cdn_prioritizer_mut(&mut self) -> &mut CdnPrioritizer {
		&mut self.cdn
	}

	pub fn set_pipeline_depth(&mut self, depth: usize) {
		self.pipeline_depth = depth.max(1);
	}

	pub fn pipeline_depth(&self) -> usize {
		self.pipeline_depth
	}

	/// Replaces the elected queue (spec §4.D: "Holds the currently elected
	/// `{init_segment, segmentQueue}` list produced by the Representation
	/// Stream"). Keeps in-flight requests untouched; they settle
	/// independently.
	pub fn set_elected(&mut self, init_segment: Option<Segment>, segments: Vec<PendingSegment>) {
		self.init_segment = init_segment;
		self.pending = segments.into_iter().collect();
	}

	pub fn is_media_request_in_flight(&self) -> bool {
		self.current_media_request.is_some()
	}

	pub fn is_init_request_in_flight(&self) -> bool {
		self.current_init_request.is_some()
	}

	/// Returns the next media segment to request, honoring the pipeline
	/// depth and testable property 4 ("never two media requests in flight
	/// for the same Representation"). Does not pop it: the caller commits
	/// with [`Self::begin_media_request`] once the download actually starts.
	pub fn peek_next_media(&self) -> Option<&PendingSegment> {
		if self.current_media_request.is_some() {
			return None;
		}
		self.pending.front()
	}

	pub fn begin_media_request(&mut self, cancel: CancellationToken) -> Option<PendingSegment> {
		if self.current_media_request.is_some() {
			return None;
		}
		let next = self.pending.pop_front()?;
		self.current_media_request = Some(InFlight {
			kind: RequestKind::Media,
			segment_time: next.segment.time,
			attempt: 0,
			cancel,
		});
		Some(next)
	}

	pub fn begin_init_request(&mut self, cancel: CancellationToken) -> Option<Segment> {
		if self.current_init_request.is_some() {
			return None;
		}
		let seg = self.init_segment.clone()?;
		self.current_init_request = Some(InFlight {
			kind: RequestKind::Init,
			segment_time: seg.time,
			attempt: 0,
			cancel,
		});
		Some(seg)
	}

	pub fn on_init_request_settled(&mut self) {
		self.current_init_request = None;
	}

	pub fn on_media_request_settled(&mut self) {
		self.current_media_request = None;
	}

	/// Cancels whatever is in flight, matching spec §4.E's "urgent
	/// terminate: clear queue, cancel".
	pub fn cancel_all(&mut self) {
		if let Some(req) = self.current_media_request.take() {
			req.cancel.cancel();
		}
		if let Some(req) = self.current_init_request.take() {
			req.cancel.cancel();
		}
		self.pending.clear();
	}

	/// Returns `true` if a retry is still within budget, bumping the
	/// attempt counter and returning the backoff delay; `false` once
	/// exhausted (spec §4.D: "on exhaustion the error is surfaced as fatal").
	pub fn record_failure_and_retry_delay(&mut self, is_offline: bool, jitter: f64) -> Option<std::time::Duration> {
		let req = self.current_media_request.as_mut().or(self.current_init_request.as_mut())?;
		let max = if is_offline { self.retry_policy.offline_max_retry } else { self.retry_policy.max_retry };
		if req.attempt >= max {
			return None;
		}
		req.attempt += 1;
		Some(self.retry_policy.delay_for_attempt(req.attempt, jitter))
	}

	pub fn is_empty(&self) -> bool {
		self.pending.is_empty() && self.init_segment.is_none()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn seg(time: f64) -> Segment {
		Segment {
			id: format!("s{time}"),
			is_init: false,
			time,
			end: time + 2.0,
			duration: 2.0,
			timescale: 1,
			url_template: "c-$Number$.m4s".into(),
			byte_range: None,
			private_infos: serde_json::Value::Null,
		}
	}

	#[test]
	fn never_two_media_requests_in_flight() {
		let mut q = SegmentQueue::new(RetryPolicy::default());
		q.set_elected(None, vec![PendingSegment { segment: seg(0.0), priority: 0 }, PendingSegment { segment: seg(2.0), priority: 1 }]);
		assert!(q.begin_media_request(CancellationToken::new()).is_some());
		assert!(q.begin_media_request(CancellationToken::new()).is_none());
		q.on_media_request_settled();
		assert!(q.begin_media_request(CancellationToken::new()).is_some());
	}

	#[test]
	fn in_flight_media_request_matches_pending_head_at_start_time() {
		let mut q = SegmentQueue::new(RetryPolicy::default());
		q.set_elected(None, vec![PendingSegment { segment: seg(0.0), priority: 0 }]);
		let started = q.begin_media_request(CancellationToken::new()).unwrap();
		assert_eq!(started.segment.time, 0.0);
	}

	#[test]
	fn retry_budget_is_exhausted_after_max_retry() {
		let mut q = SegmentQueue::new(RetryPolicy { max_retry: 2, offline_max_retry: 2, base_delay_ms: 1, max_delay_ms: 10 });
		q.set_elected(None, vec![PendingSegment { segment: seg(0.0), priority: 0 }]);
		q.begin_media_request(CancellationToken::new());
		assert!(q.record_failure_and_retry_delay(false, 0.5).is_some());
		assert!(q.record_failure_and_retry_delay(false, 0.5).is_some());
		assert!(q.record_failure_and_retry_delay(false, 0.5).is_none());
	}

	#[test]
	fn cancel_all_clears_pending_and_in_flight() {
		let mut q = SegmentQueue::new(RetryPolicy::default());
		q.set_elected(None, vec![PendingSegment { segment: seg(0.0), priority: 0 }, PendingSegment { segment: seg(2.0), priority: 1 }]);
		q.begin_media_request(CancellationToken::new());
		q.cancel_all();
		assert!(q.is_empty());
		assert!(!q.is_media_request_in_flight());
	}
}
