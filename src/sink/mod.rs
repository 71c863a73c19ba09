//! Segment Buffer Sink (spec §3, §4.C): one FIFO-serialized wrapper around a
//! single platform media buffer, plus the [`inventory::Inventory`] tracking
//! which segment occupies which buffered range.

pub mod inventory;

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::transport::{AppendOptions, BufferHandle, BufferedRange, MediaBufferDriver};
use crate::manifest::RepresentationUniqueId;

use inventory::{Inventory, SegmentInfo};

/// One pending operation in the sink's FIFO queue (spec §4.C: "operations
/// are serialized into a FIFO queue; the sink executes one operation at a
/// time... and resolves the futures in order").
enum Op {
	PushSegment {
		info: SegmentInfo,
		handle: BufferHandle,
		data: Bytes,
		opts: AppendOptions,
		reply: oneshot::Sender<Result<Vec<BufferedRange>>>,
	},
	PushInitSegment {
		representation: RepresentationUniqueId,
		handle: BufferHandle,
		data: Bytes,
		reply: oneshot::Sender<Result<Vec<BufferedRange>>>,
	},
	SignalSegmentComplete {
		representation: RepresentationUniqueId,
		segment_start: f64,
		reply: oneshot::Sender<Result<()>>,
	},
	SynchronizeInventory {
		real_buffered_ranges: Vec<BufferedRange>,
		reply: oneshot::Sender<Result<()>>,
	},
	RemoveBuffer {
		handle: BufferHandle,
		start: f64,
		end: f64,
		reply: oneshot::Sender<Result<Vec<BufferedRange>>>,
	},
}

struct QueuedOp {
	op: Op,
	cancel: CancellationToken,
}

/// One platform media buffer (audio, video, or text) plus its inventory
/// (spec §3: "A Sink wraps one underlying media buffer").
pub struct Sink {
	tx: mpsc::UnboundedSender<QueuedOp>,
	inventory: Arc<Mutex<Inventory>>,
}

impl Sink {
	pub fn new(driver: Arc<dyn MediaBufferDriver>) -> Self {
		let (tx, mut rx) = mpsc::unbounded_channel::<QueuedOp>();
		let inventory = Arc::new(Mutex::new(Inventory::new()));
		let worker_inventory = Arc::clone(&inventory);

		tokio::spawn(async move {
			while let Some(queued) = rx.recv().await {
				if queued.cancel.is_cancelled() {
					Self::fail_cancelled(queued.op);
					continue;
				}
				Self::run(&driver, &worker_inventory, queued.op).await;
			}
		});

		Self { tx, inventory }
	}

	fn fail_cancelled(op: Op) {
		match op {
			Op::PushSegment { reply, .. } => {
				let _ = reply.send(Err(Error::Cancelled));
			}
			Op::PushInitSegment { reply, .. } => {
				let _ = reply.send(Err(Error::Cancelled));
			}
			Op::SignalSegmentComplete { reply, .. } => {
				let _ = reply.send(Err(Error::Cancelled));
			}
			Op::SynchronizeInventory { reply, .. } => {
				let _ = reply.send(Err(Error::Cancelled));
			}
			Op::RemoveBuffer { reply, .. } => {
				let _ = reply.send(Err(Error::Cancelled));
			}
		}
	}

	async fn run(driver: &Arc<dyn MediaBufferDriver>, inventory: &Arc<Mutex<Inventory>>, op: Op) {
		match op {
			Op::PushSegment { info, handle, data, opts, reply } => {
				let representation = info.representation.clone();
				let segment_start = info.segment.time;
				inventory.lock().unwrap().begin_push(info);
				let result = driver.append(handle, data, opts).await;
				if let Ok(ranges) = &result {
					if let Some(range) = ranges.iter().find(|r| r.start <= segment_start && r.end > segment_start) {
						inventory
							.lock()
							.unwrap()
							.on_push_resolved(&representation, segment_start, range.start, range.end);
					}
				}
				let _ = reply.send(result);
			}
			Op::PushInitSegment { representation, handle, data, reply } => {
				inventory.lock().unwrap().declare_init_segment(representation);
				let result = driver.append(handle, data, AppendOptions::default()).await;
				let _ = reply.send(result);
			}
			Op::SignalSegmentComplete { representation, segment_start, reply } => {
				inventory.lock().unwrap().signal_complete(&representation, segment_start);
				let _ = reply.send(Ok(()));
			}
			Op::SynchronizeInventory { real_buffered_ranges, reply } => {
				inventory.lock().unwrap().synchronize(&real_buffered_ranges);
				let _ = reply.send(Ok(()));
			}
			Op::RemoveBuffer { handle, start, end, reply } => {
				let result = driver.remove(handle, start, end).await;
				if result.is_ok() {
					inventory.lock().unwrap().prune_removed(start, end);
				}
				let _ = reply.send(result);
			}
		}
	}

	fn enqueue(&self, op: Op, cancel: CancellationToken) {
		// An unbound receiver was dropped only if the worker task panicked;
		// nothing sensible to do beyond letting the reply channel close,
		// which turns into a RecvError at the call site.
		let _ = self.tx.send(QueuedOp { op, cancel });
	}

	pub async fn push_segment(&self, info: SegmentInfo, handle: BufferHandle, data: Bytes, opts: AppendOptions, cancel: CancellationToken) -> Result<Vec<BufferedRange>> {
		let (reply, rx) = oneshot::channel();
		self.enqueue(Op::PushSegment { info, handle, data, opts, reply }, cancel);
		rx.await.unwrap_or(Err(Error::Cancelled))
	}

	pub async fn push_init_segment(&self, representation: RepresentationUniqueId, handle: BufferHandle, data: Bytes, cancel: CancellationToken) -> Result<Vec<BufferedRange>> {
		let (reply, rx) = oneshot::channel();
		self.enqueue(Op::PushInitSegment { representation, handle, data, reply }, cancel);
		rx.await.unwrap_or(Err(Error::Cancelled))
	}

	pub async fn signal_segment_complete(&self, representation: RepresentationUniqueId, segment_start: f64, cancel: CancellationToken) -> Result<()> {
		let (reply, rx) = oneshot::channel();
		self.enqueue(Op::SignalSegmentComplete { representation, segment_start, reply }, cancel);
		rx.await.unwrap_or(Err(Error::Cancelled))
	}

	pub async fn synchronize_inventory(&self, real_buffered_ranges: Vec<BufferedRange>, cancel: CancellationToken) -> Result<()> {
		let (reply, rx) = oneshot::channel();
		self.enqueue(Op::SynchronizeInventory { real_buffered_ranges, reply }, cancel);
		rx.await.unwrap_or(Err(Error::Cancelled))
	}

	pub async fn remove_buffer(&self, handle: BufferHandle, start: f64, end: f64, cancel: CancellationToken) -> Result<Vec<BufferedRange>> {
		let (reply, rx) = oneshot::channel();
		self.enqueue(Op::RemoveBuffer { handle, start, end, reply }, cancel);
		rx.await.unwrap_or(Err(Error::Cancelled))
	}

	/// Free a previously declared init segment once its refcount drops to
	/// zero (spec §4.C `free_init_segment`). Synchronous: it only touches
	/// the inventory bookkeeping, not the underlying buffer.
	pub fn free_init_segment(&self, representation: &RepresentationUniqueId) -> bool {
		self.inventory.lock().unwrap().free_init_segment(representation)
	}

	pub fn with_inventory<R>(&self, f: impl FnOnce(&Inventory) -> R) -> R {
		f(&self.inventory.lock().unwrap())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::manifest::{AdaptationId, PeriodId};
	use crate::manifest::segment_index::Segment;
	use crate::types::TrackType;
	use async_trait::async_trait;

	struct FakeDriver;

	#[async_trait]
	impl MediaBufferDriver for FakeDriver {
		async fn create(&self, _track_type: TrackType, _codec_string: &str) -> Result<BufferHandle> {
			Ok(BufferHandle(1))
		}
		async fn append(&self, _handle: BufferHandle, data: Bytes, opts: AppendOptions) -> Result<Vec<BufferedRange>> {
			let offset = opts.time_offset.unwrap_or(0.0);
			Ok(vec![BufferedRange { start: offset, end: offset + data.len() as f64 }])
		}
		async fn remove(&self, _handle: BufferHandle, start: f64, end: f64) -> Result<Vec<BufferedRange>> {
			let _ = (start, end);
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

	fn info(time: f64, end: f64) -> SegmentInfo {
		SegmentInfo {
			period: PeriodId("p".into()),
			adaptation: AdaptationId("a".into()),
			representation: RepresentationUniqueId("r".into()),
			segment: Segment {
				id: "s".into(),
				is_init: false,
				time,
				end,
				duration: end - time,
				timescale: 1,
				url_template: "c-$Number$.m4s".into(),
				byte_range: None,
				private_infos: serde_json::Value::Null,
			},
		}
	}

	#[tokio::test]
	async fn push_segment_records_inventory_entry() {
		let sink = Sink::new(Arc::new(FakeDriver));
		let ranges = sink
			.push_segment(
				info(0.0, 2.0),
				BufferHandle(1),
				Bytes::from_static(&[0u8; 2]),
				AppendOptions { time_offset: Some(0.0), append_window: None },
				CancellationToken::new(),
			)
			.await
			.unwrap();
		assert_eq!(ranges[0].start, 0.0);

		sink.with_inventory(|inv| {
			assert_eq!(inv.entries().len(), 1);
			assert!(inv.entries()[0].buffered_start.is_some());
		});
	}

	#[tokio::test]
	async fn pre_cancelled_operation_never_touches_buffer() {
		let sink = Sink::new(Arc::new(FakeDriver));
		let token = CancellationToken::new();
		token.cancel();
		let result = sink
			.push_segment(
				info(0.0, 2.0),
				BufferHandle(1),
				Bytes::from_static(&[0u8; 2]),
				AppendOptions::default(),
				token,
			)
			.await;
		assert!(matches!(result, Err(Error::Cancelled)));
	}
}
