//! Structured cancellation (spec §4.K, §5).
//!
//! Built on [`tokio_util::sync::CancellationToken`], the idiomatic choice for
//! exactly this shape of "cooperative, tree-structured cancellation" — see
//! the DASH player and HLS coordinator reference implementations in the
//! wider example pack, both of which reach for the same type.

use std::panic::AssertUnwindSafe;
use std::sync::Mutex;

use tokio_util::sync::CancellationToken;

type Cleanup = Box<dyn FnOnce() + Send>;

/// A cancellable unit of work plus its registered teardown callbacks.
///
/// Cancelling a [`TaskCanceller`] fires every callback registered with
/// [`TaskCanceller::register`] exactly once, in LIFO order (spec §4.K). A
/// panicking callback is caught so that it cannot prevent the remaining
/// callbacks from running (spec §4.K).
pub struct TaskCanceller {
	token: CancellationToken,
	cleanups: Mutex<Vec<Cleanup>>,
}

impl TaskCanceller {
	pub fn new() -> Self {
		Self {
			token: CancellationToken::new(),
			cleanups: Mutex::new(Vec::new()),
		}
	}

	/// Create a child canceller: cancelling `self` cancels the child, but not
	/// the reverse (spec: "Linking is one-way (parent cancels child)").
	pub fn child(&self) -> Self {
		Self {
			token: self.token.child_token(),
			cleanups: Mutex::new(Vec::new()),
		}
	}

	/// Link `self` to an external signal: when `signal` is cancelled, `self`
	/// is cancelled too. One-way, as with [`Self::child`], but for a signal
	/// not otherwise related to this canceller's own tree.
	pub fn link_to_signal(self: &std::sync::Arc<Self>, signal: CancellationToken) {
		let this = std::sync::Arc::clone(self);
		tokio::spawn(async move {
			signal.cancelled().await;
			this.cancel();
		});
	}

	/// Register a teardown callback. Callbacks run in LIFO order on
	/// cancellation; if the canceller is already cancelled, the callback
	/// runs immediately.
	pub fn register(&self, cb: impl FnOnce() + Send + 'static) {
		if self.token.is_cancelled() {
			run_cleanup(Box::new(cb));
			return;
		}
		self.cleanups.lock().unwrap().push(Box::new(cb));
	}

	pub fn is_cancelled(&self) -> bool {
		self.token.is_cancelled()
	}

	pub fn signal(&self) -> CancellationToken {
		self.token.clone()
	}

	/// Wait until this canceller is cancelled. A suspension point per §5.
	pub async fn cancelled(&self) {
		self.token.cancelled().await;
	}

	/// Cancel this token and run every registered cleanup exactly once, most
	/// recently registered first.
	pub fn cancel(&self) {
		if self.token.is_cancelled() {
			return;
		}
		self.token.cancel();
		let callbacks = std::mem::take(&mut *self.cleanups.lock().unwrap());
		for cb in callbacks.into_iter().rev() {
			run_cleanup(cb);
		}
	}
}

fn run_cleanup(cb: Cleanup) {
	// A panicking cleanup callback must not stop the rest from running.
	let _ = std::panic::catch_unwind(AssertUnwindSafe(cb));
}

impl Default for TaskCanceller {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::atomic::{AtomicUsize, Ordering};
	use std::sync::Arc;

	#[test]
	fn callbacks_fire_lifo_exactly_once() {
		let canceller = TaskCanceller::new();
		let order = Arc::new(Mutex::new(Vec::new()));

		for i in 0..3 {
			let order = Arc::clone(&order);
			canceller.register(move || order.lock().unwrap().push(i));
		}

		canceller.cancel();
		canceller.cancel(); // idempotent, no double-fire

		assert_eq!(*order.lock().unwrap(), vec![2, 1, 0]);
	}

	#[test]
	fn late_register_after_cancel_runs_immediately() {
		let canceller = TaskCanceller::new();
		canceller.cancel();

		let fired = Arc::new(AtomicUsize::new(0));
		let fired2 = Arc::clone(&fired);
		canceller.register(move || {
			fired2.fetch_add(1, Ordering::SeqCst);
		});

		assert_eq!(fired.load(Ordering::SeqCst), 1);
	}

	#[test]
	fn panicking_callback_does_not_block_others() {
		let canceller = TaskCanceller::new();
		let fired = Arc::new(AtomicUsize::new(0));

		canceller.register(|| panic!("boom"));
		let fired2 = Arc::clone(&fired);
		canceller.register(move || {
			fired2.fetch_add(1, Ordering::SeqCst);
		});

		canceller.cancel();
		assert_eq!(fired.load(Ordering::SeqCst), 1);
	}

	#[test]
	fn child_is_cancelled_when_parent_is() {
		let parent = TaskCanceller::new();
		let child = parent.child();
		assert!(!child.is_cancelled());
		parent.cancel();
		assert!(child.is_cancelled());
	}

	#[tokio::test]
	async fn link_to_signal_propagates_one_way() {
		let external = CancellationToken::new();
		let mine = Arc::new(TaskCanceller::new());
		mine.link_to_signal(external.clone());

		assert!(!mine.is_cancelled());
		external.cancel();
		mine.cancelled().await;
		assert!(mine.is_cancelled());
	}
}
