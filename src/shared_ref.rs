//! Observable shared references (spec §4.K, §9).
//!
//! Modeled exactly as the design notes prescribe: "a value + subscriber set,
//! no hidden back-pressure". A terminal [`SharedRef::finish`] flips the cell
//! read-only and delivers one last notification; callbacks registered after
//! that point fire once, immediately, with the final value (spec §4.K).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;

struct Subscriber<T> {
	id: u64,
	cb: Box<dyn FnMut(T) + Send>,
}

struct Inner<T> {
	value: T,
	finished: bool,
	subscribers: Vec<Subscriber<T>>,
}

/// Options controlling a [`SharedRef`] subscription.
#[derive(Default, Clone)]
pub struct SubscribeOptions {
	/// Call the callback once immediately with the current value.
	pub emit_current: bool,
	/// Unsubscribe automatically when this token is cancelled.
	pub clear_signal: Option<CancellationToken>,
}

/// A value cell with synchronous, FIFO-ordered subscriber notification and an
/// explicit terminal state (spec §3, §4.K).
pub struct SharedRef<T: Clone + Send + 'static> {
	inner: Arc<Mutex<Inner<T>>>,
	next_id: AtomicU64,
}

impl<T: Clone + Send + 'static> SharedRef<T> {
	pub fn new(initial: T) -> Self {
		Self {
			inner: Arc::new(Mutex::new(Inner {
				value: initial,
				finished: false,
				subscribers: Vec::new(),
			})),
			next_id: AtomicU64::new(0),
		}
	}

	pub fn get(&self) -> T {
		self.inner.lock().unwrap().value.clone()
	}

	pub fn is_finished(&self) -> bool {
		self.inner.lock().unwrap().finished
	}

	/// Set a new value and notify every current subscriber, in FIFO
	/// registration order. A no-op once [`Self::finish`] has been called.
	pub fn set(&self, value: T) {
		self.notify(value);
	}

	/// Like [`Self::set`], but the caller supplies an equality check so that
	/// subscribers are only notified when the value actually changed.
	pub fn set_if_changed(&self, value: T, eq: impl Fn(&T, &T) -> bool) {
		let should_skip = {
			let guard = self.inner.lock().unwrap();
			guard.finished || eq(&guard.value, &value)
		};
		if should_skip {
			return;
		}
		self.notify(value);
	}

	/// Flip to the terminal state: this is the last value this ref will ever
	/// hold. Fires one final notification; every later subscription receives
	/// this value immediately and is never called again.
	pub fn finish(&self) {
		let mut guard = self.inner.lock().unwrap();
		if guard.finished {
			return;
		}
		guard.finished = true;
		let value = guard.value.clone();
		let mut subs = std::mem::take(&mut guard.subscribers);
		drop(guard);
		for sub in subs.iter_mut() {
			(sub.cb)(value.clone());
		}
	}

	/// Notify current subscribers in FIFO order. A subscriber registered from
	/// inside another subscriber's callback only observes *future* updates,
	/// never the one currently being dispatched (spec §4.K ordering note).
	fn notify(&self, value: T) {
		let count = {
			let mut guard = self.inner.lock().unwrap();
			if guard.finished {
				return;
			}
			guard.value = value.clone();
			guard.subscribers.len()
		};

		let placeholder = || Subscriber {
			id: u64::MAX,
			cb: Box::new(|_| {}) as Box<dyn FnMut(T) + Send>,
		};

		for i in 0..count {
			let mut sub = {
				let mut guard = self.inner.lock().unwrap();
				if i >= guard.subscribers.len() {
					break;
				}
				std::mem::replace(&mut guard.subscribers[i], placeholder())
			};
			(sub.cb)(value.clone());
			let mut guard = self.inner.lock().unwrap();
			if let Some(slot) = guard.subscribers.get_mut(i) {
				if slot.id == u64::MAX {
					*slot = sub;
				}
			}
		}
	}

	/// Subscribe for updates. If the ref is already finished, `cb` fires
	/// immediately with the final value and is not retained.
	pub fn on_update(&self, mut cb: impl FnMut(T) + Send + 'static, opts: SubscribeOptions) {
		let (current, finished) = {
			let guard = self.inner.lock().unwrap();
			(guard.value.clone(), guard.finished)
		};

		if finished {
			cb(current);
			return;
		}

		if opts.emit_current {
			cb(current);
		}

		let id = self.next_id.fetch_add(1, Ordering::Relaxed);
		self.inner.lock().unwrap().subscribers.push(Subscriber {
			id,
			cb: Box::new(cb),
		});

		if let Some(signal) = opts.clear_signal {
			let inner = Arc::clone(&self.inner);
			tokio::spawn(async move {
				signal.cancelled().await;
				inner.lock().unwrap().subscribers.retain(|s| s.id != id);
			});
		}
	}

	/// Sugar for [`Self::on_update`] with `emit_current: true` and no
	/// automatic unsubscription.
	pub fn listen(&self, cb: impl FnMut(T) + Send + 'static) {
		self.on_update(
			cb,
			SubscribeOptions {
				emit_current: true,
				clear_signal: None,
			},
		);
	}
}
