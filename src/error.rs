//! Error taxonomy for the streaming orchestrator (spec §7).
//!
//! Errors are deliberately coarse at the public boundary: most failures are
//! handled locally (retried, or demoted to a `warning` event) and only the
//! terminal, unrecoverable cases surface as an [`Error`] to the host.

use std::sync::Arc;

use crate::manifest::RepresentationUniqueId;

/// Media-layer errors that are not network related.
#[derive(Debug, thiserror::Error, Clone)]
pub enum MediaError {
	#[error("starting time not found in manifest")]
	StartingTimeNotFound,

	#[error("no supported and decipherable representation in an audio or video adaptation")]
	IncompatibleCodecs,

	#[error("manifest parse error: {0}")]
	ManifestParse(String),

	#[error("media buffer is full and cannot be recovered by eviction")]
	BufferFullUnrecoverable,
}

/// DRM/EME-adjacent errors (spec §7).
#[derive(Debug, thiserror::Error, Clone)]
pub enum EncryptedMediaError {
	#[error("content is encrypted and no key system is usable")]
	MediaIsEncrypted,

	#[error("a decryption key transitioned to an unusable status")]
	KeyStatusChange,
}

/// Errors surfaced by the host's platform media buffer implementation.
#[derive(Debug, thiserror::Error, Clone)]
pub enum SourceBufferError {
	#[error("append exceeded the buffer's storage quota")]
	QuotaExceeded,

	#[error("platform buffer error: {0}")]
	Other(String),
}

/// Top-level error type returned by the orchestrator's public API.
///
/// [`Error::Cancelled`] is an internal bookkeeping variant: per spec §5/§7 it
/// must never reach the host as a fatal `error` event. Call sites that
/// receive it from a cancellable operation are expected to check
/// [`Error::is_cancelled`] and swallow it rather than propagate it further.
#[derive(Debug, thiserror::Error, Clone)]
pub enum Error {
	#[error("network error after exhausting retries: {0}")]
	Network(Arc<anyhow::Error>),

	/// A 404 (or transport-equivalent "does not exist") response, kept
	/// distinct from [`Error::Network`] so the engine can weigh it against
	/// [`crate::manifest::SegmentIndex::can_be_out_of_sync_error`] before
	/// retrying or avoiding the Representation (spec §4.B, S6).
	#[error("segment not found: {0}")]
	NotFound(Arc<anyhow::Error>),

	#[error(transparent)]
	Media(#[from] MediaError),

	#[error(transparent)]
	EncryptedMedia(#[from] EncryptedMediaError),

	#[error(transparent)]
	SourceBuffer(#[from] SourceBufferError),

	#[error("representation {0} is locked: no eligible representation remains")]
	LockedStream(RepresentationUniqueId),

	#[error("{0}")]
	Other(String),

	#[error("operation was cancelled")]
	Cancelled,
}

impl Error {
	pub fn network(err: impl Into<anyhow::Error>) -> Self {
		Error::Network(Arc::new(err.into()))
	}

	pub fn not_found(err: impl Into<anyhow::Error>) -> Self {
		Error::NotFound(Arc::new(err.into()))
	}

	pub fn other(msg: impl Into<String>) -> Self {
		Error::Other(msg.into())
	}

	/// True for the internal cancellation marker that must never be reported
	/// to the host as a fatal error (spec §5, §7, testable property 5).
	pub fn is_cancelled(&self) -> bool {
		matches!(self, Error::Cancelled)
	}

	/// True for a 404/"not found"-shaped failure, as opposed to a transient
	/// network error (spec §4.B, S6).
	pub fn is_not_found(&self) -> bool {
		matches!(self, Error::NotFound(_))
	}

	/// Whether this error is scoped to a single Representation and should
	/// trigger Adaptation-level fallback rather than a fatal engine error
	/// (spec §7 propagation policy).
	pub fn is_representation_scoped(&self) -> bool {
		matches!(
			self,
			Error::Network(_) | Error::NotFound(_) | Error::LockedStream(_) | Error::EncryptedMedia(_)
		)
	}
}

pub type Result<T> = std::result::Result<T, Error>;
