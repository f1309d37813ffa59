use std::fmt;
use std::time::Duration;

use crate::peer::PeerIdentifier;

/// The error taxonomy this crate surfaces to callers.
///
/// Variants are grouped by the §7 classification: some are always retriable,
/// some are always terminal, and a few (transport/membership errors) are only
/// ever seen bundled inside a [`MultiError`].
#[derive(thiserror::Error, Debug)]
pub enum Error {
	#[error("request timed out")]
	Timeout,

	#[error("remote returned an unexpected error: {0}")]
	RemoteUnexpected(String),

	#[error("invalid argument: {0}")]
	InvalidArgument(String),

	#[error("not found: {0}")]
	NotFound(String),

	#[error("permission denied: {0}")]
	PermissionDenied(String),

	#[error("unauthenticated: {0}")]
	Unauthenticated(String),

	#[error("remote rejected the request as malformed: {0}")]
	RemoteBadRequest(String),

	#[error("failed to reset replayable request body: {0}")]
	ResetFailure(#[source] std::io::Error),

	#[error("replayable reader does not support reset before reaching end of stream")]
	ErrReset,

	#[error("peer list is not running: {cause}")]
	ListNotRunning { cause: Box<Error> },

	#[error("no peer became available before the deadline")]
	Unavailable,

	#[error("choose was called with a context that has no deadline")]
	NoDeadline,

	#[error("peer heap corrupted: entry for {id} has an inconsistent index, this is a bug")]
	HeapCorruption { id: PeerIdentifier },

	#[error("peer {id} is already in the list")]
	PeerAddAlreadyInList { id: PeerIdentifier },

	#[error("peer {id} is not in the list")]
	PeerRemoveNotInList { id: PeerIdentifier },

	#[error("transport failed to retain peer {id}: {source}")]
	TransportRetain {
		id: PeerIdentifier,
		#[source]
		source: Box<dyn std::error::Error + Send + Sync>,
	},

	#[error("transport failed to release peer {id}: {source}")]
	TransportRelease {
		id: PeerIdentifier,
		#[source]
		source: Box<dyn std::error::Error + Send + Sync>,
	},

	#[error("timed out waiting for list to start after {0:?}")]
	StartupTimeout(Duration),

	#[error(transparent)]
	Multi(#[from] MultiError),
}

impl Error {
	/// Classifies an error per §7: true if a retry middleware should attempt
	/// this call again, false if the error is terminal.
	pub fn is_retriable(&self) -> bool {
		matches!(self, Error::Timeout | Error::RemoteUnexpected(_))
	}
}

/// Combines zero or more errors into a single one, per §4.9.
///
/// - Zero inputs (after filtering `None`) yields `None`.
/// - Exactly one input is returned unwrapped, unchanged.
/// - More than one is flattened (nested [`MultiError`]s are inlined one level
///   deep) and wrapped in a `MultiError`.
pub fn combine(errs: impl IntoIterator<Item = Option<Error>>) -> Option<Error> {
	let mut flat = Vec::new();
	for err in errs.into_iter().flatten() {
		match err {
			Error::Multi(multi) => flat.extend(multi.errors),
			other => flat.push(other),
		}
	}
	match flat.len() {
		0 => None,
		1 => flat.pop(),
		_ => Some(Error::Multi(MultiError { errors: flat })),
	}
}

/// An aggregate of independent errors, e.g. from releasing every peer during
/// `stop`, or from a batched `update` that touched several peers.
#[derive(Debug)]
pub struct MultiError {
	errors: Vec<Error>,
}

impl MultiError {
	pub fn errors(&self) -> &[Error] {
		&self.errors
	}
}

impl fmt::Display for MultiError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		writeln!(f, "{} errors occurred:", self.errors.len())?;
		for e in &self.errors {
			write!(f, "\n\t* {e}")?;
		}
		Ok(())
	}
}

impl std::error::Error for MultiError {
	fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
		self.errors.first().map(|e| e as &(dyn std::error::Error + 'static))
	}
}
