//! The relocation engine.
//!
//! A relocation resolves a study at the source, retrieves its instances and forwards them to the
//! destination. Three roles run concurrently while the retrieval is in flight:
//! - the receiver accepts instances (STORE-SCP or C-GET sub-operations) and pushes them onto a [`queue::WorkQueue`],
//! - the transformer applies [`transform::TransformRules`] and UID remapping,
//! - the sender stores every instance at the destination and optionally waits for storage commitment.

pub mod dimse;
pub mod orchestrator;
pub mod progress;
pub mod query;
pub mod queue;
pub mod receiver;
pub mod retrieve;
pub mod sender;
pub mod transform;
pub mod uid;

use crate::dimse::commitment::CommitmentFailure;
use crate::dimse::cstore::ReceivedObject;
use crate::types::UI;
use dicom::object::InMemDicomObject;
use std::fmt::Display;
use std::sync::{Arc, OnceLock};
use tokio::sync::watch;
use tracing::{debug, error};

/// One instance travelling from the receiver through the transformer to the sender.
#[derive(Debug, Clone)]
pub struct MovedObject {
	pub data: InMemDicomObject,
	pub transfer_syntax: UI,
	pub sop_class_uid: UI,
	pub sop_instance_uid: UI,
	/// Set by the transformer if the instance was remapped.
	pub new_sop_instance_uid: Option<UI>,
	/// Set by the sender if the destination refused to commit the instance.
	pub commitment_failure: Option<CommitmentFailure>,
}

impl MovedObject {
	/// The SOP instance UID under which the instance is stored at the destination.
	pub fn stored_sop_instance_uid(&self) -> &str {
		self.new_sop_instance_uid
			.as_deref()
			.unwrap_or(&self.sop_instance_uid)
	}
}

impl From<ReceivedObject> for MovedObject {
	fn from(object: ReceivedObject) -> Self {
		Self {
			data: object.data,
			transfer_syntax: object.transfer_syntax,
			sop_class_uid: object.sop_class_uid,
			sop_instance_uid: object.sop_instance_uid,
			new_sop_instance_uid: None,
			commitment_failure: None,
		}
	}
}

/// Cancels a relocation. Every long running await of a session selects on it.
#[derive(Debug, Clone)]
pub struct AbortSignal {
	sender: Arc<watch::Sender<bool>>,
}

impl Default for AbortSignal {
	fn default() -> Self {
		Self::new()
	}
}

impl AbortSignal {
	pub fn new() -> Self {
		let (sender, _) = watch::channel(false);
		Self {
			sender: Arc::new(sender),
		}
	}

	pub fn abort(&self) {
		self.sender.send_replace(true);
	}

	pub fn is_aborted(&self) -> bool {
		*self.sender.borrow()
	}

	/// Completes once [`AbortSignal::abort`] was called.
	pub async fn aborted(&self) {
		let mut receiver = self.sender.subscribe();
		// The sender lives in self, so waiting cannot fail.
		let _ = receiver.wait_for(|aborted| *aborted).await;
	}
}

/// Keeps the first fault raised by any role and aborts the session.
#[derive(Debug, Clone)]
pub struct FaultLatch {
	error: Arc<OnceLock<String>>,
	abort: AbortSignal,
}

impl FaultLatch {
	pub fn new(abort: AbortSignal) -> Self {
		Self {
			error: Arc::new(OnceLock::new()),
			abort,
		}
	}

	/// Returns true if this was the first fault of the session.
	pub fn latch(&self, fault: impl Display) -> bool {
		let message = fault.to_string();
		let first = self.error.set(message.clone()).is_ok();
		if first {
			error!("{message}");
		} else {
			debug!("Suppressed subsequent fault: {message}");
		}
		self.abort.abort();
		first
	}

	pub fn error(&self) -> Option<&str> {
		self.error.get().map(String::as_str)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::time::Duration;

	#[tokio::test]
	async fn abort_wakes_waiters() {
		let signal = AbortSignal::new();
		let waiter = {
			let signal = signal.clone();
			tokio::spawn(async move { signal.aborted().await })
		};
		assert!(!signal.is_aborted());
		signal.abort();
		tokio::time::timeout(Duration::from_secs(1), waiter)
			.await
			.unwrap()
			.unwrap();
		assert!(signal.is_aborted());

		// Waiting after the fact returns immediately.
		tokio::time::timeout(Duration::from_secs(1), signal.aborted())
			.await
			.unwrap();
	}

	#[tokio::test]
	async fn first_fault_wins() {
		let signal = AbortSignal::new();
		let latch = FaultLatch::new(signal.clone());

		let handles: Vec<_> = (0..4)
			.map(|role| {
				let latch = latch.clone();
				tokio::spawn(async move { latch.latch(format!("fault from role {role}")) })
			})
			.collect();
		let mut firsts = 0;
		for handle in handles {
			if handle.await.unwrap() {
				firsts += 1;
			}
		}

		assert_eq!(firsts, 1);
		assert!(latch.error().unwrap().starts_with("fault from role"));
		assert!(signal.is_aborted());
	}
}
