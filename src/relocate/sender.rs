use crate::dimse::association::AssociationError;
use crate::dimse::cecho::EchoError;
use crate::dimse::commitment::commitmentscu::CommitmentError;
use crate::dimse::commitment::CommitmentFailure;
use crate::dimse::cstore::storescu::StoreError;
use crate::dimse::StatusType;
use crate::relocate::progress::MoveCounters;
use crate::relocate::{AbortSignal, FaultLatch, MovedObject};
use crate::types::{UI, US};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum CommitmentOutcome {
	Committed,
	Failed(CommitmentFailure),
}

/// Stores instances at the destination archive.
#[async_trait]
pub trait StorageService: Send {
	/// Verifies that the destination is reachable before any instance is retrieved.
	async fn prepare(&mut self) -> Result<(), SenderError>;

	/// Returns the status of the C-STORE-RSP.
	async fn store(&mut self, object: &MovedObject) -> Result<US, SenderError>;

	/// Waits until the destination either committed the instance or reported a failure for it.
	async fn commit(&mut self, object: &MovedObject) -> Result<CommitmentOutcome, SenderError>;

	/// Releases all open associations.
	async fn release(&mut self);
}

#[derive(Debug, Error)]
pub enum SenderError {
	#[error("Destination {aet} did not answer the C-ECHO")]
	Unreachable { aet: String },
	#[error(transparent)]
	Echo(#[from] EchoError),
	#[error(transparent)]
	Association(#[from] AssociationError),
	#[error(transparent)]
	Store(#[from] StoreError),
	#[error(transparent)]
	Commitment(#[from] CommitmentError),
	#[error("The destination does not accept transfer syntax {0}")]
	UnsupportedTransferSyntax(UI),
	#[error("The destination rejected instance {sop_instance_uid} with status {status:#06x}")]
	Rejected { sop_instance_uid: UI, status: US },
}

/// The sender role. Stores every transformed instance and optionally requests storage commitment.
pub struct SenderStage<S> {
	pub service: S,
	pub input: mpsc::UnboundedReceiver<MovedObject>,
	pub commitment: bool,
	pub counters: Arc<MoveCounters>,
	pub faults: FaultLatch,
	pub abort: AbortSignal,
}

impl<S: StorageService> SenderStage<S> {
	async fn send(&mut self, mut object: MovedObject) -> Result<(), SenderError> {
		let status = self.service.store(&object).await?;
		match StatusType::from_code(Some(status)) {
			StatusType::Success => {}
			StatusType::Warning => {
				warn!(sop_instance_uid = object.stored_sop_instance_uid(), status, "Instance stored with warning");
			}
			_ => {
				return Err(SenderError::Rejected {
					sop_instance_uid: UI::from(object.stored_sop_instance_uid()),
					status,
				});
			}
		}
		MoveCounters::increment(&self.counters.sent);

		if !self.commitment {
			MoveCounters::increment(&self.counters.moved);
			return Ok(());
		}

		match self.service.commit(&object).await? {
			CommitmentOutcome::Committed => {
				debug!(sop_instance_uid = object.stored_sop_instance_uid(), "Instance committed");
				MoveCounters::increment(&self.counters.moved);
			}
			CommitmentOutcome::Failed(failure) => {
				warn!(
					sop_instance_uid = object.stored_sop_instance_uid(),
					failure_reason = failure.failure_reason,
					"Destination refused to commit instance"
				);
				object.commitment_failure = Some(failure);
				MoveCounters::increment(&self.counters.commit_failures);
			}
		}
		Ok(())
	}

	/// Runs until the transformer closed the channel, the session was aborted or a store failed.
	#[instrument(skip_all, name = "SENDER")]
	pub async fn run(mut self) {
		let abort = self.abort.clone();
		loop {
			let object = tokio::select! {
				biased;
				() = abort.aborted() => {
					debug!("Relocation aborted, discarding remaining instances");
					break;
				}
				object = self.input.recv() => object,
			};
			let Some(object) = object else {
				break;
			};
			if let Err(err) = self.send(object).await {
				self.faults.latch(err);
				break;
			}
		}

		self.service.release().await;
		info!(sent = self.counters.snapshot().sent, "Sender stopped");
	}
}

#[cfg(test)]
pub(crate) mod tests {
	use super::*;
	use crate::dimse::commitment::SopReference;
	use crate::relocate::queue::tests::moved_object;
	use std::collections::{HashMap, HashSet};
	use std::sync::Mutex;
	use std::time::Duration;

	/// Records stored instances. Statuses and commitment failures are configured per SOP instance UID.
	#[derive(Default, Clone)]
	pub(crate) struct FakeStorageService {
		pub statuses: HashMap<String, US>,
		pub uncommitted: HashSet<String>,
		pub unreachable: bool,
		/// Time every C-STORE takes.
		pub delay: Duration,
		pub stored: Arc<Mutex<Vec<MovedObject>>>,
		pub released: Arc<Mutex<bool>>,
	}

	#[async_trait]
	impl StorageService for FakeStorageService {
		async fn prepare(&mut self) -> Result<(), SenderError> {
			if self.unreachable {
				return Err(SenderError::Unreachable {
					aet: String::from("DEST"),
				});
			}
			Ok(())
		}

		async fn store(&mut self, object: &MovedObject) -> Result<US, SenderError> {
			if !self.delay.is_zero() {
				tokio::time::sleep(self.delay).await;
			}
			let status = self
				.statuses
				.get(&object.sop_instance_uid)
				.copied()
				.unwrap_or(0);
			if status == 0 {
				self.stored.lock().unwrap().push(object.clone());
			}
			Ok(status)
		}

		async fn commit(&mut self, object: &MovedObject) -> Result<CommitmentOutcome, SenderError> {
			if self.uncommitted.contains(&object.sop_instance_uid) {
				return Ok(CommitmentOutcome::Failed(CommitmentFailure {
					reference: SopReference {
						sop_class_uid: object.sop_class_uid.clone(),
						sop_instance_uid: UI::from(object.stored_sop_instance_uid()),
					},
					failure_reason: Some(0x0110),
				}));
			}
			Ok(CommitmentOutcome::Committed)
		}

		async fn release(&mut self) {
			*self.released.lock().unwrap() = true;
		}
	}

	fn stage(service: FakeStorageService, commitment: bool) -> (SenderStage<FakeStorageService>, mpsc::UnboundedSender<MovedObject>) {
		let (output, input) = mpsc::unbounded_channel();
		let abort = AbortSignal::new();
		let stage = SenderStage {
			service,
			input,
			commitment,
			counters: Arc::new(MoveCounters::default()),
			faults: FaultLatch::new(abort.clone()),
			abort,
		};
		(stage, output)
	}

	#[tokio::test]
	async fn sends_until_channel_closes() {
		let service = FakeStorageService::default();
		let stored = Arc::clone(&service.stored);
		let released = Arc::clone(&service.released);
		let (stage, output) = stage(service, false);
		let counters = Arc::clone(&stage.counters);

		output.send(moved_object("1.1", "1.1.1", "1.1.1.1")).unwrap();
		output.send(moved_object("1.1", "1.1.1", "1.1.1.2")).unwrap();
		drop(output);
		stage.run().await;

		let snapshot = counters.snapshot();
		assert_eq!(snapshot.sent, 2);
		assert_eq!(snapshot.moved, 2);
		assert_eq!(stored.lock().unwrap().len(), 2);
		assert!(*released.lock().unwrap());
	}

	#[tokio::test]
	async fn rejected_store_is_latched() {
		let mut service = FakeStorageService::default();
		service.statuses.insert(String::from("1.1.1.1"), 0xA700);
		let (stage, output) = stage(service, false);
		let counters = Arc::clone(&stage.counters);
		let faults = stage.faults.clone();
		let abort = stage.abort.clone();

		output.send(moved_object("1.1", "1.1.1", "1.1.1.1")).unwrap();
		output.send(moved_object("1.1", "1.1.1", "1.1.1.2")).unwrap();
		stage.run().await;

		assert!(faults.error().unwrap().contains("0xa700"));
		assert!(abort.is_aborted());
		assert_eq!(counters.snapshot().sent, 0);
	}

	#[tokio::test]
	async fn warning_status_counts_as_sent() {
		let mut service = FakeStorageService::default();
		service.statuses.insert(String::from("1.1.1.1"), 0xB000);
		let (stage, output) = stage(service, false);
		let counters = Arc::clone(&stage.counters);

		output.send(moved_object("1.1", "1.1.1", "1.1.1.1")).unwrap();
		drop(output);
		stage.run().await;

		assert_eq!(counters.snapshot().sent, 1);
		assert_eq!(counters.snapshot().moved, 1);
	}

	#[tokio::test]
	async fn commitment_failures_are_not_fatal() {
		let mut service = FakeStorageService::default();
		service.uncommitted.insert(String::from("1.1.1.2"));
		let (stage, output) = stage(service, true);
		let counters = Arc::clone(&stage.counters);
		let faults = stage.faults.clone();

		for instance in ["1.1.1.1", "1.1.1.2", "1.1.1.3"] {
			output.send(moved_object("1.1", "1.1.1", instance)).unwrap();
		}
		drop(output);
		stage.run().await;

		let snapshot = counters.snapshot();
		assert_eq!(snapshot.sent, 3);
		assert_eq!(snapshot.moved, 2);
		assert_eq!(snapshot.commit_failures, 1);
		assert!(faults.error().is_none());
	}

	#[tokio::test]
	async fn abort_stops_sending() {
		let service = FakeStorageService::default();
		let stored = Arc::clone(&service.stored);
		let (stage, output) = stage(service, false);
		stage.abort.abort();

		output.send(moved_object("1.1", "1.1.1", "1.1.1.1")).unwrap();
		stage.run().await;

		assert!(stored.lock().unwrap().is_empty());
		drop(output);
	}
}
