use crate::dimse::cget::getscu::GetError;
use crate::dimse::cmove::movescu::MoveError;
use crate::dimse::cmove::{CompositeRetrieveResponse, SubOperationCounters};
use crate::dimse::cstore::StoreHandler;
use crate::dimse::StatusType;
use crate::relocate::progress::MoveCounters;
use crate::relocate::query::IdentifierSet;
use crate::relocate::AbortSignal;
use crate::types::{QueryInformationModel, AE, US};
use dicom::object::InMemDicomObject;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

/// A C-MOVE or C-GET for one identifier set.
#[derive(Debug, Clone)]
pub struct RetrieveRequest {
	pub identifier: InMemDicomObject,
	/// Move destination. Ignored by C-GET.
	pub destination: AE,
}

/// Pulls instances from the source archive.
pub trait RetrieveService: Send + Sync {
	/// Yields every response until the final one.
	/// Instances that arrive on the retrieve association itself are passed to `handler`.
	fn retrieve(
		&self,
		request: RetrieveRequest,
		handler: StoreHandler,
	) -> BoxStream<'_, Result<CompositeRetrieveResponse, RetrieveError>>;
}

#[derive(Debug, Error)]
pub enum RetrieveError {
	#[error(transparent)]
	Move(#[from] MoveError),
	#[error(transparent)]
	Get(#[from] GetError),
	#[error("Retrieval ended with status {0:#06x}")]
	Status(US),
	#[error("Retrieval was aborted")]
	Aborted,
}

/// Result of a batch of retrievals. The counters are kept even if the batch failed.
#[derive(Debug, Default)]
pub struct RetrieveOutcome {
	pub counters: SubOperationCounters,
	pub requests: usize,
	pub skipped: usize,
	pub error: Option<RetrieveError>,
}

/// Issues one retrieve request per identifier set and aggregates the sub-operation counters.
pub struct RetrievalCoordinator<'a, R: ?Sized> {
	pub service: &'a R,
	pub model: QueryInformationModel,
	/// The AE that C-MOVE sub-operations are sent to, which is our own receiver.
	pub move_destination: AE,
	pub skip_if_present: bool,
	pub max_responses: Option<usize>,
	pub counters: Arc<MoveCounters>,
}

impl<R: RetrieveService + ?Sized> RetrievalCoordinator<'_, R> {
	/// Whether the set is left out because `destination` already holds it.
	pub fn is_skipped(&self, set: &IdentifierSet, destination: &str) -> bool {
		self.skip_if_present && set.retrieve_aets().iter().any(|aet| aet == destination)
	}

	fn publish(&self, counters: SubOperationCounters) {
		let retrieved = u64::from(counters.completed) + u64::from(counters.warning);
		self.counters.retrieved.store(retrieved, Ordering::Release);
	}

	#[instrument(skip_all, name = "RETRIEVE", fields(destination = destination))]
	pub async fn retrieve(
		&self,
		sets: &[IdentifierSet],
		destination: &str,
		handler: StoreHandler,
		abort: &AbortSignal,
	) -> RetrieveOutcome {
		let mut outcome = RetrieveOutcome::default();

		for set in sets {
			if self.max_responses.is_some_and(|max| outcome.requests >= max) {
				info!(requests = outcome.requests, "Reached response ceiling, skipping remaining identifiers");
				break;
			}
			if self.is_skipped(set, destination) {
				debug!(level = %set.level, "Destination already holds the entity, skipping");
				outcome.skipped += 1;
				MoveCounters::increment(&self.counters.skipped);
				continue;
			}

			outcome.requests += 1;
			let request = RetrieveRequest {
				identifier: set.retrieve_identifier(self.model),
				destination: self.move_destination.clone(),
			};
			let mut responses = self.service.retrieve(request, Arc::clone(&handler));
			let mut latest = SubOperationCounters::default();

			let result = loop {
				let response = tokio::select! {
					biased;
					() = abort.aborted() => break Err(RetrieveError::Aborted),
					response = responses.next() => response,
				};
				let response = match response {
					Some(Ok(response)) => response,
					Some(Err(err)) => break Err(err),
					None => break Ok(()),
				};

				// Some peers omit the counters in the final response.
				if response.counters.total() > 0 {
					latest = response.counters;
				}
				let mut running = outcome.counters;
				running += latest;
				self.publish(running);

				match StatusType::from_code(Some(response.status)) {
					StatusType::Pending => {}
					StatusType::Success => break Ok(()),
					StatusType::Warning => {
						warn!(status = response.status, failed = latest.failed, "Retrieval completed with warnings");
						break Ok(());
					}
					StatusType::Failure | StatusType::Cancel => {
						break Err(RetrieveError::Status(response.status));
					}
				}
			};
			// Dropping the stream closes the association of an aborted retrieval.
			drop(responses);

			latest.remaining = 0;
			outcome.counters += latest;
			self.publish(outcome.counters);

			if let Err(err) = result {
				outcome.error = Some(err);
				break;
			}
		}
		outcome
	}
}
