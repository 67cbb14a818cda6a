use crate::config::{AppConfig, DimseServerConfig};
use crate::dimse::cmove::SubOperationCounters;
use crate::dimse::cstore::StoreHandler;
use crate::relocate::progress::{MoveCounters, MoveCountersSnapshot, ProgressSink};
use crate::relocate::query::{FindService, HierarchicalQueryResolver, IdentifierSet, QueryError};
use crate::relocate::queue::{WorkItem, WorkQueue};
use crate::relocate::receiver::{ReceiveError, Receiver};
use crate::relocate::retrieve::{RetrievalCoordinator, RetrieveError, RetrieveService};
use crate::relocate::sender::{SenderError, SenderStage, StorageService};
use crate::relocate::transform::{TransformRules, TransformStage};
use crate::relocate::uid::{UidMappingDocument, UidRemapper};
use crate::relocate::{AbortSignal, FaultLatch};
use crate::types::{QueryInformationModel, QueryRetrieveLevel, RetrieveMethod, AE, UI};
use dicom::core::VR;
use dicom::dictionary_std::tags;
use dicom::object::InMemDicomObject;
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveState {
	Idle,
	Starting,
	Moving,
	Aborting,
	Draining,
	Completed,
}

/// Relocates one study from `source` to `destination`.
/// With rules, every instance is modified and receives new UIDs.
#[derive(Debug, Clone)]
pub struct StudyMoveRequest {
	pub study_instance_uid: UI,
	pub source: AE,
	pub destination: AE,
	pub rules: Option<TransformRules>,
}

#[derive(Debug, Error)]
#[error("Application entity {0} is not configured")]
pub struct UnknownAet(pub AE);

#[derive(Debug, Error)]
#[error("Another relocation is in progress")]
pub struct OrchestratorBusy;

#[derive(Debug, Error)]
pub enum RelocationError {
	#[error(transparent)]
	UnknownAet(#[from] UnknownAet),
	#[error(transparent)]
	Receive(#[from] ReceiveError),
	#[error(transparent)]
	Sender(#[from] SenderError),
	#[error(transparent)]
	Query(#[from] QueryError),
	#[error(transparent)]
	Retrieve(#[from] RetrieveError),
	#[error("No instances found for study {0}")]
	NoInstances(UI),
	#[error("The relocation was cancelled")]
	Cancelled,
	#[error("The {0} terminated unexpectedly")]
	RoleFailed(&'static str),
	#[error("{0} sub-operations of the retrieval failed")]
	FailedSubOperations(u32),
	#[error("Only {moved} of {received} received instances were moved")]
	Incomplete { received: u64, moved: u64 },
}

/// Creates the services that talk to the source and destination archives.
pub trait ServiceProvider: Send + Sync {
	type Find: FindService;
	type Retrieve: RetrieveService;
	type Storage: StorageService + 'static;

	fn find_service(&self, source: &str) -> Result<Self::Find, UnknownAet>;

	fn retrieve_service(&self, source: &str) -> Result<Self::Retrieve, UnknownAet>;

	fn storage_service(&self, destination: &str) -> Result<Self::Storage, UnknownAet>;
}

#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
	pub method: RetrieveMethod,
	pub retrieve_level: QueryRetrieveLevel,
	pub storage_commitment: bool,
	pub skip_if_present: bool,
	pub max_responses: Option<usize>,
	pub progress_interval: Duration,
	/// The receiver for C-MOVE sub-operations. Its AET is the move destination.
	pub server: DimseServerConfig,
}

impl From<&AppConfig> for OrchestratorOptions {
	fn from(config: &AppConfig) -> Self {
		let relocation = &config.relocation;
		Self {
			method: relocation.method,
			retrieve_level: relocation.retrieve_level,
			storage_commitment: relocation.storage_commitment,
			skip_if_present: relocation.skip_if_present,
			max_responses: (relocation.max_responses > 0).then_some(relocation.max_responses),
			progress_interval: Duration::from_millis(relocation.progress_interval.max(1)),
			server: config.server.clone(),
		}
	}
}

#[derive(Debug, Clone, Serialize)]
pub struct MoveResult {
	pub study_instance_uid: UI,
	pub source: AE,
	pub destination: AE,
	pub counters: MoveCountersSnapshot,
	pub success: bool,
	pub error: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub uid_mapping: Option<UidMappingDocument>,
	pub retrieve: SubOperationCounters,
}

/// The state shared by the roles of one relocation.
struct Session {
	abort: AbortSignal,
	faults: FaultLatch,
	counters: Arc<MoveCounters>,
	queue: Arc<WorkQueue>,
	remapper: Arc<UidRemapper>,
}

impl Session {
	fn new() -> Self {
		let abort = AbortSignal::new();
		Self {
			faults: FaultLatch::new(abort.clone()),
			abort,
			counters: Arc::new(MoveCounters::default()),
			queue: Arc::new(WorkQueue::new()),
			remapper: Arc::new(UidRemapper::new()),
		}
	}
}

/// Marks the orchestrator as idle again once the relocation is over, even if it was dropped midway.
struct ActiveRelocation<'a, P> {
	orchestrator: &'a MoveOrchestrator<P>,
}

impl<P> Drop for ActiveRelocation<'_, P> {
	fn drop(&mut self) {
		self.orchestrator.transition(MoveState::Completed);
		*self
			.orchestrator
			.abort
			.lock()
			.unwrap_or_else(PoisonError::into_inner) = None;
	}
}

/// Runs one relocation at a time.
pub struct MoveOrchestrator<P> {
	provider: P,
	options: OrchestratorOptions,
	sink: Arc<dyn ProgressSink>,
	state: Mutex<MoveState>,
	abort: Mutex<Option<AbortSignal>>,
}

impl<P> MoveOrchestrator<P> {
	pub fn new(provider: P, options: OrchestratorOptions, sink: Arc<dyn ProgressSink>) -> Self {
		Self {
			provider,
			options,
			sink,
			state: Mutex::new(MoveState::Idle),
			abort: Mutex::new(None),
		}
	}

	pub fn state(&self) -> MoveState {
		*self.state.lock().unwrap_or_else(PoisonError::into_inner)
	}

	/// Aborts the running relocation. Returns false if none is running.
	pub fn abort(&self) -> bool {
		let abort = self.abort.lock().unwrap_or_else(PoisonError::into_inner);
		abort.as_ref().map(AbortSignal::abort).is_some()
	}

	fn transition(&self, next: MoveState) {
		let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
		debug!(from = ?*state, to = ?next, "State transition");
		*state = next;
	}

	fn begin(&self, abort: &AbortSignal) -> Result<ActiveRelocation<'_, P>, OrchestratorBusy> {
		let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
		if !matches!(*state, MoveState::Idle | MoveState::Completed) {
			return Err(OrchestratorBusy);
		}
		*state = MoveState::Starting;
		*self.abort.lock().unwrap_or_else(PoisonError::into_inner) = Some(abort.clone());
		Ok(ActiveRelocation { orchestrator: self })
	}
}

impl<P: ServiceProvider> MoveOrchestrator<P> {
	/// Relocates a study. Every failure except re-entrancy is reported through the [`MoveResult`].
	#[instrument(skip_all, name = "RELOCATE", fields(study_instance_uid = %request.study_instance_uid))]
	pub async fn relocate(&self, request: StudyMoveRequest) -> Result<MoveResult, OrchestratorBusy> {
		let session = Session::new();
		let active = self.begin(&session.abort)?;
		info!(source = request.source, destination = request.destination, "Starting relocation");

		let mut retrieve = SubOperationCounters::default();
		let error = self.execute(&session, &request, &mut retrieve).await.err();

		let result = Self::complete(&session, &request, retrieve, error);
		drop(active);
		self.sink.finalize(&result);
		Ok(result)
	}

	async fn execute(
		&self,
		session: &Session,
		request: &StudyMoveRequest,
		retrieve: &mut SubOperationCounters,
	) -> Result<(), RelocationError> {
		let find = self.provider.find_service(&request.source)?;
		let retrieval = self.provider.retrieve_service(&request.source)?;
		let mut storage = self.provider.storage_service(&request.destination)?;

		let receiver = Receiver {
			queue: Arc::clone(&session.queue),
			counters: Arc::clone(&session.counters),
			abort: session.abort.clone(),
			study_instance_uid: request.study_instance_uid.clone(),
		};
		let listener = match self.options.method {
			RetrieveMethod::Move => Some(receiver.listen(&self.options.server).await?),
			RetrieveMethod::Get => None,
		};
		if let Err(err) = storage.prepare().await {
			if let Some(listener) = listener {
				listener.stop().await;
			}
			return Err(err.into());
		}

		let (output, input) = mpsc::unbounded_channel();
		let transformer = tokio::spawn(
			TransformStage {
				queue: Arc::clone(&session.queue),
				rules: request.rules.clone().map(Arc::new),
				remapper: Arc::clone(&session.remapper),
				counters: Arc::clone(&session.counters),
				output,
				faults: session.faults.clone(),
				abort: session.abort.clone(),
			}
			.run(),
		);
		let sender = tokio::spawn(
			SenderStage {
				service: storage,
				input,
				commitment: self.options.storage_commitment,
				counters: Arc::clone(&session.counters),
				faults: session.faults.clone(),
				abort: session.abort.clone(),
			}
			.run(),
		);

		self.transition(MoveState::Moving);
		let moving = self
			.move_study(session, request, &find, &retrieval, receiver.handler(), retrieve)
			.await;
		if session.abort.is_aborted() {
			self.transition(MoveState::Aborting);
		}

		// Each role only stops after everything upstream of it has finished.
		self.transition(MoveState::Draining);
		if let Some(listener) = listener {
			listener.stop().await;
		}
		session.queue.push(WorkItem::Stop);
		let (transformed, sent) = self
			.supervise(session, async { (transformer.await, sender.await) })
			.await;
		if transformed.is_err() {
			session.faults.latch(RelocationError::RoleFailed("transformer"));
		}
		if sent.is_err() {
			session.faults.latch(RelocationError::RoleFailed("sender"));
		}
		Self::reconcile_found(session, retrieve);
		moving
	}

	/// Drives `future` while the progress sink is updated and polled for cancellation.
	async fn supervise<F: Future>(&self, session: &Session, future: F) -> F::Output {
		tokio::pin!(future);
		let mut ticks = tokio::time::interval(self.options.progress_interval);
		loop {
			tokio::select! {
				output = &mut future => return output,
				_ = ticks.tick() => {
					self.sink.update(&session.counters.snapshot());
					if self.sink.is_cancel_requested() && !session.abort.is_aborted() {
						session.faults.latch(RelocationError::Cancelled);
					}
				}
			}
		}
	}

	/// The count announced by the source can be stale. Whatever was actually retrieved is a lower bound.
	fn reconcile_found(session: &Session, retrieve: &SubOperationCounters) {
		let retrieved = u64::from(retrieve.completed + retrieve.warning + retrieve.failed);
		let arrived = session.counters.received.load(Ordering::Acquire).max(retrieved);
		let announced = session.counters.found.fetch_max(arrived, Ordering::AcqRel);
		if announced < arrived {
			warn!(announced, arrived, "The source announced fewer instances than it delivered");
		}
	}

	async fn move_study(
		&self,
		session: &Session,
		request: &StudyMoveRequest,
		find: &P::Find,
		retrieval: &P::Retrieve,
		handler: StoreHandler,
		retrieve: &mut SubOperationCounters,
	) -> Result<(), RelocationError> {
		let mut keys = InMemDicomObject::new_empty();
		keys.put_str(tags::STUDY_INSTANCE_UID, VR::UI, request.study_instance_uid.clone());

		let resolver = HierarchicalQueryResolver::new(find, self.options.max_responses);
		let sets = resolver
			.resolve(&keys, self.options.retrieve_level, &session.abort)
			.await?;
		if sets.is_empty() {
			return Err(RelocationError::NoInstances(request.study_instance_uid.clone()));
		}

		let coordinator = RetrievalCoordinator {
			service: retrieval,
			model: QueryInformationModel::Study,
			move_destination: self.options.server.aet.clone(),
			skip_if_present: self.options.skip_if_present,
			max_responses: self.options.max_responses,
			counters: Arc::clone(&session.counters),
		};

		let announced: Option<u64> = sets
			.iter()
			.filter(|set| !coordinator.is_skipped(set, &request.destination))
			.take(self.options.max_responses.unwrap_or(usize::MAX))
			.map(IdentifierSet::related_instances)
			.sum();
		if let Some(found) = announced {
			session.counters.found.store(found, Ordering::Release);
		}
		info!(sets = sets.len(), found = announced, "Resolved study");

		let outcome = self
			.supervise(
				session,
				coordinator.retrieve(&sets, &request.destination, handler, &session.abort),
			)
			.await;

		*retrieve = outcome.counters;
		if announced.is_none() {
			let total = outcome.counters.completed + outcome.counters.failed + outcome.counters.warning;
			session.counters.found.store(u64::from(total), Ordering::Release);
		}
		info!(
			requests = outcome.requests,
			skipped = outcome.skipped,
			completed = outcome.counters.completed,
			failed = outcome.counters.failed,
			"Retrieval finished"
		);

		match outcome.error {
			Some(err) => Err(err.into()),
			None => Ok(()),
		}
	}

	/// Builds the result after every role has been joined.
	fn complete(
		session: &Session,
		request: &StudyMoveRequest,
		retrieve: SubOperationCounters,
		error: Option<RelocationError>,
	) -> MoveResult {
		let counters = session.counters.snapshot();

		// A latched fault is the cause of any error the retrieval reported afterwards.
		let error = session
			.faults
			.error()
			.map(str::to_owned)
			.or_else(|| error.map(|err| err.to_string()))
			.or_else(|| {
				(retrieve.failed > 0)
					.then(|| RelocationError::FailedSubOperations(retrieve.failed).to_string())
			})
			.or_else(|| {
				(counters.moved != counters.received).then(|| {
					RelocationError::Incomplete {
						received: counters.received,
						moved: counters.moved,
					}
					.to_string()
				})
			});
		if let Some(error) = &error {
			warn!("Relocation failed: {error}");
		}
		let uid_mapping = request.rules.is_some().then(|| session.remapper.document());
		if let Some(mapping) = &uid_mapping {
			debug!(instances = mapping.instance_count(), "Collected UID mapping");
		}

		MoveResult {
			study_instance_uid: request.study_instance_uid.clone(),
			source: request.source.clone(),
			destination: request.destination.clone(),
			counters,
			success: error.is_none(),
			error,
			uid_mapping,
			retrieve,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::dimse::cmove::CompositeRetrieveResponse;
	use crate::dimse::cstore::ReceivedObject;
	use crate::relocate::query::tests::{entity, FakeFindService};
	use crate::relocate::query::FindRequest;
	use crate::relocate::queue::tests::moved_object;
	use crate::relocate::retrieve::tests::{response, FakeRetrieveService};
	use crate::relocate::retrieve::RetrieveRequest;
	use crate::relocate::sender::tests::FakeStorageService;
	use crate::dimse::cfind::findscu::FindError;
	use futures::stream::BoxStream;
	use std::net::{IpAddr, Ipv4Addr};
	use std::sync::atomic::{AtomicBool, AtomicUsize};

	struct SharedFind(Arc<FakeFindService>);

	impl FindService for SharedFind {
		fn relational(&self) -> bool {
			self.0.relational()
		}

		fn find(&self, request: FindRequest) -> BoxStream<'_, Result<InMemDicomObject, FindError>> {
			self.0.find(request)
		}
	}

	struct SharedRetrieve(Arc<FakeRetrieveService>);

	impl RetrieveService for SharedRetrieve {
		fn retrieve(
			&self,
			request: RetrieveRequest,
			handler: StoreHandler,
		) -> BoxStream<'_, Result<CompositeRetrieveResponse, RetrieveError>> {
			self.0.retrieve(request, handler)
		}
	}

	struct FakeProvider {
		find: Arc<FakeFindService>,
		retrieve: Arc<FakeRetrieveService>,
		storage: FakeStorageService,
	}

	impl ServiceProvider for FakeProvider {
		type Find = SharedFind;
		type Retrieve = SharedRetrieve;
		type Storage = FakeStorageService;

		fn find_service(&self, source: &str) -> Result<Self::Find, UnknownAet> {
			if source != "SOURCE" {
				return Err(UnknownAet(AE::from(source)));
			}
			Ok(SharedFind(Arc::clone(&self.find)))
		}

		fn retrieve_service(&self, _: &str) -> Result<Self::Retrieve, UnknownAet> {
			Ok(SharedRetrieve(Arc::clone(&self.retrieve)))
		}

		fn storage_service(&self, _: &str) -> Result<Self::Storage, UnknownAet> {
			Ok(self.storage.clone())
		}
	}

	/// Counts finalize calls. Requests cancellation right away or once enough instances were sent.
	#[derive(Default)]
	struct RecordingSink {
		cancel: AtomicBool,
		cancel_after_sent: Option<u64>,
		finalized: AtomicUsize,
		last: Mutex<Option<MoveResult>>,
	}

	impl ProgressSink for RecordingSink {
		fn update(&self, counters: &MoveCountersSnapshot) {
			if self.cancel_after_sent.is_some_and(|sent| counters.sent >= sent) {
				self.cancel.store(true, Ordering::SeqCst);
			}
		}

		fn is_cancel_requested(&self) -> bool {
			self.cancel.load(Ordering::SeqCst)
		}

		fn finalize(&self, result: &MoveResult) {
			self.finalized.fetch_add(1, Ordering::SeqCst);
			*self.last.lock().unwrap() = Some(result.clone());
		}
	}

	fn options(method: RetrieveMethod) -> OrchestratorOptions {
		OrchestratorOptions {
			method,
			retrieve_level: QueryRetrieveLevel::Study,
			storage_commitment: false,
			skip_if_present: false,
			max_responses: None,
			progress_interval: Duration::from_millis(10),
			server: DimseServerConfig {
				aet: AE::from("RELOCATE"),
				interface: IpAddr::V4(Ipv4Addr::LOCALHOST),
				port: 0,
				uncompressed: false,
				release_timeout: 100,
			},
		}
	}

	fn received(series: &str, instance: &str) -> ReceivedObject {
		let object = moved_object("S1", series, instance);
		ReceivedObject {
			message_id: 1,
			sop_class_uid: object.sop_class_uid,
			sop_instance_uid: object.sop_instance_uid,
			transfer_syntax: object.transfer_syntax,
			calling_aet: AE::from("SOURCE"),
			data: object.data,
		}
	}

	fn study(related_instances: &str) -> FakeFindService {
		let mut find = FakeFindService::default();
		find.add(
			QueryRetrieveLevel::Study,
			None,
			entity(&[
				(tags::STUDY_INSTANCE_UID, VR::UI, "S1"),
				(tags::NUMBER_OF_STUDY_RELATED_INSTANCES, VR::IS, related_instances),
			]),
		);
		find
	}

	/// Study S1 with the series SE1 (instance I1) and SE2 (instance I2).
	fn provider() -> FakeProvider {
		let find = study("2");
		let mut retrieve = FakeRetrieveService::default();
		retrieve
			.instances
			.insert(String::from("S1"), vec![received("SE1", "I1"), received("SE2", "I2")]);
		retrieve.responses.insert(
			String::from("S1"),
			vec![response(0xFF00, 1, 0, 1), response(0x0000, 2, 0, 0)],
		);
		FakeProvider {
			find: Arc::new(find),
			retrieve: Arc::new(retrieve),
			storage: FakeStorageService::default(),
		}
	}

	fn anonymize() -> StudyMoveRequest {
		StudyMoveRequest {
			study_instance_uid: UI::from("S1"),
			source: AE::from("SOURCE"),
			destination: AE::from("DEST"),
			rules: Some(TransformRules {
				overrides: Vec::new(),
				removals: vec![tags::PATIENT_NAME],
			}),
		}
	}

	fn orchestrator(provider: FakeProvider, sink: Arc<RecordingSink>) -> MoveOrchestrator<FakeProvider> {
		MoveOrchestrator::new(provider, options(RetrieveMethod::Get), sink)
	}

	#[tokio::test]
	async fn relocates_and_anonymizes_study() {
		let provider = provider();
		let stored = Arc::clone(&provider.storage.stored);
		let sink = Arc::new(RecordingSink::default());
		let orchestrator = orchestrator(provider, Arc::clone(&sink));

		let result = orchestrator.relocate(anonymize()).await.unwrap();

		assert!(result.success, "{:?}", result.error);
		assert!(result.error.is_none());
		let counters = result.counters;
		assert_eq!(counters.found, 2);
		assert_eq!(counters.received, 2);
		assert_eq!(counters.transformed, 2);
		assert_eq!(counters.sent, 2);
		assert_eq!(counters.moved, 2);
		assert_eq!(result.retrieve.completed, 2);

		let mapping = result.uid_mapping.unwrap();
		assert_eq!(mapping.studies.len(), 1);
		assert_eq!(mapping.studies[0].uids.old_uid, "S1");
		assert_eq!(mapping.studies[0].series.len(), 2);
		assert_eq!(mapping.instance_count(), 2);

		let stored = stored.lock().unwrap();
		assert_eq!(stored.len(), 2);
		for object in stored.iter() {
			assert!(object.data.get(tags::PATIENT_NAME).is_none());
			let study = object.data.get(tags::STUDY_INSTANCE_UID).unwrap().to_str().unwrap();
			assert_eq!(study, mapping.studies[0].uids.new_uid.as_str());
		}

		assert_eq!(sink.finalized.load(Ordering::SeqCst), 1);
		assert_eq!(orchestrator.state(), MoveState::Completed);
	}

	#[tokio::test]
	async fn relocates_over_move_receiver() {
		let sink = Arc::new(RecordingSink::default());
		let orchestrator = MoveOrchestrator::new(provider(), options(RetrieveMethod::Move), sink);
		let request = StudyMoveRequest {
			rules: None,
			..anonymize()
		};

		let result = orchestrator.relocate(request).await.unwrap();

		assert!(result.success, "{:?}", result.error);
		assert_eq!(result.counters.moved, 2);
		assert!(result.uid_mapping.is_none());
	}

	#[tokio::test]
	async fn empty_study_is_a_failure() {
		let mut provider = provider();
		provider.find = Arc::new(FakeFindService::default());
		let sink = Arc::new(RecordingSink::default());
		let orchestrator = orchestrator(provider, Arc::clone(&sink));

		let result = orchestrator.relocate(anonymize()).await.unwrap();

		assert!(!result.success);
		assert_eq!(result.error.as_deref(), Some("No instances found for study S1"));
		assert_eq!(sink.finalized.load(Ordering::SeqCst), 1);
	}

	#[tokio::test]
	async fn unreachable_destination_fails_before_retrieval() {
		let mut provider = provider();
		provider.storage.unreachable = true;
		let retrieve = Arc::clone(&provider.retrieve);
		let orchestrator = orchestrator(provider, Arc::new(RecordingSink::default()));

		let result = orchestrator.relocate(anonymize()).await.unwrap();

		assert!(!result.success);
		assert!(retrieve.requests.lock().unwrap().is_empty());
		assert_eq!(result.counters.received, 0);
	}

	#[tokio::test]
	async fn pipeline_fault_is_reported_once() {
		let mut provider = provider();
		provider.storage.statuses.insert(String::from("I1"), 0xA700);
		let sink = Arc::new(RecordingSink::default());
		let orchestrator = MoveOrchestrator::new(
			provider,
			options(RetrieveMethod::Get),
			Arc::clone(&sink) as Arc<dyn ProgressSink>,
		);
		let request = StudyMoveRequest {
			rules: None,
			..anonymize()
		};

		let result = orchestrator.relocate(request).await.unwrap();

		assert!(!result.success);
		let error = result.error.unwrap();
		assert!(error.contains("I1"), "{error}");
		assert!(result.counters.moved <= result.counters.sent);
		assert!(result.counters.sent <= result.counters.received);
		assert_eq!(sink.finalized.load(Ordering::SeqCst), 1);
	}

	#[tokio::test]
	async fn cancel_request_aborts_relocation() {
		let mut provider = provider();
		let mut retrieve = FakeRetrieveService {
			hang: true,
			..Default::default()
		};
		retrieve.responses.insert(String::from("S1"), vec![response(0xFF00, 0, 0, 2)]);
		provider.retrieve = Arc::new(retrieve);
		let sink = Arc::new(RecordingSink {
			cancel: AtomicBool::new(true),
			..Default::default()
		});
		let orchestrator = orchestrator(provider, Arc::clone(&sink));

		let result = tokio::time::timeout(Duration::from_secs(5), orchestrator.relocate(anonymize()))
			.await
			.unwrap()
			.unwrap();

		assert!(!result.success);
		assert_eq!(result.error.as_deref(), Some("The relocation was cancelled"));
		assert_eq!(sink.finalized.load(Ordering::SeqCst), 1);
	}

	#[tokio::test]
	async fn second_relocation_is_rejected_while_busy() {
		let mut provider = provider();
		let mut retrieve = FakeRetrieveService {
			hang: true,
			..Default::default()
		};
		retrieve.responses.insert(String::from("S1"), vec![response(0xFF00, 0, 0, 2)]);
		provider.retrieve = Arc::new(retrieve);
		let orchestrator = Arc::new(orchestrator(provider, Arc::new(RecordingSink::default())));

		let running = {
			let orchestrator = Arc::clone(&orchestrator);
			tokio::spawn(async move { orchestrator.relocate(anonymize()).await })
		};
		tokio::time::timeout(Duration::from_secs(2), async {
			while orchestrator.state() != MoveState::Moving {
				tokio::time::sleep(Duration::from_millis(5)).await;
			}
		})
		.await
		.unwrap();

		assert!(orchestrator.relocate(anonymize()).await.is_err());
		assert!(orchestrator.abort());

		let result = running.await.unwrap().unwrap();
		assert!(!result.success);
		assert_eq!(orchestrator.state(), MoveState::Completed);
		assert!(!orchestrator.abort());
	}

	#[tokio::test]
	async fn unknown_source_is_reported() {
		let orchestrator = orchestrator(provider(), Arc::new(RecordingSink::default()));
		let request = StudyMoveRequest {
			source: AE::from("ELSEWHERE"),
			..anonymize()
		};

		let result = orchestrator.relocate(request).await.unwrap();

		assert_eq!(result.error.as_deref(), Some("Application entity ELSEWHERE is not configured"));
	}

	#[tokio::test]
	async fn stale_instance_count_is_reconciled() {
		let mut provider = provider();
		provider.find = Arc::new(study("1"));
		let orchestrator = orchestrator(provider, Arc::new(RecordingSink::default()));

		let result = orchestrator.relocate(anonymize()).await.unwrap();

		assert!(result.success, "{:?}", result.error);
		let counters = result.counters;
		assert_eq!(counters.received, 2);
		assert_eq!(counters.found, 2);
		assert!(counters.moved <= counters.sent);
		assert!(counters.sent <= counters.received);
		assert!(counters.received <= counters.found);
	}

	#[tokio::test]
	async fn cancel_while_draining_stops_sender() {
		let mut provider = provider();
		provider.storage.delay = Duration::from_millis(100);
		let sink = Arc::new(RecordingSink {
			cancel_after_sent: Some(1),
			..Default::default()
		});
		let orchestrator = orchestrator(provider, Arc::clone(&sink));

		let result = tokio::time::timeout(Duration::from_secs(5), orchestrator.relocate(anonymize()))
			.await
			.unwrap()
			.unwrap();

		assert!(!result.success);
		assert_eq!(result.error.as_deref(), Some("The relocation was cancelled"));
		assert_eq!(result.retrieve.completed, 2);
		assert_eq!(sink.finalized.load(Ordering::SeqCst), 1);
	}

	#[tokio::test]
	async fn explicit_abort_is_reported_as_abort() {
		let mut provider = provider();
		let mut retrieve = FakeRetrieveService {
			hang: true,
			..Default::default()
		};
		retrieve
			.instances
			.insert(String::from("S1"), vec![received("SE1", "I1"), received("SE2", "I2")]);
		retrieve.responses.insert(String::from("S1"), vec![response(0xFF00, 2, 0, 0)]);
		provider.retrieve = Arc::new(retrieve);
		provider.storage.delay = Duration::from_millis(100);
		let orchestrator = Arc::new(orchestrator(provider, Arc::new(RecordingSink::default())));

		let running = {
			let orchestrator = Arc::clone(&orchestrator);
			tokio::spawn(async move { orchestrator.relocate(anonymize()).await })
		};
		tokio::time::timeout(Duration::from_secs(2), async {
			while orchestrator.state() != MoveState::Moving {
				tokio::time::sleep(Duration::from_millis(5)).await;
			}
		})
		.await
		.unwrap();
		tokio::time::sleep(Duration::from_millis(20)).await;
		assert!(orchestrator.abort());

		let result = running.await.unwrap().unwrap();
		assert!(!result.success);
		assert_eq!(result.error.as_deref(), Some("Retrieval was aborted"));
		assert!(result.counters.sent < 2);
		let mapping = result.uid_mapping.unwrap();
		assert!(mapping.instance_count() as u64 <= result.counters.transformed);
	}
}
