//! Binds the relocation engine to remote archives through the DIMSE service class users.

use crate::config::{AeConfig, AppConfig, RelocationConfig};
use crate::dimse::association::{Connector, PresentationParameter};
use crate::dimse::cecho::EchoServiceClassUser;
use crate::dimse::cfind::findscu::{FindError, FindServiceClassUser, FindServiceClassUserOptions};
use crate::dimse::cget::getscu::GetServiceClassUser;
use crate::dimse::cget::CompositeGetRequest;
use crate::dimse::cmove::movescu::MoveServiceClassUser;
use crate::dimse::cmove::{CompositeMoveRequest, CompositeRetrieveResponse};
use crate::dimse::commitment::commitmentscu::StorageCommitmentServiceClassUser;
use crate::dimse::commitment::{CommitmentFailure, SopReference};
use crate::dimse::cstore::storescu::{StoreError, StoreInstance, StoreServiceClassUser};
use crate::dimse::cstore::StoreHandler;
use crate::dimse::next_message_id;
use crate::relocate::orchestrator::{ServiceProvider, UnknownAet};
use crate::relocate::query::{FindRequest, FindService};
use crate::relocate::retrieve::{RetrieveError, RetrieveRequest, RetrieveService};
use crate::relocate::sender::{CommitmentOutcome, SenderError, StorageService};
use crate::relocate::MovedObject;
use crate::types::{Priority, QueryInformationModel, QueryRetrieveLevel, RetrieveMethod, AE, UI, US};
use async_trait::async_trait;
use dicom::dictionary_std::uids;
use dicom::object::InMemDicomObject;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use std::time::Duration;
use tracing::{debug, info, instrument};

pub struct DimseFindService {
	scu: FindServiceClassUser,
	relational: bool,
}

impl FindService for DimseFindService {
	fn relational(&self) -> bool {
		self.relational
	}

	fn find(&self, request: FindRequest) -> BoxStream<'_, Result<InMemDicomObject, FindError>> {
		// Patients can only be queried in the patient root model.
		let query_information_model = if request.level == QueryRetrieveLevel::Patient {
			QueryInformationModel::Patient
		} else {
			QueryInformationModel::Study
		};
		let options = FindServiceClassUserOptions {
			query_information_model,
			identifier: request.identifier,
			message_id: next_message_id(),
			priority: Priority::Medium,
			max_responses: request.max_responses,
		};
		self.scu.invoke(options).boxed()
	}
}

enum RetrieveServiceClassUser {
	Move(MoveServiceClassUser),
	Get(GetServiceClassUser),
}

pub struct DimseRetrieveService {
	scu: RetrieveServiceClassUser,
	model: QueryInformationModel,
}

impl RetrieveService for DimseRetrieveService {
	fn retrieve(
		&self,
		request: RetrieveRequest,
		handler: StoreHandler,
	) -> BoxStream<'_, Result<CompositeRetrieveResponse, RetrieveError>> {
		match &self.scu {
			RetrieveServiceClassUser::Move(scu) => {
				let move_request = CompositeMoveRequest::new(
					UI::from(self.model.move_sop_class()),
					next_message_id(),
					request.destination,
				)
				.identifier(request.identifier);
				scu.invoke(move_request).map_err(RetrieveError::from).boxed()
			}
			RetrieveServiceClassUser::Get(scu) => {
				let get_request = CompositeGetRequest::new(
					UI::from(self.model.get_sop_class()),
					next_message_id(),
					request.identifier,
				);
				scu.invoke(get_request, handler)
					.map_err(RetrieveError::from)
					.boxed()
			}
		}
	}
}

pub struct DimseStorageService {
	connector: Connector,
	timeout: Duration,
	store: StoreServiceClassUser,
	commitment: StorageCommitmentServiceClassUser,
}

#[async_trait]
impl StorageService for DimseStorageService {
	#[instrument(skip_all, name = "PREPARE", fields(destination = %self.connector.called_aet))]
	async fn prepare(&mut self) -> Result<(), SenderError> {
		let presentation = PresentationParameter::new(
			uids::VERIFICATION,
			vec![UI::from(uids::IMPLICIT_VR_LITTLE_ENDIAN)],
		);
		let association = self.connector.connect(vec![presentation]).await?;
		let reachable = EchoServiceClassUser::new(&association)
			.echo(self.timeout)
			.await?;
		if let Err(err) = association.release(self.timeout).await {
			debug!("Failed to release C-ECHO association: {err}");
		}

		if !reachable {
			return Err(SenderError::Unreachable {
				aet: self.connector.called_aet.clone(),
			});
		}
		info!("Destination is reachable");
		Ok(())
	}

	async fn store(&mut self, object: &MovedObject) -> Result<US, SenderError> {
		let instance = StoreInstance {
			sop_class_uid: &object.sop_class_uid,
			sop_instance_uid: object.stored_sop_instance_uid(),
			transfer_syntax: &object.transfer_syntax,
			data_set: object.data.clone(),
		};
		self.store.store(instance).await.map_err(|err| match err {
			StoreError::UnsupportedTransferSyntax(transfer_syntax) => {
				SenderError::UnsupportedTransferSyntax(transfer_syntax)
			}
			err => SenderError::Store(err),
		})
	}

	async fn commit(&mut self, object: &MovedObject) -> Result<CommitmentOutcome, SenderError> {
		let reference = SopReference {
			sop_class_uid: object.sop_class_uid.clone(),
			sop_instance_uid: UI::from(object.stored_sop_instance_uid()),
		};
		let report = self.commitment.commit(vec![reference.clone()]).await?;

		if let Some(failure) = report
			.failed
			.iter()
			.find(|failure| failure.reference == reference)
		{
			return Ok(CommitmentOutcome::Failed(failure.clone()));
		}
		if report.has_failures() {
			return Ok(CommitmentOutcome::Failed(CommitmentFailure {
				reference,
				failure_reason: None,
			}));
		}
		Ok(CommitmentOutcome::Committed)
	}

	async fn release(&mut self) {
		self.store.release().await;
		self.commitment.release().await;
	}
}

/// Creates the DIMSE services for the peers listed in the configuration.
pub struct DimseServices {
	calling_aet: AE,
	aets: Vec<AeConfig>,
	relocation: RelocationConfig,
}

impl DimseServices {
	pub fn new(config: &AppConfig) -> Self {
		Self {
			calling_aet: config.server.aet.clone(),
			aets: config.aets.clone(),
			relocation: config.relocation.clone(),
		}
	}

	fn peer(&self, aet: &str) -> Result<(Connector, Duration), UnknownAet> {
		let ae = self
			.aets
			.iter()
			.find(|ae| ae.aet == aet)
			.ok_or_else(|| UnknownAet(AE::from(aet)))?;
		let connector = Connector::new(self.calling_aet.clone(), ae.aet.clone(), ae.address());
		Ok((connector, Duration::from_millis(ae.timeout)))
	}
}

impl ServiceProvider for DimseServices {
	type Find = DimseFindService;
	type Retrieve = DimseRetrieveService;
	type Storage = DimseStorageService;

	fn find_service(&self, source: &str) -> Result<Self::Find, UnknownAet> {
		let (connector, timeout) = self.peer(source)?;
		let relational = self.aets.iter().any(|ae| ae.aet == source && ae.relational);
		Ok(DimseFindService {
			scu: FindServiceClassUser::new(connector, timeout),
			relational,
		})
	}

	fn retrieve_service(&self, source: &str) -> Result<Self::Retrieve, UnknownAet> {
		let (connector, timeout) = self.peer(source)?;
		let scu = match self.relocation.method {
			RetrieveMethod::Move => {
				RetrieveServiceClassUser::Move(MoveServiceClassUser::new(connector, timeout))
			}
			RetrieveMethod::Get => RetrieveServiceClassUser::Get(GetServiceClassUser::new(
				connector,
				timeout,
				self.relocation.storage_sop_classes.clone(),
			)),
		};
		Ok(DimseRetrieveService {
			scu,
			model: QueryInformationModel::Study,
		})
	}

	fn storage_service(&self, destination: &str) -> Result<Self::Storage, UnknownAet> {
		let (connector, timeout) = self.peer(destination)?;
		Ok(DimseStorageService {
			store: StoreServiceClassUser::new(connector.clone(), timeout),
			commitment: StorageCommitmentServiceClassUser::new(
				connector.clone(),
				timeout,
				Duration::from_millis(self.relocation.commitment_timeout),
			),
			connector,
			timeout,
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::net::{IpAddr, Ipv4Addr};

	fn services() -> DimseServices {
		let peer = |aet: &str, relational| AeConfig {
			aet: AE::from(aet),
			host: IpAddr::V4(Ipv4Addr::LOCALHOST),
			port: 11112,
			relational,
			timeout: 1000,
		};
		DimseServices {
			calling_aet: AE::from("RELOCATE"),
			aets: vec![peer("SOURCE", true), peer("DEST", false)],
			relocation: RelocationConfig {
				method: RetrieveMethod::Get,
				retrieve_level: QueryRetrieveLevel::Study,
				storage_commitment: false,
				commitment_timeout: 1000,
				skip_if_present: false,
				max_responses: 0,
				progress_interval: 1000,
				storage_sop_classes: Vec::new(),
			},
		}
	}

	#[test]
	fn services_are_built_for_known_peers() {
		let services = services();
		assert!(services.find_service("SOURCE").unwrap().relational());
		assert!(!services.find_service("DEST").unwrap().relational());
		assert!(matches!(
			services.retrieve_service("SOURCE").unwrap().scu,
			RetrieveServiceClassUser::Get(_)
		));
		assert_eq!(services.storage_service("DEST").unwrap().connector.called_aet, "DEST");
	}

	#[test]
	fn unknown_peer_is_rejected() {
		let services = services();
		assert!(matches!(services.storage_service("NOPE"), Err(UnknownAet(aet)) if aet == "NOPE"));
	}
}
