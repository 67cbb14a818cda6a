use crate::dimse::association::client::ClientAssociation;
use crate::dimse::association::{Association, AssociationError, Connector, PresentationParameter};
use crate::dimse::commitment::{
	CommitmentActionRequest, CommitmentActionResponse, CommitmentEventReport, SopReference,
	STORAGE_COMMITMENT_PUSH_MODEL,
};
use crate::dimse::{
	next_message_id, DicomMessageReader, DicomMessageWriter, NegotiationError, ReadError,
	StatusType, WriteError,
};
use crate::types::{generate_uid, UI, US};
use dicom::dictionary_std::uids;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, instrument, trace, warn};

/// Requests storage commitment and waits for the N-EVENT-REPORT on the same association.
pub struct StorageCommitmentServiceClassUser {
	connector: Connector,
	timeout: Duration,
	commitment_timeout: Duration,
	association: Option<ClientAssociation>,
}

impl StorageCommitmentServiceClassUser {
	pub const fn new(connector: Connector, timeout: Duration, commitment_timeout: Duration) -> Self {
		Self {
			connector,
			timeout,
			commitment_timeout,
			association: None,
		}
	}

	async fn association(&mut self) -> Result<&ClientAssociation, CommitmentError> {
		if self.association.is_none() {
			let presentation = PresentationParameter::new(
				STORAGE_COMMITMENT_PUSH_MODEL,
				vec![
					UI::from(uids::IMPLICIT_VR_LITTLE_ENDIAN),
					UI::from(uids::EXPLICIT_VR_LITTLE_ENDIAN),
				],
			);
			self.association = Some(self.connector.connect(vec![presentation]).await?);
		}
		self.association
			.as_ref()
			.ok_or(CommitmentError::Negotiation(NegotiationError::NoPresentationContext))
	}

	/// Sends an N-ACTION-RQ for the given instances and returns the destination's verdict.
	#[instrument(skip_all, name = "COMMITMENT-SCU")]
	pub async fn commit(
		&mut self,
		references: Vec<SopReference>,
	) -> Result<CommitmentEventReport, CommitmentError> {
		let timeout = self.timeout;
		let commitment_timeout = self.commitment_timeout;
		let transaction_uid = generate_uid();

		let result = async {
			let association = self.association().await?;
			let presentation_context_id = association
				.presentation_context_for(STORAGE_COMMITMENT_PUSH_MODEL)?
				.id;

			let request = CommitmentActionRequest {
				message_id: next_message_id(),
				transaction_uid: transaction_uid.clone(),
				references,
			};
			association
				.write_message(request, Some(presentation_context_id), timeout)
				.await?;
			trace!(transaction_uid, "Sent N-ACTION-RQ");

			let response = CommitmentActionResponse::try_from(association.read_message(timeout).await?)?;
			if StatusType::from_code(Some(response.status)) != StatusType::Success {
				return Err(CommitmentError::Status(response.status));
			}

			let wait = async {
				loop {
					let report =
						CommitmentEventReport::try_from(association.read_message(commitment_timeout).await?)?;
					association
						.write_message(report.response(), Some(presentation_context_id), timeout)
						.await?;

					if report
						.transaction_uid
						.as_deref()
						.is_some_and(|uid| uid != transaction_uid)
					{
						warn!(
							expected = transaction_uid,
							received = report.transaction_uid,
							"Ignoring N-EVENT-REPORT for another transaction"
						);
						continue;
					}
					debug!(
						committed = report.committed.len(),
						failed = report.failed.len(),
						"Received N-EVENT-REPORT"
					);
					return Ok::<_, CommitmentError>(report);
				}
			};
			tokio::time::timeout(commitment_timeout, wait)
				.await
				.map_err(|_| CommitmentError::Timeout(commitment_timeout))?
		}
		.await;

		if result.is_err() {
			// The association is unusable once a reply went missing.
			self.association = None;
		}
		result
	}

	pub async fn release(&mut self) {
		if let Some(association) = self.association.take() {
			if let Err(err) = association.release(self.timeout).await {
				debug!("Failed to release storage commitment association: {err}");
			}
		}
	}
}

#[derive(Debug, Error)]
pub enum CommitmentError {
	#[error(transparent)]
	Read(#[from] ReadError),
	#[error(transparent)]
	Write(#[from] WriteError),
	#[error(transparent)]
	Association(#[from] AssociationError),
	#[error(transparent)]
	Negotiation(#[from] NegotiationError),
	#[error("N-ACTION failed with status {0:#06x}")]
	Status(US),
	#[error("No commitment result within {0:?}")]
	Timeout(Duration),
}
