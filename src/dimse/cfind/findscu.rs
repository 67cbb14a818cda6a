use crate::dimse::association::{AssociationError, Connector, PresentationParameter};
use crate::dimse::cfind::{CompositeFindRequest, CompositeFindResponse};
use crate::dimse::{
	Association, CompositeCancelRequest, DicomMessageReader, DicomMessageWriter,
	NegotiationError, ReadError, StatusType, WriteError,
};
use crate::types::QueryInformationModel;
use crate::types::{Priority, UI, US};
use async_stream::try_stream;
use dicom::dictionary_std::uids;
use dicom::object::InMemDicomObject;
use futures::Stream;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, trace, warn};

pub struct FindServiceClassUser {
	connector: Connector,
	timeout: Duration,
}

pub struct FindServiceClassUserOptions {
	pub query_information_model: QueryInformationModel,
	pub identifier: InMemDicomObject,
	pub message_id: US,
	pub priority: Priority,
	/// Sends a C-CANCEL-RQ once this many matches were received.
	pub max_responses: Option<usize>,
}

impl From<FindServiceClassUserOptions> for CompositeFindRequest {
	fn from(options: FindServiceClassUserOptions) -> Self {
		Self {
			identifier: options.identifier,
			message_id: options.message_id,
			priority: options.priority as US,
			affected_sop_class_uid: UI::from(options.query_information_model.find_sop_class()),
		}
	}
}

impl FindServiceClassUser {
	pub const fn new(connector: Connector, timeout: Duration) -> Self {
		Self { connector, timeout }
	}

	pub fn invoke(
		&self,
		options: FindServiceClassUserOptions,
	) -> impl Stream<Item = Result<InMemDicomObject, FindError>> + '_ {
		let sop_class_uid = options.query_information_model.find_sop_class();
		let presentation = PresentationParameter::new(
			sop_class_uid,
			vec![
				UI::from(uids::IMPLICIT_VR_LITTLE_ENDIAN),
				UI::from(uids::EXPLICIT_VR_LITTLE_ENDIAN),
			],
		);

		try_stream! {
			let association = self.connector.connect(vec![presentation]).await?;
			let presentation_context_id = association.presentation_context_for(sop_class_uid)?.id;
			let message_id = options.message_id;
			let max_responses = options.max_responses;

			let request = CompositeFindRequest::from(options);
			association.write_message(request, Some(presentation_context_id), self.timeout).await?;
			trace!("Sent C-FIND-RQ");

			let mut matches = 0;
			let mut cancelled = false;
			loop {
				let response = association.read_message(self.timeout).await?;
				let response = CompositeFindResponse::try_from(response)?;
				trace!("Received C-FIND-RSP");

				match StatusType::from_code(Some(response.status)) {
					StatusType::Pending => {
						if cancelled {
							continue;
						}
						if let Some(data) = response.data {
							matches += 1;
							yield data;
						}
						if max_responses.is_some_and(|max| matches >= max) {
							debug!(matches, "Reached response ceiling, cancelling C-FIND");
							let cancel = CompositeCancelRequest { message_id_being_responded_to: message_id };
							association.write_message(cancel, Some(presentation_context_id), self.timeout).await?;
							cancelled = true;
						}
					}
					StatusType::Success | StatusType::Cancel => break,
					StatusType::Warning => {
						warn!(status = response.status, "C-FIND completed with warning");
						break;
					}
					StatusType::Failure => {
						Err::<(), _>(FindError::Status(response.status))?;
					}
				}
			}

			if let Err(err) = association.release(self.timeout).await {
				debug!("Failed to release C-FIND association: {err}");
			}
		}
	}
}

#[derive(Debug, Error)]
pub enum FindError {
	#[error(transparent)]
	Read(#[from] ReadError),
	#[error(transparent)]
	Write(#[from] WriteError),
	#[error(transparent)]
	Association(#[from] AssociationError),
	#[error(transparent)]
	Negotiation(#[from] NegotiationError),
	#[error("C-FIND failed with status {0:#06x}")]
	Status(US),
}
