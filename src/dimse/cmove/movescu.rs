use crate::dimse::association::{Association, AssociationError, Connector, PresentationParameter};
use crate::dimse::cmove::{CompositeMoveRequest, CompositeRetrieveResponse};
use crate::dimse::{
	DicomMessageReader, DicomMessageWriter, NegotiationError, ReadError, StatusType, WriteError,
};
use crate::types::UI;
use async_stream::try_stream;
use dicom::dictionary_std::uids;
use futures::Stream;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, trace};

pub struct MoveServiceClassUser {
	connector: Connector,
	timeout: Duration,
}

impl MoveServiceClassUser {
	pub const fn new(connector: Connector, timeout: Duration) -> Self {
		Self { connector, timeout }
	}

	/// Sends the C-MOVE-RQ and yields every C-MOVE-RSP until the final one.
	/// Dropping the stream aborts the association and thereby the move.
	pub fn invoke(
		&self,
		request: CompositeMoveRequest,
	) -> impl Stream<Item = Result<CompositeRetrieveResponse, MoveError>> + '_ {
		let sop_class_uid = request.affected_sop_class_uid.clone();
		let presentation = PresentationParameter::new(
			sop_class_uid.clone(),
			vec![UI::from(uids::IMPLICIT_VR_LITTLE_ENDIAN)],
		);

		try_stream! {
			let association = self.connector.connect(vec![presentation]).await?;
			let presentation_context_id = association.presentation_context_for(&sop_class_uid)?.id;

			association.write_message(request, Some(presentation_context_id), self.timeout).await?;
			trace!("Sent C-MOVE-RQ");

			loop {
				let response = association.read_message(self.timeout).await?;
				let response = CompositeRetrieveResponse::try_from(response)?;
				trace!(status = response.status, "Received C-MOVE-RSP");

				let status_type = StatusType::from_code(Some(response.status));
				yield response;
				if status_type != StatusType::Pending {
					info!("C-MOVE completed ({status_type:?})");
					break;
				}
			}

			if let Err(err) = association.release(self.timeout).await {
				debug!("Failed to release C-MOVE association: {err}");
			}
		}
	}
}

#[derive(Debug, Error)]
pub enum MoveError {
	#[error(transparent)]
	Read(#[from] ReadError),
	#[error(transparent)]
	Write(#[from] WriteError),
	#[error(transparent)]
	Association(#[from] AssociationError),
	#[error(transparent)]
	Negotiation(#[from] NegotiationError),
}
