use crate::dimse::association::{Association, AssociationError, Connector, PresentationParameter};
use crate::dimse::cget::{parse_get_response, CompositeGetRequest};
use crate::dimse::cmove::CompositeRetrieveResponse;
use crate::dimse::cstore::{
	ReceivedObject, StoreHandler, COMMAND_FIELD_COMPOSITE_STORE_REQUEST, STATUS_PROCESSING_FAILURE,
};
use crate::dimse::{
	DicomMessageReader, DicomMessageWriter, NegotiationError, ReadError, StatusType, WriteError,
};
use crate::types::UI;
use async_stream::try_stream;
use dicom::dictionary_std::uids;
use futures::Stream;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

/// Retrieves instances with C-GET. The C-STORE sub-operations arrive on the same
/// association and are passed to the store handler before they are acknowledged.
pub struct GetServiceClassUser {
	connector: Connector,
	timeout: Duration,
	storage_sop_classes: Vec<UI>,
}

impl GetServiceClassUser {
	pub const fn new(connector: Connector, timeout: Duration, storage_sop_classes: Vec<UI>) -> Self {
		Self {
			connector,
			timeout,
			storage_sop_classes,
		}
	}

	fn presentation_contexts(&self, sop_class_uid: &str) -> Vec<PresentationParameter> {
		let transfer_syntaxes = vec![
			UI::from(uids::EXPLICIT_VR_LITTLE_ENDIAN),
			UI::from(uids::IMPLICIT_VR_LITTLE_ENDIAN),
		];
		let mut presentation_contexts = vec![PresentationParameter::new(
			sop_class_uid,
			vec![UI::from(uids::IMPLICIT_VR_LITTLE_ENDIAN)],
		)];
		presentation_contexts.extend(
			self.storage_sop_classes
				.iter()
				.map(|storage| PresentationParameter::new(storage.as_str(), transfer_syntaxes.clone())),
		);
		presentation_contexts
	}

	/// Sends the C-GET-RQ and yields every C-GET-RSP until the final one.
	pub fn invoke(
		&self,
		request: CompositeGetRequest,
		handler: StoreHandler,
	) -> impl Stream<Item = Result<CompositeRetrieveResponse, GetError>> + '_ {
		let sop_class_uid = request.affected_sop_class_uid.clone();
		let presentation_contexts = self.presentation_contexts(&sop_class_uid);

		try_stream! {
			let association = self.connector.connect(presentation_contexts).await?;
			let presentation_context_id = association.presentation_context_for(&sop_class_uid)?.id;

			association.write_message(request, Some(presentation_context_id), self.timeout).await?;
			trace!("Sent C-GET-RQ");

			loop {
				let message = association.read_message(self.timeout).await?;

				if message.command_field() == Some(COMMAND_FIELD_COMPOSITE_STORE_REQUEST) {
					let pctx_id = message.presentation_context_id;
					let transfer_syntax = association
						.presentation_contexts()
						.iter()
						.find(|pctx| Some(pctx.id) == pctx_id)
						.map(|pctx| pctx.transfer_syntax.clone())
						.ok_or(NegotiationError::NoPresentationContext)?;

					let received = ReceivedObject::from_message(message, &transfer_syntax, &self.connector.called_aet)?;
					debug!(sop_instance_uid = received.sop_instance_uid, "Received C-GET sub-operation");

					let mut response = received.response(0);
					if let Err(rejected) = handler(received) {
						warn!("{rejected}");
						response.status = STATUS_PROCESSING_FAILURE;
					}
					association.write_message(response, pctx_id, self.timeout).await?;
					continue;
				}

				let response = parse_get_response(&message)?;
				trace!(status = response.status, "Received C-GET-RSP");

				let status_type = StatusType::from_code(Some(response.status));
				yield response;
				if status_type != StatusType::Pending {
					info!("C-GET completed ({status_type:?})");
					break;
				}
			}

			if let Err(err) = association.release(self.timeout).await {
				debug!("Failed to release C-GET association: {err}");
			}
		}
	}
}

#[derive(Debug, Error)]
pub enum GetError {
	#[error(transparent)]
	Read(#[from] ReadError),
	#[error(transparent)]
	Write(#[from] WriteError),
	#[error(transparent)]
	Association(#[from] AssociationError),
	#[error(transparent)]
	Negotiation(#[from] NegotiationError),
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::net::SocketAddr;

	#[test]
	fn proposes_storage_contexts_for_sub_operations() {
		let connector = Connector::new(
			"RELOCATE".into(),
			"PACS".into(),
			SocketAddr::from(([127, 0, 0, 1], 11112)),
		);
		let scu = GetServiceClassUser::new(
			connector,
			Duration::from_secs(1),
			vec![UI::from(uids::CT_IMAGE_STORAGE), UI::from(uids::MR_IMAGE_STORAGE)],
		);

		let contexts = scu.presentation_contexts(uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_GET);
		assert_eq!(contexts.len(), 3);
		assert_eq!(
			contexts[0].abstract_syntax_uid,
			uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_GET
		);
		assert_eq!(contexts[2].abstract_syntax_uid, uids::MR_IMAGE_STORAGE);
		assert_eq!(contexts[2].transfer_syntax_uids.len(), 2);
	}
}
