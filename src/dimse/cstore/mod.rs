pub mod storescp;
pub mod storescu;

use crate::dimse::{DicomMessage, ReadError, DATA_SET_EXISTS, DATA_SET_MISSING};
use crate::types::{AE, UI, US};
use dicom::core::{DataElement, VR};
use dicom::dicom_value;
use dicom::dictionary_std::tags;
use dicom::object::InMemDicomObject;
use std::sync::Arc;
use thiserror::Error;

// Magic numbers defined by the DICOM specification.
pub const COMMAND_FIELD_COMPOSITE_STORE_REQUEST: US = 0x0001;
pub const COMMAND_FIELD_COMPOSITE_STORE_RESPONSE: US = 0x8001;

/// Failure status "Processing failure" used when a received instance cannot be accepted.
pub const STATUS_PROCESSING_FAILURE: US = 0x0110;

/// C-STORE-RQ
pub struct CompositeStoreRequest {
	pub affected_sop_class_uid: UI,
	pub affected_sop_instance_uid: UI,
	pub move_originator_aet: Option<AE>,
	pub move_originator_message_id: Option<US>,
	pub message_id: US,
	pub priority: US,
	pub data_set: InMemDicomObject,
	pub presentation_context_id: Option<u8>,
}

impl From<CompositeStoreRequest> for DicomMessage {
	#[rustfmt::skip]
	fn from(request: CompositeStoreRequest) -> Self {
		let mut command = InMemDicomObject::command_from_element_iter([
			DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [COMMAND_FIELD_COMPOSITE_STORE_REQUEST])),
			DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, dicom_value!(U16, [DATA_SET_EXISTS])),
			DataElement::new(tags::AFFECTED_SOP_CLASS_UID, VR::UI, dicom_value!(Str, request.affected_sop_class_uid)),
			DataElement::new(tags::AFFECTED_SOP_INSTANCE_UID, VR::UI, dicom_value!(Str, request.affected_sop_instance_uid)),
			DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [request.message_id])),
			DataElement::new(tags::PRIORITY, VR::US, dicom_value!(U16, [request.priority])),
		]);

		if let Some(move_originator_message_id) = request.move_originator_message_id {
			command.put_element(DataElement::new(tags::MOVE_ORIGINATOR_MESSAGE_ID, VR::US, dicom_value!(U16, [move_originator_message_id])));
		}

		if let Some(move_originator_aet) = request.move_originator_aet {
			command.put_element(DataElement::new(tags::MOVE_ORIGINATOR_APPLICATION_ENTITY_TITLE, VR::AE, dicom_value!(Str, move_originator_aet)));
		}

		Self {
			command,
			data: Some(request.data_set),
			presentation_context_id: request.presentation_context_id,
		}
	}
}

/// C-STORE-RSP
pub struct CompositeStoreResponse {
	pub message_id: US,
	pub sop_class_uid: UI,
	pub sop_instance_uid: UI,
	pub status: US,
}

impl From<CompositeStoreResponse> for DicomMessage {
	#[rustfmt::skip]
	fn from(response: CompositeStoreResponse) -> Self {
		let command = InMemDicomObject::command_from_element_iter([
			DataElement::new(tags::AFFECTED_SOP_CLASS_UID, VR::UI, dicom_value!(Str, response.sop_class_uid)),
			DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [COMMAND_FIELD_COMPOSITE_STORE_RESPONSE])),
			DataElement::new(tags::MESSAGE_ID_BEING_RESPONDED_TO, VR::US, dicom_value!(U16, [response.message_id])),
			DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, dicom_value!(U16, [DATA_SET_MISSING])),
			DataElement::new(tags::STATUS, VR::US, dicom_value!(U16, [response.status])),
			DataElement::new(tags::AFFECTED_SOP_INSTANCE_UID, VR::UI, dicom_value!(Str, response.sop_instance_uid))
		]);

		Self {
			command,
			data: None,
			presentation_context_id: None,
		}
	}
}

impl TryFrom<DicomMessage> for CompositeStoreResponse {
	type Error = ReadError;

	fn try_from(message: DicomMessage) -> Result<Self, Self::Error> {
		match message.command_field() {
			Some(COMMAND_FIELD_COMPOSITE_STORE_RESPONSE) => {}
			Some(other) => return Err(ReadError::UnexpectedCommand(other)),
			None => return Err(ReadError::MissingAttribute(tags::COMMAND_FIELD)),
		}

		Ok(Self {
			message_id: message
				.command_int(tags::MESSAGE_ID_BEING_RESPONDED_TO)
				.unwrap_or_default(),
			sop_class_uid: message
				.command_str(tags::AFFECTED_SOP_CLASS_UID)
				.unwrap_or_default(),
			sop_instance_uid: message
				.command_str(tags::AFFECTED_SOP_INSTANCE_UID)
				.unwrap_or_default(),
			status: message
				.status()
				.ok_or(ReadError::MissingAttribute(tags::STATUS))?,
		})
	}
}

/// An instance that arrived through a C-STORE-RQ, either on our STORE-SCP or as a C-GET sub-operation.
#[derive(Debug, Clone)]
pub struct ReceivedObject {
	pub message_id: US,
	pub sop_class_uid: UI,
	pub sop_instance_uid: UI,
	pub transfer_syntax: UI,
	pub calling_aet: AE,
	pub data: InMemDicomObject,
}

impl ReceivedObject {
	/// Extracts the instance from a C-STORE-RQ that was read with the given transfer syntax.
	pub fn from_message(
		message: DicomMessage,
		transfer_syntax: &str,
		calling_aet: &str,
	) -> Result<Self, ReadError> {
		match message.command_field() {
			Some(COMMAND_FIELD_COMPOSITE_STORE_REQUEST) => {}
			Some(other) => return Err(ReadError::UnexpectedCommand(other)),
			None => return Err(ReadError::MissingAttribute(tags::COMMAND_FIELD)),
		}

		let message_id = message.command_int(tags::MESSAGE_ID).unwrap_or(0);
		let sop_class_uid = message
			.command_str(tags::AFFECTED_SOP_CLASS_UID)
			.ok_or(ReadError::MissingAttribute(tags::AFFECTED_SOP_CLASS_UID))?;
		let sop_instance_uid = message
			.command_str(tags::AFFECTED_SOP_INSTANCE_UID)
			.ok_or(ReadError::MissingAttribute(tags::AFFECTED_SOP_INSTANCE_UID))?;
		let data = message.data.ok_or(ReadError::OutOfOrder)?;

		Ok(Self {
			message_id,
			sop_class_uid,
			sop_instance_uid,
			transfer_syntax: UI::from(transfer_syntax.trim_end_matches('\0')),
			calling_aet: AE::from(calling_aet),
			data,
		})
	}

	/// The C-STORE-RSP that acknowledges this instance with the given status.
	pub fn response(&self, status: US) -> CompositeStoreResponse {
		CompositeStoreResponse {
			message_id: self.message_id,
			sop_class_uid: self.sop_class_uid.clone(),
			sop_instance_uid: self.sop_instance_uid.clone(),
			status,
		}
	}
}

#[derive(Debug, Error)]
#[error("Rejected instance {sop_instance_uid}: {reason}")]
pub struct StoreRejected {
	pub sop_instance_uid: UI,
	pub reason: String,
}

/// Callback invoked for every received instance. An error is answered with a failure status.
pub type StoreHandler = Arc<dyn Fn(ReceivedObject) -> Result<(), StoreRejected> + Send + Sync>;

#[cfg(test)]
mod tests {
	use super::*;

	fn store_request() -> DicomMessage {
		let mut data_set = InMemDicomObject::new_empty();
		data_set.put_str(tags::SOP_INSTANCE_UID, VR::UI, "1.2.3.4");
		DicomMessage::from(CompositeStoreRequest {
			affected_sop_class_uid: UI::from("1.2.840.10008.5.1.4.1.1.2"),
			affected_sop_instance_uid: UI::from("1.2.3.4"),
			move_originator_aet: Some(AE::from("PACS")),
			move_originator_message_id: Some(3),
			message_id: 11,
			priority: 0,
			data_set,
			presentation_context_id: Some(1),
		})
	}

	#[test]
	fn received_object_from_store_request() {
		let received =
			ReceivedObject::from_message(store_request(), "1.2.840.10008.1.2\0", "PACS").unwrap();

		assert_eq!(received.message_id, 11);
		assert_eq!(received.sop_class_uid, "1.2.840.10008.5.1.4.1.1.2");
		assert_eq!(received.sop_instance_uid, "1.2.3.4");
		assert_eq!(received.transfer_syntax, "1.2.840.10008.1.2");
		assert_eq!(received.calling_aet, "PACS");

		let response = DicomMessage::from(received.response(0));
		assert_eq!(
			response.command_field(),
			Some(COMMAND_FIELD_COMPOSITE_STORE_RESPONSE)
		);
		assert_eq!(
			response.command_int(tags::MESSAGE_ID_BEING_RESPONDED_TO),
			Some(11)
		);
	}

	#[test]
	fn store_request_requires_data_set() {
		let mut message = store_request();
		message.data = None;
		assert!(ReceivedObject::from_message(message, "1.2.840.10008.1.2", "PACS").is_err());
	}

	#[test]
	fn store_response_roundtrip_status() {
		let message = DicomMessage::from(CompositeStoreResponse {
			message_id: 5,
			sop_class_uid: UI::from("1.2"),
			sop_instance_uid: UI::from("1.2.3"),
			status: 0xA700,
		});
		let response = CompositeStoreResponse::try_from(message).unwrap();
		assert_eq!(response.status, 0xA700);
		assert_eq!(response.message_id, 5);
		assert_eq!(response.sop_instance_uid, "1.2.3");
	}
}
