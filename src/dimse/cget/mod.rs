use crate::dimse::cmove::CompositeRetrieveResponse;
use crate::dimse::{DicomMessage, ReadError, DATA_SET_EXISTS};
use crate::types::{Priority, UI, US};
use dicom::core::{DataElement, VR};
use dicom::dicom_value;
use dicom::dictionary_std::tags;
use dicom::object::InMemDicomObject;

pub mod getscu;

// Magic numbers defined by the DICOM specification.
pub const COMMAND_FIELD_COMPOSITE_GET_REQUEST: US = 0x0010;
pub const COMMAND_FIELD_COMPOSITE_GET_RESPONSE: US = 0x8010;

/// C-GET-RQ
/// <https://dicom.nema.org/medical/dicom/current/output/chtml/part07/sect_9.3.3.html>
pub struct CompositeGetRequest {
	pub affected_sop_class_uid: UI,
	pub identifier: InMemDicomObject,
	pub message_id: US,
	pub priority: US,
}

impl CompositeGetRequest {
	pub fn new(affected_sop_class_uid: UI, message_id: US, identifier: InMemDicomObject) -> Self {
		Self {
			affected_sop_class_uid,
			identifier,
			message_id,
			priority: Priority::Medium as US,
		}
	}
}

impl From<CompositeGetRequest> for DicomMessage {
	#[rustfmt::skip]
	fn from(request: CompositeGetRequest) -> Self {
		let command = InMemDicomObject::command_from_element_iter([
			DataElement::new(tags::AFFECTED_SOP_CLASS_UID, VR::UI, dicom_value!(Str, request.affected_sop_class_uid)),
			DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [COMMAND_FIELD_COMPOSITE_GET_REQUEST])),
			DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [request.message_id])),
			DataElement::new(tags::PRIORITY, VR::US, dicom_value!(U16, [request.priority])),
			DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, dicom_value!(U16, [DATA_SET_EXISTS])),
		]);

		Self {
			command,
			data: Some(request.identifier),
			presentation_context_id: None,
		}
	}
}

/// Parses a C-GET-RSP. The layout matches the C-MOVE-RSP apart from the command field.
pub fn parse_get_response(message: &DicomMessage) -> Result<CompositeRetrieveResponse, ReadError> {
	CompositeRetrieveResponse::parse(message, COMMAND_FIELD_COMPOSITE_GET_RESPONSE)
}
