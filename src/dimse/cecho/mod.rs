mod echoscu;
pub use echoscu::*;

use super::{DicomMessage, ReadError, DATA_SET_MISSING};
use crate::types::US;
use dicom::core::{DataElement, VR};
use dicom::dicom_value;
use dicom::dictionary_std::{tags, uids};
use dicom::object::InMemDicomObject;

pub const COMMAND_FIELD_COMPOSITE_ECHO_REQUEST: US = 0x0030;
const COMMAND_FIELD_COMPOSITE_ECHO_RESPONSE: US = 0x8030;

/// C-ECHO-RQ
#[derive(Debug)]
struct CompositeEchoRequest {
	message_id: US,
	presentation_context_id: u8,
}

impl From<CompositeEchoRequest> for DicomMessage {
	#[rustfmt::skip]
	fn from(request: CompositeEchoRequest) -> Self {
		let command = InMemDicomObject::command_from_element_iter([
			DataElement::new(tags::AFFECTED_SOP_CLASS_UID, VR::UI, dicom_value!(Str, uids::VERIFICATION)),
			DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [COMMAND_FIELD_COMPOSITE_ECHO_REQUEST])),
			DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [request.message_id])),
			DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, dicom_value!(U16, [DATA_SET_MISSING]))
		]);

		Self {
			command,
			data: None,
			presentation_context_id: Some(request.presentation_context_id),
		}
	}
}

/// C-ECHO-RSP
#[derive(Debug)]
pub struct CompositeEchoResponse {
	pub message_id: US,
	pub status: US,
}

impl From<CompositeEchoResponse> for DicomMessage {
	#[rustfmt::skip]
	fn from(response: CompositeEchoResponse) -> Self {
		let command = InMemDicomObject::command_from_element_iter([
			DataElement::new(tags::AFFECTED_SOP_CLASS_UID, VR::UI, dicom_value!(Str, uids::VERIFICATION)),
			DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [COMMAND_FIELD_COMPOSITE_ECHO_RESPONSE])),
			DataElement::new(tags::MESSAGE_ID_BEING_RESPONDED_TO, VR::US, dicom_value!(U16, [response.message_id])),
			DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, dicom_value!(U16, [DATA_SET_MISSING])),
			DataElement::new(tags::STATUS, VR::US, dicom_value!(U16, [response.status])),
		]);

		Self {
			command,
			data: None,
			presentation_context_id: None,
		}
	}
}

impl TryFrom<DicomMessage> for CompositeEchoResponse {
	type Error = ReadError;

	fn try_from(message: DicomMessage) -> Result<Self, Self::Error> {
		match message.command_field() {
			Some(COMMAND_FIELD_COMPOSITE_ECHO_RESPONSE) => {}
			Some(other) => return Err(ReadError::UnexpectedCommand(other)),
			None => return Err(ReadError::MissingAttribute(tags::COMMAND_FIELD)),
		}
		let status = message
			.status()
			.ok_or(ReadError::MissingAttribute(tags::STATUS))?;

		Ok(Self {
			message_id: message
				.command_int(tags::MESSAGE_ID_BEING_RESPONDED_TO)
				.unwrap_or_default(),
			status,
		})
	}
}
