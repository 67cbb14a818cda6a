use crate::dimse::{DicomMessage, ReadError, DATA_SET_EXISTS};
use crate::types::{UI, US};
use dicom::core::{DataElement, VR};
use dicom::dicom_value;
use dicom::dictionary_std::tags;
use dicom::object::InMemDicomObject;

pub mod findscu;

// Magic numbers defined by the DICOM specification.
pub const COMMAND_FIELD_COMPOSITE_FIND_REQUEST: US = 0x0020;
pub const COMMAND_FIELD_COMPOSITE_FIND_RESPONSE: US = 0x8020;

/// C-FIND-RQ
/// <https://dicom.nema.org/medical/dicom/current/output/chtml/part07/chapter_9.html#table_9.1-2>
pub struct CompositeFindRequest {
	pub message_id: US,
	pub priority: US,
	pub affected_sop_class_uid: UI,
	pub identifier: InMemDicomObject,
}

impl From<CompositeFindRequest> for DicomMessage {
	#[rustfmt::skip]
	fn from(request: CompositeFindRequest) -> Self {
		let command = InMemDicomObject::command_from_element_iter([
			DataElement::new(tags::AFFECTED_SOP_CLASS_UID, VR::UI, dicom_value!(Str, request.affected_sop_class_uid)),
			DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [COMMAND_FIELD_COMPOSITE_FIND_REQUEST])),
			DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [request.message_id])),
			DataElement::new(tags::PRIORITY, VR::US, dicom_value!(U16, [request.priority])),
			DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, dicom_value!(U16, [DATA_SET_EXISTS]))
		]);

		Self {
			command,
			data: Some(request.identifier),
			presentation_context_id: None,
		}
	}
}

/// C-FIND-RSP
#[derive(Debug)]
pub struct CompositeFindResponse {
	pub status: US,
	pub data: Option<InMemDicomObject>,
}

impl TryFrom<DicomMessage> for CompositeFindResponse {
	type Error = ReadError;

	fn try_from(message: DicomMessage) -> Result<Self, Self::Error> {
		match message.command_field() {
			Some(COMMAND_FIELD_COMPOSITE_FIND_RESPONSE) => {}
			Some(other) => return Err(ReadError::UnexpectedCommand(other)),
			None => return Err(ReadError::MissingAttribute(tags::COMMAND_FIELD)),
		}

		let status = message
			.status()
			.ok_or(ReadError::MissingAttribute(tags::STATUS))?;

		Ok(Self {
			status,
			data: message.data,
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn response_requires_status() {
		let command = InMemDicomObject::command_from_element_iter([DataElement::new(
			tags::COMMAND_FIELD,
			VR::US,
			dicom_value!(U16, [COMMAND_FIELD_COMPOSITE_FIND_RESPONSE]),
		)]);
		let message = DicomMessage {
			command,
			data: None,
			presentation_context_id: Some(1),
		};
		assert!(matches!(
			CompositeFindResponse::try_from(message),
			Err(ReadError::MissingAttribute(tag)) if tag == tags::STATUS
		));
	}

	#[test]
	fn request_carries_identifier() {
		let mut identifier = InMemDicomObject::new_empty();
		identifier.put_str(tags::QUERY_RETRIEVE_LEVEL, VR::CS, "STUDY");
		let message = DicomMessage::from(CompositeFindRequest {
			message_id: 7,
			priority: 0,
			affected_sop_class_uid: UI::from("1.2.840.10008.5.1.4.1.2.2.1"),
			identifier,
		});

		assert_eq!(
			message.command_field(),
			Some(COMMAND_FIELD_COMPOSITE_FIND_REQUEST)
		);
		assert_eq!(message.command_int(tags::MESSAGE_ID), Some(7));
		assert_eq!(
			message.command_str(tags::AFFECTED_SOP_CLASS_UID).as_deref(),
			Some("1.2.840.10008.5.1.4.1.2.2.1")
		);
		assert!(message.data.is_some());
	}
}
