use crate::dimse::{DicomMessage, ReadError, DATA_SET_EXISTS};
use crate::types::{Priority, AE, UI, US};
use dicom::core::{DataElement, Tag, VR};
use dicom::dicom_value;
use dicom::dictionary_std::tags;
use dicom::object::InMemDicomObject;
use serde::Serialize;
use std::ops::AddAssign;

pub mod movescu;

// Magic numbers defined by the DICOM specification.
pub const COMMAND_FIELD_COMPOSITE_MOVE_REQUEST: US = 0x0021;
pub const COMMAND_FIELD_COMPOSITE_MOVE_RESPONSE: US = 0x8021;

/// C-MOVE-RQ
pub struct CompositeMoveRequest {
	pub affected_sop_class_uid: UI,
	pub identifier: InMemDicomObject,
	pub message_id: US,
	pub priority: US,
	pub destination: AE,
}

impl CompositeMoveRequest {
	pub fn new(affected_sop_class_uid: UI, message_id: US, destination: AE) -> Self {
		Self {
			affected_sop_class_uid,
			identifier: InMemDicomObject::new_empty(),
			priority: Priority::Medium as US,
			message_id,
			destination,
		}
	}

	pub fn identifier(mut self, identifier: InMemDicomObject) -> Self {
		self.identifier = identifier;
		self
	}
}

impl From<CompositeMoveRequest> for DicomMessage {
	#[rustfmt::skip]
	fn from(request: CompositeMoveRequest) -> Self {
		let command = InMemDicomObject::command_from_element_iter([
			DataElement::new(tags::AFFECTED_SOP_CLASS_UID, VR::UI, dicom_value!(Str, request.affected_sop_class_uid)),
			DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [COMMAND_FIELD_COMPOSITE_MOVE_REQUEST])),
			DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [request.message_id])),
			DataElement::new(tags::PRIORITY, VR::US, dicom_value!(U16, [request.priority])),
			DataElement::new(tags::MOVE_DESTINATION, VR::AE, dicom_value!(Str, request.destination)),
			DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, dicom_value!(U16, [DATA_SET_EXISTS])),
		]);

		Self {
			command,
			data: Some(request.identifier),
			presentation_context_id: None,
		}
	}
}

/// Number of sub-operations reported in a C-MOVE-RSP or C-GET-RSP.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SubOperationCounters {
	pub remaining: u32,
	pub completed: u32,
	pub failed: u32,
	pub warning: u32,
}

impl SubOperationCounters {
	/// All sub-operations the peer announced for a request.
	pub const fn total(&self) -> u32 {
		self.remaining + self.completed + self.failed + self.warning
	}

	fn from_command(command: &InMemDicomObject) -> Self {
		let read = |tag: Tag| {
			command
				.get(tag)
				.and_then(|element| element.to_int::<US>().ok())
				.map_or(0, u32::from)
		};
		Self {
			remaining: read(tags::NUMBER_OF_REMAINING_SUBOPERATIONS),
			completed: read(tags::NUMBER_OF_COMPLETED_SUBOPERATIONS),
			failed: read(tags::NUMBER_OF_FAILED_SUBOPERATIONS),
			warning: read(tags::NUMBER_OF_WARNING_SUBOPERATIONS),
		}
	}
}

impl AddAssign for SubOperationCounters {
	fn add_assign(&mut self, rhs: Self) {
		self.remaining += rhs.remaining;
		self.completed += rhs.completed;
		self.failed += rhs.failed;
		self.warning += rhs.warning;
	}
}

/// C-MOVE-RSP or C-GET-RSP
#[derive(Debug, Clone)]
pub struct CompositeRetrieveResponse {
	pub status: US,
	pub counters: SubOperationCounters,
}

impl CompositeRetrieveResponse {
	pub(crate) fn parse(message: &DicomMessage, command_field: US) -> Result<Self, ReadError> {
		match message.command_field() {
			Some(field) if field == command_field => {}
			Some(other) => return Err(ReadError::UnexpectedCommand(other)),
			None => return Err(ReadError::MissingAttribute(tags::COMMAND_FIELD)),
		}
		let status = message
			.status()
			.ok_or(ReadError::MissingAttribute(tags::STATUS))?;

		Ok(Self {
			status,
			counters: SubOperationCounters::from_command(&message.command),
		})
	}
}

impl TryFrom<DicomMessage> for CompositeRetrieveResponse {
	type Error = ReadError;

	fn try_from(message: DicomMessage) -> Result<Self, Self::Error> {
		Self::parse(&message, COMMAND_FIELD_COMPOSITE_MOVE_RESPONSE)
	}
}
