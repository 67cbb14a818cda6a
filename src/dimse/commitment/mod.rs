//! Storage Commitment Push Model (N-ACTION / N-EVENT-REPORT).
//! <https://dicom.nema.org/medical/dicom/current/output/chtml/part04/chapter_J.html>

use crate::dimse::{DicomMessage, ReadError, DATA_SET_EXISTS, DATA_SET_MISSING};
use crate::types::{UI, US};
use dicom::core::value::DataSetSequence;
use dicom::core::{DataElement, VR};
use dicom::dicom_value;
use dicom::dictionary_std::tags;
use dicom::object::InMemDicomObject;

pub mod commitmentscu;

// Magic numbers defined by the DICOM specification.
pub const COMMAND_FIELD_N_ACTION_REQUEST: US = 0x0130;
pub const COMMAND_FIELD_N_ACTION_RESPONSE: US = 0x8130;
pub const COMMAND_FIELD_N_EVENT_REPORT_REQUEST: US = 0x0100;
pub const COMMAND_FIELD_N_EVENT_REPORT_RESPONSE: US = 0x8100;

pub const STORAGE_COMMITMENT_PUSH_MODEL: &str = "1.2.840.10008.1.20.1";
/// Well-known SOP instance of the Storage Commitment Push Model.
pub const STORAGE_COMMITMENT_PUSH_MODEL_INSTANCE: &str = "1.2.840.10008.1.20.1.1";

const ACTION_TYPE_REQUEST_COMMITMENT: US = 1;
const EVENT_TYPE_FAILURES_EXIST: US = 2;

/// A stored instance referenced in a commitment request or result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SopReference {
	pub sop_class_uid: UI,
	pub sop_instance_uid: UI,
}

impl SopReference {
	#[rustfmt::skip]
	fn to_item(&self) -> InMemDicomObject {
		InMemDicomObject::from_element_iter([
			DataElement::new(tags::REFERENCED_SOP_CLASS_UID, VR::UI, dicom_value!(Str, self.sop_class_uid.clone())),
			DataElement::new(tags::REFERENCED_SOP_INSTANCE_UID, VR::UI, dicom_value!(Str, self.sop_instance_uid.clone())),
		])
	}
}

/// N-ACTION-RQ asking the destination to commit the referenced instances.
pub struct CommitmentActionRequest {
	pub message_id: US,
	pub transaction_uid: UI,
	pub references: Vec<SopReference>,
}

impl From<CommitmentActionRequest> for DicomMessage {
	#[rustfmt::skip]
	fn from(request: CommitmentActionRequest) -> Self {
		let command = InMemDicomObject::command_from_element_iter([
			DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [COMMAND_FIELD_N_ACTION_REQUEST])),
			DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [request.message_id])),
			DataElement::new(tags::REQUESTED_SOP_CLASS_UID, VR::UI, dicom_value!(Str, STORAGE_COMMITMENT_PUSH_MODEL)),
			DataElement::new(tags::REQUESTED_SOP_INSTANCE_UID, VR::UI, dicom_value!(Str, STORAGE_COMMITMENT_PUSH_MODEL_INSTANCE)),
			DataElement::new(tags::ACTION_TYPE_ID, VR::US, dicom_value!(U16, [ACTION_TYPE_REQUEST_COMMITMENT])),
			DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, dicom_value!(U16, [DATA_SET_EXISTS])),
		]);

		let items: Vec<InMemDicomObject> = request.references.iter().map(SopReference::to_item).collect();
		let data = InMemDicomObject::from_element_iter([
			DataElement::new(tags::TRANSACTION_UID, VR::UI, dicom_value!(Str, request.transaction_uid)),
			DataElement::new(tags::REFERENCED_SOP_SEQUENCE, VR::SQ, DataSetSequence::from(items)),
		]);

		Self {
			command,
			data: Some(data),
			presentation_context_id: None,
		}
	}
}

/// N-ACTION-RSP
#[derive(Debug)]
pub struct CommitmentActionResponse {
	pub status: US,
}

impl TryFrom<DicomMessage> for CommitmentActionResponse {
	type Error = ReadError;

	fn try_from(message: DicomMessage) -> Result<Self, Self::Error> {
		match message.command_field() {
			Some(COMMAND_FIELD_N_ACTION_RESPONSE) => {}
			Some(other) => return Err(ReadError::UnexpectedCommand(other)),
			None => return Err(ReadError::MissingAttribute(tags::COMMAND_FIELD)),
		}
		let status = message
			.status()
			.ok_or(ReadError::MissingAttribute(tags::STATUS))?;
		Ok(Self { status })
	}
}

/// An instance the destination refused to commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitmentFailure {
	pub reference: SopReference,
	pub failure_reason: Option<US>,
}

/// N-EVENT-REPORT-RQ carrying the outcome of a commitment transaction.
#[derive(Debug)]
pub struct CommitmentEventReport {
	pub message_id: US,
	pub event_type_id: US,
	pub transaction_uid: Option<UI>,
	pub committed: Vec<SopReference>,
	pub failed: Vec<CommitmentFailure>,
}

impl CommitmentEventReport {
	/// Whether the destination reports failures for at least one instance.
	pub fn has_failures(&self) -> bool {
		self.event_type_id == EVENT_TYPE_FAILURES_EXIST || !self.failed.is_empty()
	}

	/// The N-EVENT-REPORT-RSP acknowledging this report.
	pub fn response(&self) -> CommitmentEventReportResponse {
		CommitmentEventReportResponse {
			message_id: self.message_id,
			event_type_id: self.event_type_id,
		}
	}
}

fn read_references(data: &InMemDicomObject, sequence: dicom::core::Tag) -> Vec<(SopReference, Option<US>)> {
	data.get(sequence)
		.and_then(|element| element.items())
		.unwrap_or_default()
		.iter()
		.filter_map(|item| {
			let read = |tag| {
				item.get(tag)
					.and_then(|element| element.to_str().ok())
					.map(|value| value.trim_end_matches(['\0', ' ']).to_owned())
			};
			let reference = SopReference {
				sop_class_uid: read(tags::REFERENCED_SOP_CLASS_UID).unwrap_or_default(),
				sop_instance_uid: read(tags::REFERENCED_SOP_INSTANCE_UID)?,
			};
			let reason = item
				.get(tags::FAILURE_REASON)
				.and_then(|element| element.to_int::<US>().ok());
			Some((reference, reason))
		})
		.collect()
}

impl TryFrom<DicomMessage> for CommitmentEventReport {
	type Error = ReadError;

	fn try_from(message: DicomMessage) -> Result<Self, Self::Error> {
		match message.command_field() {
			Some(COMMAND_FIELD_N_EVENT_REPORT_REQUEST) => {}
			Some(other) => return Err(ReadError::UnexpectedCommand(other)),
			None => return Err(ReadError::MissingAttribute(tags::COMMAND_FIELD)),
		}
		let event_type_id = message
			.command_int(tags::EVENT_TYPE_ID)
			.ok_or(ReadError::MissingAttribute(tags::EVENT_TYPE_ID))?;
		let message_id = message.command_int(tags::MESSAGE_ID).unwrap_or(0);

		let data = message.data.unwrap_or_else(InMemDicomObject::new_empty);
		let transaction_uid = data
			.get(tags::TRANSACTION_UID)
			.and_then(|element| element.to_str().ok())
			.map(|value| value.trim_end_matches(['\0', ' ']).to_owned());
		let committed = read_references(&data, tags::REFERENCED_SOP_SEQUENCE)
			.into_iter()
			.map(|(reference, _)| reference)
			.collect();
		let failed = read_references(&data, tags::FAILED_SOP_SEQUENCE)
			.into_iter()
			.map(|(reference, failure_reason)| CommitmentFailure {
				reference,
				failure_reason,
			})
			.collect();

		Ok(Self {
			message_id,
			event_type_id,
			transaction_uid,
			committed,
			failed,
		})
	}
}

/// N-EVENT-REPORT-RSP
pub struct CommitmentEventReportResponse {
	pub message_id: US,
	pub event_type_id: US,
}

impl From<CommitmentEventReportResponse> for DicomMessage {
	#[rustfmt::skip]
	fn from(response: CommitmentEventReportResponse) -> Self {
		let command = InMemDicomObject::command_from_element_iter([
			DataElement::new(tags::AFFECTED_SOP_CLASS_UID, VR::UI, dicom_value!(Str, STORAGE_COMMITMENT_PUSH_MODEL)),
			DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [COMMAND_FIELD_N_EVENT_REPORT_RESPONSE])),
			DataElement::new(tags::MESSAGE_ID_BEING_RESPONDED_TO, VR::US, dicom_value!(U16, [response.message_id])),
			DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, dicom_value!(U16, [DATA_SET_MISSING])),
			DataElement::new(tags::STATUS, VR::US, dicom_value!(U16, [0])),
			DataElement::new(tags::AFFECTED_SOP_INSTANCE_UID, VR::UI, dicom_value!(Str, STORAGE_COMMITMENT_PUSH_MODEL_INSTANCE)),
			DataElement::new(tags::EVENT_TYPE_ID, VR::US, dicom_value!(U16, [response.event_type_id])),
		]);

		Self {
			command,
			data: None,
			presentation_context_id: None,
		}
	}
}
