use crate::dimse::association::client::ClientAssociation;
use crate::dimse::association::{Association, AssociationError, Connector, PresentationParameter};
use crate::dimse::cstore::{CompositeStoreRequest, CompositeStoreResponse};
use crate::dimse::{
	next_message_id, DicomMessageReader, DicomMessageWriter, NegotiationError, ReadError,
	WriteError,
};
use crate::types::{Priority, UI, US};
use dicom::dictionary_std::uids;
use dicom::encoding::TransferSyntaxIndex;
use dicom::object::InMemDicomObject;
use dicom::transfer_syntax::TransferSyntaxRegistry;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, instrument, trace};

/// Key of a cached association: the SOP class plus the transfer syntax for encapsulated data.
/// Uncompressed data can be re-encoded in any uncompressed transfer syntax, so it shares one key.
type AssociationKey = (UI, Option<UI>);

/// Stores instances at a single destination.
/// Associations are kept open per SOP class and reused for subsequent instances.
pub struct StoreServiceClassUser {
	connector: Connector,
	timeout: Duration,
	associations: HashMap<AssociationKey, ClientAssociation>,
}

pub struct StoreInstance<'a> {
	pub sop_class_uid: &'a str,
	pub sop_instance_uid: &'a str,
	pub transfer_syntax: &'a str,
	pub data_set: InMemDicomObject,
}

impl StoreServiceClassUser {
	pub fn new(connector: Connector, timeout: Duration) -> Self {
		Self {
			connector,
			timeout,
			associations: HashMap::new(),
		}
	}

	fn presentation(sop_class_uid: &str, transfer_syntax: &str) -> (AssociationKey, PresentationParameter) {
		let codec_free = TransferSyntaxRegistry
			.get(transfer_syntax)
			.is_some_and(|ts| ts.is_codec_free());

		if codec_free {
			let mut transfer_syntaxes = vec![UI::from(transfer_syntax)];
			for fallback in [uids::EXPLICIT_VR_LITTLE_ENDIAN, uids::IMPLICIT_VR_LITTLE_ENDIAN] {
				if fallback != transfer_syntax {
					transfer_syntaxes.push(UI::from(fallback));
				}
			}
			(
				(UI::from(sop_class_uid), None),
				PresentationParameter::new(sop_class_uid, transfer_syntaxes),
			)
		} else {
			(
				(UI::from(sop_class_uid), Some(UI::from(transfer_syntax))),
				PresentationParameter::new(sop_class_uid, vec![UI::from(transfer_syntax)]),
			)
		}
	}

	/// Sends a C-STORE-RQ and returns the status of the C-STORE-RSP.
	#[instrument(skip_all, name = "STORE-SCU", fields(sop_instance_uid = instance.sop_instance_uid))]
	pub async fn store(&mut self, instance: StoreInstance<'_>) -> Result<US, StoreError> {
		let (key, presentation) = Self::presentation(instance.sop_class_uid, instance.transfer_syntax);

		if !self.associations.contains_key(&key) {
			let association = self.connector.connect(vec![presentation]).await?;
			self.associations.insert(key.clone(), association);
		}
		let Some(association) = self.associations.get(&key) else {
			return Err(StoreError::Negotiation(NegotiationError::NoPresentationContext));
		};

		let presentation_context = association.presentation_context_for(instance.sop_class_uid)?;
		if key.1.as_deref().is_some_and(|ts| ts != presentation_context.transfer_syntax.trim_end_matches('\0')) {
			return Err(StoreError::UnsupportedTransferSyntax(UI::from(
				instance.transfer_syntax,
			)));
		}

		let request = CompositeStoreRequest {
			affected_sop_class_uid: UI::from(instance.sop_class_uid),
			affected_sop_instance_uid: UI::from(instance.sop_instance_uid),
			priority: Priority::Medium as US,
			message_id: next_message_id(),
			move_originator_aet: None,
			move_originator_message_id: None,
			data_set: instance.data_set,
			presentation_context_id: Some(presentation_context.id),
		};

		let result = async {
			association.write_message(request, None, self.timeout).await?;
			trace!("Sent C-STORE-RQ");
			let response = association.read_message(self.timeout).await?;
			let response = CompositeStoreResponse::try_from(response)?;
			debug!(status = response.status, "Received C-STORE-RSP");
			Ok::<_, StoreError>(response.status)
		}
		.await;

		if result.is_err() {
			// The association is in an undefined state after a transport error.
			self.associations.remove(&key);
		}
		result
	}

	/// Releases all open associations.
	pub async fn release(&mut self) {
		for (_, association) in self.associations.drain() {
			if let Err(err) = association.release(self.timeout).await {
				debug!("Failed to release C-STORE association: {err}");
			}
		}
	}
}

#[derive(Debug, Error)]
pub enum StoreError {
	#[error(transparent)]
	Read(#[from] ReadError),
	#[error(transparent)]
	Write(#[from] WriteError),
	#[error(transparent)]
	Association(#[from] AssociationError),
	#[error(transparent)]
	Negotiation(#[from] NegotiationError),
	#[error("The destination does not accept transfer syntax {0}")]
	UnsupportedTransferSyntax(UI),
}
