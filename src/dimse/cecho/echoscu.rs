use std::time::Duration;

use dicom::dictionary_std::uids;
use thiserror::Error;
use tracing::{debug, instrument, trace};

use super::{CompositeEchoRequest, CompositeEchoResponse};
use crate::dimse::association::Association;
use crate::dimse::{
	next_message_id, DicomMessageReader, DicomMessageWriter, NegotiationError, ReadError,
	StatusType, WriteError,
};

/// Service class user for the Verification SOP class.
/// It simply sends a C-ECHO-RQ and waits for a C-ECHO-RSP.
/// The response contains the Status attribute that indicates the current connection status.
pub struct EchoServiceClassUser<'a, A> {
	association: &'a A,
}

impl<'a, A: Association> EchoServiceClassUser<'a, A> {
	pub const fn new(association: &'a A) -> Self {
		Self { association }
	}

	/// Initiates the C-ECHO protocol.
	#[instrument(skip_all, name = "ECHO-SCU")]
	pub async fn echo(&self, timeout: Duration) -> Result<bool, EchoError> {
		trace!("Initiated C-ECHO protocol");
		let presentation_context = self
			.association
			.presentation_context_for(uids::VERIFICATION)?;
		let request = CompositeEchoRequest {
			message_id: next_message_id(),
			presentation_context_id: presentation_context.id,
		};
		self.association
			.write_message(request, None, timeout)
			.await?;

		let response = self.association.read_message(timeout).await?;
		let response = CompositeEchoResponse::try_from(response)?;

		let status_type = StatusType::from_code(Some(response.status));

		debug!(
			status = response.status,
			"Received C-ECHO-RSP ({status_type:?})"
		);
		Ok(status_type == StatusType::Success)
	}
}

/// Errors that can occur for the echoscu.
#[derive(Debug, Error)]
pub enum EchoError {
	#[error(transparent)]
	Write(#[from] WriteError),
	#[error(transparent)]
	Read(#[from] ReadError),
	#[error(transparent)]
	Negotiation(#[from] NegotiationError),
}
