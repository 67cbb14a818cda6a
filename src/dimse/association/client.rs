use dicom::ul::pdu::{PDataValueType, PresentationContextNegotiated};
use dicom::ul::Pdu;
use std::convert::identity;
use std::io::Write;
use std::net::{SocketAddr, TcpStream};
use std::thread;
use std::time::Duration;
use tokio::sync::mpsc::Sender;
use tokio::sync::oneshot;
use tracing::{debug, error};
use uuid::Uuid;

use super::{
	AskPattern, Association, AssociationError, ChannelError, Command, PresentationParameter,
};

type UlClientAssociation = dicom::ul::ClientAssociation<TcpStream>;

/// A client association whose blocking I/O runs on a dedicated OS thread.
pub struct ClientAssociation {
	channel: Sender<Command>,
	uuid: Uuid,
	tcp_stream: TcpStream,
	presentation_contexts: Vec<PresentationContextNegotiated>,
}

pub struct ClientAssociationOptions {
	pub calling_aet: String,
	pub called_aet: String,
	pub presentation_contexts: Vec<PresentationParameter>,
	pub address: SocketAddr,
}

impl ClientAssociation {
	fn chunked_send(association: &mut UlClientAssociation, pdu: &Pdu) -> Result<(), AssociationError> {
		match &pdu {
			Pdu::PData { data } => {
				let is_command = data
					.first()
					.is_some_and(|pdv| pdv.value_type == PDataValueType::Command);
				let data_length: usize = data.iter().map(|pdv| pdv.data.len()).sum();
				if is_command || data_length <= association.acceptor_max_pdu_length() as usize {
					return association.send(pdu).map_err(AssociationError::Association);
				}
				for pdv in data {
					let mut writer = association.send_pdata(pdv.presentation_context_id);
					writer
						.write_all(&pdv.data)
						.map_err(AssociationError::ChunkWriter)?;
				}
				Ok(())
			}
			_ => association.send(pdu).map_err(AssociationError::Association),
		}
	}

	pub async fn new(options: ClientAssociationOptions) -> Result<Self, AssociationError> {
		let uuid = Uuid::new_v4();
		let (tx, mut rx) = tokio::sync::mpsc::channel::<Command>(1);
		let (connect_tx, connect_result) = oneshot::channel::<Result<_, AssociationError>>();

		let address = options.address;
		let mut ul_options = dicom::ul::ClientAssociationOptions::new()
			.calling_ae_title(options.calling_aet)
			.called_ae_title(options.called_aet.clone());
		for presentation in options.presentation_contexts {
			ul_options = ul_options.with_presentation_context(
				presentation.abstract_syntax_uid,
				presentation.transfer_syntax_uids,
			);
		}

		let _handle = thread::Builder::new()
			.name(format!("{}-client", options.called_aet))
			.spawn(move || {
				let mut association = match ul_options.establish(address) {
					Ok(mut association) => {
						let presentation_contexts = association.presentation_contexts().to_vec();
						let stream = match association.inner_stream().try_clone() {
							Ok(stream) => stream,
							Err(err) => {
								let _ = connect_tx.send(Err(AssociationError::OsThread(err)));
								return Err(());
							}
						};

						connect_tx
							.send(Ok((stream, presentation_contexts)))
							.map_err(|_| ())?;

						association
					}
					Err(e) => {
						error!(backend_uuid = uuid.to_string(), "Failed to connect: {e}");
						connect_tx.send(Err(e.into())).map_err(|_| ())?;
						return Err(());
					}
				};

				while let Some(command) = rx.blocking_recv() {
					let result = match command {
						Command::Send(pdu, reply_to) => {
							let send_result = Self::chunked_send(&mut association, &pdu);
							reply_to.send(send_result).map_err(|_| ChannelError::Closed)
						}
						Command::Receive(reply_to) => {
							let receive_result = association
								.receive()
								.map_err(AssociationError::Association);
							reply_to
								.send(receive_result)
								.map_err(|_| ChannelError::Closed)
						}
						Command::Release(reply_to) => {
							let release_result =
								association.release().map_err(AssociationError::Association);
							let _ = reply_to.send(release_result);
							return Ok(());
						}
					};
					if let Some(err) = result.err() {
						error!(
							backend_uuid = uuid.to_string(),
							"Error in ClientAssociation backend: {err}"
						);
						return Err(());
					}
				}

				rx.close();

				if let Err(err) = association.abort() {
					debug!(
						backend_uuid = uuid.to_string(),
						"Failed to abort ClientAssociation: {err}"
					);
				}

				Ok(())
			})
			.map_err(AssociationError::OsThread)?;

		let (tcp_stream, presentation_contexts) = connect_result
			.await
			.map_err(|_| ChannelError::Closed)??;

		Ok(Self {
			channel: tx,
			uuid,
			tcp_stream,
			presentation_contexts,
		})
	}

	pub const fn uuid(&self) -> &Uuid {
		&self.uuid
	}

	/// Gracefully releases the association and waits for the peer's A-RELEASE-RP.
	pub async fn release(self, timeout: Duration) -> Result<(), AssociationError> {
		self.channel
			.ask(Command::Release, timeout)
			.await
			.map_err(AssociationError::Channel)
			.and_then(identity)
	}
}

impl Drop for ClientAssociation {
	fn drop(&mut self) {
		self.close();
	}
}

impl Association for ClientAssociation {
	async fn receive(&self, timeout: Duration) -> Result<Pdu, AssociationError> {
		self.channel
			.ask(Command::Receive, timeout)
			.await
			.map_err(AssociationError::Channel)
			.and_then(identity)
	}

	async fn send(&self, pdu: Pdu, timeout: Duration) -> Result<(), AssociationError> {
		self.channel
			.ask(|reply_to| Command::Send(pdu, reply_to), timeout)
			.await
			.map_err(AssociationError::Channel)
			.and_then(identity)
	}

	fn close(&mut self) {
		if let Err(err) = self.tcp_stream.shutdown(std::net::Shutdown::Both) {
			debug!(
				backend_uuid = self.uuid.to_string(),
				"Failed to shutdown TcpStream: {err}"
			);
		}
	}

	fn presentation_contexts(&self) -> &[PresentationContextNegotiated] {
		&self.presentation_contexts
	}
}
