use crate::dimse::association::server::{ServerAssociation, ServerAssociationOptions};
use crate::dimse::association::Association;
use crate::dimse::cecho::{CompositeEchoResponse, COMMAND_FIELD_COMPOSITE_ECHO_REQUEST};
use crate::dimse::cstore::{
	ReceivedObject, StoreHandler, COMMAND_FIELD_COMPOSITE_STORE_REQUEST, STATUS_PROCESSING_FAILURE,
};
use crate::dimse::{DicomMessageReader, DicomMessageWriter, ReadError};
use crate::types::AE;
use anyhow::Context;
use dicom::dictionary_std::tags;
use dicom::ul::Pdu;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, info_span, instrument, warn, Instrument};

/// Accepts C-STORE-RQs from any peer and hands every instance to a [`StoreHandler`].
pub struct StoreServiceClassProvider {
	inner: Arc<InnerStoreServiceClassProvider>,
}

struct InnerStoreServiceClassProvider {
	handler: StoreHandler,
	aet: AE,
	uncompressed: bool,
	timeout: Duration,
}

impl StoreServiceClassProvider {
	pub fn new(handler: StoreHandler, aet: AE, uncompressed: bool, timeout: Duration) -> Self {
		Self {
			inner: Arc::new(InnerStoreServiceClassProvider {
				handler,
				aet,
				uncompressed,
				timeout,
			}),
		}
	}

	/// Accepts associations until `shutdown` turns true.
	/// Associations that are still open afterwards get `grace` to finish before they are aborted.
	pub async fn serve(
		&self,
		listener: TcpListener,
		mut shutdown: watch::Receiver<bool>,
		grace: Duration,
	) {
		if let Ok(address) = listener.local_addr() {
			info!("Started Store Service Class Provider on {address}");
		}
		let mut associations = JoinSet::new();

		loop {
			tokio::select! {
				_ = shutdown.wait_for(|stop| *stop) => break,
				Some(_) = associations.join_next(), if !associations.is_empty() => {}
				accepted = listener.accept() => match accepted {
					Ok((stream, peer)) => {
						let span = info_span!("STORE-SCP", aet = &self.inner.aet, peer = peer.to_string());
						info!("Accepted incoming connection from {peer}");
						let inner = Arc::clone(&self.inner);
						associations.spawn(async move {
							if let Err(err) = Self::process(stream, inner).instrument(span).await {
								error!("{err:#}");
							}
						});
					}
					Err(err) => error!("Failed to accept incoming connection: {err}"),
				},
			}
		}

		drop(listener);
		let drained = tokio::time::timeout(grace, async {
			while associations.join_next().await.is_some() {}
		})
		.await;
		if drained.is_err() {
			warn!(
				open = associations.len(),
				"Aborting associations that did not finish in time"
			);
			associations.abort_all();
		}
		info!("Stopped Store Service Class Provider");
	}

	#[instrument(skip_all)]
	async fn process(
		stream: TcpStream,
		inner: Arc<InnerStoreServiceClassProvider>,
	) -> anyhow::Result<()> {
		let tcp_stream = stream.into_std()?;
		// dicom-ul performs blocking reads and writes on the association thread.
		tcp_stream.set_nonblocking(false)?;

		let options = ServerAssociationOptions {
			aet: inner.aet.clone(),
			tcp_stream,
			uncompressed: inner.uncompressed,
		};
		let association = ServerAssociation::new(options).await?;

		loop {
			// Duration::MAX to indefinitely wait for incoming messages
			let message = match association.read_message(Duration::MAX).await {
				Ok(message) => message,
				Err(ReadError::UnexpectedPdu(Pdu::ReleaseRQ)) => {
					association.send(Pdu::ReleaseRP, inner.timeout).await?;
					debug!("Association released by peer");
					break;
				}
				Err(ReadError::UnexpectedPdu(Pdu::AbortRQ { .. })) => {
					debug!("Association aborted by peer");
					break;
				}
				Err(ReadError::Association(err)) => {
					debug!("Association closed: {err}");
					break;
				}
				Err(err) => return Err(err.into()),
			};

			match message.command_field() {
				Some(COMMAND_FIELD_COMPOSITE_STORE_REQUEST) => {}
				Some(COMMAND_FIELD_COMPOSITE_ECHO_REQUEST) => {
					let response = CompositeEchoResponse {
						message_id: message.command_int(tags::MESSAGE_ID).unwrap_or(0),
						status: 0,
					};
					association
						.write_message(response, message.presentation_context_id, inner.timeout)
						.await?;
					continue;
				}
				Some(other) => {
					anyhow::bail!("Unexpected command field {other:#06x}, only C-STORE-RQ is supported")
				}
				None => anyhow::bail!("Missing tag COMMAND_FIELD (0000,0100)"),
			}

			let presentation_context_id = message.presentation_context_id;
			let pctx = association
				.presentation_contexts()
				.iter()
				.find(|pctx| Some(pctx.id) == presentation_context_id)
				.context("No presentation context available")?;
			debug!("Used transfer syntax {} to read message", pctx.transfer_syntax);

			let received =
				ReceivedObject::from_message(message, &pctx.transfer_syntax, association.calling_aet())?;
			info!(
				sop_instance_uid = received.sop_instance_uid,
				sop_class_uid = received.sop_class_uid,
				"Received instance"
			);

			let mut response = received.response(0);
			response.status = match (inner.handler)(received) {
				Ok(()) => 0,
				Err(rejected) => {
					warn!("{rejected}");
					STATUS_PROCESSING_FAILURE
				}
			};

			association
				.write_message(
					response,
					presentation_context_id,
					inner.timeout,
				)
				.await?;
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::dimse::association::Connector;
	use crate::dimse::cstore::storescu::{StoreInstance, StoreServiceClassUser};
	use crate::dimse::cstore::StoreRejected;
	use crate::relocate::queue::tests::moved_object;
	use std::sync::Mutex;

	#[tokio::test(flavor = "multi_thread")]
	async fn answers_stores_with_handler_status() {
		let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
		let address = listener.local_addr().unwrap();
		let accepted = Arc::new(Mutex::new(Vec::new()));
		let handler: StoreHandler = {
			let accepted = Arc::clone(&accepted);
			Arc::new(move |object: ReceivedObject| {
				if object.sop_instance_uid.starts_with("9.") {
					return Err(StoreRejected {
						sop_instance_uid: object.sop_instance_uid,
						reason: String::from("foreign study"),
					});
				}
				accepted.lock().unwrap().push(object.sop_instance_uid);
				Ok(())
			})
		};
		let provider =
			StoreServiceClassProvider::new(handler, AE::from("RELOCATE"), false, Duration::from_secs(2));
		let (shutdown, stopped) = watch::channel(false);
		let server = tokio::spawn(async move {
			provider.serve(listener, stopped, Duration::from_secs(2)).await;
		});

		let connector = Connector::new(AE::from("SOURCE"), AE::from("RELOCATE"), address);
		let mut scu = StoreServiceClassUser::new(connector, Duration::from_secs(5));
		for (instance, expected) in [("1.1.1.1", 0), ("9.9.1.1", STATUS_PROCESSING_FAILURE)] {
			let object = moved_object("1.1", "1.1.1", instance);
			let status = scu
				.store(StoreInstance {
					sop_class_uid: &object.sop_class_uid,
					sop_instance_uid: &object.sop_instance_uid,
					transfer_syntax: &object.transfer_syntax,
					data_set: object.data.clone(),
				})
				.await
				.unwrap();
			assert_eq!(status, expected, "{instance}");
		}
		scu.release().await;

		shutdown.send_replace(true);
		tokio::time::timeout(Duration::from_secs(5), server)
			.await
			.unwrap()
			.unwrap();
		assert_eq!(*accepted.lock().unwrap(), vec![String::from("1.1.1.1")]);
	}
}
