use crate::dimse::NegotiationError;
use crate::types::{AE, UI};
use client::{ClientAssociation, ClientAssociationOptions};
use dicom::ul::pdu::PresentationContextNegotiated;
use dicom::ul::Pdu;
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::Sender;
use tokio::sync::oneshot;
use tracing::{info, warn};

pub mod client;
pub mod server;

#[derive(Debug, Error)]
pub enum AssociationError {
	#[error(transparent)]
	Channel(#[from] ChannelError),
	#[error("Failed to spawn thread")]
	OsThread(std::io::Error),
	#[error("Failed to write P-DATA chunk: {0}")]
	ChunkWriter(std::io::Error),
	#[error(transparent)]
	Association(#[from] dicom::ul::association::Error),
}

pub trait Association {
	fn receive(
		&self,
		timeout: Duration,
	) -> impl Future<Output = Result<Pdu, AssociationError>> + Send;

	fn send(
		&self,
		pdu: Pdu,
		timeout: Duration,
	) -> impl Future<Output = Result<(), AssociationError>> + Send;

	fn close(&mut self);

	fn presentation_contexts(&self) -> &[PresentationContextNegotiated];

	/// Finds the accepted presentation context for the given abstract syntax.
	fn presentation_context_for(
		&self,
		abstract_syntax: &str,
	) -> Result<&PresentationContextNegotiated, NegotiationError> {
		self.presentation_contexts()
			.iter()
			.find(|pctx| pctx.abstract_syntax.trim_end_matches('\0') == abstract_syntax)
			.ok_or_else(|| NegotiationError::AbstractSyntaxRejected(UI::from(abstract_syntax)))
	}
}

#[derive(Debug)]
pub enum Command {
	Send(Pdu, oneshot::Sender<Result<(), AssociationError>>),
	Receive(oneshot::Sender<Result<Pdu, AssociationError>>),
	Release(oneshot::Sender<Result<(), AssociationError>>),
}

#[derive(Debug, Error)]
pub enum ChannelError {
	#[error("Timed out")]
	Timeout,
	#[error("Channel is closed")]
	Closed,
}

pub trait AskPattern<T> {
	async fn ask<R>(
		&self,
		command: impl FnOnce(oneshot::Sender<R>) -> T,
		timeout: Duration,
	) -> Result<R, ChannelError>;
}

impl<T> AskPattern<T> for Sender<T> {
	async fn ask<R>(
		&self,
		command: impl FnOnce(oneshot::Sender<R>) -> T,
		timeout: Duration,
	) -> Result<R, ChannelError> {
		let (tx, rx) = oneshot::channel();
		tokio::time::timeout(timeout, async {
			self.send(command(tx))
				.await
				.map_err(|_| ChannelError::Closed)?;

			rx.await.map_err(|_| ChannelError::Closed)
		})
		.await
		.map_err(|_| ChannelError::Timeout)?
	}
}

/// An abstract syntax together with the transfer syntaxes proposed for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresentationParameter {
	pub abstract_syntax_uid: UI,
	pub transfer_syntax_uids: Vec<UI>,
}

impl PresentationParameter {
	pub fn new(abstract_syntax_uid: impl Into<UI>, transfer_syntax_uids: Vec<UI>) -> Self {
		Self {
			abstract_syntax_uid: abstract_syntax_uid.into(),
			transfer_syntax_uids,
		}
	}
}

/// Establishes client associations with a single remote application entity.
#[derive(Debug, Clone)]
pub struct Connector {
	pub calling_aet: AE,
	pub called_aet: AE,
	pub address: SocketAddr,
}

impl Connector {
	pub const fn new(calling_aet: AE, called_aet: AE, address: SocketAddr) -> Self {
		Self {
			calling_aet,
			called_aet,
			address,
		}
	}

	pub async fn connect(
		&self,
		presentation_contexts: Vec<PresentationParameter>,
	) -> Result<ClientAssociation, AssociationError> {
		let options = ClientAssociationOptions {
			calling_aet: self.calling_aet.clone(),
			called_aet: self.called_aet.clone(),
			presentation_contexts,
			address: self.address,
		};

		let association = ClientAssociation::new(options).await;
		match &association {
			Ok(association) => info!(
				backend_uuid = association.uuid().to_string(),
				called_aet = self.called_aet,
				"Created new client association"
			),
			Err(err) => warn!(
				called_aet = self.called_aet,
				"Failed to create new client association: {err}"
			),
		}
		association
	}
}
