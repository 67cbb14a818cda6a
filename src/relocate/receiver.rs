use crate::config::DimseServerConfig;
use crate::dimse::cstore::storescp::StoreServiceClassProvider;
use crate::dimse::cstore::{ReceivedObject, StoreHandler, StoreRejected};
use crate::relocate::progress::MoveCounters;
use crate::relocate::queue::{WorkItem, WorkQueue};
use crate::relocate::{AbortSignal, MovedObject};
use crate::types::UI;
use dicom::dictionary_std::tags;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum ReceiveError {
	#[error("Failed to bind the receiver to {address}: {source}")]
	Bind {
		address: SocketAddr,
		source: std::io::Error,
	},
}

/// The receiver role. Every accepted instance becomes a [`WorkItem::Data`] on the session queue.
#[derive(Clone)]
pub struct Receiver {
	pub queue: Arc<WorkQueue>,
	pub counters: Arc<MoveCounters>,
	pub abort: AbortSignal,
	/// Instances of other studies are rejected.
	pub study_instance_uid: UI,
}

impl Receiver {
	fn accept(&self, object: ReceivedObject) -> Result<(), StoreRejected> {
		if self.abort.is_aborted() {
			return Err(StoreRejected {
				sop_instance_uid: object.sop_instance_uid,
				reason: String::from("the relocation was aborted"),
			});
		}

		let study_instance_uid = object
			.data
			.get(tags::STUDY_INSTANCE_UID)
			.and_then(|element| element.to_str().ok())
			.map(|value| value.trim_end_matches(['\0', ' ']).to_owned());
		if study_instance_uid.as_deref() != Some(self.study_instance_uid.as_str()) {
			return Err(StoreRejected {
				sop_instance_uid: object.sop_instance_uid,
				reason: format!(
					"study {} is not being relocated",
					study_instance_uid.unwrap_or_default()
				),
			});
		}

		debug!(
			sop_instance_uid = object.sop_instance_uid,
			calling_aet = object.calling_aet,
			"Queued instance"
		);
		MoveCounters::increment(&self.counters.received);
		self.queue.push(WorkItem::Data(MovedObject::from(object)));
		Ok(())
	}

	/// The callback for the STORE-SCP or the C-STORE sub-operations of a C-GET.
	pub fn handler(&self) -> StoreHandler {
		let receiver = self.clone();
		Arc::new(move |object| receiver.accept(object))
	}

	/// Binds the STORE-SCP that receives the C-MOVE sub-operations.
	pub async fn listen(&self, config: &DimseServerConfig) -> Result<ReceiverHandle, ReceiveError> {
		let address = config.address();
		let listener = TcpListener::bind(address)
			.await
			.map_err(|source| ReceiveError::Bind { address, source })?;

		let provider = StoreServiceClassProvider::new(
			self.handler(),
			config.aet.clone(),
			config.uncompressed,
			Duration::from_millis(config.release_timeout),
		);
		let (shutdown, stopped) = watch::channel(false);
		let grace = Duration::from_millis(config.release_timeout);
		let task = tokio::spawn(async move { provider.serve(listener, stopped, grace).await });

		Ok(ReceiverHandle { shutdown, task })
	}
}

/// A running STORE-SCP.
pub struct ReceiverHandle {
	shutdown: watch::Sender<bool>,
	task: JoinHandle<()>,
}

impl ReceiverHandle {
	/// Stops accepting associations and waits for the open ones within the configured grace period.
	pub async fn stop(self) {
		self.shutdown.send_replace(true);
		if let Err(err) = self.task.await {
			warn!("Receiver task did not finish: {err}");
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::relocate::queue::tests::moved_object;
	use std::net::{IpAddr, Ipv4Addr};

	fn received(study: &str, instance: &str) -> ReceivedObject {
		let object = moved_object(study, "1.1.1", instance);
		ReceivedObject {
			message_id: 1,
			sop_class_uid: object.sop_class_uid,
			sop_instance_uid: object.sop_instance_uid,
			transfer_syntax: object.transfer_syntax,
			calling_aet: String::from("SOURCE"),
			data: object.data,
		}
	}

	fn receiver() -> Receiver {
		Receiver {
			queue: Arc::new(WorkQueue::new()),
			counters: Arc::new(MoveCounters::default()),
			abort: AbortSignal::new(),
			study_instance_uid: UI::from("1.1"),
		}
	}

	#[tokio::test]
	async fn handler_queues_instances() {
		let receiver = receiver();
		let handler = receiver.handler();

		handler(received("1.1", "1.1.1.1")).unwrap();
		handler(received("1.1", "1.1.1.2")).unwrap();

		assert_eq!(receiver.queue.len(), 2);
		assert_eq!(receiver.counters.snapshot().received, 2);
		match receiver.queue.pop().await {
			WorkItem::Data(object) => assert_eq!(object.sop_instance_uid, "1.1.1.1"),
			WorkItem::Stop => panic!("expected data"),
		}
	}

	#[test]
	fn handler_rejects_foreign_studies() {
		let receiver = receiver();
		let rejected = (receiver.handler())(received("9.9", "9.9.1.1")).unwrap_err();
		assert_eq!(rejected.sop_instance_uid, "9.9.1.1");
		assert!(receiver.queue.is_empty());
		assert_eq!(receiver.counters.snapshot().received, 0);
	}

	#[test]
	fn handler_rejects_after_abort() {
		let receiver = receiver();
		receiver.abort.abort();
		assert!((receiver.handler())(received("1.1", "1.1.1.1")).is_err());
		assert!(receiver.queue.is_empty());
	}

	#[tokio::test]
	async fn listener_stops_on_shutdown() {
		let config = DimseServerConfig {
			aet: String::from("RELOCATE"),
			interface: IpAddr::V4(Ipv4Addr::LOCALHOST),
			port: 0,
			uncompressed: false,
			release_timeout: 100,
		};
		let handle = receiver().listen(&config).await.unwrap();
		tokio::time::timeout(Duration::from_secs(2), handle.stop())
			.await
			.unwrap();
	}
}
