use crate::relocate::orchestrator::MoveResult;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{info, warn};

/// Progress counters of one session. Every counter has exactly one writing role.
#[derive(Debug, Default)]
pub struct MoveCounters {
	/// Orchestrator: instances announced by the source.
	pub found: AtomicU64,
	/// Retrieval coordinator: completed and warning sub-operations.
	pub retrieved: AtomicU64,
	/// Receiver: instances pushed onto the work queue.
	pub received: AtomicU64,
	/// Transformer
	pub transformed: AtomicU64,
	/// Sender: instances the destination accepted.
	pub sent: AtomicU64,
	/// Sender: instances the destination accepted and, if enabled, committed.
	pub moved: AtomicU64,
	/// Sender
	pub commit_failures: AtomicU64,
	/// Retrieval coordinator: identifier sets skipped because the destination already has them.
	pub skipped: AtomicU64,
}

impl MoveCounters {
	pub fn increment(counter: &AtomicU64) {
		counter.fetch_add(1, Ordering::Release);
	}

	pub fn snapshot(&self) -> MoveCountersSnapshot {
		let read = |counter: &AtomicU64| counter.load(Ordering::Acquire);
		MoveCountersSnapshot {
			found: read(&self.found),
			retrieved: read(&self.retrieved),
			received: read(&self.received),
			transformed: read(&self.transformed),
			sent: read(&self.sent),
			moved: read(&self.moved),
			commit_failures: read(&self.commit_failures),
			skipped: read(&self.skipped),
		}
	}
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MoveCountersSnapshot {
	pub found: u64,
	pub retrieved: u64,
	pub received: u64,
	pub transformed: u64,
	pub sent: u64,
	pub moved: u64,
	pub commit_failures: u64,
	pub skipped: u64,
}

/// Receives progress of a relocation and may request its cancellation.
pub trait ProgressSink: Send + Sync {
	fn update(&self, counters: &MoveCountersSnapshot);

	fn is_cancel_requested(&self) -> bool;

	/// Called exactly once per relocation.
	fn finalize(&self, result: &MoveResult);
}

/// Logs progress with tracing. Cancellation can be requested through [`TracingProgressSink::cancel`].
#[derive(Debug, Default)]
pub struct TracingProgressSink {
	cancel: AtomicBool,
}

impl TracingProgressSink {
	pub fn cancel(&self) {
		self.cancel.store(true, Ordering::Release);
	}
}

impl ProgressSink for TracingProgressSink {
	fn update(&self, counters: &MoveCountersSnapshot) {
		info!(
			found = counters.found,
			received = counters.received,
			transformed = counters.transformed,
			sent = counters.sent,
			moved = counters.moved,
			"Relocation progress"
		);
	}

	fn is_cancel_requested(&self) -> bool {
		self.cancel.load(Ordering::Acquire)
	}

	fn finalize(&self, result: &MoveResult) {
		if result.success {
			info!(
				study_instance_uid = result.study_instance_uid,
				moved = result.counters.moved,
				"Relocation completed"
			);
		} else {
			warn!(
				study_instance_uid = result.study_instance_uid,
				error = result.error.as_deref().unwrap_or_default(),
				"Relocation failed"
			);
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn snapshot_reads_every_counter() {
		let counters = MoveCounters::default();
		counters.found.store(3, Ordering::Relaxed);
		MoveCounters::increment(&counters.received);
		MoveCounters::increment(&counters.received);
		MoveCounters::increment(&counters.sent);

		let snapshot = counters.snapshot();
		assert_eq!(snapshot.found, 3);
		assert_eq!(snapshot.received, 2);
		assert_eq!(snapshot.sent, 1);
		assert_eq!(snapshot.moved, 0);
	}

	#[test]
	fn tracing_sink_cancels_on_request() {
		let sink = TracingProgressSink::default();
		assert!(!sink.is_cancel_requested());
		sink.cancel();
		assert!(sink.is_cancel_requested());
	}
}
