use crate::relocate::MovedObject;
use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};
use tokio::sync::Semaphore;

#[derive(Debug)]
pub enum WorkItem {
	Data(MovedObject),
	/// Wakes the transformer so it can check whether it may exit.
	Stop,
}

/// Unbounded FIFO between the receiver and the transformer.
/// Pushing never blocks, popping waits until an item is available.
#[derive(Debug)]
pub struct WorkQueue {
	items: Mutex<VecDeque<WorkItem>>,
	available: Semaphore,
}

impl Default for WorkQueue {
	fn default() -> Self {
		Self::new()
	}
}

impl WorkQueue {
	pub fn new() -> Self {
		Self {
			items: Mutex::new(VecDeque::new()),
			available: Semaphore::new(0),
		}
	}

	pub fn push(&self, item: WorkItem) {
		self.items
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.push_back(item);
		self.available.add_permits(1);
	}

	pub async fn pop(&self) -> WorkItem {
		match self.available.acquire().await {
			Ok(permit) => permit.forget(),
			// The semaphore is never closed.
			Err(_) => return WorkItem::Stop,
		}
		self.items
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.pop_front()
			.unwrap_or(WorkItem::Stop)
	}

	/// Whether real work is still waiting behind the head of the queue.
	pub fn has_data(&self) -> bool {
		self.items
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.iter()
			.any(|item| matches!(item, WorkItem::Data(_)))
	}

	pub fn len(&self) -> usize {
		self.items
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}
}
