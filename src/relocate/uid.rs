//! Old to new UID mapping for anonymized studies.
//!
//! Every relocation session owns one [`UidRemapper`]. Nodes are created the first time an old UID
//! is seen and live in an arena, so the study/series/instance tree can be walked in both directions.

use crate::types::{generate_uid, UI};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::sync::{Mutex, PoisonError};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UidKind {
	Study,
	Series,
	Instance,
}

impl UidKind {
	const fn parent(self) -> Option<Self> {
		match self {
			Self::Study => None,
			Self::Series => Some(Self::Study),
			Self::Instance => Some(Self::Series),
		}
	}
}

impl Display for UidKind {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		match self {
			Self::Study => write!(f, "study"),
			Self::Series => write!(f, "series"),
			Self::Instance => write!(f, "instance"),
		}
	}
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum UidError {
	#[error("Resolving a {0} UID requires the UID of its parent")]
	MissingParent(UidKind),
	#[error("Parent {parent_uid} of {kind} {uid} has not been resolved")]
	UnresolvedParent {
		kind: UidKind,
		uid: UI,
		parent_uid: UI,
	},
	#[error("{kind} {uid} was already resolved below another parent than {parent_uid}")]
	ParentMismatch {
		kind: UidKind,
		uid: UI,
		parent_uid: UI,
	},
}

type NodeId = usize;

#[derive(Debug)]
struct UidNode {
	kind: UidKind,
	old_uid: UI,
	new_uid: UI,
	parent: Option<NodeId>,
	children: Vec<NodeId>,
}

#[derive(Debug, Default)]
struct UidTree {
	nodes: Vec<UidNode>,
	studies: Vec<NodeId>,
	index: HashMap<(UidKind, UI), NodeId>,
}

impl UidTree {
	fn resolve(&mut self, kind: UidKind, old_uid: &str, parent_uid: Option<&str>) -> Result<NodeId, UidError> {
		let parent = match kind.parent() {
			None => None,
			Some(parent_kind) => {
				let parent_uid = parent_uid.ok_or(UidError::MissingParent(kind))?;
				let parent = self
					.index
					.get(&(parent_kind, UI::from(parent_uid)))
					.copied()
					.ok_or_else(|| UidError::UnresolvedParent {
						kind,
						uid: UI::from(old_uid),
						parent_uid: UI::from(parent_uid),
					})?;
				debug_assert_eq!(self.nodes[parent].kind, parent_kind);
				Some(parent)
			}
		};

		if let Some(&existing) = self.index.get(&(kind, UI::from(old_uid))) {
			if self.nodes[existing].parent != parent {
				return Err(UidError::ParentMismatch {
					kind,
					uid: UI::from(old_uid),
					parent_uid: parent_uid.map(UI::from).unwrap_or_default(),
				});
			}
			return Ok(existing);
		}

		let id = self.nodes.len();
		self.nodes.push(UidNode {
			kind,
			old_uid: UI::from(old_uid),
			new_uid: generate_uid(),
			parent,
			children: Vec::new(),
		});
		match parent {
			Some(parent) => self.nodes[parent].children.push(id),
			None => self.studies.push(id),
		}
		self.index.insert((kind, UI::from(old_uid)), id);
		Ok(id)
	}

	fn pair(&self, id: NodeId) -> UidPair {
		let node = &self.nodes[id];
		UidPair {
			old_uid: node.old_uid.clone(),
			new_uid: node.new_uid.clone(),
		}
	}
}

/// The new UIDs of one instance and its ancestors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemappedUids {
	pub study: UI,
	pub series: UI,
	pub instance: UI,
}

/// Thread-safe, idempotent UID remapping scoped to one relocation session.
#[derive(Debug, Default)]
pub struct UidRemapper {
	tree: Mutex<UidTree>,
}

impl UidRemapper {
	pub fn new() -> Self {
		Self::default()
	}

	/// Returns the new UID for `old_uid`, creating it on first use.
	/// Series and instances need the old UID of their already resolved parent.
	pub fn resolve(&self, kind: UidKind, old_uid: &str, parent_uid: Option<&str>) -> Result<UI, UidError> {
		let mut tree = self.tree.lock().unwrap_or_else(PoisonError::into_inner);
		let id = tree.resolve(kind, old_uid, parent_uid)?;
		Ok(tree.nodes[id].new_uid.clone())
	}

	/// Resolves all three tiers of an instance under a single lock.
	pub fn remap(&self, study: &str, series: &str, instance: &str) -> Result<RemappedUids, UidError> {
		let mut tree = self.tree.lock().unwrap_or_else(PoisonError::into_inner);
		let study_id = tree.resolve(UidKind::Study, study, None)?;
		let series_id = tree.resolve(UidKind::Series, series, Some(study))?;
		let instance_id = tree.resolve(UidKind::Instance, instance, Some(series))?;

		Ok(RemappedUids {
			study: tree.nodes[study_id].new_uid.clone(),
			series: tree.nodes[series_id].new_uid.clone(),
			instance: tree.nodes[instance_id].new_uid.clone(),
		})
	}

	/// Serializable view of the tree in insertion order.
	pub fn document(&self) -> UidMappingDocument {
		let tree = self.tree.lock().unwrap_or_else(PoisonError::into_inner);
		let studies = tree
			.studies
			.iter()
			.map(|&study| {
				let series = tree.nodes[study]
					.children
					.iter()
					.map(|&series| SeriesMapping {
						uids: tree.pair(series),
						instances: tree.nodes[series]
							.children
							.iter()
							.map(|&instance| tree.pair(instance))
							.collect(),
					})
					.collect();
				StudyMapping {
					uids: tree.pair(study),
					series,
				}
			})
			.collect();

		UidMappingDocument { studies }
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UidPair {
	pub old_uid: UI,
	pub new_uid: UI,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SeriesMapping {
	#[serde(flatten)]
	pub uids: UidPair,
	pub instances: Vec<UidPair>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StudyMapping {
	#[serde(flatten)]
	pub uids: UidPair,
	pub series: Vec<SeriesMapping>,
}

/// The UID mapping of a session, nested as studies, series and instances.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UidMappingDocument {
	pub studies: Vec<StudyMapping>,
}

impl UidMappingDocument {
	pub fn instance_count(&self) -> usize {
		self.studies
			.iter()
			.flat_map(|study| &study.series)
			.map(|series| series.instances.len())
			.sum()
	}
}
