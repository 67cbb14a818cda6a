use crate::config::TransformConfig;
use crate::relocate::progress::MoveCounters;
use crate::relocate::queue::{WorkItem, WorkQueue};
use crate::relocate::uid::{UidError, UidRemapper};
use crate::relocate::{AbortSignal, FaultLatch, MovedObject};
use dicom::core::DataDictionary;
use dicom::core::ops::{ApplyOp, AttributeAction, AttributeOp};
use dicom::core::{PrimitiveValue, Tag, VR};
use dicom::dictionary_std::{tags, StandardDataDictionary};
use dicom::object::InMemDicomObject;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, instrument};

#[derive(Debug, Error)]
pub enum TransformError {
	#[error("Unknown attribute '{0}'")]
	UnknownAttribute(String),
	#[error("Failed to modify attribute {tag}: {reason}")]
	Apply { tag: Tag, reason: String },
	#[error("Instance {sop_instance_uid} lacks mandatory attribute {tag}")]
	MissingAttribute { sop_instance_uid: String, tag: Tag },
	#[error(transparent)]
	Uid(#[from] UidError),
	#[error("The sender stopped before all instances were transformed")]
	SenderClosed,
}

/// Attribute modifications applied to every instance of an anonymized relocation.
#[derive(Debug, Clone, Default)]
pub struct TransformRules {
	/// Applied in order. Missing attributes are created.
	pub overrides: Vec<(Tag, String)>,
	pub removals: Vec<Tag>,
}

/// Accepts keywords (`PatientName`), `(0010,0010)`, `0010,0010` and `00100010`.
fn parse_tag(text: &str) -> Result<Tag, TransformError> {
	let text = text.trim();
	StandardDataDictionary
		.parse_tag(text)
		.or_else(|| {
			let group = u16::from_str_radix(text.get(0..4)?, 16).ok()?;
			let element = u16::from_str_radix(text.get(4..8)?, 16).ok()?;
			(text.len() == 8).then_some(Tag(group, element))
		})
		.ok_or_else(|| TransformError::UnknownAttribute(text.to_owned()))
}

impl TransformRules {
	/// Builds the rules from the configuration. Returns `None` if transformation is disabled.
	pub fn from_config(config: &TransformConfig) -> Result<Option<Self>, TransformError> {
		if !config.enabled {
			return Ok(None);
		}

		let overrides = config
			.set
			.iter()
			.map(|attribute| Ok((parse_tag(&attribute.tag)?, attribute.value.clone())))
			.collect::<Result<Vec<_>, TransformError>>()?;
		let removals = config
			.remove
			.iter()
			.map(|tag| parse_tag(tag))
			.collect::<Result<Vec<_>, _>>()?;

		Ok(Some(Self {
			overrides,
			removals,
		}))
	}

	pub fn apply(&self, data: &mut InMemDicomObject) -> Result<(), TransformError> {
		let overrides = self.overrides.iter().map(|(tag, value)| {
			(
				*tag,
				AttributeAction::Set(PrimitiveValue::from(value.clone())),
			)
		});
		let removals = self.removals.iter().map(|tag| (*tag, AttributeAction::Remove));

		for (tag, action) in overrides.chain(removals) {
			data.apply(AttributeOp::new(tag, action))
				.map_err(|err| TransformError::Apply {
					tag,
					reason: err.to_string(),
				})?;
		}
		Ok(())
	}
}

fn read_uid(data: &InMemDicomObject, tag: Tag, sop_instance_uid: &str) -> Result<String, TransformError> {
	data.get(tag)
		.and_then(|element| element.to_str().ok())
		.map(|value| value.trim_end_matches(['\0', ' ']).to_owned())
		.filter(|value| !value.is_empty())
		.ok_or_else(|| TransformError::MissingAttribute {
			sop_instance_uid: sop_instance_uid.to_owned(),
			tag,
		})
}

/// The transformer role. Consumes the work queue and forwards instances to the sender.
pub struct TransformStage {
	pub queue: Arc<WorkQueue>,
	pub rules: Option<Arc<TransformRules>>,
	pub remapper: Arc<UidRemapper>,
	pub counters: Arc<MoveCounters>,
	pub output: mpsc::UnboundedSender<MovedObject>,
	pub faults: FaultLatch,
	pub abort: AbortSignal,
}

impl TransformStage {
	/// Applies the rules and remaps the UIDs. Without rules the instance is forwarded unchanged.
	pub fn transform(&self, mut object: MovedObject) -> Result<MovedObject, TransformError> {
		let Some(rules) = &self.rules else {
			return Ok(object);
		};
		rules.apply(&mut object.data)?;

		let uid = |tag| read_uid(&object.data, tag, &object.sop_instance_uid);
		let study = uid(tags::STUDY_INSTANCE_UID)?;
		let series = uid(tags::SERIES_INSTANCE_UID)?;
		let instance = uid(tags::SOP_INSTANCE_UID)?;

		let remapped = self.remapper.remap(&study, &series, &instance)?;
		object.data.put_str(tags::STUDY_INSTANCE_UID, VR::UI, remapped.study);
		object.data.put_str(tags::SERIES_INSTANCE_UID, VR::UI, remapped.series);
		object.data.put_str(tags::SOP_INSTANCE_UID, VR::UI, remapped.instance.clone());
		object.new_sop_instance_uid = Some(remapped.instance);
		Ok(object)
	}

	/// Runs until a [`WorkItem::Stop`] is popped and no data is left behind it, until a fault
	/// or until the session is aborted. After an abort the remaining instances are discarded.
	#[instrument(skip_all, name = "TRANSFORMER")]
	pub async fn run(self) {
		let abort = self.abort.clone();
		loop {
			let item = tokio::select! {
				biased;
				() = abort.aborted() => {
					debug!(pending = self.queue.len(), "Relocation aborted, discarding remaining instances");
					break;
				}
				item = self.queue.pop() => item,
			};
			let object = match item {
				WorkItem::Data(object) => object,
				WorkItem::Stop if self.queue.has_data() => {
					debug!("Stop requested, draining remaining instances first");
					self.queue.push(WorkItem::Stop);
					continue;
				}
				WorkItem::Stop => break,
			};

			let object = match self.transform(object) {
				Ok(object) => object,
				Err(err) => {
					self.faults.latch(err);
					break;
				}
			};
			MoveCounters::increment(&self.counters.transformed);
			debug!(
				sop_instance_uid = object.sop_instance_uid,
				new_sop_instance_uid = object.new_sop_instance_uid,
				"Transformed instance"
			);

			if self.output.send(object).is_err() {
				// After an abort the sender leaves on its own, the abort is the cause.
				if !abort.is_aborted() {
					self.faults.latch(TransformError::SenderClosed);
				}
				break;
			}
		}
		debug!("Transformer stopped");
	}
}
