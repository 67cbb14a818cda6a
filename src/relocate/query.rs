use crate::dimse::cfind::findscu::FindError;
use crate::relocate::AbortSignal;
use crate::types::{QueryInformationModel, QueryRetrieveLevel, AE};
use dicom::core::{Tag, VR};
use dicom::dictionary_std::tags;
use dicom::object::InMemDicomObject;
use futures::stream::BoxStream;
use futures::StreamExt;
use thiserror::Error;
use tracing::{debug, instrument};

/// A C-FIND that is issued by the resolver.
#[derive(Debug, Clone)]
pub struct FindRequest {
	pub level: QueryRetrieveLevel,
	pub identifier: InMemDicomObject,
	pub max_responses: Option<usize>,
}

/// Queries the source archive.
pub trait FindService: Send + Sync {
	/// Whether the source supports relational queries, so every level can be queried directly.
	fn relational(&self) -> bool;

	fn find(&self, request: FindRequest) -> BoxStream<'_, Result<InMemDicomObject, FindError>>;
}

#[derive(Debug, Error)]
pub enum QueryError {
	#[error("C-FIND at {level} level failed: {source}")]
	Find {
		level: QueryRetrieveLevel,
		source: FindError,
	},
	#[error("Query was aborted")]
	Aborted,
}

/// The unique key of a level in the patient hierarchy.
pub const fn unique_key(level: QueryRetrieveLevel) -> Tag {
	match level {
		QueryRetrieveLevel::Patient => tags::PATIENT_ID,
		QueryRetrieveLevel::Study => tags::STUDY_INSTANCE_UID,
		QueryRetrieveLevel::Series => tags::SERIES_INSTANCE_UID,
		QueryRetrieveLevel::Image => tags::SOP_INSTANCE_UID,
	}
}

const fn key_vr(level: QueryRetrieveLevel) -> VR {
	match level {
		QueryRetrieveLevel::Patient => VR::LO,
		_ => VR::UI,
	}
}

const LEVELS: [QueryRetrieveLevel; 4] = [
	QueryRetrieveLevel::Patient,
	QueryRetrieveLevel::Study,
	QueryRetrieveLevel::Series,
	QueryRetrieveLevel::Image,
];

/// Attributes that are copied from the find responses into the identifier sets.
const RETURN_KEYS: [Tag; 3] = [
	tags::RETRIEVE_AE_TITLE,
	tags::NUMBER_OF_STUDY_RELATED_INSTANCES,
	tags::NUMBER_OF_SERIES_RELATED_INSTANCES,
];

fn text(object: &InMemDicomObject, tag: Tag) -> Option<String> {
	object
		.get(tag)
		.and_then(|element| element.to_str().ok())
		.map(|value| value.trim_end_matches(['\0', ' ']).to_owned())
		.filter(|value| !value.is_empty())
}

/// Whether the key holds a single value that can be used for matching.
fn is_given(object: &InMemDicomObject, tag: Tag) -> bool {
	text(object, tag).is_some_and(|value| !value.contains(['*', '?', '\\']))
}

/// The keys of one entity at the resolved level together with the keys of its ancestors.
#[derive(Debug, Clone)]
pub struct IdentifierSet {
	pub level: QueryRetrieveLevel,
	pub identifier: InMemDicomObject,
}

impl IdentifierSet {
	pub fn uid(&self, level: QueryRetrieveLevel) -> Option<String> {
		text(&self.identifier, unique_key(level))
	}

	/// AEs that report to already hold the entity.
	pub fn retrieve_aets(&self) -> Vec<AE> {
		self.identifier
			.get(tags::RETRIEVE_AE_TITLE)
			.and_then(|element| element.to_multi_str().ok())
			.map(|values| {
				values
					.iter()
					.flat_map(|value| value.split('\\'))
					.map(|value| value.trim_end_matches('\0').trim().to_owned())
					.filter(|value| !value.is_empty())
					.collect()
			})
			.unwrap_or_default()
	}

	/// Number of instances below this entity as reported by the source.
	pub fn related_instances(&self) -> Option<u64> {
		let tag = match self.level {
			QueryRetrieveLevel::Patient => tags::NUMBER_OF_PATIENT_RELATED_INSTANCES,
			QueryRetrieveLevel::Study => tags::NUMBER_OF_STUDY_RELATED_INSTANCES,
			QueryRetrieveLevel::Series => tags::NUMBER_OF_SERIES_RELATED_INSTANCES,
			QueryRetrieveLevel::Image => return Some(1),
		};
		text(&self.identifier, tag).and_then(|value| value.trim().parse().ok())
	}

	/// The identifier of a C-MOVE or C-GET for this entity.
	pub fn retrieve_identifier(&self, model: QueryInformationModel) -> InMemDicomObject {
		let mut identifier = InMemDicomObject::new_empty();
		identifier.put_str(tags::QUERY_RETRIEVE_LEVEL, VR::CS, self.level.to_string());
		for level in LEVELS.into_iter().filter(|level| *level <= self.level) {
			if level == QueryRetrieveLevel::Patient && model == QueryInformationModel::Study {
				continue;
			}
			if let Some(uid) = self.uid(level) {
				identifier.put_str(unique_key(level), key_vr(level), uid);
			}
		}
		identifier
	}
}

/// Resolves matching keys down to a query/retrieve level, cascading through the
/// hierarchy if the source does not support relational queries.
pub struct HierarchicalQueryResolver<'a, F: ?Sized> {
	service: &'a F,
	max_responses: Option<usize>,
}

impl<'a, F: FindService + ?Sized> HierarchicalQueryResolver<'a, F> {
	pub const fn new(service: &'a F, max_responses: Option<usize>) -> Self {
		Self {
			service,
			max_responses,
		}
	}

	#[instrument(skip_all, name = "RESOLVER", fields(level = %level))]
	pub async fn resolve(
		&self,
		keys: &InMemDicomObject,
		level: QueryRetrieveLevel,
		abort: &AbortSignal,
	) -> Result<Vec<IdentifierSet>, QueryError> {
		let ancestors: Vec<_> = level.ancestors().collect();
		let fully_specified = ancestors
			.iter()
			.filter(|ancestor| **ancestor != QueryRetrieveLevel::Patient)
			.all(|ancestor| is_given(keys, unique_key(*ancestor)));

		let base = IdentifierSet {
			level,
			identifier: keys.clone(),
		};

		if self.service.relational() || fully_specified {
			debug!("Issuing a single query");
			return self.find_below(&base, keys, level, self.max_responses, abort).await;
		}

		// Levels above the deepest given key need no query.
		let start = ancestors
			.iter()
			.rposition(|ancestor| is_given(keys, unique_key(*ancestor)))
			.map_or(0, |position| position + 1);

		let mut sets = vec![base];
		for stage in LEVELS.into_iter().filter(|stage| *stage <= level).skip(start) {
			let is_target = stage == level;
			let mut resolved = Vec::new();

			for parent in &sets {
				let limit = if is_target {
					match self.max_responses {
						Some(max) if resolved.len() >= max => break,
						Some(max) => Some(max - resolved.len()),
						None => None,
					}
				} else {
					None
				};
				resolved.extend(self.find_below(parent, keys, stage, limit, abort).await?);
			}

			debug!(stage = %stage, sets = resolved.len(), "Resolved level");
			if resolved.is_empty() {
				return Ok(Vec::new());
			}
			sets = resolved;
		}
		Ok(sets)
	}

	/// Issues one C-FIND at `level` scoped to the keys of `parent`.
	async fn find_below(
		&self,
		parent: &IdentifierSet,
		keys: &InMemDicomObject,
		level: QueryRetrieveLevel,
		limit: Option<usize>,
		abort: &AbortSignal,
	) -> Result<Vec<IdentifierSet>, QueryError> {
		let mut identifier = InMemDicomObject::new_empty();
		for element in keys {
			let deeper_key = LEVELS
				.into_iter()
				.any(|other| other > level && unique_key(other) == element.header().tag);
			if !deeper_key {
				identifier.put_element(element.clone());
			}
		}
		for ancestor in level.ancestors() {
			if let Some(uid) = parent.uid(ancestor) {
				identifier.put_str(unique_key(ancestor), key_vr(ancestor), uid);
			}
		}
		identifier.put_str(tags::QUERY_RETRIEVE_LEVEL, VR::CS, level.to_string());
		if identifier.get(unique_key(level)).is_none() {
			identifier.put_str(unique_key(level), key_vr(level), "");
		}
		identifier.put_str(tags::RETRIEVE_AE_TITLE, VR::AE, "");
		match level {
			QueryRetrieveLevel::Study => {
				identifier.put_str(tags::NUMBER_OF_STUDY_RELATED_INSTANCES, VR::IS, "");
			}
			QueryRetrieveLevel::Series => {
				identifier.put_str(tags::NUMBER_OF_SERIES_RELATED_INSTANCES, VR::IS, "");
			}
			_ => {}
		}

		let request = FindRequest {
			level,
			identifier,
			max_responses: limit,
		};
		let mut responses = self.service.find(request);
		let mut sets = Vec::new();

		loop {
			let response = tokio::select! {
				biased;
				() = abort.aborted() => return Err(QueryError::Aborted),
				response = responses.next() => response,
			};
			let Some(response) = response else {
				break;
			};
			let response = response.map_err(|source| QueryError::Find { level, source })?;

			// The source may ignore the ceiling, responses beyond it are discarded.
			if limit.is_some_and(|limit| sets.len() >= limit) {
				continue;
			}

			let mut identifier = parent.identifier.clone();
			for ancestor in level.ancestors().chain(std::iter::once(level)) {
				if let Some(element) = response.get(unique_key(ancestor)) {
					identifier.put_element(element.clone());
				}
			}
			for tag in RETURN_KEYS {
				if let Some(element) = response.get(tag) {
					identifier.put_element(element.clone());
				}
			}
			identifier.put_str(tags::QUERY_RETRIEVE_LEVEL, VR::CS, level.to_string());
			sets.push(IdentifierSet { level, identifier });
		}
		Ok(sets)
	}
}

#[cfg(test)]
pub(crate) mod tests {
	use super::*;
	use futures::stream;
	use std::collections::HashMap;
	use std::sync::Mutex;

	/// Answers C-FINDs from a fixed table keyed by level and parent UID.
	#[derive(Default)]
	pub(crate) struct FakeFindService {
		pub relational: bool,
		pub responses: HashMap<(QueryRetrieveLevel, Option<String>), Vec<InMemDicomObject>>,
		pub requests: Mutex<Vec<FindRequest>>,
		pub fail_at: Option<QueryRetrieveLevel>,
	}

	impl FakeFindService {
		pub(crate) fn add(&mut self, level: QueryRetrieveLevel, parent: Option<&str>, response: InMemDicomObject) {
			self.responses
				.entry((level, parent.map(String::from)))
				.or_default()
				.push(response);
		}

		pub(crate) fn levels(&self) -> Vec<QueryRetrieveLevel> {
			self.requests.lock().unwrap().iter().map(|request| request.level).collect()
		}
	}

	impl FindService for FakeFindService {
		fn relational(&self) -> bool {
			self.relational
		}

		fn find(&self, request: FindRequest) -> BoxStream<'_, Result<InMemDicomObject, FindError>> {
			let parent = request
				.level
				.ancestors()
				.last()
				.and_then(|ancestor| text(&request.identifier, unique_key(ancestor)));
			let level = request.level;
			self.requests.lock().unwrap().push(request);

			if self.fail_at == Some(level) {
				return stream::iter(vec![Err(FindError::Status(0xC000))]).boxed();
			}
			let key = if self.relational || !self.responses.contains_key(&(level, parent.clone())) {
				(level, None)
			} else {
				(level, parent)
			};
			let responses = self.responses.get(&key).cloned().unwrap_or_default();
			stream::iter(responses.into_iter().map(Ok)).boxed()
		}
	}

	pub(crate) fn entity(tags_and_values: &[(Tag, VR, &str)]) -> InMemDicomObject {
		let mut object = InMemDicomObject::new_empty();
		for (tag, vr, value) in tags_and_values {
			object.put_str(*tag, *vr, *value);
		}
		object
	}

	fn study_keys(study: &str) -> InMemDicomObject {
		entity(&[(tags::STUDY_INSTANCE_UID, VR::UI, study)])
	}

	#[tokio::test]
	async fn single_query_when_ancestors_are_given() {
		let mut service = FakeFindService::default();
		for series in ["1.1", "1.2"] {
			service.add(
				QueryRetrieveLevel::Series,
				None,
				entity(&[
					(tags::SERIES_INSTANCE_UID, VR::UI, series),
					(tags::NUMBER_OF_SERIES_RELATED_INSTANCES, VR::IS, "3"),
				]),
			);
		}

		let resolver = HierarchicalQueryResolver::new(&service, None);
		let sets = resolver
			.resolve(&study_keys("1"), QueryRetrieveLevel::Series, &AbortSignal::new())
			.await
			.unwrap();

		assert_eq!(service.levels(), vec![QueryRetrieveLevel::Series]);
		assert_eq!(sets.len(), 2);
		assert_eq!(sets[1].uid(QueryRetrieveLevel::Study).as_deref(), Some("1"));
		assert_eq!(sets[1].uid(QueryRetrieveLevel::Series).as_deref(), Some("1.2"));
		assert_eq!(sets[0].related_instances(), Some(3));

		let request = &service.requests.lock().unwrap()[0];
		assert_eq!(
			text(&request.identifier, tags::QUERY_RETRIEVE_LEVEL).as_deref(),
			Some("SERIES")
		);
		assert!(request.identifier.get(tags::SERIES_INSTANCE_UID).is_some());
	}

	#[tokio::test]
	async fn cascades_from_patient_to_series() {
		let mut service = FakeFindService::default();
		service.add(QueryRetrieveLevel::Patient, None, entity(&[(tags::PATIENT_ID, VR::LO, "P1")]));
		service.add(QueryRetrieveLevel::Patient, None, entity(&[(tags::PATIENT_ID, VR::LO, "P2")]));
		service.add(QueryRetrieveLevel::Study, Some("P1"), study_keys("1"));
		service.add(QueryRetrieveLevel::Study, Some("P2"), study_keys("2"));
		service.add(QueryRetrieveLevel::Series, Some("1"), entity(&[(tags::SERIES_INSTANCE_UID, VR::UI, "1.1")]));
		service.add(QueryRetrieveLevel::Series, Some("2"), entity(&[(tags::SERIES_INSTANCE_UID, VR::UI, "2.1")]));
		service.add(QueryRetrieveLevel::Series, Some("2"), entity(&[(tags::SERIES_INSTANCE_UID, VR::UI, "2.2")]));

		let keys = entity(&[(tags::PATIENT_NAME, VR::PN, "Doe*")]);
		let resolver = HierarchicalQueryResolver::new(&service, None);
		let sets = resolver
			.resolve(&keys, QueryRetrieveLevel::Series, &AbortSignal::new())
			.await
			.unwrap();

		assert_eq!(
			service.levels(),
			vec![
				QueryRetrieveLevel::Patient,
				QueryRetrieveLevel::Study,
				QueryRetrieveLevel::Study,
				QueryRetrieveLevel::Series,
				QueryRetrieveLevel::Series,
			]
		);
		let paths: Vec<String> = sets
			.iter()
			.map(|set| {
				format!(
					"{}/{}/{}",
					set.uid(QueryRetrieveLevel::Patient).unwrap(),
					set.uid(QueryRetrieveLevel::Study).unwrap(),
					set.uid(QueryRetrieveLevel::Series).unwrap(),
				)
			})
			.collect();
		assert_eq!(paths, vec!["P1/1/1.1", "P2/2/2.1", "P2/2/2.2"]);

		// The study query of the second patient is scoped to that patient only.
		let requests = service.requests.lock().unwrap();
		assert_eq!(text(&requests[2].identifier, tags::PATIENT_ID).as_deref(), Some("P2"));
		assert!(requests[1].identifier.get(tags::SERIES_INSTANCE_UID).is_none());
	}

	#[tokio::test]
	async fn given_keys_skip_levels() {
		let mut service = FakeFindService::default();
		service.add(QueryRetrieveLevel::Series, Some("1"), entity(&[(tags::SERIES_INSTANCE_UID, VR::UI, "1.1")]));
		service.add(QueryRetrieveLevel::Image, Some("1.1"), entity(&[(tags::SOP_INSTANCE_UID, VR::UI, "1.1.1")]));

		let resolver = HierarchicalQueryResolver::new(&service, None);
		let sets = resolver
			.resolve(&study_keys("1"), QueryRetrieveLevel::Image, &AbortSignal::new())
			.await
			.unwrap();

		assert_eq!(service.levels(), vec![QueryRetrieveLevel::Series, QueryRetrieveLevel::Image]);
		assert_eq!(sets.len(), 1);
		assert_eq!(sets[0].related_instances(), Some(1));
		let identifier = sets[0].retrieve_identifier(QueryInformationModel::Study);
		assert_eq!(text(&identifier, tags::SOP_INSTANCE_UID).as_deref(), Some("1.1.1"));
		assert_eq!(text(&identifier, tags::QUERY_RETRIEVE_LEVEL).as_deref(), Some("IMAGE"));
	}

	#[tokio::test]
	async fn empty_level_ends_resolution() {
		let service = FakeFindService::default();
		let resolver = HierarchicalQueryResolver::new(&service, None);
		let sets = resolver
			.resolve(&study_keys("1"), QueryRetrieveLevel::Image, &AbortSignal::new())
			.await
			.unwrap();

		assert!(sets.is_empty());
		assert_eq!(service.levels(), vec![QueryRetrieveLevel::Series]);
	}

	#[tokio::test]
	async fn ceiling_truncates_and_stops_querying() {
		let mut service = FakeFindService::default();
		service.add(QueryRetrieveLevel::Series, Some("1"), entity(&[(tags::SERIES_INSTANCE_UID, VR::UI, "1.1")]));
		service.add(QueryRetrieveLevel::Series, Some("1"), entity(&[(tags::SERIES_INSTANCE_UID, VR::UI, "1.2")]));
		for instance in 1..=5 {
			let uid = format!("1.1.{instance}");
			service.add(QueryRetrieveLevel::Image, Some("1.1"), entity(&[(tags::SOP_INSTANCE_UID, VR::UI, &uid)]));
		}
		service.add(QueryRetrieveLevel::Image, Some("1.2"), entity(&[(tags::SOP_INSTANCE_UID, VR::UI, "1.2.1")]));

		let resolver = HierarchicalQueryResolver::new(&service, Some(3));
		let sets = resolver
			.resolve(&study_keys("1"), QueryRetrieveLevel::Image, &AbortSignal::new())
			.await
			.unwrap();

		assert_eq!(sets.len(), 3);
		// No image query for the second series once the ceiling is reached.
		assert_eq!(service.levels(), vec![QueryRetrieveLevel::Series, QueryRetrieveLevel::Image]);
		assert_eq!(service.requests.lock().unwrap()[1].max_responses, Some(3));
	}

	#[tokio::test]
	async fn find_failure_is_returned() {
		let service = FakeFindService {
			fail_at: Some(QueryRetrieveLevel::Study),
			..Default::default()
		};
		let resolver = HierarchicalQueryResolver::new(&service, None);
		let result = resolver
			.resolve(&study_keys("1"), QueryRetrieveLevel::Study, &AbortSignal::new())
			.await;

		assert!(matches!(
			result,
			Err(QueryError::Find { level: QueryRetrieveLevel::Study, .. })
		));
	}

	#[tokio::test]
	async fn abort_ends_resolution() {
		let service = FakeFindService::default();
		let abort = AbortSignal::new();
		abort.abort();
		let resolver = HierarchicalQueryResolver::new(&service, None);
		let result = resolver
			.resolve(&study_keys("1"), QueryRetrieveLevel::Study, &abort)
			.await;

		assert!(matches!(result, Err(QueryError::Aborted)));
	}

	#[test]
	fn retrieve_aets_are_split() {
		let set = IdentifierSet {
			level: QueryRetrieveLevel::Study,
			identifier: entity(&[(tags::RETRIEVE_AE_TITLE, VR::AE, "PACS\\ARCHIVE ")]),
		};
		assert_eq!(set.retrieve_aets(), vec![AE::from("PACS"), AE::from("ARCHIVE")]);
	}
}
