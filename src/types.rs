use dicom::dictionary_std::uids;
use serde::Deserialize;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

/// UI (Unique Identifier) value representation.
pub type UI = String;

/// US (Unsigned Short) value representation.
pub type US = u16;

/// AE (Application Entity) value representation.
pub type AE = String;

/// Priority (0000,0700) values for DIMSE operations.
#[derive(Debug, Copy, Clone, Default)]
pub enum Priority {
	Low = 0x0002,
	#[default]
	Medium = 0x0000,
	High = 0x0001,
}

/// The query/retrieve information model used for C-FIND, C-MOVE and C-GET.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
pub enum QueryInformationModel {
	#[default]
	Study,
	Patient,
}

impl QueryInformationModel {
	pub const fn find_sop_class(&self) -> &'static str {
		match self {
			Self::Study => uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_FIND,
			Self::Patient => uids::PATIENT_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_FIND,
		}
	}

	pub const fn move_sop_class(&self) -> &'static str {
		match self {
			Self::Study => uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_MOVE,
			Self::Patient => uids::PATIENT_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_MOVE,
		}
	}

	pub const fn get_sop_class(&self) -> &'static str {
		match self {
			Self::Study => uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_GET,
			Self::Patient => uids::PATIENT_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_GET,
		}
	}
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize)]
#[serde(try_from = "String")]
pub enum QueryRetrieveLevel {
	Patient,
	Study,
	Series,
	Image,
}

impl QueryRetrieveLevel {
	/// The levels above this one, starting at the root of the patient hierarchy.
	pub fn ancestors(self) -> impl Iterator<Item = Self> {
		[Self::Patient, Self::Study, Self::Series]
			.into_iter()
			.filter(move |level| *level < self)
	}
}

impl Display for QueryRetrieveLevel {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		match self {
			Self::Patient => write!(f, "PATIENT"),
			Self::Study => write!(f, "STUDY"),
			Self::Series => write!(f, "SERIES"),
			Self::Image => write!(f, "IMAGE"),
		}
	}
}

impl FromStr for QueryRetrieveLevel {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.trim().to_ascii_uppercase().as_str() {
			"PATIENT" => Ok(Self::Patient),
			"STUDY" => Ok(Self::Study),
			"SERIES" => Ok(Self::Series),
			"IMAGE" | "INSTANCE" => Ok(Self::Image),
			other => Err(format!("Unknown query/retrieve level {other}")),
		}
	}
}

impl TryFrom<String> for QueryRetrieveLevel {
	type Error = String;

	fn try_from(value: String) -> Result<Self, Self::Error> {
		value.parse()
	}
}

/// Whether instances are pulled with C-MOVE (to our own STORE-SCP) or C-GET (on the same association).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetrieveMethod {
	#[default]
	Move,
	Get,
}

/// Creates a new globally unique UID below the `2.25` root (ITU-T X.667).
pub fn generate_uid() -> UI {
	format!("2.25.{}", uuid::Uuid::new_v4().as_u128())
}
