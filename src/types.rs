use dicom::core::{DataDictionary, PrimitiveValue, Tag};
use dicom::dictionary_std::uids;
use dicom::object::StandardDataDictionary;
use serde::Deserialize;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

/// UI (Unique Identifier) value representation.
pub type UI = String;

/// UL (Unsigned Long) value representation.
pub type UL = u32;

/// US (Unsigned Short) value representation.
pub type US = u16;

/// AE (Application Entity) value representation.
pub type AE = String;

/// Priority (0000,0700) values for DIMSE operations.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
	Low = 0x0002,
	#[default]
	Medium = 0x0000,
	High = 0x0001,
}

impl FromStr for Priority {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.to_ascii_lowercase().as_str() {
			"low" => Ok(Self::Low),
			"medium" => Ok(Self::Medium),
			"high" => Ok(Self::High),
			other => Err(format!("unknown priority `{other}`")),
		}
	}
}

/// The information model used for C-FIND, C-GET and C-MOVE.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryInformationModel {
	#[default]
	Study,
	Patient,
	Worklist,
}

impl QueryInformationModel {
	pub const fn as_sop_class(&self) -> &str {
		match self {
			Self::Study => uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_FIND,
			Self::Patient => uids::PATIENT_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_FIND,
			Self::Worklist => uids::MODALITY_WORKLIST_INFORMATION_MODEL_FIND,
		}
	}

	/// The SOP class used for C-GET. The worklist model has no retrieve counterpart.
	pub const fn as_get_sop_class(&self) -> Option<&str> {
		match self {
			Self::Study => Some(uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_GET),
			Self::Patient => Some(uids::PATIENT_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_GET),
			Self::Worklist => None,
		}
	}

	/// The SOP class used for C-MOVE. The worklist model has no retrieve counterpart.
	pub const fn as_move_sop_class(&self) -> Option<&str> {
		match self {
			Self::Study => Some(uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_MOVE),
			Self::Patient => Some(uids::PATIENT_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_MOVE),
			Self::Worklist => None,
		}
	}
}

impl FromStr for QueryInformationModel {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.to_ascii_lowercase().as_str() {
			"study" => Ok(Self::Study),
			"patient" => Ok(Self::Patient),
			"worklist" | "mwl" => Ok(Self::Worklist),
			other => Err(format!("unknown information model `{other}`")),
		}
	}
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum QueryRetrieveLevel {
	Patient,
	Study,
	Series,
	Image,
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
		match s.to_ascii_uppercase().as_str() {
			"PATIENT" => Ok(Self::Patient),
			"STUDY" => Ok(Self::Study),
			"SERIES" => Ok(Self::Series),
			"IMAGE" | "INSTANCE" => Ok(Self::Image),
			other => Err(format!("unknown query/retrieve level `{other}`")),
		}
	}
}

impl From<QueryRetrieveLevel> for PrimitiveValue {
	fn from(level: QueryRetrieveLevel) -> Self {
		Self::Str(level.to_string())
	}
}

/// Generates a new UID below the 2.25 root from a random UUID.
pub fn new_uid() -> UI {
	format!("2.25.{}", uuid::Uuid::new_v4().as_u128())
}

/// Removes the trailing padding that DICOM allows in UI values.
pub fn trim_uid(uid: &str) -> &str {
	uid.trim_end_matches(['\0', ' '])
}

/// Parses an attribute assignment such as `PatientID=123`, `00100020=123` or `(0010,0020)=123`.
/// A missing value means an empty value, e.g. a return key of a query.
pub fn parse_attribute(assignment: &str) -> Result<(Tag, String), String> {
	let (key, value) = assignment.split_once('=').unwrap_or((assignment, ""));
	let key = key.trim();
	let tag = StandardDataDictionary
		.by_name(key)
		.map(|entry| entry.tag.inner())
		.or_else(|| parse_tag(key))
		.ok_or_else(|| format!("unknown attribute `{key}`"))?;
	Ok((tag, value.to_owned()))
}

fn parse_tag(key: &str) -> Option<Tag> {
	let hex: String = key.chars().filter(|c| !matches!(c, '(' | ')' | ',')).collect();
	if hex.len() != 8 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
		return None;
	}
	let group = u16::from_str_radix(&hex[..4], 16).ok()?;
	let element = u16::from_str_radix(&hex[4..], 16).ok()?;
	Some(Tag(group, element))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn query_retrieve_level_round_trip() {
		assert_eq!("series".parse::<QueryRetrieveLevel>(), Ok(QueryRetrieveLevel::Series));
		assert_eq!(QueryRetrieveLevel::Image.to_string(), "IMAGE");
		assert!("FRAME".parse::<QueryRetrieveLevel>().is_err());
	}

	#[test]
	fn worklist_has_no_retrieve_model() {
		assert!(QueryInformationModel::Worklist.as_get_sop_class().is_none());
		assert_eq!(
			QueryInformationModel::Patient.as_move_sop_class(),
			Some(uids::PATIENT_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_MOVE)
		);
	}

	#[test]
	fn generated_uids_are_valid() {
		let uid = new_uid();
		assert!(uid.starts_with("2.25."));
		assert!(uid.len() <= 64);
		assert!(uid.chars().all(|c| c.is_ascii_digit() || c == '.'));
	}

	#[test]
	fn parses_attribute_assignments() {
		use dicom::dictionary_std::tags;

		assert_eq!(
			parse_attribute("PatientID=123"),
			Ok((tags::PATIENT_ID, String::from("123")))
		);
		assert_eq!(
			parse_attribute("(0010,0010)=Doe^John"),
			Ok((tags::PATIENT_NAME, String::from("Doe^John")))
		);
		assert_eq!(parse_attribute("00080020"), Ok((tags::STUDY_DATE, String::new())));
		assert!(parse_attribute("NotAnAttribute=1").is_err());
	}

	#[test]
	fn trims_uid_padding() {
		assert_eq!(trim_uid("1.2.840.10008.1.2\0"), "1.2.840.10008.1.2");
		assert_eq!(trim_uid("1.2.3 "), "1.2.3");
	}
}
