use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Stable identifier of a domain record (e.g. `patient:P1`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(String);

impl RecordId {
	pub fn new(id: impl Into<String>) -> Self {
		Self(id.into())
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for RecordId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl From<&str> for RecordId {
	fn from(s: &str) -> Self {
		Self(s.to_string())
	}
}

/// Identifier of whoever made a write: a device's health worker or a remote actor.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActorId(String);

impl ActorId {
	pub fn new(id: impl Into<String>) -> Self {
		Self(id.into())
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for ActorId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl From<&str> for ActorId {
	fn from(s: &str) -> Self {
		Self(s.to_string())
	}
}

/// Kinds of entity the companion app keeps offline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
	Patient,
	Visit,
	Reminder,
	Message,
}

impl fmt::Display for RecordKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let s = match self {
			RecordKind::Patient => "patient",
			RecordKind::Visit => "visit",
			RecordKind::Reminder => "reminder",
			RecordKind::Message => "message",
		};
		f.write_str(s)
	}
}

impl FromStr for RecordKind {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.trim().to_ascii_lowercase().as_str() {
			"patient" => Ok(RecordKind::Patient),
			"visit" => Ok(RecordKind::Visit),
			"reminder" => Ok(RecordKind::Reminder),
			"message" => Ok(RecordKind::Message),
			other => Err(format!("unknown record kind: {}", other)),
		}
	}
}

/// Who wrote a field last, and at which shared version.
///
/// Stamps order by their last-writer-wins key `(updated_at, updated_by)` and
/// only then by version, so every replica ranks two writes the same way no
/// matter which versions the authority or a peer assigned them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FieldStamp {
	pub version: u64,
	pub updated_at: u64,
	pub updated_by: ActorId,
}

impl FieldStamp {
	/// Identity of the write itself; equal keys mean the same write.
	pub fn lww_key(&self) -> (u64, &ActorId) {
		(self.updated_at, &self.updated_by)
	}
}

impl Ord for FieldStamp {
	fn cmp(&self, other: &Self) -> Ordering {
		self.lww_key()
			.cmp(&other.lww_key())
			.then(self.version.cmp(&other.version))
	}
}

impl PartialOrd for FieldStamp {
	fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
		Some(self.cmp(other))
	}
}

/// A versioned domain entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
	pub id: RecordId,
	pub kind: RecordKind,
	#[serde(default)]
	pub fields: BTreeMap<String, Value>,
	#[serde(default)]
	pub stamps: BTreeMap<String, FieldStamp>,
	/// Local write counter; strictly increases on every accepted write.
	pub version: u64,
	pub updated_at: u64,
	pub updated_by: ActorId,
}

impl Record {
	/// A not-yet-stored record (version 0).
	pub fn new(id: RecordId, kind: RecordKind) -> Self {
		Self {
			id,
			kind,
			fields: BTreeMap::new(),
			stamps: BTreeMap::new(),
			version: 0,
			updated_at: 0,
			updated_by: ActorId::default(),
		}
	}

	pub fn field(&self, name: &str) -> Option<&Value> {
		self.fields.get(name)
	}

	/// Stamp of a field; fields never written carry the zero stamp.
	pub fn stamp(&self, name: &str) -> FieldStamp {
		self.stamps.get(name).cloned().unwrap_or_default()
	}
}

/// The delta shape exchanged with the authority and with peers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delta {
	pub record_id: RecordId,
	pub kind: RecordKind,
	/// Shared version the fields were written at.
	pub version: u64,
	pub fields: BTreeMap<String, Value>,
	pub updated_at: u64,
	pub updated_by: ActorId,
}

impl Delta {
	pub fn stamp(&self) -> FieldStamp {
		FieldStamp {
			version: self.version,
			updated_at: self.updated_at,
			updated_by: self.updated_by.clone(),
		}
	}
}

#[cfg(feature = "unit-tests")]
mod tests {
	use super::*;

	#[test]
	fn stamp_ordering_prefers_time_then_actor_then_version() {
		let a = FieldStamp {
			version: 4,
			updated_at: 100,
			updated_by: ActorId::from("zeta"),
		};
		let b = FieldStamp {
			version: 5,
			updated_at: 1,
			updated_by: ActorId::from("alpha"),
		};
		assert!(a > b, "a later write outranks a higher version");

		let c = FieldStamp {
			version: 2,
			updated_at: 1,
			updated_by: ActorId::from("beta"),
		};
		assert!(c > b);

		let echoed = FieldStamp { version: 9, ..b.clone() };
		assert_eq!(echoed.lww_key(), b.lww_key());
		assert!(echoed > b);
	}

	#[test]
	fn record_kind_parses_case_insensitively() {
		assert_eq!("Patient".parse::<RecordKind>(), Ok(RecordKind::Patient));
		assert!("clinic".parse::<RecordKind>().is_err());
		assert_eq!(RecordKind::Reminder.to_string(), "reminder");
	}

	#[test]
	fn missing_field_has_zero_stamp() {
		let r = Record::new(RecordId::from("patient:P1"), RecordKind::Patient);
		assert_eq!(r.stamp("phone"), FieldStamp::default());
		assert!(r.field("phone").is_none());
	}
}
