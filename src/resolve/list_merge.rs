//! Three-way union merge for list-valued fields.

use serde_json::Value;
use std::collections::BTreeMap;

/// Identity of a list element: its `id` member for objects that have one,
/// otherwise its canonical JSON text.
fn identity(value: &Value) -> String {
	match value.get("id") {
		Some(id) if value.is_object() => format!("id:{}", canonical(id)),
		_ => format!("v:{}", canonical(value)),
	}
}

/// `serde_json` keeps object keys sorted, so this is stable across replicas.
fn canonical(value: &Value) -> String {
	value.to_string()
}

fn items(value: Option<&Value>) -> Result<Vec<Value>, String> {
	match value {
		None | Some(Value::Null) => Ok(Vec::new()),
		Some(Value::Array(items)) => Ok(items.clone()),
		Some(other) => Err(format!("expected a list, found {}", canonical(other))),
	}
}

/// First occurrence wins when a list repeats an identity.
fn index(list: &[Value]) -> BTreeMap<String, &Value> {
	let mut map = BTreeMap::new();
	for item in list {
		map.entry(identity(item)).or_insert(item);
	}
	map
}

/// Merge `local` and `remote` against their common `base`.
///
/// Additions from both sides are kept and removals from either side applied.
/// The result is symmetric in `local` and `remote`: surviving base elements in
/// base order, then additions sorted by canonical JSON. Returns `Err` with a
/// reason when the two sides changed the same element incompatibly, or when a
/// value is not a list.
pub fn union_merge(base: Option<&Value>, local: &Value, remote: &Value) -> Result<Value, String> {
	let base = items(base)?;
	let local = items(Some(local))?;
	let remote = items(Some(remote))?;
	let (local_ix, remote_ix) = (index(&local), index(&remote));
	let base_ix = index(&base);

	let mut merged = Vec::new();
	let mut seen = std::collections::BTreeSet::new();
	for original in &base {
		let key = identity(original);
		if !seen.insert(key.clone()) {
			continue;
		}
		match (local_ix.get(&key), remote_ix.get(&key)) {
			(Some(l), Some(r)) => {
				if l == r || *r == original {
					merged.push((*l).clone());
				} else if *l == original {
					merged.push((*r).clone());
				} else {
					return Err(format!("element {} edited differently on both sides", key));
				}
			}
			(Some(kept), None) | (None, Some(kept)) => {
				if *kept != original {
					return Err(format!(
						"element {} edited on one side and removed on the other",
						key
					));
				}
			}
			(None, None) => {}
		}
	}

	let mut added: BTreeMap<String, Value> = BTreeMap::new();
	for (key, value) in local_ix.iter().chain(remote_ix.iter()) {
		if base_ix.contains_key(key) {
			continue;
		}
		match added.get(key) {
			Some(existing) if existing != *value => {
				return Err(format!("element {} added differently on both sides", key));
			}
			Some(_) => {}
			None => {
				added.insert(key.clone(), (*value).clone());
			}
		}
	}
	let mut added: Vec<Value> = added.into_values().collect();
	added.sort_by_key(canonical);
	merged.extend(added);

	Ok(Value::Array(merged))
}

#[cfg(feature = "unit-tests")]
mod tests {
	use serde_json::json;

	use super::*;

	#[test]
	fn concurrent_additions_are_both_kept() {
		let base = json!([]);
		let merged = union_merge(Some(&base), &json!(["Metformin"]), &json!(["Insulin"])).unwrap();
		assert_eq!(merged, json!(["Insulin", "Metformin"]));
	}

	#[test]
	fn merge_is_symmetric() {
		let base = json!(["Aspirin", "Iron"]);
		let a = json!(["Aspirin", "Iron", "Metformin"]);
		let b = json!(["Iron", "Insulin"]);
		assert_eq!(
			union_merge(Some(&base), &a, &b).unwrap(),
			union_merge(Some(&base), &b, &a).unwrap()
		);
		assert_eq!(
			union_merge(Some(&base), &a, &b).unwrap(),
			json!(["Iron", "Insulin", "Metformin"])
		);
	}

	#[test]
	fn removal_on_one_side_is_applied() {
		let base = json!(["Aspirin", "Iron"]);
		let merged =
			union_merge(Some(&base), &json!(["Iron"]), &json!(["Aspirin", "Iron"])).unwrap();
		assert_eq!(merged, json!(["Iron"]));
	}

	#[test]
	fn objects_are_matched_by_id() {
		let base = json!([{"id": "m1", "dose": "5mg"}]);
		let local = json!([{"id": "m1", "dose": "10mg"}]);
		let remote = json!([{"id": "m1", "dose": "5mg"}, {"id": "m2", "dose": "1mg"}]);
		let merged = union_merge(Some(&base), &local, &remote).unwrap();
		assert_eq!(merged, json!([{"id": "m1", "dose": "10mg"}, {"id": "m2", "dose": "1mg"}]));
	}

	#[test]
	fn incompatible_edits_escalate() {
		let base = json!([{"id": "m1", "dose": "5mg"}]);
		let local = json!([{"id": "m1", "dose": "10mg"}]);
		let remote = json!([{"id": "m1", "dose": "20mg"}]);
		assert!(union_merge(Some(&base), &local, &remote).is_err());
		assert!(union_merge(Some(&base), &local, &json!([])).is_err());
	}

	#[test]
	fn non_list_values_escalate() {
		assert!(union_merge(None, &json!("Metformin"), &json!(["Insulin"])).is_err());
	}
}
