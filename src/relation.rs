//! Relation / join evaluator.
//!
//! Everything here is pure: it operates on already-fetched `View`s and
//! field names, never touches a lock or a file. `storage.rs` is the
//! only caller — it fetches the source/target snapshots from the
//! relevant `CollectionHandle`s and hands them to these functions, then
//! (for `plan_delete`) carries out the resulting plan against the
//! collections itself.

use std::collections::BTreeMap;

use crate::collection::View;
use crate::schema::{Cardinality, DeletePolicy};
use crate::value::Value;

/// One row of a join: the "driving" side's view, plus the other side's
/// view when a match exists.
#[derive(Debug, Clone)]
pub struct JoinRow {
	pub base: View,
	pub joined: Option<View>,
}

/// A foreign key with no matching target, surfaced by `validate_integrity`.
#[derive(Debug, Clone, PartialEq)]
pub struct Orphan {
	pub id: String,
	pub field: String,
	pub value: String,
}

/// Result of `validate_integrity`.
#[derive(Debug, Clone, PartialEq)]
pub struct IntegrityReport {
	pub ok: bool,
	pub orphans: Vec<Orphan>,
}

fn record_id(view: &View) -> String {
	match view.get("id") {
		Some(Value::Text(s)) => s.clone(),
		_ => String::new(),
	}
}

fn display_value(value: &Value) -> String {
	match value {
		Value::Text(s) => s.clone(),
		Value::Real(f) => f.to_string(),
		Value::Boolean(b) => b.to_string(),
		Value::Instant(ms) => ms.to_string(),
		Value::Null => "null".to_string(),
	}
}

/// Groups `targets` by the value of `target_field`, dropping nulls —
/// nulls never participate in a foreign-key match.
fn index_by(targets: &[View], target_field: &str) -> BTreeMap<Value, Vec<&View>> {
	let mut map: BTreeMap<Value, Vec<&View>> = BTreeMap::new();
	for target in targets {
		if let Some(value) = target.get(target_field) {
			if !value.is_null() {
				map.entry(value.clone()).or_default().push(target);
			}
		}
	}
	map
}

/// For each source record with a non-null foreign key matching a
/// target, emits the pair. Sources with no match (null key, or a key
/// with no target) are dropped.
pub fn inner_join(sources: &[View], targets: &[View], source_field: &str, target_field: &str) -> Vec<(View, View)> {
	let index = index_by(targets, target_field);
	sources
		.iter()
		.filter_map(|source| {
			let key = source.get(source_field)?;
			if key.is_null() {
				return None;
			}
			index.get(key).and_then(|matches| matches.first()).map(|target| (source.clone(), (*target).clone()))
		})
		.collect()
}

/// Every source record, joined where possible, `None` where not.
pub fn left_join(sources: &[View], targets: &[View], source_field: &str, target_field: &str) -> Vec<JoinRow> {
	let index = index_by(targets, target_field);
	sources
		.iter()
		.map(|source| {
			let joined = source
				.get(source_field)
				.filter(|key| !key.is_null())
				.and_then(|key| index.get(key))
				.and_then(|matches| matches.first())
				.map(|target| (*target).clone());
			JoinRow {
				base: source.clone(),
				joined,
			}
		})
		.collect()
}

/// Every target record; a target matched by several sources emits one
/// row per source, and an unmatched target emits one row with a null
/// source.
pub fn right_join(sources: &[View], targets: &[View], source_field: &str, target_field: &str) -> Vec<JoinRow> {
	let mut rows = Vec::new();
	for target in targets {
		let Some(target_key) = target.get(target_field).filter(|v| !v.is_null()) else {
			rows.push(JoinRow {
				base: target.clone(),
				joined: None,
			});
			continue;
		};
		let matches: Vec<&View> = sources
			.iter()
			.filter(|source| source.get(source_field).map(|k| k == target_key).unwrap_or(false))
			.collect();
		if matches.is_empty() {
			rows.push(JoinRow {
				base: target.clone(),
				joined: None,
			});
		} else {
			for source in matches {
				rows.push(JoinRow {
					base: target.clone(),
					joined: Some(source.clone()),
				});
			}
		}
	}
	rows
}

/// The targets referenced by `source`'s foreign key. `one-to-one`
/// returns at most one match; every other cardinality returns all of
/// them (for one-to-one, returns at most one; otherwise
/// all matching").
pub fn get_related(source: &View, source_field: &str, targets: &[View], target_field: &str, cardinality: Cardinality) -> Vec<View> {
	let Some(key) = source.get(source_field).filter(|v| !v.is_null()) else {
		return Vec::new();
	};
	let matches: Vec<View> = targets
		.iter()
		.filter(|target| target.get(target_field).map(|k| k == key).unwrap_or(false))
		.cloned()
		.collect();
	if cardinality == Cardinality::OneToOne {
		matches.into_iter().take(1).collect()
	} else {
		matches
	}
}

/// Checks that every source record's non-null foreign key resolves to
/// an existing target. Does not fail when targets have no index on
/// `target_field` — that's a caller-side performance warning (
/// "scans become O(n)"), not a correctness concern here.
pub fn validate_integrity(sources: &[View], source_field: &str, targets: &[View], target_field: &str) -> IntegrityReport {
	let index = index_by(targets, target_field);
	let mut orphans = Vec::new();
	for source in sources {
		let Some(key) = source.get(source_field) else {
			continue;
		};
		if key.is_null() {
			continue;
		}
		if !index.contains_key(key) {
			orphans.push(Orphan {
				id: record_id(source),
				field: source_field.to_string(),
				value: display_value(key),
			});
		}
	}
	IntegrityReport {
		ok: orphans.is_empty(),
		orphans,
	}
}

/// What to do to the source collection before a target record carrying
/// `target_value` is actually removed.
#[derive(Debug, Clone, PartialEq)]
pub enum DeletePlan {
	/// No source record references the target; the delete may proceed
	/// (covers `restrict` with nothing to restrict, and `cascade`/
	/// `set_null` with nothing to touch).
	Clear,
	/// `cascade`: remove every source record with this id.
	Cascade(Vec<String>),
	/// `set_null`: overwrite `source_field` to `Null` on every source
	/// record with this id.
	SetNull(Vec<String>),
	/// `restrict`: at least one source record still references the
	/// target; the delete must be refused with `IntegrityError{count}`.
	Restrict(usize),
}

/// Computes the plan for a relation's `on_delete` policy, given the
/// source collection's current records and the target value about to
/// be removed. Applying the plan (removing/updating the named source
/// ids) is the caller's job — this function never mutates anything.
pub fn plan_delete(sources: &[View], source_field: &str, target_value: &Value, policy: DeletePolicy) -> DeletePlan {
	let referencing: Vec<String> = sources
		.iter()
		.filter(|source| source.get(source_field).map(|v| v == target_value).unwrap_or(false))
		.map(record_id)
		.collect();

	if referencing.is_empty() {
		return DeletePlan::Clear;
	}

	match policy {
		DeletePolicy::Cascade => DeletePlan::Cascade(referencing),
		DeletePolicy::SetNull => DeletePlan::SetNull(referencing),
		DeletePolicy::Restrict => DeletePlan::Restrict(referencing.len()),
	}
}
