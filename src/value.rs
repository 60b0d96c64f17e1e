//! The tagged union shared by the schema model, the binary codec and
//! the secondary-index comparator.
//!
//! There is no subtype dispatch: every consumer switches on `Kind`.
//! `real` orders by `f64::total_cmp` so that non-finite values (the
//! schema model permits them, §4.D) still produce a total order instead
//! of the usual IEEE partial order; comparing across different `Kind`s
//! is well-defined (kinds are ordered by their tag) but not meaningful —
//! callers are expected not to mix them.

use std::cmp::Ordering;

/// The four scalar kinds a field can hold, plus the implicit `null`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
	Text,
	Real,
	Boolean,
	Instant,
}

impl Kind {
	pub(crate) fn code(self) -> u8 {
		match self {
			Kind::Text => 0,
			Kind::Real => 1,
			Kind::Boolean => 2,
			Kind::Instant => 3,
		}
	}

	pub(crate) fn from_code(code: u8) -> Option<Kind> {
		match code {
			0 => Some(Kind::Text),
			1 => Some(Kind::Real),
			2 => Some(Kind::Boolean),
			3 => Some(Kind::Instant),
			_ => None,
		}
	}

	pub(crate) fn name(self) -> &'static str {
		match self {
			Kind::Text => "text",
			Kind::Real => "real",
			Kind::Boolean => "boolean",
			Kind::Instant => "instant",
		}
	}
}

/// A single field value: one of the four scalar kinds, or `null`.
#[derive(Debug, Clone)]
pub enum Value {
	Text(String),
	Real(f64),
	Boolean(bool),
	/// Milliseconds since the Unix epoch.
	Instant(i64),
	Null,
}

impl Value {
	pub(crate) fn null_code() -> u8 {
		4
	}

	/// The `Kind` this value would validate against, or `None` for `Null`.
	pub fn kind(&self) -> Option<Kind> {
		match self {
			Value::Text(_) => Some(Kind::Text),
			Value::Real(_) => Some(Kind::Real),
			Value::Boolean(_) => Some(Kind::Boolean),
			Value::Instant(_) => Some(Kind::Instant),
			Value::Null => None,
		}
	}

	pub fn is_null(&self) -> bool {
		matches!(self, Value::Null)
	}

	fn rank(&self) -> u8 {
		match self {
			Value::Text(_) => 0,
			Value::Real(_) => 1,
			Value::Boolean(_) => 2,
			Value::Instant(_) => 3,
			Value::Null => 4,
		}
	}
}

impl PartialEq for Value {
	fn eq(&self, other: &Self) -> bool {
		self.cmp(other) == Ordering::Equal
	}
}

impl Eq for Value {}

impl PartialOrd for Value {
	fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
		Some(self.cmp(other))
	}
}

impl Ord for Value {
	fn cmp(&self, other: &Self) -> Ordering {
		use Value::*;
		match (self, other) {
			(Text(a), Text(b)) => a.cmp(b),
			(Real(a), Real(b)) => a.total_cmp(b),
			(Boolean(a), Boolean(b)) => a.cmp(b),
			(Instant(a), Instant(b)) => a.cmp(b),
			(Null, Null) => Ordering::Equal,
			_ => self.rank().cmp(&other.rank()),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn same_kind_orders_naturally() {
		assert!(Value::Real(1.0) < Value::Real(2.0));
		assert!(Value::Text("a".into()) < Value::Text("b".into()));
		assert!(Value::Instant(1) < Value::Instant(2));
		assert!(Value::Boolean(false) != Value::Boolean(true));
	}

	#[test]
	fn non_finite_reals_still_order_totally() {
		let nan = Value::Real(f64::NAN);
		let inf = Value::Real(f64::INFINITY);
		// must not panic, and must be consistent with itself
		assert_eq!(nan.cmp(&nan), Ordering::Equal);
		assert!(inf > Value::Real(1e300));
	}

	#[test]
	fn kind_round_trips_through_code() {
		for k in [Kind::Text, Kind::Real, Kind::Boolean, Kind::Instant] {
			assert_eq!(Kind::from_code(k.code()), Some(k));
		}
		assert_eq!(Kind::from_code(99), None);
	}
}
