//! Error taxonomy for the engine.
//!
//! Every public operation returns `Result<T>` and fails with one of the
//! `ErrorKind` variants below rather than a bare `std::io::Error` or a panic.

#![allow(missing_docs)]

use std::path::PathBuf;

use error_chain::error_chain;

error_chain! {
	foreign_links {
		Io(::std::io::Error);
	}

	errors {
		/// A record failed schema validation.
		SchemaError(field: String, reason: String) {
			description("record failed schema validation")
			display("field `{}`: {}", field, reason),
		}
		/// An insert or update would duplicate a unique index value.
		UniqueViolation(index: String, value: String) {
			description("unique constraint violated")
			display("index `{}` already contains value `{}`", index, value),
		}
		/// An operation requires an index that does not exist.
		MissingIndex(field: String) {
			description("operation requires a missing index")
			display("no index on field `{}`", field),
		}
		/// A name was looked up that the schema registry does not know.
		NotFound(what: String) {
			description("not found")
			display("not found: {}", what),
		}
		/// A `restrict` delete policy would leave dangling references.
		IntegrityError(count: usize) {
			description("restrict delete would orphan references")
			display("{} record(s) still reference the target", count),
		}
		/// On-disk magic/version/length mismatch or truncated input.
		FormatError(path: PathBuf, reason: String) {
			description("on-disk format is invalid")
			display("corrupt data at {}: {}", path.display(), reason),
		}
		/// Invalid combination of `OpenOptions` / index options.
		InvalidOptions(field: &'static str, reason: String) {
			description("invalid options were provided")
			display("invalid value of `{}`: {}", field, reason),
		}
	}
}

impl PartialEq for ErrorKind {
	fn eq(&self, other: &Self) -> bool {
		use self::ErrorKind::*;

		match (self, other) {
			(&SchemaError(ref f1, ref r1), &SchemaError(ref f2, ref r2)) => f1 == f2 && r1 == r2,
			(&UniqueViolation(ref i1, ref v1), &UniqueViolation(ref i2, ref v2)) => i1 == i2 && v1 == v2,
			(&MissingIndex(ref f1), &MissingIndex(ref f2)) => f1 == f2,
			(&NotFound(ref w1), &NotFound(ref w2)) => w1 == w2,
			(&IntegrityError(c1), &IntegrityError(c2)) => c1 == c2,
			(&FormatError(ref p1, ref r1), &FormatError(ref p2, ref r2)) => p1 == p2 && r1 == r2,
			(&InvalidOptions(f1, ref r1), &InvalidOptions(f2, ref r2)) => f1 == f2 && r1 == r2,
			_ => false,
		}
	}
}
