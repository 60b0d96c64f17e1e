//! Binary codec — length-prefixed little-endian framing for schema
//! sections, index directories and records.
//!
//! Everything here is pure encode/decode: no file handles, no locking.
//! `container.rs` and `collection.rs` call into this module to turn
//! in-memory structures into bytes and back. Decode failures are always
//! `ErrorKind::FormatError`, never a panic — the input may be a
//! partially-written or foreign file.

use std::io::{Cursor, Read, Write};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{ErrorKind, Result, ResultExt};
use crate::schema::{FieldDefinition, IndexDefinition, Schema};
use crate::value::{Kind, Value};

fn fmt_err(path: &Path, reason: impl Into<String>) -> crate::error::Error {
	ErrorKind::FormatError(path.to_path_buf(), reason.into()).into()
}

/// Writes a `u32`-length-prefixed UTF-8 string.
pub(crate) fn write_string<W: Write>(w: &mut W, s: &str) -> Result<()> {
	w.write_u32::<LittleEndian>(s.len() as u32)?;
	w.write_all(s.as_bytes())?;
	Ok(())
}

/// Reads a `u32`-length-prefixed UTF-8 string, failing with `FormatError`
/// on truncation or invalid UTF-8.
pub(crate) fn read_string(r: &mut impl Read, path: &Path) -> Result<String> {
	let len = r
		.read_u32::<LittleEndian>()
		.chain_err(|| fmt_err(path, "truncated string length"))? as usize;
	let mut buf = vec![0u8; len];
	r.read_exact(&mut buf)
		.chain_err(|| fmt_err(path, "truncated string bytes"))?;
	String::from_utf8(buf).map_err(|_| fmt_err(path, "string is not valid utf-8"))
}

/// Writes a single scalar value as `type-code, u32 value-length, bytes`.
pub(crate) fn write_value<W: Write>(w: &mut W, value: &Value) -> Result<()> {
	match value {
		Value::Text(s) => {
			w.write_u8(Kind::Text.code())?;
			w.write_u32::<LittleEndian>(s.len() as u32)?;
			w.write_all(s.as_bytes())?;
		}
		Value::Real(f) => {
			w.write_u8(Kind::Real.code())?;
			w.write_u32::<LittleEndian>(8)?;
			w.write_f64::<LittleEndian>(*f)?;
		}
		Value::Boolean(b) => {
			w.write_u8(Kind::Boolean.code())?;
			w.write_u32::<LittleEndian>(1)?;
			w.write_u8(if *b { 1 } else { 0 })?;
		}
		Value::Instant(ms) => {
			w.write_u8(Kind::Instant.code())?;
			w.write_u32::<LittleEndian>(8)?;
			w.write_f64::<LittleEndian>(*ms as f64)?;
		}
		Value::Null => {
			w.write_u8(Value::null_code())?;
			w.write_u32::<LittleEndian>(0)?;
		}
	}
	Ok(())
}

/// Reads a single scalar value, the inverse of [`write_value`].
pub(crate) fn read_value(r: &mut impl Read, path: &Path) -> Result<Value> {
	let code = r
		.read_u8()
		.chain_err(|| fmt_err(path, "truncated value type code"))?;
	let len = r
		.read_u32::<LittleEndian>()
		.chain_err(|| fmt_err(path, "truncated value length"))? as usize;
	let mut buf = vec![0u8; len];
	r.read_exact(&mut buf)
		.chain_err(|| fmt_err(path, "truncated value bytes"))?;
	let mut cursor = Cursor::new(&buf);

	if code == Value::null_code() {
		if len != 0 {
			return Err(fmt_err(path, "null value carries a non-empty payload"));
		}
		return Ok(Value::Null);
	}

	let kind = Kind::from_code(code).ok_or_else(|| fmt_err(path, format!("unknown value type code {}", code)))?;
	match kind {
		Kind::Text => {
			if buf.len() != len {
				return Err(fmt_err(path, "text value length mismatch"));
			}
			String::from_utf8(buf)
				.map(Value::Text)
				.map_err(|_| fmt_err(path, "text value is not valid utf-8"))
		}
		Kind::Real => {
			if len != 8 {
				return Err(fmt_err(path, "real value is not 8 bytes"));
			}
			Ok(Value::Real(cursor.read_f64::<LittleEndian>().unwrap()))
		}
		Kind::Boolean => {
			if len != 1 {
				return Err(fmt_err(path, "boolean value is not 1 byte"));
			}
			Ok(Value::Boolean(buf[0] != 0))
		}
		Kind::Instant => {
			if len != 8 {
				return Err(fmt_err(path, "instant value is not 8 bytes"));
			}
			Ok(Value::Instant(cursor.read_f64::<LittleEndian>().unwrap() as i64))
		}
	}
}

/// Writes the schema section: `u32` field count, then `name, kind-code`
/// per field in declaration order.
///
/// Only name and kind survive the round-trip through disk; `indexed`,
/// `unique`, `required`, `default` and relation metadata live in the
/// caller-supplied registry and are re-attached on open.
pub(crate) fn write_schema<W: Write>(w: &mut W, schema: &Schema) -> Result<()> {
	let fields: Vec<&FieldDefinition> = schema.fields_in_order();
	w.write_u32::<LittleEndian>(fields.len() as u32)?;
	for field in fields {
		write_string(w, &field.name)?;
		w.write_u8(field.kind.code())?;
	}
	Ok(())
}

/// Reads a bare `(name, kind)` list from the schema section. The caller
/// (`container.rs`/`storage.rs`) reconciles this against the registered
/// `Schema`, if any.
pub(crate) fn read_schema_fields(r: &mut impl Read, path: &Path) -> Result<Vec<(String, Kind)>> {
	let count = r
		.read_u32::<LittleEndian>()
		.chain_err(|| fmt_err(path, "truncated schema field count"))?;
	let mut out = Vec::with_capacity(count as usize);
	for _ in 0..count {
		let name = read_string(r, path)?;
		let code = r
			.read_u8()
			.chain_err(|| fmt_err(path, "truncated schema field kind"))?;
		let kind = Kind::from_code(code).ok_or_else(|| fmt_err(path, format!("unknown field kind code {}", code)))?;
		out.push((name, kind));
	}
	Ok(out)
}

/// Writes the index directory: `u32` index count, then
/// `name, field, flags` per index, where bit 0 of `flags` is `unique`.
pub(crate) fn write_index_directory<W: Write>(w: &mut W, indexes: &[IndexDefinition]) -> Result<()> {
	w.write_u32::<LittleEndian>(indexes.len() as u32)?;
	for index in indexes {
		write_string(w, &index.name)?;
		write_string(w, &index.field)?;
		let flags: u8 = if index.unique { 1 } else { 0 };
		w.write_u8(flags)?;
	}
	Ok(())
}

/// Reads the index directory, the inverse of [`write_index_directory`].
pub(crate) fn read_index_directory(r: &mut impl Read, path: &Path) -> Result<Vec<IndexDefinition>> {
	let count = r
		.read_u32::<LittleEndian>()
		.chain_err(|| fmt_err(path, "truncated index directory count"))?;
	let mut out = Vec::with_capacity(count as usize);
	for _ in 0..count {
		let name = read_string(r, path)?;
		let field = read_string(r, path)?;
		let flags = r
			.read_u8()
			.chain_err(|| fmt_err(path, "truncated index flags"))?;
		out.push(IndexDefinition {
			name,
			field,
			unique: flags & 1 != 0,
		});
	}
	Ok(out)
}

/// Writes one record as `u32 length-of-rest, id, field values in schema
/// order`, framed so a reader can skip an unrecognised record without
/// decoding its fields.
pub(crate) fn write_record<W: Write>(w: &mut W, id: &str, schema: &Schema, values: &[Value]) -> Result<()> {
	let mut body = Vec::new();
	write_string(&mut body, id)?;
	for value in values {
		write_value(&mut body, value)?;
	}
	let _ = schema;
	w.write_u32::<LittleEndian>(body.len() as u32)?;
	w.write_all(&body)?;
	Ok(())
}

/// Reads one record, returning its id and its values in schema order.
pub(crate) fn read_record(r: &mut impl Read, field_count: usize, path: &Path) -> Result<(String, Vec<Value>)> {
	let len = r
		.read_u32::<LittleEndian>()
		.chain_err(|| fmt_err(path, "truncated record length"))? as usize;
	let mut body = vec![0u8; len];
	r.read_exact(&mut body)
		.chain_err(|| fmt_err(path, "truncated record body"))?;
	let mut cursor = Cursor::new(&body);

	let id = read_string(&mut cursor, path)?;
	let mut values = Vec::with_capacity(field_count);
	for _ in 0..field_count {
		values.push(read_value(&mut cursor, path)?);
	}
	Ok((id, values))
}
