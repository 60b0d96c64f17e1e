//! Database file — the single binary container holding every
//! collection.
//!
//! `Container` only knows bytes: it has no idea what a live collection
//! or an open lock looks like. `storage.rs` is the only caller —
//! it turns `LoadedCollection`s into instantiated `Collection`s on
//! load, and turns live collections into `CollectionSnapshot`s before
//! every `save`.

use std::collections::HashMap;
use std::io::Cursor;
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::codec;
use crate::error::{Error, ErrorKind, Result, ResultExt};
use crate::schema::{IndexDefinition, Schema};
use crate::value::{Kind, Value};

const FILE_MAGIC: u32 = 0x4D4F_4442; // "MODB"
const FILE_VERSION: u32 = 1;
const FILE_HEADER_LEN: usize = 64;
const FILE_HEADER_RESERVED: usize = 52;

const PAYLOAD_MAGIC: u32 = 0x4D4F_434B; // "MOCK"
const PAYLOAD_VERSION: u32 = 1;
const PAYLOAD_HEADER_LEN: usize = 64;
const PAYLOAD_HEADER_RESERVED: usize = 24;

fn fmt_err(path: &Path, reason: impl Into<String>) -> Error {
	ErrorKind::FormatError(path.to_path_buf(), reason.into()).into()
}

/// One collection's data as loaded off disk, before the storage manager
/// has wired it into a live `Collection`.
pub struct LoadedCollection {
	pub schema_fields: Vec<(String, Kind)>,
	pub indexes: Vec<IndexDefinition>,
	pub records: Vec<(String, Vec<Value>)>,
}

/// A borrowed view of one live collection's current state, ready to be
/// serialized by `Container::save`.
pub struct CollectionSnapshot<'a> {
	pub name: &'a str,
	pub schema: &'a Schema,
	pub indexes: &'a [IndexDefinition],
	pub records: &'a [(String, Vec<Value>)],
}

/// The whole file's contents, keyed by collection name.
#[derive(Default)]
pub struct Container {
	collections: HashMap<String, LoadedCollection>,
}

impl Container {
	pub fn empty() -> Self {
		Container::default()
	}

	pub fn into_collections(self) -> HashMap<String, LoadedCollection> {
		self.collections
	}

	/// Loads the whole file. A missing file is not an error — the
	/// container simply starts empty.
	pub async fn load(path: &Path) -> Result<Container> {
		let bytes = match tokio::fs::read(path).await {
			Ok(bytes) => bytes,
			Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Container::empty()),
			Err(err) => return Err(err.into()),
		};
		decode_container(&bytes, path)
	}

	/// Serializes every given collection into one buffer and writes the
	/// container file with a single write, creating the parent
	/// directory first if it does not exist yet.
	pub async fn save(path: &Path, collections: &[CollectionSnapshot<'_>]) -> Result<()> {
		if let Some(parent) = path.parent() {
			if !parent.as_os_str().is_empty() {
				tokio::fs::create_dir_all(parent).await?;
			}
		}
		let buffer = encode_container(collections)?;
		tokio::fs::write(path, buffer).await?;
		Ok(())
	}
}

fn encode_container(collections: &[CollectionSnapshot<'_>]) -> Result<Vec<u8>> {
	let mut payloads: Vec<(&str, Vec<u8>)> = Vec::with_capacity(collections.len());
	for snapshot in collections {
		payloads.push((snapshot.name, encode_payload(snapshot)?));
	}

	let directory_len: usize = payloads.iter().map(|(name, _)| 4 + name.len() + 8 + 8).sum();
	let payload_len: usize = payloads.iter().map(|(_, bytes)| bytes.len()).sum();
	let mut buffer = Vec::with_capacity(FILE_HEADER_LEN + directory_len + payload_len);

	buffer.write_u32::<LittleEndian>(FILE_MAGIC)?;
	buffer.write_u32::<LittleEndian>(FILE_VERSION)?;
	buffer.write_u32::<LittleEndian>(payloads.len() as u32)?;
	buffer.extend(std::iter::repeat(0u8).take(FILE_HEADER_RESERVED));

	let mut offset = (FILE_HEADER_LEN + directory_len) as u64;
	for (name, payload) in &payloads {
		codec::write_string(&mut buffer, name)?;
		buffer.write_u64::<LittleEndian>(offset)?;
		buffer.write_u64::<LittleEndian>(payload.len() as u64)?;
		offset += payload.len() as u64;
	}

	for (_, payload) in &payloads {
		buffer.extend_from_slice(payload);
	}

	Ok(buffer)
}

fn encode_payload(snapshot: &CollectionSnapshot<'_>) -> Result<Vec<u8>> {
	let mut schema_section = Vec::new();
	codec::write_schema(&mut schema_section, snapshot.schema)?;

	let mut index_section = Vec::new();
	codec::write_index_directory(&mut index_section, snapshot.indexes)?;

	let mut data_section = Vec::new();
	for (id, values) in snapshot.records {
		codec::write_record(&mut data_section, id, snapshot.schema, values)?;
	}

	let schema_offset = PAYLOAD_HEADER_LEN as u64;
	let index_offset = schema_offset + schema_section.len() as u64;
	let data_offset = index_offset + index_section.len() as u64;

	let mut payload = Vec::with_capacity(PAYLOAD_HEADER_LEN + schema_section.len() + index_section.len() + data_section.len());
	payload.write_u32::<LittleEndian>(PAYLOAD_MAGIC)?;
	payload.write_u32::<LittleEndian>(PAYLOAD_VERSION)?;
	payload.write_u64::<LittleEndian>(schema_offset)?;
	payload.write_u64::<LittleEndian>(index_offset)?;
	payload.write_u64::<LittleEndian>(data_offset)?;
	payload.write_u64::<LittleEndian>(snapshot.records.len() as u64)?;
	payload.extend(std::iter::repeat(0u8).take(PAYLOAD_HEADER_RESERVED));

	payload.extend_from_slice(&schema_section);
	payload.extend_from_slice(&index_section);
	payload.extend_from_slice(&data_section);

	Ok(payload)
}

struct DirectoryEntry {
	name: String,
	offset: u64,
	length: u64,
}

fn decode_container(bytes: &[u8], path: &Path) -> Result<Container> {
	let mut cursor = Cursor::new(bytes);
	let magic = cursor.read_u32::<LittleEndian>().chain_err(|| fmt_err(path, "truncated file header"))?;
	if magic != FILE_MAGIC {
		return Err(fmt_err(path, format!("bad file magic 0x{:08x}", magic)));
	}
	let version = cursor
		.read_u32::<LittleEndian>()
		.chain_err(|| fmt_err(path, "truncated file header"))?;
	if version != FILE_VERSION {
		return Err(fmt_err(path, format!("unsupported format version {}", version)));
	}
	let count = cursor
		.read_u32::<LittleEndian>()
		.chain_err(|| fmt_err(path, "truncated file header"))?;
	cursor.set_position(cursor.position() + FILE_HEADER_RESERVED as u64);

	let mut entries = Vec::with_capacity(count as usize);
	for _ in 0..count {
		let name = codec::read_string(&mut cursor, path)?;
		let offset = cursor
			.read_u64::<LittleEndian>()
			.chain_err(|| fmt_err(path, "truncated directory entry"))?;
		let length = cursor
			.read_u64::<LittleEndian>()
			.chain_err(|| fmt_err(path, "truncated directory entry"))?;
		entries.push(DirectoryEntry { name, offset, length });
	}

	let mut collections = HashMap::with_capacity(entries.len());
	for entry in entries {
		let start = entry.offset as usize;
		let end = start
			.checked_add(entry.length as usize)
			.ok_or_else(|| fmt_err(path, format!("payload for `{}` overflows", entry.name)))?;
		if end > bytes.len() {
			return Err(fmt_err(path, format!("payload for `{}` runs past end of file", entry.name)));
		}
		let loaded = decode_payload(&bytes[start..end], &entry.name, path)?;
		collections.insert(entry.name, loaded);
	}

	Ok(Container { collections })
}

fn decode_payload(bytes: &[u8], name: &str, path: &Path) -> Result<LoadedCollection> {
	let mut cursor = Cursor::new(bytes);
	let magic = cursor
		.read_u32::<LittleEndian>()
		.chain_err(|| fmt_err(path, format!("truncated payload header for `{}`", name)))?;
	if magic != PAYLOAD_MAGIC {
		return Err(fmt_err(path, format!("bad payload magic for `{}`", name)));
	}
	let version = cursor
		.read_u32::<LittleEndian>()
		.chain_err(|| fmt_err(path, format!("truncated payload header for `{}`", name)))?;
	if version != PAYLOAD_VERSION {
		return Err(fmt_err(path, format!("unsupported payload version for `{}`", name)));
	}
	let schema_offset = cursor
		.read_u64::<LittleEndian>()
		.chain_err(|| fmt_err(path, format!("truncated payload header for `{}`", name)))?;
	let index_offset = cursor
		.read_u64::<LittleEndian>()
		.chain_err(|| fmt_err(path, format!("truncated payload header for `{}`", name)))?;
	let data_offset = cursor
		.read_u64::<LittleEndian>()
		.chain_err(|| fmt_err(path, format!("truncated payload header for `{}`", name)))?;
	let record_count = cursor
		.read_u64::<LittleEndian>()
		.chain_err(|| fmt_err(path, format!("truncated payload header for `{}`", name)))?;

	let section = |offset: u64| -> Result<&[u8]> {
		let start = offset as usize;
		if start > bytes.len() {
			return Err(fmt_err(path, format!("section offset past end of payload for `{}`", name)));
		}
		Ok(&bytes[start..])
	};

	let mut schema_cursor = Cursor::new(section(schema_offset)?);
	let schema_fields = codec::read_schema_fields(&mut schema_cursor, path)?;

	let mut index_cursor = Cursor::new(section(index_offset)?);
	let indexes = codec::read_index_directory(&mut index_cursor, path)?;

	let mut data_cursor = Cursor::new(section(data_offset)?);
	let field_count = schema_fields.len();
	let mut records = Vec::with_capacity(record_count as usize);
	for _ in 0..record_count {
		records.push(codec::read_record(&mut data_cursor, field_count, path)?);
	}

	Ok(LoadedCollection {
		schema_fields,
		indexes,
		records,
	})
}
