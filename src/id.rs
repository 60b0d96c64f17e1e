//! Identifier generator — opaque short record identifiers.
//!
//! Produces 6-character ids from a 62-symbol alphanumeric alphabet by
//! uniform random selection. Collisions are not checked here; callers
//! (the collection engine, §4.F) must detect and retry.

use rand::Rng;

const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
const ID_LEN: usize = 6;

/// Generates a new opaque identifier.
///
/// Ids are not ordered and carry no meaning beyond uniqueness within a
/// collection; the on-disk format stores them length-prefixed, so a
/// longer `ID_LEN` would not change the container layout.
pub fn generate() -> String {
	let mut rng = rand::thread_rng();
	(0..ID_LEN)
		.map(|_| {
			let idx = rng.gen_range(0..ALPHABET.len());
			ALPHABET[idx] as char
		})
		.collect()
}
