//! Validated cell addressing.
//!
//! A cell is identified by a 1-based row and a single column letter. The
//! canonical string form is `"<row>:<col>"` (e.g. `3:B`); the A1 form used
//! at the sheet boundary is produced by [`CellAddress::a1`].

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Highest addressable row.
pub const MAX_ROW: u32 = 10_000;

/// Number of addressable columns (`A..=Z`).
pub const MAX_COL: u8 = 26;

/// Largest accepted cell value, in bytes.
pub const MAX_VALUE_BYTES: usize = 5_000;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CellError {
	#[error("row {0} out of range 1..={MAX_ROW}")]
	InvalidRow(u32),
	#[error("invalid column letter {0:?}")]
	InvalidColumn(String),
	#[error("malformed cell address {0:?}")]
	MalformedAddress(String),
	#[error("cell value of {0} bytes exceeds the {MAX_VALUE_BYTES} byte limit")]
	ValueTooLarge(usize),
}

/// A single column letter, stored as a zero-based index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Column(u8);

impl Column {
	pub fn from_letter(letter: char) -> Result<Self, CellError> {
		let upper = letter.to_ascii_uppercase();
		if upper.is_ascii_uppercase() {
			Ok(Self(upper as u8 - b'A'))
		} else {
			Err(CellError::InvalidColumn(letter.to_string()))
		}
	}

	/// Zero-based index, as used by dense 2-D value arrays.
	pub fn from_index(index: usize) -> Option<Self> {
		(index < MAX_COL as usize).then(|| Self(index as u8))
	}

	pub fn index(self) -> usize {
		self.0 as usize
	}

	pub fn letter(self) -> char {
		(b'A' + self.0) as char
	}
}

impl fmt::Display for Column {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.letter())
	}
}

impl FromStr for Column {
	type Err = CellError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let mut chars = s.chars();
		match (chars.next(), chars.next()) {
			(Some(c), None) => Self::from_letter(c),
			_ => Err(CellError::InvalidColumn(s.to_string())),
		}
	}
}

/// A (row, column) pair identifying one cell on both peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CellAddress {
	row: u32,
	col: Column,
}

impl CellAddress {
	pub fn new(row: u32, col: Column) -> Result<Self, CellError> {
		if row == 0 || row > MAX_ROW {
			return Err(CellError::InvalidRow(row));
		}
		Ok(Self { row, col })
	}

	pub fn row(&self) -> u32 {
		self.row
	}

	pub fn col(&self) -> Column {
		self.col
	}

	/// A1-notation form used when talking to the sheet API, e.g. `B3`.
	pub fn a1(&self) -> String {
		format!("{}{}", self.col.letter(), self.row)
	}
}

impl fmt::Display for CellAddress {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}:{}", self.row, self.col)
	}
}

impl FromStr for CellAddress {
	type Err = CellError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let (row, col) = s
			.split_once(':')
			.ok_or_else(|| CellError::MalformedAddress(s.to_string()))?;
		let row = row
			.parse::<u32>()
			.map_err(|_| CellError::MalformedAddress(s.to_string()))?;
		Self::new(row, col.parse()?)
	}
}

impl Serialize for CellAddress {
	fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
		serializer.collect_str(self)
	}
}

impl<'de> Deserialize<'de> for CellAddress {
	fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
		let s = String::deserialize(deserializer)?;
		s.parse().map_err(serde::de::Error::custom)
	}
}

/// A cell payload validated at the write boundary.
///
/// Only ingress paths construct these; internally the engine passes plain
/// strings since remote-observed values are authoritative as-is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CellValue(String);

impl CellValue {
	pub fn new(value: impl Into<String>) -> Result<Self, CellError> {
		let value = value.into();
		if value.len() > MAX_VALUE_BYTES {
			return Err(CellError::ValueTooLarge(value.len()));
		}
		Ok(Self(value))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}

	pub fn into_string(self) -> String {
		self.0
	}

	pub fn is_empty(&self) -> bool {
		self.0.is_empty()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn column_letter_round_trip() {
		for (index, letter) in ('A'..='Z').enumerate() {
			let col = Column::from_letter(letter).unwrap();
			assert_eq!(col.index(), index);
			assert_eq!(col.letter(), letter);
			assert_eq!(Column::from_index(index), Some(col));
		}
		assert_eq!(Column::from_index(26), None);
		assert!(Column::from_letter('é').is_err());
		assert!(Column::from_letter('3').is_err());
	}

	#[test]
	fn lowercase_letters_normalize() {
		assert_eq!(
			Column::from_letter('b').unwrap(),
			Column::from_letter('B').unwrap()
		);
	}

	#[test]
	fn address_bounds() {
		let b = Column::from_letter('B').unwrap();
		assert!(CellAddress::new(0, b).is_err());
		assert!(CellAddress::new(MAX_ROW + 1, b).is_err());
		assert!(CellAddress::new(1, b).is_ok());
		assert!(CellAddress::new(MAX_ROW, b).is_ok());
	}

	#[test]
	fn canonical_form_round_trips() {
		let addr = CellAddress::new(3, Column::from_letter('B').unwrap()).unwrap();
		assert_eq!(addr.to_string(), "3:B");
		assert_eq!(addr.a1(), "B3");
		assert_eq!("3:B".parse::<CellAddress>().unwrap(), addr);
		assert!("B:3".parse::<CellAddress>().is_err());
		assert!("3B".parse::<CellAddress>().is_err());
	}

	#[test]
	fn value_size_cap() {
		assert!(CellValue::new("x".repeat(MAX_VALUE_BYTES)).is_ok());
		assert!(matches!(
			CellValue::new("x".repeat(MAX_VALUE_BYTES + 1)),
			Err(CellError::ValueTooLarge(_))
		));
	}
}
