//! ABX order packet and its fixed-size wire codec.
//!
//! Every packet on the wire is exactly [`RECORD_LEN`] bytes:
//!
//! | offset | len | field      | encoding                         |
//! |--------|-----|------------|----------------------------------|
//! | 0      | 4   | `symbol`   | ASCII, right-padded with `\0`    |
//! | 4      | 1   | `side`     | ASCII, `B` or `S`                |
//! | 5      | 4   | `quantity` | `i32` big-endian                 |
//! | 9      | 4   | `price`    | `i32` big-endian, unscaled       |
//! | 13     | 4   | `sequence` | `i32` big-endian                 |
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Size of one encoded packet.
pub const RECORD_LEN: usize = 17;
/// Width of the null-padded symbol field.
pub const SYMBOL_LEN: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Buy,
    Sell,
}

/// One decoded order packet. Immutable once decoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub symbol: String,
    /// Raw side character; not validated beyond being ASCII.
    pub side: char,
    pub quantity: i32,
    pub price: i32,
    pub sequence: i32,
}

fn read_i32_be(bytes: &[u8], off: usize) -> i32 {
    let mut tmp = [0u8; 4];
    tmp.copy_from_slice(&bytes[off..off + 4]);
    i32::from_be_bytes(tmp)
}

impl Record {
    /// Decodes one wire frame.
    ///
    /// # Errors
    /// Returns [`Error::MalformedFrame`] if `bytes` is not exactly
    /// [`RECORD_LEN`] long or if the symbol or side bytes are not ASCII.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != RECORD_LEN {
            return Err(Error::MalformedFrame(format!(
                "expected {RECORD_LEN} bytes, got {}",
                bytes.len()
            )));
        }
        let raw_symbol = &bytes[..SYMBOL_LEN];
        if !raw_symbol.is_ascii() {
            return Err(Error::MalformedFrame(format!(
                "non-ASCII symbol bytes {raw_symbol:02X?}"
            )));
        }
        let symbol: String = raw_symbol.iter().map(|&b| b as char).collect();
        let side = bytes[SYMBOL_LEN];
        if !side.is_ascii() {
            return Err(Error::MalformedFrame(format!("non-ASCII side byte {side:#04x}")));
        }
        Ok(Self {
            symbol: symbol.trim_end_matches('\0').to_owned(),
            side: side as char,
            quantity: read_i32_be(bytes, 5),
            price: read_i32_be(bytes, 9),
            sequence: read_i32_be(bytes, 13),
        })
    }

    /// Encodes the record back into its wire form.
    ///
    /// # Errors
    /// Returns [`Error::Encode`] if the symbol is longer than [`SYMBOL_LEN`]
    /// bytes or the symbol or side is not ASCII.
    pub fn encode(&self) -> Result<[u8; RECORD_LEN]> {
        if self.symbol.len() > SYMBOL_LEN || !self.symbol.is_ascii() {
            return Err(Error::Encode(format!(
                "symbol {:?} must be at most {SYMBOL_LEN} ASCII characters",
                self.symbol
            )));
        }
        if !self.side.is_ascii() {
            return Err(Error::Encode(format!("side {:?} is not ASCII", self.side)));
        }
        let mut out = [0u8; RECORD_LEN];
        out[..self.symbol.len()].copy_from_slice(self.symbol.as_bytes());
        out[SYMBOL_LEN] = self.side as u8;
        out[5..9].copy_from_slice(&self.quantity.to_be_bytes());
        out[9..13].copy_from_slice(&self.price.to_be_bytes());
        out[13..17].copy_from_slice(&self.sequence.to_be_bytes());
        Ok(out)
    }

    /// Interprets the side character. `None` for anything but `B` or `S`.
    pub fn side_kind(&self) -> Option<Side> {
        match self.side {
            'B' => Some(Side::Buy),
            'S' => Some(Side::Sell),
            _ => None,
        }
    }
}
