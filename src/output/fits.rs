// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Minimal FITS writer: one primary HDU with a 32-bit integer image.

use std::fs::File;
use std::io::Write;
use std::path::Path;

use crate::error::{CamdError, Result};
use crate::output::region::BinnedImage;

const CARD_LEN: usize = 80;
const BLOCK_LEN: usize = 2880;

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Logical(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Logical(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::Int(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_owned())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl Value {
    fn render(&self) -> String {
        match self {
            Value::Logical(b) => format!("{:>20}", if *b { "T" } else { "F" }),
            Value::Int(i) => format!("{i:>20}"),
            Value::Float(f) if f.is_finite() => format!("{:>20}", format!("{f:.6}")),
            Value::Float(_) => format!("{:>20}", "0.0"),
            Value::Str(s) => format!("'{:<8}'", s.replace('\'', "''")),
        }
    }
}

/// Ordered header cards, each exactly 80 ASCII bytes.
#[derive(Debug, Default, Clone)]
pub struct FitsHeader {
    cards: Vec<String>,
}

impl FitsHeader {
    /// Start a primary header for a 2-D 32-bit image.
    pub fn for_image(width: u32, height: u32) -> Self {
        let mut h = Self::default();
        h.push("SIMPLE", true, "conforms to FITS standard");
        h.push("BITPIX", 32i64, "array data type");
        h.push("NAXIS", 2i64, "number of array dimensions");
        h.push("NAXIS1", width, "");
        h.push("NAXIS2", height, "");
        h
    }

    pub fn push(&mut self, key: &str, value: impl Into<Value>, comment: &str) {
        let mut card = format!("{:<8}= {}", key.to_ascii_uppercase(), value.into().render());
        if !comment.is_empty() {
            card.push_str(" / ");
            card.push_str(comment);
        }
        card.retain(|c| c.is_ascii() && !c.is_ascii_control());
        card.truncate(CARD_LEN);
        self.cards.push(format!("{card:<CARD_LEN$}"));
    }

    pub fn len(&self) -> usize {
        self.cards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cards.is_empty()
    }

    /// Serialize with blank cards reserved up to `capacity` cards (END
    /// included), padded to a whole number of 2880-byte blocks.
    pub fn to_bytes(&self, capacity: usize) -> Vec<u8> {
        let used = self.cards.len() + 1;
        if used > capacity {
            tracing::debug!(used, capacity, "header exceeds reserved card capacity");
        }
        let blanks = capacity.saturating_sub(used);

        let mut out = Vec::with_capacity((used + blanks) * CARD_LEN + BLOCK_LEN);
        for card in &self.cards {
            out.extend_from_slice(card.as_bytes());
        }
        out.resize(out.len() + blanks * CARD_LEN, b' ');
        out.extend_from_slice(format!("{:<CARD_LEN$}", "END").as_bytes());
        pad_block(&mut out, b' ');
        out
    }
}

fn pad_block(buf: &mut Vec<u8>, fill: u8) {
    let rem = buf.len() % BLOCK_LEN;
    if rem != 0 {
        buf.resize(buf.len() + BLOCK_LEN - rem, fill);
    }
}

/// Encode header and image into a complete FITS file image.
pub fn encode(header: &FitsHeader, capacity: usize, image: &BinnedImage) -> Result<Vec<u8>> {
    let expected = image.width as usize * image.height as usize;
    if image.data.len() != expected {
        return Err(CamdError::Pool(format!(
            "image holds {} pixels, {}x{} needs {expected}",
            image.data.len(),
            image.width,
            image.height
        )));
    }
    let mut out = header.to_bytes(capacity);
    out.reserve(expected * 4 + BLOCK_LEN);
    for v in &image.data {
        out.extend_from_slice(&v.to_be_bytes());
    }
    pad_block(&mut out, 0);
    Ok(out)
}

/// Write a FITS file and flush it to disk.
pub fn write_file(path: &Path, header: &FitsHeader, capacity: usize, image: &BinnedImage) -> Result<()> {
    let bytes = encode(header, capacity, image)?;
    let mut f = File::create(path)?;
    f.write_all(&bytes)?;
    f.sync_all()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn card(bytes: &[u8], key: &str) -> Option<String> {
        bytes
            .chunks(CARD_LEN)
            .map(|c| String::from_utf8_lossy(c).into_owned())
            .find(|c| c.starts_with(&format!("{key:<8}=")))
    }

    #[test]
    fn header_cards_are_fixed_format() {
        let mut h = FitsHeader::for_image(3, 2);
        h.push("EXPTIME", 1.5, "seconds");
        h.push("CAMERA", "it's", "");
        let bytes = h.to_bytes(36);
        assert_eq!(bytes.len(), BLOCK_LEN);
        assert!(bytes.starts_with(b"SIMPLE  =                    T / conforms"));
        let exptime = card(&bytes, "EXPTIME").unwrap();
        assert_eq!(&exptime[10..30], "            1.500000");
        assert!(card(&bytes, "CAMERA").unwrap().contains("'it''s   '"));
    }

    #[test]
    fn capacity_reserves_blank_cards_before_end() {
        let h = FitsHeader::for_image(1, 1);
        let bytes = h.to_bytes(40);
        assert_eq!(bytes.len(), 2 * BLOCK_LEN);
        let end = bytes.chunks(CARD_LEN).position(|c| c.starts_with(b"END ")).unwrap();
        assert_eq!(end, 39);
    }

    #[test]
    fn data_is_big_endian_and_block_padded() {
        let h = FitsHeader::for_image(2, 1);
        let img = BinnedImage {
            width: 2,
            height: 1,
            data: vec![1, -2],
        };
        let bytes = encode(&h, 36, &img).unwrap();
        assert_eq!(bytes.len(), 2 * BLOCK_LEN);
        assert_eq!(&bytes[BLOCK_LEN..BLOCK_LEN + 8], &[0, 0, 0, 1, 0xff, 0xff, 0xff, 0xfe]);
    }

    #[test]
    fn mismatched_image_is_rejected() {
        let img = BinnedImage {
            width: 2,
            height: 2,
            data: vec![0; 3],
        };
        assert!(encode(&FitsHeader::for_image(2, 2), 36, &img).is_err());
    }
}
