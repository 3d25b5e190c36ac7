//! Field-level editing of encoded protobuf messages.
//!
//! Decoding a message into a struct drops every field the struct does not declare. The agent
//! surface is forwarded verbatim, so rewrites work on the encoded fields instead and leave the rest
//! of the message byte-for-byte intact.

use prost::{
    bytes::Buf,
    encoding::{decode_key, decode_varint, encode_key, encode_varint, WireType},
};

use crate::{PeerpodError, PeerpodResult};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// One encoded field of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawField<'a> {
    /// The field number.
    pub number: u32,

    /// The wire type.
    pub wire_type: WireType,

    /// The value bytes. For length-delimited fields this excludes the length prefix.
    pub value: &'a [u8],

    /// The complete encoding of the field, key included.
    pub raw: &'a [u8],
}

/// An encoded message being rebuilt field by field.
#[derive(Debug, Default, Clone)]
pub struct MessageWriter {
    buf: Vec<u8>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl RawField<'_> {
    /// Whether this is a length-delimited field with the given number.
    pub fn is_bytes(&self, number: u32) -> bool {
        self.number == number && self.wire_type == WireType::LengthDelimited
    }

    /// The value as a UTF-8 string.
    pub fn as_str(&self) -> PeerpodResult<&str> {
        std::str::from_utf8(self.value).map_err(|e| {
            PeerpodError::InvalidInput(format!("field {} is not valid UTF-8: {e}", self.number))
        })
    }
}

impl MessageWriter {
    /// Creates an empty message.
    pub fn new() -> Self {
        Self::default()
    }

    /// Copies a field unchanged.
    pub fn copy(&mut self, field: &RawField<'_>) -> &mut Self {
        self.buf.extend_from_slice(field.raw);
        self
    }

    /// Appends a length-delimited field.
    pub fn bytes(&mut self, number: u32, value: &[u8]) -> &mut Self {
        encode_key(number, WireType::LengthDelimited, &mut self.buf);
        encode_varint(value.len() as u64, &mut self.buf);
        self.buf.extend_from_slice(value);
        self
    }

    /// Appends a string field.
    pub fn string(&mut self, number: u32, value: &str) -> &mut Self {
        self.bytes(number, value.as_bytes())
    }

    /// Appends an entry of a `map<string, string>` field.
    pub fn map_entry(&mut self, number: u32, key: &str, value: &str) -> &mut Self {
        let mut entry = MessageWriter::new();
        entry.string(1, key).string(2, value);
        self.bytes(number, &entry.finish())
    }

    /// Returns the encoded message.
    pub fn finish(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buf)
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Splits an encoded message into its fields, in wire order.
pub fn parse_fields(mut buf: &[u8]) -> PeerpodResult<Vec<RawField<'_>>> {
    let mut fields = Vec::new();
    while buf.has_remaining() {
        let start = buf;
        let (number, wire_type) = decode_key(&mut buf)?;
        let value = match wire_type {
            WireType::Varint => {
                let before = buf;
                decode_varint(&mut buf)?;
                &before[..before.len() - buf.len()]
            }
            WireType::SixtyFourBit => take(&mut buf, 8)?,
            WireType::ThirtyTwoBit => take(&mut buf, 4)?,
            WireType::LengthDelimited => {
                let len = decode_varint(&mut buf)? as usize;
                take(&mut buf, len)?
            }
            WireType::StartGroup | WireType::EndGroup => {
                return Err(PeerpodError::InvalidInput(format!(
                    "field {number} uses the unsupported group encoding"
                )))
            }
        };

        fields.push(RawField {
            number,
            wire_type,
            value,
            raw: &start[..start.len() - buf.len()],
        });
    }

    Ok(fields)
}

/// Rebuilds `buf`, replacing every length-delimited field `number` through `edit`.
///
/// `edit` returns `None` to drop the field. When no such field exists and `missing` yields a value,
/// that value is appended as a new field.
pub fn edit_field(
    buf: &[u8],
    number: u32,
    mut edit: impl FnMut(&[u8]) -> PeerpodResult<Option<Vec<u8>>>,
    missing: impl FnOnce() -> PeerpodResult<Option<Vec<u8>>>,
) -> PeerpodResult<Vec<u8>> {
    let mut writer = MessageWriter::new();
    let mut seen = false;
    for field in parse_fields(buf)? {
        if field.is_bytes(number) {
            seen = true;
            if let Some(value) = edit(field.value)? {
                writer.bytes(number, &value);
            }
        } else {
            writer.copy(&field);
        }
    }

    if !seen {
        if let Some(value) = missing()? {
            writer.bytes(number, &value);
        }
    }

    Ok(writer.finish())
}

/// Returns the string values of a repeated string field.
pub fn repeated_strings(buf: &[u8], number: u32) -> PeerpodResult<Vec<String>> {
    parse_fields(buf)?
        .iter()
        .filter(|f| f.is_bytes(number))
        .map(|f| f.as_str().map(str::to_string))
        .collect()
}

/// Looks up `key` in a `map<string, string>` field. Later entries win, as on decode.
pub fn map_get(buf: &[u8], number: u32, key: &str) -> PeerpodResult<Option<String>> {
    let mut found = None;
    for field in parse_fields(buf)?.iter().filter(|f| f.is_bytes(number)) {
        let mut entry_key = String::new();
        let mut entry_value = String::new();
        for part in parse_fields(field.value)? {
            if part.is_bytes(1) {
                entry_key = part.as_str()?.to_string();
            } else if part.is_bytes(2) {
                entry_value = part.as_str()?.to_string();
            }
        }
        if entry_key == key {
            found = Some(entry_value);
        }
    }
    Ok(found)
}

fn take<'a>(buf: &mut &'a [u8], len: usize) -> PeerpodResult<&'a [u8]> {
    if buf.len() < len {
        return Err(PeerpodError::InvalidInput(format!(
            "truncated protobuf field: wanted {len} bytes, {} left",
            buf.len()
        )));
    }
    let (head, tail) = buf.split_at(len);
    *buf = tail;
    Ok(head)
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_fields_keeps_raw_bytes() -> anyhow::Result<()> {
        // field 1 varint 150, field 2 "hi", field 3 fixed32
        let buf = [0x08, 0x96, 0x01, 0x12, 0x02, b'h', b'i', 0x1d, 1, 2, 3, 4];
        let fields = parse_fields(&buf)?;
        assert_eq!(fields.len(), 3);
        assert_eq!(fields[0].raw, &[0x08, 0x96, 0x01]);
        assert_eq!(fields[1].as_str()?, "hi");
        assert_eq!(fields[2].value, &[1, 2, 3, 4]);

        let mut writer = MessageWriter::new();
        for field in &fields {
            writer.copy(field);
        }
        assert_eq!(writer.finish(), buf);
        Ok(())
    }

    #[test]
    fn test_parse_fields_rejects_truncation() {
        assert!(parse_fields(&[0x12, 0x05, b'a']).is_err());
    }

    #[test]
    fn test_edit_field_replaces_drops_and_appends() -> anyhow::Result<()> {
        let mut writer = MessageWriter::new();
        writer.string(1, "keep").string(2, "a").string(2, "b");
        let buf = writer.finish();

        let dropped = edit_field(&buf, 2, |_| Ok(None), || Ok(None))?;
        assert_eq!(repeated_strings(&dropped, 2)?, Vec::<String>::new());
        assert_eq!(repeated_strings(&dropped, 1)?, vec!["keep"]);

        let appended = edit_field(&buf, 3, |_| Ok(None), || Ok(Some(b"new".to_vec())))?;
        assert_eq!(repeated_strings(&appended, 3)?, vec!["new"]);
        assert_eq!(&appended[..buf.len()], &buf[..]);
        Ok(())
    }

    #[test]
    fn test_map_get_last_entry_wins() -> anyhow::Result<()> {
        let mut writer = MessageWriter::new();
        writer
            .map_entry(7, "a", "1")
            .map_entry(7, "b", "2")
            .map_entry(7, "a", "3");
        let buf = writer.finish();

        assert_eq!(map_get(&buf, 7, "a")?, Some("3".to_string()));
        assert_eq!(map_get(&buf, 7, "b")?, Some("2".to_string()));
        assert_eq!(map_get(&buf, 7, "c")?, None);
        Ok(())
    }
}
