//! Binary record format: the header with its chunk-table allocation
//! descriptor, and the child entries of object/array record bodies.
//!
//! All multi-byte integers are big-endian. Child entries straddling a chunk
//! boundary are a normal streaming condition, signalled by
//! `DecodeResult::NeedMore` rather than an error.

use std::convert::TryInto;

use crate::error::{Result, TreeError};
use crate::model::{PathReference, RecordAddress, Value, ValueType};
use crate::storage::fst::{NodeAllocation, StorageRange};
use crate::storage::kit::KeyIndexTable;

/// Record flag bits in the high nibble of header byte 0.
pub const FLAG_KEY_TREE: u8 = 0x40;
pub const FLAG_READ_LOCK: u8 = 0x20;
pub const FLAG_WRITE_LOCK: u8 = 0x10;

/// Chunk table entry types.
const CHUNK_END: u8 = 0x00;
const CHUNK_FIRST_LENGTH: u8 = 0x01;
const CHUNK_RANGE: u8 = 0x02;
const CHUNK_PAGES: u8 = 0x03;

/// Child-entry value locations (bits 7..6 of the second value-info byte).
const LOCATION_DELETED: u8 = 0;
const LOCATION_TINY: u8 = 1;
const LOCATION_INLINE: u8 = 2;
const LOCATION_RECORD: u8 = 3;

/// Inline values are length-prefixed with 6 bits holding `length - 1`.
pub const MAX_INLINE_VALUE_SIZE: usize = 64;

/// Records whose child list would exceed this count are serialized as an
/// embedded key tree instead of a linear list.
pub const KEY_TREE_THRESHOLD: usize = 100;

/// Outcome of decoding from a byte window that may end mid-entry.
#[derive(Debug, PartialEq)]
pub enum DecodeResult<T> {
    Done { value: T, consumed: usize },
    NeedMore,
}

/// A child value as it appears on the wire inside a parent record.
#[derive(Debug, Clone, PartialEq)]
pub enum WireValue {
    /// Payload packed into the low nibble of the type byte.
    Tiny { value_type: ValueType, tiny: u8 },
    /// Length-prefixed bytes embedded in the parent record.
    Inline { value_type: ValueType, bytes: Vec<u8> },
    /// 6-byte address of the child's own record.
    Record {
        value_type: ValueType,
        address: RecordAddress,
    },
}

impl WireValue {
    pub fn value_type(&self) -> ValueType {
        match self {
            WireValue::Tiny { value_type, .. }
            | WireValue::Inline { value_type, .. }
            | WireValue::Record { value_type, .. } => *value_type,
        }
    }

    pub fn address(&self) -> Option<RecordAddress> {
        match self {
            WireValue::Record { address, .. } => Some(*address),
            _ => None,
        }
    }
}

/// One decoded child entry. `key` is `None` inside arrays, where the entry's
/// position determines its index.
#[derive(Debug, Clone, PartialEq)]
pub struct ChildEntry {
    pub key: Option<String>,
    pub value: WireValue,
}

// ---------------------------------------------------------------------------
// chunk table

/// Parsed chunk table of a record header, still relative to the record's own
/// address.
#[derive(Debug, PartialEq)]
pub struct ChunkTable {
    /// Length of the first, implicit range (at least 1).
    pub first_range_length: u16,
    /// Explicit follow-on ranges.
    pub extra_ranges: Vec<StorageRange>,
    /// Byte length of the allocation's final record.
    pub last_chunk_size: u16,
}

impl ChunkTable {
    pub fn to_allocation(&self, address: RecordAddress) -> NodeAllocation {
        let mut ranges = vec![StorageRange::new(
            address.page_nr,
            address.record_nr,
            self.first_range_length,
        )];
        ranges.extend(self.extra_ranges.iter().copied());
        NodeAllocation::new(ranges)
    }
}

/// Serialized byte length of a header for the given allocation: the flag/type
/// byte, optional first-range length entry, one entry per extra range, and
/// the terminator with the last-chunk length.
pub fn header_byte_length(ranges: &[StorageRange]) -> usize {
    let mut length = 1 + 3;
    if ranges[0].length > 1 {
        length += 3;
    }
    length += 9 * (ranges.len() - 1);
    length
}

/// Serializes header byte 0 and the chunk table for an allocation.
pub fn build_record_header(
    value_type: ValueType,
    has_key_tree: bool,
    allocation: &NodeAllocation,
    last_chunk_size: u16,
) -> Vec<u8> {
    let mut out = Vec::with_capacity(header_byte_length(&allocation.ranges));
    let flags = if has_key_tree { FLAG_KEY_TREE } else { 0 };
    out.push(flags | value_type.to_nibble());
    let first = allocation.ranges[0];
    if first.length > 1 {
        out.push(CHUNK_FIRST_LENGTH);
        out.extend_from_slice(&(first.length - 1).to_be_bytes());
    }
    for range in &allocation.ranges[1..] {
        out.push(CHUNK_RANGE);
        out.extend_from_slice(&range.page_nr.to_be_bytes());
        out.extend_from_slice(&range.record_nr.to_be_bytes());
        out.extend_from_slice(&range.length.to_be_bytes());
    }
    out.push(CHUNK_END);
    out.extend_from_slice(&last_chunk_size.to_be_bytes());
    out
}

/// Parses the chunk table that follows header byte 0. `NeedMore` means the
/// table continues past the window and the caller must read the next record
/// of the first range.
pub fn parse_chunk_table(data: &[u8]) -> Result<DecodeResult<ChunkTable>> {
    let mut offset = 0;
    let mut first_range_length: u16 = 1;
    let mut extra_ranges = Vec::new();
    loop {
        if offset >= data.len() {
            return Ok(DecodeResult::NeedMore);
        }
        match data[offset] {
            CHUNK_END => {
                if offset + 3 > data.len() {
                    return Ok(DecodeResult::NeedMore);
                }
                let last_chunk_size = u16::from_be_bytes([data[offset + 1], data[offset + 2]]);
                return Ok(DecodeResult::Done {
                    value: ChunkTable {
                        first_range_length,
                        extra_ranges,
                        last_chunk_size,
                    },
                    consumed: offset + 3,
                });
            }
            CHUNK_FIRST_LENGTH => {
                if offset + 3 > data.len() {
                    return Ok(DecodeResult::NeedMore);
                }
                let extra = u16::from_be_bytes([data[offset + 1], data[offset + 2]]);
                first_range_length = 1 + extra;
                offset += 3;
            }
            CHUNK_RANGE => {
                if offset + 9 > data.len() {
                    return Ok(DecodeResult::NeedMore);
                }
                let page_nr =
                    u32::from_be_bytes(data[offset + 1..offset + 5].try_into().expect("4 bytes"));
                let record_nr = u16::from_be_bytes([data[offset + 5], data[offset + 6]]);
                let length = u16::from_be_bytes([data[offset + 7], data[offset + 8]]);
                if length == 0 {
                    return Err(TreeError::Corrupt("zero-length chunk table range".into()));
                }
                extra_ranges.push(StorageRange::new(page_nr, record_nr, length));
                offset += 9;
            }
            CHUNK_PAGES => {
                // Reserved, never produced.
                return Err(TreeError::Corrupt(
                    "contiguous-pages chunk entry is not supported".into(),
                ));
            }
            other => {
                return Err(TreeError::Corrupt(format!(
                    "unknown chunk table entry type: 0x{other:02X}"
                )))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// child entries

/// Appends the key-info bytes for a named child: a 15-bit KIT index when the
/// key is interned, inline ASCII bytes otherwise.
pub fn encode_key(key: &str, kit: &mut KeyIndexTable, out: &mut Vec<u8>) -> Result<()> {
    if let Some(index) = kit.get_or_add(key) {
        out.push(0x80 | (index >> 8) as u8);
        out.push(index as u8);
        return Ok(());
    }
    let bytes = key.as_bytes();
    if bytes.is_empty() || bytes.len() > 128 || !key.is_ascii() {
        return Err(TreeError::UnsupportedValue(format!(
            "key \"{key}\" must be 1..=128 ASCII bytes"
        )));
    }
    out.push((bytes.len() - 1) as u8);
    out.extend_from_slice(bytes);
    Ok(())
}

fn decode_key(data: &[u8], kit: &KeyIndexTable) -> Result<DecodeResult<String>> {
    if data.is_empty() {
        return Ok(DecodeResult::NeedMore);
    }
    let first = data[0];
    if first & 0x80 != 0 {
        if data.len() < 2 {
            return Ok(DecodeResult::NeedMore);
        }
        let index = ((first as u16 & 0x7F) << 8) | data[1] as u16;
        return Ok(DecodeResult::Done {
            value: kit.get(index)?.to_string(),
            consumed: 2,
        });
    }
    let length = (first & 0x7F) as usize + 1;
    if data.len() < 1 + length {
        return Ok(DecodeResult::NeedMore);
    }
    let key = std::str::from_utf8(&data[1..1 + length])
        .map_err(|_| TreeError::Corrupt("inline key is not valid UTF-8".into()))?;
    Ok(DecodeResult::Done {
        value: key.to_string(),
        consumed: 1 + length,
    })
}

/// Appends the value-info bytes (and payload) for a child value.
pub fn encode_wire_value(value: &WireValue, out: &mut Vec<u8>) -> Result<()> {
    match value {
        WireValue::Tiny { value_type, tiny } => {
            if *tiny > 0x0F {
                return Err(TreeError::InvalidArgument(
                    "tiny value exceeds 4 bits".into(),
                ));
            }
            out.push((value_type.to_nibble() << 4) | tiny);
            out.push(LOCATION_TINY << 6);
        }
        WireValue::Inline { value_type, bytes } => {
            if bytes.is_empty() || bytes.len() > MAX_INLINE_VALUE_SIZE {
                return Err(TreeError::InvalidArgument(format!(
                    "inline value length {} out of range",
                    bytes.len()
                )));
            }
            out.push(value_type.to_nibble() << 4);
            out.push((LOCATION_INLINE << 6) | (bytes.len() - 1) as u8);
            out.extend_from_slice(bytes);
        }
        WireValue::Record {
            value_type,
            address,
        } => {
            out.push(value_type.to_nibble() << 4);
            out.push(LOCATION_RECORD << 6);
            out.extend_from_slice(&address.page_nr.to_be_bytes());
            out.extend_from_slice(&address.record_nr.to_be_bytes());
        }
    }
    Ok(())
}

/// Decodes one value-info + payload.
pub fn decode_wire_value(data: &[u8]) -> Result<DecodeResult<WireValue>> {
    if data.len() < 2 {
        return Ok(DecodeResult::NeedMore);
    }
    let value_type = ValueType::from_nibble(data[0] >> 4)?;
    let tiny = data[0] & 0x0F;
    let location = data[1] >> 6;
    match location {
        LOCATION_TINY => Ok(DecodeResult::Done {
            value: WireValue::Tiny { value_type, tiny },
            consumed: 2,
        }),
        LOCATION_INLINE => {
            let length = (data[1] & 0x3F) as usize + 1;
            if data.len() < 2 + length {
                return Ok(DecodeResult::NeedMore);
            }
            Ok(DecodeResult::Done {
                value: WireValue::Inline {
                    value_type,
                    bytes: data[2..2 + length].to_vec(),
                },
                consumed: 2 + length,
            })
        }
        LOCATION_RECORD => {
            if data.len() < 8 {
                return Ok(DecodeResult::NeedMore);
            }
            let page_nr = u32::from_be_bytes(data[2..6].try_into().expect("4 bytes"));
            let record_nr = u16::from_be_bytes([data[6], data[7]]);
            Ok(DecodeResult::Done {
                value: WireValue::Record {
                    value_type,
                    address: RecordAddress::new(page_nr, record_nr),
                },
                consumed: 8,
            })
        }
        LOCATION_DELETED => Err(TreeError::Corrupt(
            "deleted value location encountered while reading".into(),
        )),
        _ => unreachable!("location is two bits"),
    }
}

/// Appends one full child entry. `key` is `None` for array entries.
pub fn encode_child_entry(
    key: Option<&str>,
    value: &WireValue,
    kit: &mut KeyIndexTable,
    out: &mut Vec<u8>,
) -> Result<()> {
    if let Some(key) = key {
        encode_key(key, kit, out)?;
    }
    encode_wire_value(value, out)
}

/// Decodes one child entry from a byte window.
pub fn decode_child_entry(
    data: &[u8],
    parent_is_array: bool,
    kit: &KeyIndexTable,
) -> Result<DecodeResult<ChildEntry>> {
    let mut offset = 0;
    let key = if parent_is_array {
        None
    } else {
        match decode_key(data, kit)? {
            DecodeResult::Done { value, consumed } => {
                offset += consumed;
                Some(value)
            }
            DecodeResult::NeedMore => return Ok(DecodeResult::NeedMore),
        }
    };
    match decode_wire_value(&data[offset..])? {
        DecodeResult::Done { value, consumed } => Ok(DecodeResult::Done {
            value: ChildEntry { key, value },
            consumed: offset + consumed,
        }),
        DecodeResult::NeedMore => Ok(DecodeResult::NeedMore),
    }
}

// ---------------------------------------------------------------------------
// value conversions

/// Converts a primitive (or empty composite) to its wire form. `None` means
/// the value needs its own record: a long string/binary, or any non-empty
/// object/array.
pub fn wire_from_value(value: &Value, max_inline: usize) -> Result<Option<WireValue>> {
    let wire = match value {
        Value::Null => {
            return Err(TreeError::UnsupportedValue(
                "null cannot be serialized".into(),
            ))
        }
        Value::Bool(v) => Some(WireValue::Tiny {
            value_type: ValueType::Boolean,
            tiny: *v as u8,
        }),
        Value::Number(n) => {
            if n.fract() == 0.0 && (0.0..=15.0).contains(n) && !n.is_sign_negative() {
                Some(WireValue::Tiny {
                    value_type: ValueType::Number,
                    tiny: *n as u8,
                })
            } else {
                Some(WireValue::Inline {
                    value_type: ValueType::Number,
                    bytes: n.to_be_bytes().to_vec(),
                })
            }
        }
        Value::DateTime(ms) => Some(WireValue::Inline {
            value_type: ValueType::DateTime,
            bytes: ms.to_be_bytes().to_vec(),
        }),
        Value::String(s) => {
            if s.is_empty() {
                Some(WireValue::Tiny {
                    value_type: ValueType::String,
                    tiny: 0,
                })
            } else if s.len() < max_inline {
                Some(WireValue::Inline {
                    value_type: ValueType::String,
                    bytes: s.as_bytes().to_vec(),
                })
            } else {
                None
            }
        }
        Value::Reference(r) => {
            if r.path.is_empty() {
                Some(WireValue::Tiny {
                    value_type: ValueType::Reference,
                    tiny: 0,
                })
            } else if r.path.len() < max_inline {
                Some(WireValue::Inline {
                    value_type: ValueType::Reference,
                    bytes: r.path.as_bytes().to_vec(),
                })
            } else {
                None
            }
        }
        Value::Binary(b) => {
            if b.is_empty() {
                Some(WireValue::Tiny {
                    value_type: ValueType::Binary,
                    tiny: 0,
                })
            } else if b.len() < max_inline {
                Some(WireValue::Inline {
                    value_type: ValueType::Binary,
                    bytes: b.clone(),
                })
            } else {
                None
            }
        }
        Value::Object(map) => {
            if map.is_empty() {
                Some(WireValue::Tiny {
                    value_type: ValueType::Object,
                    tiny: 0,
                })
            } else {
                None
            }
        }
        Value::Array(items) => {
            if items.is_empty() {
                Some(WireValue::Tiny {
                    value_type: ValueType::Array,
                    tiny: 0,
                })
            } else {
                None
            }
        }
    };
    Ok(wire)
}

/// Materializes a tiny or inline wire value. External records are resolved by
/// the node reader instead.
pub fn value_from_wire(wire: &WireValue) -> Result<Value> {
    match wire {
        WireValue::Tiny { value_type, tiny } => match value_type {
            ValueType::Boolean => match tiny {
                0 => Ok(Value::Bool(false)),
                1 => Ok(Value::Bool(true)),
                other => Err(TreeError::Corrupt(format!(
                    "invalid tiny boolean: {other}"
                ))),
            },
            ValueType::Number => Ok(Value::Number(*tiny as f64)),
            ValueType::String => Ok(Value::String(String::new())),
            ValueType::Object => Ok(Value::Object(Default::default())),
            ValueType::Array => Ok(Value::Array(Vec::new())),
            ValueType::Binary => Ok(Value::Binary(Vec::new())),
            ValueType::Reference => Ok(Value::Reference(PathReference::new(""))),
            ValueType::DateTime => Err(TreeError::Corrupt(
                "datetime cannot be a tiny value".into(),
            )),
        },
        WireValue::Inline { value_type, bytes } => decode_primitive(*value_type, bytes),
        WireValue::Record { .. } => Err(TreeError::InvalidArgument(
            "external value must be resolved through its record".into(),
        )),
    }
}

/// Decodes a primitive payload, either from an inline child entry or from the
/// body of a record that stores the primitive itself.
pub fn decode_primitive(value_type: ValueType, bytes: &[u8]) -> Result<Value> {
    match value_type {
        ValueType::Number => {
            let arr: [u8; 8] = bytes
                .try_into()
                .map_err(|_| TreeError::Corrupt("number payload must be 8 bytes".into()))?;
            Ok(Value::Number(f64::from_be_bytes(arr)))
        }
        ValueType::DateTime => {
            let arr: [u8; 8] = bytes
                .try_into()
                .map_err(|_| TreeError::Corrupt("datetime payload must be 8 bytes".into()))?;
            Ok(Value::DateTime(i64::from_be_bytes(arr)))
        }
        ValueType::String => {
            let s = std::str::from_utf8(bytes)
                .map_err(|_| TreeError::Corrupt("string payload is not valid UTF-8".into()))?;
            Ok(Value::String(s.to_string()))
        }
        ValueType::Reference => {
            let s = std::str::from_utf8(bytes)
                .map_err(|_| TreeError::Corrupt("reference payload is not valid UTF-8".into()))?;
            Ok(Value::Reference(PathReference::new(s)))
        }
        ValueType::Binary => Ok(Value::Binary(bytes.to_vec())),
        ValueType::Boolean => match bytes {
            [0] => Ok(Value::Bool(false)),
            [1] => Ok(Value::Bool(true)),
            _ => Err(TreeError::Corrupt("invalid boolean payload".into())),
        },
        ValueType::Object | ValueType::Array => Err(TreeError::UnsupportedValue(
            "non-empty composite cannot be decoded from inline bytes".into(),
        )),
    }
}

/// Encodes the body of a record that stores a primitive value directly.
pub fn encode_primitive_body(value: &Value) -> Result<Vec<u8>> {
    match value {
        Value::Number(n) => Ok(n.to_be_bytes().to_vec()),
        Value::DateTime(ms) => Ok(ms.to_be_bytes().to_vec()),
        Value::String(s) => Ok(s.as_bytes().to_vec()),
        Value::Reference(r) => Ok(r.path.as_bytes().to_vec()),
        Value::Binary(b) => Ok(b.clone()),
        Value::Bool(v) => Ok(vec![*v as u8]),
        Value::Object(_) | Value::Array(_) | Value::Null => Err(TreeError::InvalidArgument(
            "composite bodies are built from child entries".into(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kit() -> KeyIndexTable {
        KeyIndexTable::new(Vec::new(), 1024)
    }

    #[test]
    fn chunk_table_single_record() {
        let alloc = NodeAllocation::single(StorageRange::new(2, 9, 1));
        let header = build_record_header(ValueType::Object, false, &alloc, 57);
        assert_eq!(header[0], ValueType::Object.to_nibble());
        assert_eq!(header.len(), 4);

        let parsed = match parse_chunk_table(&header[1..]).expect("parse") {
            DecodeResult::Done { value, consumed } => {
                assert_eq!(consumed, 3);
                value
            }
            DecodeResult::NeedMore => panic!("complete table"),
        };
        assert_eq!(parsed.first_range_length, 1);
        assert!(parsed.extra_ranges.is_empty());
        assert_eq!(parsed.last_chunk_size, 57);
        assert_eq!(
            parsed.to_allocation(RecordAddress::new(2, 9)),
            alloc
        );
    }

    #[test]
    fn chunk_table_fragmented() {
        let alloc = NodeAllocation::new([
            StorageRange::new(0, 10, 6),
            StorageRange::new(4, 0, 3),
            StorageRange::new(9, 2, 1),
        ]);
        let header = build_record_header(ValueType::Array, true, &alloc, 128);
        assert_eq!(header[0], FLAG_KEY_TREE | ValueType::Array.to_nibble());
        assert_eq!(header.len(), header_byte_length(&alloc.ranges));

        match parse_chunk_table(&header[1..]).expect("parse") {
            DecodeResult::Done { value, .. } => {
                assert_eq!(value.first_range_length, 6);
                assert_eq!(value.extra_ranges.len(), 2);
                assert_eq!(value.last_chunk_size, 128);
                assert_eq!(value.to_allocation(RecordAddress::new(0, 10)), alloc);
            }
            DecodeResult::NeedMore => panic!("complete table"),
        }
    }

    #[test]
    fn truncated_chunk_table_asks_for_more() {
        let alloc = NodeAllocation::new([
            StorageRange::new(0, 0, 2),
            StorageRange::new(1, 0, 2),
        ]);
        let header = build_record_header(ValueType::Object, false, &alloc, 10);
        for cut in 1..header.len() - 1 {
            match parse_chunk_table(&header[1..cut]) {
                Ok(DecodeResult::NeedMore) => {}
                other => panic!("expected NeedMore at cut {cut}, got {other:?}"),
            }
        }
    }

    #[test]
    fn reserved_chunk_type_is_rejected() {
        let data = [CHUNK_PAGES, 0, 0, 0, 1, 0, 2];
        assert!(matches!(
            parse_chunk_table(&data),
            Err(TreeError::Corrupt(_))
        ));
    }

    #[test]
    fn child_entry_round_trip_interned_key() {
        let mut kit = kit();
        let mut out = Vec::new();
        let value = WireValue::Inline {
            value_type: ValueType::String,
            bytes: b"hello".to_vec(),
        };
        encode_child_entry(Some("greeting"), &value, &mut kit, &mut out).expect("encode");
        // Interned keys take two bytes with the high bit set.
        assert_eq!(out[0] & 0x80, 0x80);

        match decode_child_entry(&out, false, &kit).expect("decode") {
            DecodeResult::Done { value: entry, consumed } => {
                assert_eq!(consumed, out.len());
                assert_eq!(entry.key.as_deref(), Some("greeting"));
                assert_eq!(entry.value, value);
            }
            DecodeResult::NeedMore => panic!("complete entry"),
        }
    }

    #[test]
    fn child_entry_round_trip_inline_key() {
        // A one-byte key is never interned, exercising the inline form.
        let mut kit = kit();
        let mut out = Vec::new();
        let value = WireValue::Tiny {
            value_type: ValueType::Number,
            tiny: 7,
        };
        encode_child_entry(Some("x"), &value, &mut kit, &mut out).expect("encode");
        assert_eq!(out[0], 0); // length - 1

        match decode_child_entry(&out, false, &kit).expect("decode") {
            DecodeResult::Done { value: entry, .. } => {
                assert_eq!(entry.key.as_deref(), Some("x"));
                assert_eq!(entry.value, value);
            }
            DecodeResult::NeedMore => panic!("complete entry"),
        }
    }

    #[test]
    fn array_entries_have_no_key() {
        let mut kit = kit();
        let mut out = Vec::new();
        let value = WireValue::Record {
            value_type: ValueType::Object,
            address: RecordAddress::new(7, 42),
        };
        encode_child_entry(None, &value, &mut kit, &mut out).expect("encode");
        assert_eq!(out.len(), 8);

        match decode_child_entry(&out, true, &kit).expect("decode") {
            DecodeResult::Done { value: entry, .. } => {
                assert_eq!(entry.key, None);
                assert_eq!(
                    entry.value.address(),
                    Some(RecordAddress::new(7, 42))
                );
            }
            DecodeResult::NeedMore => panic!("complete entry"),
        }
    }

    #[test]
    fn entry_split_at_every_boundary_needs_more() {
        let mut kit = kit();
        let mut out = Vec::new();
        let value = WireValue::Inline {
            value_type: ValueType::Binary,
            bytes: vec![1, 2, 3, 4, 5],
        };
        encode_child_entry(Some("blob"), &value, &mut kit, &mut out).expect("encode");
        for cut in 0..out.len() {
            match decode_child_entry(&out[..cut], false, &kit).expect("decode") {
                DecodeResult::NeedMore => {}
                DecodeResult::Done { .. } => panic!("entry incomplete at cut {cut}"),
            }
        }
    }

    #[test]
    fn deleted_location_is_corrupt() {
        let data = [ValueType::String.to_nibble() << 4, LOCATION_DELETED << 6];
        assert!(matches!(
            decode_wire_value(&data),
            Err(TreeError::Corrupt(_))
        ));
    }

    #[test]
    fn tiny_semantics() {
        for (value, expected) in [
            (Value::Bool(true), (ValueType::Boolean, 1)),
            (Value::Bool(false), (ValueType::Boolean, 0)),
            (Value::Number(0.0), (ValueType::Number, 0)),
            (Value::Number(15.0), (ValueType::Number, 15)),
            (Value::String(String::new()), (ValueType::String, 0)),
            (Value::Object(Default::default()), (ValueType::Object, 0)),
            (Value::Array(Vec::new()), (ValueType::Array, 0)),
            (Value::Binary(Vec::new()), (ValueType::Binary, 0)),
            (
                Value::Reference(PathReference::new("")),
                (ValueType::Reference, 0),
            ),
        ] {
            match wire_from_value(&value, 50).expect("wire") {
                Some(WireValue::Tiny { value_type, tiny }) => {
                    assert_eq!((value_type, tiny as i32), (expected.0, expected.1));
                    let back = value_from_wire(&WireValue::Tiny { value_type, tiny })
                        .expect("decode");
                    assert_eq!(back, value);
                }
                other => panic!("{value:?} should be tiny, got {other:?}"),
            }
        }
    }

    #[test]
    fn numbers_outside_tiny_range_go_inline() {
        for n in [16.0, -1.0, 0.5, 1e300, f64::NAN] {
            match wire_from_value(&Value::Number(n), 50).expect("wire") {
                Some(WireValue::Inline { value_type, bytes }) => {
                    assert_eq!(value_type, ValueType::Number);
                    let back = decode_primitive(value_type, &bytes).expect("decode");
                    match back {
                        Value::Number(m) => assert_eq!(m.to_bits(), n.to_bits()),
                        other => panic!("expected number, got {other:?}"),
                    }
                }
                other => panic!("{n} should be inline, got {other:?}"),
            }
        }
    }

    #[test]
    fn long_values_need_their_own_record() {
        let long = Value::String("x".repeat(50));
        assert!(wire_from_value(&long, 50).expect("wire").is_none());
        let fits = Value::String("x".repeat(49));
        assert!(wire_from_value(&fits, 50).expect("wire").is_some());
        let composite = Value::Object([("a".to_string(), Value::Bool(true))].into());
        assert!(wire_from_value(&composite, 50).expect("wire").is_none());
    }
}
