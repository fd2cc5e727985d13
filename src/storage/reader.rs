//! Streaming access to stored records: header parsing (with chunk-table
//! continuation across record boundaries), logical-to-file offset mapping
//! through the chunk table, and child entry streams over both the linear and
//! embedded-tree body layouts.

use crate::error::{Result, TreeError};
use crate::model::{RecordAddress, ValueType};
use crate::pager::PagedFile;
use crate::path::PathKey;
use crate::storage::btree::{EmbeddedTree, TreeIo, TreeKey};
use crate::storage::fst::NodeAllocation;
use crate::storage::kit::KeyIndexTable;
use crate::storage::record::{
    decode_child_entry, decode_wire_value, parse_chunk_table, ChunkTable, DecodeResult, WireValue,
    FLAG_KEY_TREE,
};

/// Upper bound on records read by one streaming I/O.
pub const MAX_CHUNK_RECORDS: u32 = 200;

/// Everything the header of a record's first range reveals.
#[derive(Debug, Clone)]
pub struct RecordInfo {
    pub address: RecordAddress,
    pub value_type: ValueType,
    pub has_key_tree: bool,
    pub allocation: NodeAllocation,
    /// Bytes occupied by header byte 0 plus the chunk table.
    pub header_length: usize,
    pub last_chunk_size: u16,
    pub bytes_per_record: u16,
}

impl RecordInfo {
    pub fn total_byte_length(&self) -> u64 {
        let records = self.allocation.total_records() as u64;
        (records - 1) * self.bytes_per_record as u64 + self.last_chunk_size as u64
    }

    pub fn data_length(&self) -> usize {
        (self.total_byte_length() - self.header_length as u64) as usize
    }
}

/// Reads and parses a record header, chaining reads through the first range
/// when the chunk table overflows the first record.
pub fn read_record_info(file: &mut PagedFile, address: RecordAddress) -> Result<RecordInfo> {
    let record_size = file.record_size();
    let mut buffer = vec![0u8; record_size as usize];
    file.read_data(file.file_index(address.page_nr, address.record_nr), &mut buffer)?;

    let byte0 = buffer[0];
    let value_type = ValueType::from_nibble(byte0 & 0x0F)?;
    let has_key_tree = byte0 & FLAG_KEY_TREE != 0;

    let mut records_read: u16 = 1;
    let (table, consumed): (ChunkTable, usize) = loop {
        match parse_chunk_table(&buffer[1..])? {
            DecodeResult::Done { value, consumed } => break (value, consumed),
            DecodeResult::NeedMore => {
                // The table continues in the next record of the first range,
                // which is contiguous within the page.
                let next_record = address.record_nr.checked_add(records_read).ok_or_else(|| {
                    TreeError::Corrupt("chunk table overflows the page".into())
                })?;
                if next_record >= file.page_size() {
                    return Err(TreeError::Corrupt("chunk table overflows the page".into()));
                }
                let mut more = vec![0u8; record_size as usize];
                file.read_data(file.file_index(address.page_nr, next_record), &mut more)?;
                buffer.extend_from_slice(&more);
                records_read += 1;
            }
        }
    };

    let header_length = 1 + consumed;
    let allocation = table.to_allocation(address);
    Ok(RecordInfo {
        address,
        value_type,
        has_key_tree,
        allocation,
        header_length,
        last_chunk_size: table.last_chunk_size,
        bytes_per_record: record_size,
    })
}

/// Byte window over a record's *data* region (past the header), translating
/// logical offsets into file offsets through the chunk table.
pub struct RecordView<'a> {
    file: &'a mut PagedFile,
    info: &'a RecordInfo,
}

impl<'a> RecordView<'a> {
    pub fn new(file: &'a mut PagedFile, info: &'a RecordInfo) -> Self {
        Self { file, info }
    }

    pub fn data_length(&self) -> usize {
        self.info.data_length()
    }

    pub fn read(&mut self, offset: usize, length: usize) -> Result<Vec<u8>> {
        if offset + length > self.data_length() {
            return Err(TreeError::Truncated(format!(
                "read of {length} bytes at data offset {offset} exceeds record"
            )));
        }
        let mut out = vec![0u8; length];
        let mut filled = 0;
        self.for_each_segment(offset, length, |file, file_index, run| {
            file.read_data(file_index, &mut out[filled..filled + run])?;
            filled += run;
            Ok(())
        })?;
        Ok(out)
    }

    pub fn write(&mut self, offset: usize, data: &[u8]) -> Result<()> {
        if offset + data.len() > self.data_length() {
            return Err(TreeError::Truncated(format!(
                "write of {} bytes at data offset {offset} exceeds record",
                data.len()
            )));
        }
        let mut written = 0;
        self.for_each_segment(offset, data.len(), |file, file_index, run| {
            file.write_data(file_index, &data[written..written + run])?;
            written += run;
            Ok(())
        })
    }

    /// Maps a data-relative byte span onto contiguous file segments.
    fn for_each_segment(
        &mut self,
        offset: usize,
        length: usize,
        mut f: impl FnMut(&mut PagedFile, u64, usize) -> Result<()>,
    ) -> Result<()> {
        let record_size = self.info.bytes_per_record as u64;
        let mut absolute = self.info.header_length as u64 + offset as u64;
        let mut remaining = length;
        while remaining > 0 {
            let record_index = (absolute / record_size) as u32;
            let within = absolute % record_size;
            // Extend the run across contiguous records of the same range.
            let (range_start, range) = {
                let mut base = 0u32;
                let mut found = None;
                for range in &self.info.allocation.ranges {
                    if record_index < base + range.length as u32 {
                        found = Some((base, *range));
                        break;
                    }
                    base += range.length as u32;
                }
                found.ok_or_else(|| {
                    TreeError::Corrupt("data offset outside allocation".into())
                })?
            };
            let offset_in_range = record_index - range_start;
            let range_bytes_left =
                (range.length as u64 - offset_in_range as u64) * record_size - within;
            let run = remaining.min(range_bytes_left as usize);
            let file_index = self.file.file_index(
                range.page_nr,
                range.record_nr + offset_in_range as u16,
            ) + within;
            f(self.file, file_index, run)?;
            absolute += run as u64;
            remaining -= run;
        }
        Ok(())
    }
}

impl TreeIo for RecordView<'_> {
    fn tree_len(&self) -> usize {
        self.data_length()
    }

    fn tree_read(&mut self, offset: usize, length: usize) -> Result<Vec<u8>> {
        self.read(offset, length)
    }

    fn tree_write(&mut self, offset: usize, data: &[u8]) -> Result<()> {
        self.write(offset, data)
    }
}

/// Streams the record's data region in chunks of at most `MAX_CHUNK_RECORDS`
/// records. The callback may return `false` to stop early.
pub fn stream_data(
    file: &mut PagedFile,
    info: &RecordInfo,
    mut callback: impl FnMut(&[u8], usize) -> Result<bool>,
) -> Result<()> {
    let chunk_bytes = MAX_CHUNK_RECORDS as usize * info.bytes_per_record as usize;
    let data_length = info.data_length();
    let mut view = RecordView::new(file, info);
    let mut offset = 0;
    let mut chunk_index = 0;
    while offset < data_length {
        let length = chunk_bytes.min(data_length - offset);
        let chunk = view.read(offset, length)?;
        if !callback(&chunk, chunk_index)? {
            return Ok(());
        }
        offset += length;
        chunk_index += 1;
    }
    Ok(())
}

/// One streamed child: its key (or array position) and wire value.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamedChild {
    pub key: PathKey,
    pub value: WireValue,
}

pub fn tree_key_for(key: &PathKey) -> TreeKey {
    match key {
        PathKey::Key(name) => TreeKey::Name(name.clone()),
        PathKey::Index(index) => TreeKey::Index(*index),
    }
}

fn path_key_for(key: &TreeKey) -> PathKey {
    match key {
        TreeKey::Name(name) => PathKey::Key(name.clone()),
        TreeKey::Index(index) => PathKey::Index(*index),
    }
}

/// Streams child entries of a composite record, dispatching on the body
/// layout. With a key filter, tree records are probed per key instead of
/// walked. The callback may return `false` to cancel.
pub fn stream_children(
    file: &mut PagedFile,
    kit: &KeyIndexTable,
    info: &RecordInfo,
    key_filter: Option<&[PathKey]>,
    mut callback: impl FnMut(StreamedChild) -> Result<bool>,
) -> Result<()> {
    if !info.value_type.is_composite() {
        return Err(TreeError::InvalidArgument(format!(
            "record at {} holds no children",
            info.address
        )));
    }
    if info.has_key_tree {
        let mut view = RecordView::new(file, info);
        let mut tree = EmbeddedTree::new(&mut view);
        if let Some(filter) = key_filter {
            for key in filter {
                let Some(bytes) = tree.find(&tree_key_for(key))? else {
                    continue;
                };
                let value = decode_leaf_value(&bytes)?;
                if !callback(StreamedChild {
                    key: key.clone(),
                    value,
                })? {
                    return Ok(());
                }
            }
            return Ok(());
        }
        let mut leaf = tree.first_leaf()?;
        loop {
            for (key, bytes) in &leaf.entries {
                let value = decode_leaf_value(bytes)?;
                if !callback(StreamedChild {
                    key: path_key_for(key),
                    value,
                })? {
                    return Ok(());
                }
            }
            match tree.next_leaf(&leaf)? {
                Some(next) => leaf = next,
                None => return Ok(()),
            }
        }
    }

    // Linear layout: entries tolerate truncation at chunk boundaries; the
    // incomplete tail is carried into the next chunk.
    let is_array = info.value_type == ValueType::Array;
    let mut carry: Vec<u8> = Vec::new();
    let mut position: u32 = 0;
    let mut stopped = false;
    stream_data(file, info, |chunk, _| {
        carry.extend_from_slice(chunk);
        let mut offset = 0;
        loop {
            match decode_child_entry(&carry[offset..], is_array, kit)? {
                DecodeResult::Done { value: entry, consumed } => {
                    offset += consumed;
                    let key = match (&entry.key, is_array) {
                        (Some(name), false) => PathKey::Key(name.clone()),
                        (None, true) => PathKey::Index(position),
                        _ => {
                            return Err(TreeError::Corrupt(
                                "child entry key does not match record layout".into(),
                            ))
                        }
                    };
                    position += 1;
                    if let Some(filter) = key_filter {
                        if !filter.contains(&key) {
                            continue;
                        }
                    }
                    let keep = callback(StreamedChild {
                        key,
                        value: entry.value,
                    })?;
                    if !keep {
                        stopped = true;
                        return Ok(false);
                    }
                }
                DecodeResult::NeedMore => break,
            }
            if offset >= carry.len() {
                break;
            }
        }
        carry.drain(..offset);
        Ok(true)
    })?;
    if !stopped && !carry.is_empty() {
        return Err(TreeError::Truncated(
            "record data ended inside a child entry".into(),
        ));
    }
    Ok(())
}

fn decode_leaf_value(bytes: &[u8]) -> Result<WireValue> {
    match decode_wire_value(bytes)? {
        DecodeResult::Done { value, .. } => Ok(value),
        DecodeResult::NeedMore => Err(TreeError::Truncated(
            "tree leaf holds a truncated value".into(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::fst::{NodeAllocation, StorageRange};
    use crate::storage::kit::KeyIndexTable;
    use crate::storage::record::{build_record_header, encode_child_entry, header_byte_length};
    use tempfile::NamedTempFile;

    const RECORD_SIZE: u16 = 32;

    fn open_file() -> (NamedTempFile, PagedFile) {
        let tmp = NamedTempFile::new().expect("temp file");
        let file = PagedFile::open(tmp.path(), 8, RECORD_SIZE, false).expect("open");
        (tmp, file)
    }

    /// Writes header + body over the allocation's ranges, the way the write
    /// path lays records out.
    fn write_record(
        file: &mut PagedFile,
        allocation: &NodeAllocation,
        value_type: ValueType,
        has_key_tree: bool,
        body: &[u8],
    ) {
        let header_len = header_byte_length(&allocation.ranges);
        let total_records = allocation.total_records() as usize;
        let last_chunk =
            (header_len + body.len() - (total_records - 1) * RECORD_SIZE as usize) as u16;
        let mut bytes = build_record_header(value_type, has_key_tree, allocation, last_chunk);
        bytes.extend_from_slice(body);
        let mut offset = 0;
        for range in &allocation.ranges {
            let end = (offset + range.length as usize * RECORD_SIZE as usize).min(bytes.len());
            let index = file.file_index(range.page_nr, range.record_nr);
            file.write_data(index, &bytes[offset..end]).expect("write");
            offset = end;
        }
    }

    #[test]
    fn header_round_trip_over_fragmented_allocation() {
        let (_tmp, mut file) = open_file();
        let allocation = NodeAllocation::new([
            StorageRange::new(0, 2, 3),
            StorageRange::new(1, 0, 2),
        ]);
        let body: Vec<u8> = (0..130).map(|i| i as u8).collect();
        write_record(&mut file, &allocation, ValueType::String, false, &body);

        let info = read_record_info(&mut file, RecordAddress::new(0, 2)).expect("info");
        assert_eq!(info.value_type, ValueType::String);
        assert!(!info.has_key_tree);
        assert_eq!(info.allocation, allocation);
        assert_eq!(info.data_length(), body.len());
    }

    #[test]
    fn record_view_maps_offsets_across_ranges() {
        let (_tmp, mut file) = open_file();
        let allocation = NodeAllocation::new([
            StorageRange::new(0, 0, 2),
            StorageRange::new(2, 5, 2),
            StorageRange::new(4, 1, 1),
        ]);
        let body: Vec<u8> = (0..130).map(|i| (i % 251) as u8).collect();
        write_record(&mut file, &allocation, ValueType::Binary, false, &body);

        let info = read_record_info(&mut file, RecordAddress::new(0, 0)).expect("info");
        let mut view = RecordView::new(&mut file, &info);
        assert_eq!(view.read(0, body.len()).expect("full read"), body);
        // Spans crossing range boundaries must come back stitched together.
        assert_eq!(view.read(40, 60).expect("middle read"), body[40..100]);
        assert_eq!(view.read(body.len() - 7, 7).expect("tail read"), body[body.len() - 7..]);
        assert!(view.read(body.len() - 3, 8).is_err());
    }

    #[test]
    fn record_view_writes_in_place() {
        let (_tmp, mut file) = open_file();
        let allocation = NodeAllocation::new([
            StorageRange::new(0, 0, 2),
            StorageRange::new(1, 3, 2),
        ]);
        let body = vec![0u8; 100];
        write_record(&mut file, &allocation, ValueType::Binary, false, &body);

        let info = read_record_info(&mut file, RecordAddress::new(0, 0)).expect("info");
        let mut view = RecordView::new(&mut file, &info);
        view.write(50, &[9, 8, 7, 6]).expect("write");
        let read = view.read(48, 8).expect("read back");
        assert_eq!(read, [0, 0, 9, 8, 7, 6, 0, 0]);
    }

    #[test]
    fn linear_child_stream_respects_key_filter() {
        let (_tmp, mut file) = open_file();
        let mut kit = KeyIndexTable::new(Vec::new(), 256);
        let mut body = Vec::new();
        for (key, tiny) in [("alpha", 1u8), ("beta", 2), ("gamma", 3)] {
            encode_child_entry(
                Some(key),
                &WireValue::Tiny {
                    value_type: ValueType::Number,
                    tiny,
                },
                &mut kit,
                &mut body,
            )
            .expect("encode");
        }
        let allocation = NodeAllocation::single(StorageRange::new(0, 0, 1));
        write_record(&mut file, &allocation, ValueType::Object, false, &body);

        let info = read_record_info(&mut file, RecordAddress::new(0, 0)).expect("info");
        let filter = [PathKey::Key("beta".into())];
        let mut seen = Vec::new();
        stream_children(&mut file, &kit, &info, Some(&filter), |child| {
            seen.push(child);
            Ok(true)
        })
        .expect("stream");
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].key, PathKey::Key("beta".into()));
        assert_eq!(
            seen[0].value,
            WireValue::Tiny {
                value_type: ValueType::Number,
                tiny: 2,
            }
        );
    }

    #[test]
    fn child_entries_split_across_records_are_reassembled() {
        let (_tmp, mut file) = open_file();
        let mut kit = KeyIndexTable::new(Vec::new(), 256);
        let mut body = Vec::new();
        // Inline strings sized so entries straddle 32-byte record boundaries.
        for i in 0..8u8 {
            encode_child_entry(
                Some(&format!("name{i}")),
                &WireValue::Inline {
                    value_type: ValueType::String,
                    bytes: vec![b'a' + i; 21],
                },
                &mut kit,
                &mut body,
            )
            .expect("encode");
        }
        let records = ((4 + body.len()) as u16).div_ceil(RECORD_SIZE) + 1;
        let allocation = NodeAllocation::single(StorageRange::new(0, 0, records));
        let trimmed = NodeAllocation::single(StorageRange::new(
            0,
            0,
            ((header_byte_length(&allocation.ranges) + body.len() + RECORD_SIZE as usize - 1)
                / RECORD_SIZE as usize) as u16,
        ));
        write_record(&mut file, &trimmed, ValueType::Object, false, &body);

        let info = read_record_info(&mut file, RecordAddress::new(0, 0)).expect("info");
        let mut count = 0;
        stream_children(&mut file, &kit, &info, None, |child| {
            match &child.value {
                WireValue::Inline { bytes, .. } => assert_eq!(bytes.len(), 21),
                other => panic!("expected inline value, got {other:?}"),
            }
            count += 1;
            Ok(true)
        })
        .expect("stream");
        assert_eq!(count, 8);
    }

    #[test]
    fn data_stream_stops_on_request() {
        let (_tmp, mut file) = open_file();
        let allocation = NodeAllocation::single(StorageRange::new(0, 0, 8));
        let body = vec![0xCD; 8 * RECORD_SIZE as usize - 16];
        write_record(&mut file, &allocation, ValueType::Binary, false, &body);

        let info = read_record_info(&mut file, RecordAddress::new(0, 0)).expect("info");
        let mut calls = 0;
        stream_data(&mut file, &info, |chunk, index| {
            assert!(!chunk.is_empty());
            assert_eq!(index, calls);
            calls += 1;
            Ok(false)
        })
        .expect("stream");
        assert_eq!(calls, 1, "returning false must cancel the stream");
    }
}
