use std::convert::TryInto;

use crate::error::{Result, TreeError};
use crate::model::RecordAddress;
use crate::pager::FILE_HEADER_SIZE;

const MAGIC: &[u8; 8] = b"ARBORDB\0";
const VERSION: u16 = 1;

/// Byte offset where the serialized key-index table begins.
const KIT_OFFSET: usize = 23;

/// The fixed file header: magic, version, geometry, root record pointer and
/// the key-index table. All multi-byte integers are big-endian.
#[derive(Debug, Clone)]
pub struct Header {
    pub page_size: u16,
    pub record_size: u16,
    pub root: Option<RecordAddress>,
    pub kit_keys: Vec<String>,
}

impl Header {
    pub fn new(page_size: u16, record_size: u16) -> Self {
        Self {
            page_size,
            record_size,
            root: None,
            kit_keys: Vec::new(),
        }
    }

    /// Parses the header region. Returns `None` for a fresh (all-zero) file.
    pub fn read(data: &[u8]) -> Result<Option<Self>> {
        if data.len() < FILE_HEADER_SIZE as usize {
            return Err(TreeError::Corrupt(
                "file header region shorter than expected".into(),
            ));
        }

        if data[..MAGIC.len()].iter().all(|&b| b == 0) {
            return Ok(None);
        }
        if &data[..MAGIC.len()] != MAGIC {
            return Err(TreeError::Corrupt("invalid file header magic".into()));
        }

        let version = u16::from_be_bytes([data[8], data[9]]);
        if version != VERSION {
            return Err(TreeError::Corrupt(format!(
                "unsupported file version {version}"
            )));
        }

        let page_size = u16::from_be_bytes([data[10], data[11]]);
        let record_size = u16::from_be_bytes([data[12], data[13]]);
        if page_size == 0 || record_size == 0 {
            return Err(TreeError::Corrupt("zero page or record size".into()));
        }

        let root = if data[14] == 1 {
            let page_nr = u32::from_be_bytes(data[15..19].try_into().expect("4 bytes"));
            let record_nr = u16::from_be_bytes([data[19], data[20]]);
            Some(RecordAddress::new(page_nr, record_nr))
        } else {
            None
        };

        let key_count = u16::from_be_bytes([data[21], data[22]]) as usize;
        let mut kit_keys = Vec::with_capacity(key_count);
        let mut offset = KIT_OFFSET;
        for _ in 0..key_count {
            if offset >= data.len() {
                return Err(TreeError::Corrupt("key index table truncated".into()));
            }
            let len = data[offset] as usize;
            offset += 1;
            if len == 0 || offset + len > data.len() {
                return Err(TreeError::Corrupt("key index table entry truncated".into()));
            }
            let key = std::str::from_utf8(&data[offset..offset + len])
                .map_err(|_| TreeError::Corrupt("key index entry is not valid UTF-8".into()))?;
            kit_keys.push(key.to_string());
            offset += len;
        }

        Ok(Some(Self {
            page_size,
            record_size,
            root,
            kit_keys,
        }))
    }

    /// Serializes the header into a fresh `FILE_HEADER_SIZE` buffer.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut data = vec![0u8; FILE_HEADER_SIZE as usize];
        data[..MAGIC.len()].copy_from_slice(MAGIC);
        data[8..10].copy_from_slice(&VERSION.to_be_bytes());
        data[10..12].copy_from_slice(&self.page_size.to_be_bytes());
        data[12..14].copy_from_slice(&self.record_size.to_be_bytes());
        if let Some(root) = self.root {
            data[14] = 1;
            data[15..19].copy_from_slice(&root.page_nr.to_be_bytes());
            data[19..21].copy_from_slice(&root.record_nr.to_be_bytes());
        }

        let key_count: u16 = self
            .kit_keys
            .len()
            .try_into()
            .map_err(|_| TreeError::InvalidArgument("too many interned keys".into()))?;
        data[21..23].copy_from_slice(&key_count.to_be_bytes());
        let mut offset = KIT_OFFSET;
        for key in &self.kit_keys {
            let bytes = key.as_bytes();
            if bytes.is_empty() || bytes.len() > 128 {
                return Err(TreeError::InvalidArgument(
                    "interned key length out of range".into(),
                ));
            }
            if offset + 1 + bytes.len() > data.len() {
                return Err(TreeError::InvalidArgument(
                    "key index table exceeds header region".into(),
                ));
            }
            data[offset] = bytes.len() as u8;
            offset += 1;
            data[offset..offset + bytes.len()].copy_from_slice(bytes);
            offset += bytes.len();
        }
        Ok(data)
    }

    /// Remaining header bytes available for further interned keys.
    pub fn kit_bytes_free(&self) -> usize {
        let used: usize = self.kit_keys.iter().map(|k| 1 + k.len()).sum();
        (FILE_HEADER_SIZE as usize - KIT_OFFSET).saturating_sub(used)
    }
}
