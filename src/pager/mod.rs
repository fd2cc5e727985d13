use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use memmap2::MmapMut;

use crate::error::{Result, TreeError};
use crate::model::{PageNr, RecordNr};

/// Fixed byte length of the file header region preceding the first page.
pub const FILE_HEADER_SIZE: u64 = 4096;

/// Flat file partitioned into pages of `page_size` records of `record_size`
/// bytes each, behind a fixed-size header region. No caching beyond the OS;
/// all higher-level caching is explicit in the callers.
pub struct PagedFile {
    file: File,
    path: PathBuf,
    page_size: u16,
    record_size: u16,
    file_len: u64,
    mmap: Option<MmapMut>,
    use_mmap: bool,
}

impl PagedFile {
    pub fn open(path: &Path, page_size: u16, record_size: u16, use_mmap: bool) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let file_len = file.metadata()?.len();

        let mmap = if use_mmap && file_len > 0 {
            unsafe { MmapMut::map_mut(&file).ok() }
        } else {
            None
        };

        Ok(Self {
            file,
            path: path.to_path_buf(),
            page_size,
            record_size,
            file_len,
            mmap,
            use_mmap,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn page_size(&self) -> u16 {
        self.page_size
    }

    pub fn record_size(&self) -> u16 {
        self.record_size
    }

    pub fn len(&self) -> u64 {
        self.file_len
    }

    pub fn is_empty(&self) -> bool {
        self.file_len == 0
    }

    /// Number of (possibly partial) pages the file currently covers.
    pub fn page_count(&self) -> u32 {
        if self.file_len <= FILE_HEADER_SIZE {
            return 0;
        }
        let data_len = self.file_len - FILE_HEADER_SIZE;
        let page_bytes = self.page_size as u64 * self.record_size as u64;
        ((data_len - 1) / page_bytes + 1) as u32
    }

    /// Byte offset of a record slot in the file.
    pub fn file_index(&self, page_nr: PageNr, record_nr: RecordNr) -> u64 {
        let record_index = page_nr as u64 * self.page_size as u64 + record_nr as u64;
        FILE_HEADER_SIZE + record_index * self.record_size as u64
    }

    /// Reads `length` bytes starting at `file_index`. Bytes past the current
    /// end of file read as zero, matching never-written record slack.
    pub fn read_data(&mut self, file_index: u64, buffer: &mut [u8]) -> Result<()> {
        let offset = file_index as usize;
        if file_index >= self.file_len {
            buffer.fill(0);
            return Ok(());
        }
        self.ensure_mmap()?;
        if let Some(ref mmap) = self.mmap {
            let end = (offset + buffer.len()).min(mmap.len());
            let copy_len = end.saturating_sub(offset);
            buffer[..copy_len].copy_from_slice(&mmap[offset..end]);
            buffer[copy_len..].fill(0);
        } else {
            self.file.seek(SeekFrom::Start(file_index))?;
            let mut read_total = 0;
            while read_total < buffer.len() {
                let n = self.file.read(&mut buffer[read_total..])?;
                if n == 0 {
                    break;
                }
                read_total += n;
            }
            buffer[read_total..].fill(0);
        }
        Ok(())
    }

    /// Writes bytes at `file_index`, growing the file as needed.
    pub fn write_data(&mut self, file_index: u64, data: &[u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(file_index))?;
        self.file.write_all(data)?;
        let end = file_index + data.len() as u64;
        if end > self.file_len {
            self.file_len = end;
        }
        self.invalidate_mmap();
        Ok(())
    }

    pub fn read_header_region(&mut self) -> Result<Vec<u8>> {
        let mut buffer = vec![0u8; FILE_HEADER_SIZE as usize];
        self.read_data(0, &mut buffer)?;
        Ok(buffer)
    }

    pub fn write_header_region(&mut self, data: &[u8]) -> Result<()> {
        if data.len() != FILE_HEADER_SIZE as usize {
            return Err(TreeError::InvalidArgument(
                "header region must be exactly FILE_HEADER_SIZE bytes".into(),
            ));
        }
        self.write_data(0, data)
    }

    pub fn sync(&mut self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }

    fn ensure_mmap(&mut self) -> Result<()> {
        if self.use_mmap && self.mmap.is_none() && self.file_len > 0 {
            self.file.sync_data()?;
            self.mmap = unsafe { MmapMut::map_mut(&self.file).ok() };
        }
        Ok(())
    }

    fn invalidate_mmap(&mut self) {
        if self.mmap.is_some() {
            self.mmap = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn open_file(use_mmap: bool) -> (NamedTempFile, PagedFile) {
        let tmp = NamedTempFile::new().expect("temp file");
        let file = PagedFile::open(tmp.path(), 1024, 128, use_mmap).expect("open");
        (tmp, file)
    }

    #[test]
    fn file_index_geometry() {
        let (_tmp, file) = open_file(false);
        assert_eq!(file.file_index(0, 0), FILE_HEADER_SIZE);
        assert_eq!(file.file_index(0, 1), FILE_HEADER_SIZE + 128);
        assert_eq!(file.file_index(1, 0), FILE_HEADER_SIZE + 1024 * 128);
        assert_eq!(file.file_index(2, 3), FILE_HEADER_SIZE + (2 * 1024 + 3) * 128);
    }

    #[test]
    fn write_then_read_round_trip() {
        let (_tmp, mut file) = open_file(false);
        let index = file.file_index(0, 5);
        file.write_data(index, b"hello records").expect("write");

        let mut buffer = vec![0u8; 13];
        file.read_data(index, &mut buffer).expect("read");
        assert_eq!(&buffer, b"hello records");
    }

    #[test]
    fn reads_past_eof_are_zero_filled() {
        let (_tmp, mut file) = open_file(false);
        file.write_data(file.file_index(0, 0), &[0xAA; 16])
            .expect("write");

        let index = file.file_index(0, 0);
        let mut buffer = vec![0u8; 32];
        file.read_data(index, &mut buffer).expect("read");
        assert_eq!(&buffer[..16], &[0xAA; 16]);
        assert_eq!(&buffer[16..], &[0u8; 16]);
    }

    #[test]
    fn reopen_sees_previous_writes() {
        let tmp = NamedTempFile::new().expect("temp file");
        {
            let mut file = PagedFile::open(tmp.path(), 1024, 128, false).expect("open");
            let index = file.file_index(3, 7);
            file.write_data(index, &[1, 2, 3, 4]).expect("write");
            file.sync().expect("sync");
        }
        let mut file = PagedFile::open(tmp.path(), 1024, 128, true).expect("reopen");
        let index = file.file_index(3, 7);
        let mut buffer = [0u8; 4];
        file.read_data(index, &mut buffer).expect("read");
        assert_eq!(buffer, [1, 2, 3, 4]);
    }

    #[test]
    fn page_count_tracks_growth() {
        let (_tmp, mut file) = open_file(false);
        assert_eq!(file.page_count(), 0);
        let index = file.file_index(0, 0);
        file.write_data(index, &[0u8; 128]).expect("write");
        assert_eq!(file.page_count(), 1);
        let index = file.file_index(1, 0);
        file.write_data(index, &[0u8; 128]).expect("write");
        assert_eq!(file.page_count(), 2);
    }
}
