//! Page management for boxdb
//!
//! This module defines the slotted page format. Every page is a fixed-size
//! block starting with a 32-byte header:
//!
//! ```text
//! 0      page type
//! 1      flags
//! 2..4   slot count
//! 4..6   free space offset (start of the record area)
//! 6..8   reserved
//! 8..12  page id
//! 12..16 next page in a chain
//! 16..24 version that wrote the page
//! 24..28 payload length (chain and overflow pages)
//! 28..32 CRC-32C of the page, computed with this field excluded
//! ```
//!
//! Data pages use a slot directory growing up from the header and a record
//! area growing down from the end of the page. Chain, overflow and header
//! pages carry a single payload right after the header instead.

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{Error, Result};

/// Page header size
pub const PAGE_HEADER_SIZE: usize = 32;

/// Size of one slot directory entry
pub const SLOT_SIZE: usize = 4;

/// Page ID type
pub type PageId = u32;

/// Marks the end of a page chain
pub const INVALID_PAGE_ID: PageId = u32::MAX;

const CHECKSUM_OFFSET: usize = 28;

/// Magic bytes at the start of a header page payload
pub const MAGIC: [u8; 4] = *b"BXDB";

/// Version of the on-disk format
pub const FORMAT_VERSION: u32 = 1;

/// Page type
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PageType {
    Free = 0,
    Header = 1,
    Data = 2,
    Overflow = 3,
    Catalog = 4,
    Directory = 5,
    Index = 6,
}

impl PageType {
    /// Page type for a stored byte
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(PageType::Free),
            1 => Some(PageType::Header),
            2 => Some(PageType::Data),
            3 => Some(PageType::Overflow),
            4 => Some(PageType::Catalog),
            5 => Some(PageType::Directory),
            6 => Some(PageType::Index),
            _ => None,
        }
    }
}

/// Largest record that fits into an empty data page
pub fn max_inline_record(page_size: usize) -> usize {
    page_size - PAGE_HEADER_SIZE - SLOT_SIZE
}

/// Payload capacity of a chain or overflow page
pub fn payload_capacity(page_size: usize) -> usize {
    page_size - PAGE_HEADER_SIZE
}

/// A page
#[derive(Debug, Clone, PartialEq)]
pub struct Page {
    data: Vec<u8>,
}

impl Page {
    /// Create a new empty page
    pub fn new(page_id: PageId, page_type: PageType, page_size: usize) -> Self {
        let mut data = vec![0u8; page_size];
        data[0] = page_type as u8;
        LittleEndian::write_u16(&mut data[4..6], page_size as u16);
        LittleEndian::write_u32(&mut data[8..12], page_id);
        LittleEndian::write_u32(&mut data[12..16], INVALID_PAGE_ID);
        Self { data }
    }

    /// Create a page from raw bytes, verifying its checksum
    pub fn from_bytes(page_id: PageId, bytes: Vec<u8>) -> Result<Self> {
        if bytes.len() < PAGE_HEADER_SIZE {
            return Err(Error::CorruptPage(page_id));
        }
        let page = Self { data: bytes };
        if page.stored_checksum() != page.compute_checksum()
            || page.page_id() != page_id
            || PageType::from_u8(page.data[0]).is_none()
        {
            return Err(Error::CorruptPage(page_id));
        }
        if page.page_type() == PageType::Data
            && (page.free_space_offset() > page.data.len()
                || page.slot_area_end() > page.free_space_offset())
        {
            return Err(Error::CorruptPage(page_id));
        }
        Ok(page)
    }

    /// Compute and store the checksum; call before writing the page out
    pub fn seal(&mut self) {
        let checksum = self.compute_checksum();
        LittleEndian::write_u32(&mut self.data[CHECKSUM_OFFSET..PAGE_HEADER_SIZE], checksum);
    }

    fn compute_checksum(&self) -> u32 {
        let head = crc32c::crc32c(&self.data[..CHECKSUM_OFFSET]);
        crc32c::crc32c_append(head, &self.data[PAGE_HEADER_SIZE..])
    }

    fn stored_checksum(&self) -> u32 {
        LittleEndian::read_u32(&self.data[CHECKSUM_OFFSET..PAGE_HEADER_SIZE])
    }

    /// Get page ID
    pub fn page_id(&self) -> PageId {
        LittleEndian::read_u32(&self.data[8..12])
    }

    /// Get page type
    pub fn page_type(&self) -> PageType {
        PageType::from_u8(self.data[0]).unwrap_or(PageType::Free)
    }

    /// Next page of a chain, `None` at the end
    pub fn next_page(&self) -> Option<PageId> {
        match LittleEndian::read_u32(&self.data[12..16]) {
            INVALID_PAGE_ID => None,
            id => Some(id),
        }
    }

    /// Link this page to the next page of its chain
    pub fn set_next_page(&mut self, next: Option<PageId>) {
        LittleEndian::write_u32(&mut self.data[12..16], next.unwrap_or(INVALID_PAGE_ID));
    }

    /// Version of the commit that wrote this page
    pub fn version(&self) -> u64 {
        LittleEndian::read_u64(&self.data[16..24])
    }

    /// Set the writing version
    pub fn set_version(&mut self, version: u64) {
        LittleEndian::write_u64(&mut self.data[16..24], version);
    }

    /// Page size in bytes
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Raw page bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    // ========== Slotted record area ==========

    /// Number of slots, deleted ones included
    pub fn slot_count(&self) -> u16 {
        LittleEndian::read_u16(&self.data[2..4])
    }

    fn free_space_offset(&self) -> usize {
        match LittleEndian::read_u16(&self.data[4..6]) {
            0 => self.data.len(),
            offset => offset as usize,
        }
    }

    fn set_free_space_offset(&mut self, offset: usize) {
        LittleEndian::write_u16(&mut self.data[4..6], offset as u16);
    }

    fn slot_area_end(&self) -> usize {
        PAGE_HEADER_SIZE + self.slot_count() as usize * SLOT_SIZE
    }

    /// Bytes available for one more record including its slot
    pub fn free_space(&self) -> usize {
        self.free_space_offset()
            .saturating_sub(self.slot_area_end())
    }

    /// Check whether a record of `len` bytes fits
    pub fn can_fit(&self, len: usize) -> bool {
        self.free_space() >= len + SLOT_SIZE
    }

    /// Append a record, returning its slot
    pub fn insert_record(&mut self, record: &[u8]) -> Option<u16> {
        if !self.can_fit(record.len()) || self.slot_count() == u16::MAX {
            return None;
        }

        let slot = self.slot_count();
        let offset = self.free_space_offset() - record.len();
        self.data[offset..offset + record.len()].copy_from_slice(record);

        let entry = self.slot_area_end();
        LittleEndian::write_u16(&mut self.data[entry..entry + 2], offset as u16);
        LittleEndian::write_u16(&mut self.data[entry + 2..entry + 4], record.len() as u16);

        LittleEndian::write_u16(&mut self.data[2..4], slot + 1);
        self.set_free_space_offset(offset);
        Some(slot)
    }

    /// Get a record by slot
    pub fn record(&self, slot: u16) -> Option<&[u8]> {
        if slot >= self.slot_count() {
            return None;
        }
        let entry = PAGE_HEADER_SIZE + slot as usize * SLOT_SIZE;
        let offset = LittleEndian::read_u16(&self.data[entry..entry + 2]) as usize;
        let len = LittleEndian::read_u16(&self.data[entry + 2..entry + 4]) as usize;
        self.data.get(offset..offset + len)
    }

    /// Iterate over `(slot, record)` pairs
    pub fn records(&self) -> impl Iterator<Item = (u16, &[u8])> {
        (0..self.slot_count()).filter_map(move |slot| self.record(slot).map(|r| (slot, r)))
    }

    // ========== Single payload ==========

    /// Payload of a chain, overflow or header page
    pub fn payload(&self) -> &[u8] {
        let len = LittleEndian::read_u32(&self.data[24..28]) as usize;
        let end = (PAGE_HEADER_SIZE + len).min(self.data.len());
        &self.data[PAGE_HEADER_SIZE..end]
    }

    /// Replace the payload, returning the number of bytes stored
    pub fn set_payload(&mut self, payload: &[u8]) -> usize {
        let len = payload.len().min(payload_capacity(self.data.len()));
        self.data[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + len].copy_from_slice(&payload[..len]);
        LittleEndian::write_u32(&mut self.data[24..28], len as u32);
        len
    }
}

/// Contents of a header page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHeader {
    pub format_version: u32,
    pub page_size: u32,
    pub schema_version: u32,
    /// Committed version this header publishes
    pub version: u64,
    /// First page of the catalog chain
    pub catalog_root: PageId,
    /// Number of pages in the file
    pub page_count: u32,
}

const FILE_HEADER_LEN: usize = 32;

impl FileHeader {
    /// Header page slot used for a version; the two slots alternate
    pub fn slot_for(version: u64) -> PageId {
        (version % 2) as PageId
    }

    /// Encode into header page `slot`
    pub fn to_page(&self, slot: PageId) -> Page {
        let mut page = Page::new(slot, PageType::Header, self.page_size as usize);
        let mut buf = [0u8; FILE_HEADER_LEN];
        buf[0..4].copy_from_slice(&MAGIC);
        LittleEndian::write_u32(&mut buf[4..8], self.format_version);
        LittleEndian::write_u32(&mut buf[8..12], self.page_size);
        LittleEndian::write_u32(&mut buf[12..16], self.schema_version);
        LittleEndian::write_u64(&mut buf[16..24], self.version);
        LittleEndian::write_u32(&mut buf[24..28], self.catalog_root);
        LittleEndian::write_u32(&mut buf[28..32], self.page_count);
        page.set_payload(&buf);
        page.set_version(self.version);
        page.seal();
        page
    }

    /// Decode from a verified header page
    pub fn from_page(page: &Page) -> Result<Self> {
        let buf = page.payload();
        if page.page_type() != PageType::Header || buf.len() < FILE_HEADER_LEN || buf[0..4] != MAGIC
        {
            return Err(Error::CorruptPage(page.page_id()));
        }
        let header = Self {
            format_version: LittleEndian::read_u32(&buf[4..8]),
            page_size: LittleEndian::read_u32(&buf[8..12]),
            schema_version: LittleEndian::read_u32(&buf[12..16]),
            version: LittleEndian::read_u64(&buf[16..24]),
            catalog_root: LittleEndian::read_u32(&buf[24..28]),
            page_count: LittleEndian::read_u32(&buf[28..32]),
        };
        if header.format_version != FORMAT_VERSION {
            return Err(Error::Serialization(format!(
                "unsupported format version {}",
                header.format_version
            )));
        }
        Ok(header)
    }

    /// Read the page size out of raw header bytes without verifying them
    pub fn peek_page_size(raw: &[u8]) -> Option<usize> {
        let start = PAGE_HEADER_SIZE;
        if raw.len() < start + FILE_HEADER_LEN || raw[start..start + 4] != MAGIC {
            return None;
        }
        Some(LittleEndian::read_u32(&raw[start + 8..start + 12]) as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_creation() {
        let page = Page::new(7, PageType::Data, 4096);
        assert_eq!(page.page_id(), 7);
        assert_eq!(page.slot_count(), 0);
        assert_eq!(page.page_type(), PageType::Data);
        assert_eq!(page.next_page(), None);
        assert_eq!(page.free_space(), 4096 - PAGE_HEADER_SIZE);
    }

    #[test]
    fn test_insert_and_read_records() {
        let mut page = Page::new(3, PageType::Data, 1024);
        let a = page.insert_record(b"hello").unwrap();
        let b = page.insert_record(b"world!").unwrap();
        assert_eq!((a, b), (0, 1));
        assert_eq!(page.record(a), Some(&b"hello"[..]));
        assert_eq!(page.record(b), Some(&b"world!"[..]));
        assert_eq!(page.record(2), None);
        assert_eq!(page.records().count(), 2);
    }

    #[test]
    fn test_page_fills_up() {
        let mut page = Page::new(3, PageType::Data, 1024);
        let record = [0xabu8; 100];
        let mut inserted = 0;
        while page.insert_record(&record).is_some() {
            inserted += 1;
        }
        assert_eq!(inserted, (1024 - PAGE_HEADER_SIZE) / (100 + SLOT_SIZE));
        assert!(!page.can_fit(100));

        let mut empty = Page::new(4, PageType::Data, 1024);
        assert!(empty.insert_record(&vec![1u8; max_inline_record(1024)]).is_some());
    }

    #[test]
    fn test_largest_page_size() {
        let mut page = Page::new(1, PageType::Data, 32768);
        assert_eq!(page.free_space(), 32768 - PAGE_HEADER_SIZE);
        let slot = page.insert_record(b"abc").unwrap();
        assert_eq!(page.record(slot), Some(&b"abc"[..]));
    }

    #[test]
    fn test_checksum_detects_corruption() {
        let mut page = Page::new(9, PageType::Data, 1024);
        page.insert_record(b"payload").unwrap();
        page.seal();

        let bytes = page.as_bytes().to_vec();
        assert!(Page::from_bytes(9, bytes.clone()).is_ok());

        let mut flipped = bytes.clone();
        flipped[1000] ^= 0x01;
        assert!(matches!(
            Page::from_bytes(9, flipped),
            Err(Error::CorruptPage(9))
        ));

        // A page read at the wrong position is rejected too.
        assert!(Page::from_bytes(10, bytes).is_err());
    }

    #[test]
    fn test_payload() {
        let mut page = Page::new(2, PageType::Overflow, 1024);
        let stored = page.set_payload(&vec![5u8; 2000]);
        assert_eq!(stored, payload_capacity(1024));
        assert_eq!(page.payload().len(), stored);
        page.set_next_page(Some(11));
        assert_eq!(page.next_page(), Some(11));
    }

    #[test]
    fn test_file_header() {
        let header = FileHeader {
            format_version: FORMAT_VERSION,
            page_size: 4096,
            schema_version: 2,
            version: 5,
            catalog_root: 12,
            page_count: 40,
        };
        assert_eq!(FileHeader::slot_for(5), 1);
        let page = header.to_page(1);
        let reread = Page::from_bytes(1, page.as_bytes().to_vec()).unwrap();
        assert_eq!(FileHeader::from_page(&reread).unwrap(), header);
        assert_eq!(FileHeader::peek_page_size(page.as_bytes()), Some(4096));
    }
}
