//! Pager for boxdb
//!
//! This module handles raw page I/O against the data file, or against a
//! page map for in-memory stores.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::trace;

use super::page::{Page, PageId};
use crate::error::{Error, Result};

#[derive(Debug)]
enum Backend {
    File { file: Mutex<File>, path: PathBuf },
    Memory(Mutex<HashMap<PageId, Vec<u8>>>),
}

/// Page-granular access to the data file
#[derive(Debug)]
pub struct Pager {
    backend: Backend,
    page_size: usize,
}

impl Pager {
    /// Open or create the data file at `path`
    pub fn open(path: impl AsRef<Path>, page_size: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .map_err(|source| Error::DirectoryUnavailable {
                path: path.clone(),
                source,
            })?;
        Ok(Self {
            backend: Backend::File {
                file: Mutex::new(file),
                path,
            },
            page_size,
        })
    }

    /// Create a pager that keeps pages in memory
    pub fn memory(page_size: usize) -> Self {
        Self {
            backend: Backend::Memory(Mutex::new(HashMap::new())),
            page_size,
        }
    }

    /// Page size in bytes
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Change the page size; used once the header of an existing file is read
    pub fn set_page_size(&mut self, page_size: usize) {
        self.page_size = page_size;
    }

    /// Path of the data file, `None` in memory
    pub fn path(&self) -> Option<&Path> {
        match &self.backend {
            Backend::File { path, .. } => Some(path),
            Backend::Memory(_) => None,
        }
    }

    /// Number of whole pages currently stored
    pub fn stored_pages(&self) -> Result<u32> {
        match &self.backend {
            Backend::File { file, .. } => {
                let len = file.lock().metadata()?.len();
                Ok((len / self.page_size as u64) as u32)
            }
            Backend::Memory(pages) => {
                Ok(pages.lock().keys().max().map(|&max| max + 1).unwrap_or(0))
            }
        }
    }

    /// Read up to `len` raw bytes from the start of the file
    pub fn read_prefix(&self, len: usize) -> Result<Vec<u8>> {
        match &self.backend {
            Backend::File { file, .. } => {
                let mut file = file.lock();
                let mut buf = Vec::with_capacity(len);
                file.seek(SeekFrom::Start(0))?;
                Read::by_ref(&mut *file).take(len as u64).read_to_end(&mut buf)?;
                Ok(buf)
            }
            Backend::Memory(pages) => Ok(pages
                .lock()
                .get(&0)
                .map(|p| p[..len.min(p.len())].to_vec())
                .unwrap_or_default()),
        }
    }

    /// Read and verify a page
    pub fn read_page(&self, page_id: PageId) -> Result<Page> {
        trace!(page_id, "reading page");
        let bytes = match &self.backend {
            Backend::File { file, .. } => {
                let mut file = file.lock();
                let mut buf = vec![0u8; self.page_size];
                file.seek(SeekFrom::Start(page_id as u64 * self.page_size as u64))?;
                match file.read_exact(&mut buf) {
                    Ok(()) => buf,
                    Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                        return Err(Error::CorruptPage(page_id))
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            Backend::Memory(pages) => pages
                .lock()
                .get(&page_id)
                .cloned()
                .ok_or(Error::CorruptPage(page_id))?,
        };
        Page::from_bytes(page_id, bytes)
    }

    /// Write a sealed page to its position
    pub fn write_page(&self, page: &Page) -> Result<()> {
        let page_id = page.page_id();
        trace!(page_id, "writing page");
        match &self.backend {
            Backend::File { file, .. } => {
                let mut file = file.lock();
                file.seek(SeekFrom::Start(page_id as u64 * self.page_size as u64))?;
                file.write_all(page.as_bytes())?;
            }
            Backend::Memory(pages) => {
                pages.lock().insert(page_id, page.as_bytes().to_vec());
            }
        }
        Ok(())
    }

    /// Flush written pages to stable storage
    pub fn sync(&self) -> Result<()> {
        if let Backend::File { file, .. } = &self.backend {
            let mut file = file.lock();
            file.flush()?;
            file.sync_data()?;
        }
        Ok(())
    }

    /// Truncate or extend the file to `page_count` pages
    pub fn set_len(&self, page_count: u32) -> Result<()> {
        match &self.backend {
            Backend::File { file, .. } => {
                file.lock().set_len(page_count as u64 * self.page_size as u64)?;
            }
            Backend::Memory(pages) => pages.lock().retain(|&id, _| id < page_count),
        }
        Ok(())
    }
}
