//! Page chains
//!
//! A chain stores one byte payload across linked pages of a single type.
//! Chains hold the catalog, the entity directories, the secondary indexes and
//! records too large for a data page.

use std::collections::HashSet;
use std::sync::Arc;

use super::page::{payload_capacity, Page, PageId, PageType};
use crate::error::{Error, Result};

/// Number of pages a payload of `len` bytes needs (at least one)
pub fn chain_pages_needed(len: usize, page_size: usize) -> usize {
    len.div_ceil(payload_capacity(page_size)).max(1)
}

/// Lay `payload` out over the given page ids, in order.
///
/// Pages beyond what the payload needs carry an empty payload. The returned
/// pages are not sealed.
pub fn build_chain(
    ids: &[PageId],
    page_type: PageType,
    payload: &[u8],
    page_size: usize,
) -> Result<Vec<Page>> {
    if ids.len() < chain_pages_needed(payload.len(), page_size) {
        return Err(Error::Internal(format!(
            "{} pages cannot hold a {} byte chain",
            ids.len(),
            payload.len()
        )));
    }
    let mut pages = Vec::with_capacity(ids.len());
    let mut rest = payload;
    for (i, &id) in ids.iter().enumerate() {
        let mut page = Page::new(id, page_type, page_size);
        let stored = page.set_payload(rest);
        rest = &rest[stored..];
        page.set_next_page(ids.get(i + 1).copied());
        pages.push(page);
    }
    Ok(pages)
}

/// Read a chain starting at `root`, returning its payload and page ids
pub fn read_chain<F>(root: PageId, page_type: PageType, mut fetch: F) -> Result<(Vec<u8>, Vec<PageId>)>
where
    F: FnMut(PageId) -> Result<Arc<Page>>,
{
    let mut payload = Vec::new();
    let mut ids = Vec::new();
    let mut seen = HashSet::new();
    let mut next = Some(root);
    while let Some(id) = next {
        if !seen.insert(id) {
            return Err(Error::CorruptPage(id));
        }
        let page = fetch(id)?;
        if page.page_type() != page_type {
            return Err(Error::CorruptPage(id));
        }
        payload.extend_from_slice(page.payload());
        ids.push(id);
        next = page.next_page();
    }
    Ok((payload, ids))
}

/// Collect the page ids of a chain without keeping its payload
pub fn chain_page_ids<F>(root: PageId, page_type: PageType, fetch: F) -> Result<Vec<PageId>>
where
    F: FnMut(PageId) -> Result<Arc<Page>>,
{
    read_chain(root, page_type, fetch).map(|(_, ids)| ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_chain_round_trip() {
        let payload: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
        let needed = chain_pages_needed(payload.len(), 1024);
        assert_eq!(needed, 6);

        // One spare page at the end stays empty.
        let ids: Vec<PageId> = (10..10 + needed as PageId + 1).collect();
        let pages = build_chain(&ids, PageType::Directory, &payload, 1024).unwrap();
        let map: HashMap<PageId, Arc<Page>> =
            pages.into_iter().map(|p| (p.page_id(), Arc::new(p))).collect();

        let (read, read_ids) = read_chain(10, PageType::Directory, |id| {
            map.get(&id).cloned().ok_or(Error::CorruptPage(id))
        })
        .unwrap();
        assert_eq!(read, payload);
        assert_eq!(read_ids, ids);
    }

    #[test]
    fn test_empty_payload_uses_one_page() {
        assert_eq!(chain_pages_needed(0, 4096), 1);
        let pages = build_chain(&[3], PageType::Index, &[], 4096).unwrap();
        assert_eq!(pages[0].payload(), &[] as &[u8]);
        assert!(build_chain(&[], PageType::Index, &[], 4096).is_err());
    }

    #[test]
    fn test_rejects_wrong_type_and_cycles() {
        let mut a = Page::new(1, PageType::Index, 1024);
        a.set_next_page(Some(2));
        let mut b = Page::new(2, PageType::Index, 1024);
        b.set_next_page(Some(1));
        let map: HashMap<PageId, Arc<Page>> = [(1, Arc::new(a)), (2, Arc::new(b))].into();
        let fetch = |id: PageId| map.get(&id).cloned().ok_or(Error::CorruptPage(id));

        assert!(matches!(read_chain(1, PageType::Index, fetch), Err(Error::CorruptPage(1))));
        assert!(matches!(
            read_chain(1, PageType::Directory, fetch),
            Err(Error::CorruptPage(1))
        ));
    }
}
