//! Inverted lists: per-list vector ids and their PQ codes.

use serde::{Deserialize, Serialize};

/// One inverted list. `codes` holds `ids.len()` codes of `code_size` bytes each.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvertedList {
    ids: Vec<u32>,
    codes: Vec<u8>,
}

impl InvertedList {
    #[inline]
    pub fn ids(&self) -> &[u32] {
        &self.ids
    }

    #[inline]
    pub fn codes(&self) -> &[u8] {
        &self.codes
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// All inverted lists of an index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvertedLists {
    code_size: usize,
    lists: Vec<InvertedList>,
}

impl InvertedLists {
    pub fn new(nlist: usize, code_size: usize) -> Self {
        Self {
            code_size,
            lists: vec![InvertedList::default(); nlist],
        }
    }

    /// Append one entry. `code` must be exactly `code_size` bytes.
    pub fn add_entry(&mut self, list_no: usize, id: u32, code: &[u8]) {
        debug_assert_eq!(code.len(), self.code_size);
        let list = &mut self.lists[list_no];
        list.ids.push(id);
        list.codes.extend_from_slice(code);
    }

    /// List `list_no`, or `None` if out of range.
    #[inline]
    pub fn list(&self, list_no: usize) -> Option<&InvertedList> {
        self.lists.get(list_no)
    }

    #[inline]
    pub fn list_len(&self, list_no: usize) -> Option<usize> {
        self.list(list_no).map(InvertedList::len)
    }

    /// Code of the `offset`-th entry of list `list_no`.
    pub fn code(&self, list_no: usize, offset: usize) -> Option<&[u8]> {
        let list = self.lists.get(list_no)?;
        let start = offset.checked_mul(self.code_size)?;
        list.codes.get(start..start + self.code_size)
    }

    #[inline]
    pub fn nlist(&self) -> usize {
        self.lists.len()
    }

    #[inline]
    pub fn code_size(&self) -> usize {
        self.code_size
    }

    /// Total number of entries across lists.
    pub fn ntotal(&self) -> usize {
        self.lists.iter().map(InvertedList::len).sum()
    }

    /// Approximate heap bytes held by ids and codes.
    pub fn size_bytes(&self) -> usize {
        self.lists
            .iter()
            .map(|l| l.ids.len() * std::mem::size_of::<u32>() + l.codes.len())
            .sum()
    }

    /// Whether every list's code buffer matches its id count.
    pub(crate) fn is_consistent(&self) -> bool {
        self.lists
            .iter()
            .all(|l| l.codes.len() == l.ids.len() * self.code_size)
    }
}
