use crate::bins::{const_assert, put_varint, read_varint, SliceExt};
use crate::page::{PageRef, PAGE_SIZE};
use anyhow::anyhow;

/// Maximum number of children per page table node. Fixed by the node layout:
/// an 8-byte entry count followed by one 8-byte offset slot per child.
pub(crate) const FANOUT: u64 = 504;

const NODE_HEADER_SIZE: usize = 8;

const_assert!(NODE_HEADER_SIZE + 8 * FANOUT as usize <= PAGE_SIZE as usize);

/// One node of the tiered page tree. A node at height 0 points at data pages,
/// a node at height > 0 points at child nodes. Children always occupy a dense
/// slot prefix; a node owns its children, so there are no parent links.
pub(crate) struct PageTable {
    pub(crate) height: u32,
    /// The physical page holding the serialized node.
    pub(crate) pp: PageRef,
    children: Children,
}

enum Children {
    Pages(Vec<PageRef>),
    Tables(Vec<PageTable>),
}

impl PageTable {
    pub(crate) fn new(height: u32, pp: PageRef) -> Self {
        let children = if height == 0 {
            Children::Pages(Vec::new())
        } else {
            Children::Tables(Vec::new())
        };
        Self {
            height,
            pp,
            children,
        }
    }

    pub(crate) fn len(&self) -> usize {
        match &self.children {
            Children::Pages(pages) => pages.len(),
            Children::Tables(tables) => tables.len(),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn child_pages(&self) -> &Vec<PageRef> {
        match &self.children {
            Children::Pages(pages) => pages,
            Children::Tables(_) => panic!("node at height {} has no child pages", self.height),
        }
    }

    pub(crate) fn child_pages_mut(&mut self) -> &mut Vec<PageRef> {
        match &mut self.children {
            Children::Pages(pages) => pages,
            Children::Tables(_) => panic!("node at height {} has no child pages", self.height),
        }
    }

    pub(crate) fn child_tables(&self) -> &Vec<PageTable> {
        match &self.children {
            Children::Tables(tables) => tables,
            Children::Pages(_) => panic!("leaf node has no child tables"),
        }
    }

    pub(crate) fn child_tables_mut(&mut self) -> &mut Vec<PageTable> {
        match &mut self.children {
            Children::Tables(tables) => tables,
            Children::Pages(_) => panic!("leaf node has no child tables"),
        }
    }

    /// Length of the serialized node.
    fn size(&self) -> usize {
        NODE_HEADER_SIZE + 8 * self.len()
    }

    fn marshal(&self) -> Vec<u8> {
        let mut data = vec![0u8; self.size()];
        data.put_u64(self.len() as u64);

        let mut off = NODE_HEADER_SIZE;
        match &self.children {
            Children::Pages(pages) => {
                for page in pages {
                    put_varint(&mut data[off..off + 8], page.file_off() as i64);
                    off += 8;
                }
            }
            Children::Tables(tables) => {
                for table in tables {
                    put_varint(&mut data[off..off + 8], table.pp.file_off() as i64);
                    off += 8;
                }
            }
        }
        data
    }

    /// Serializes the node and rewrites it on its physical page. The whole
    /// node is rewritten; there is no partial update.
    pub(crate) fn write_to_disk(&self) -> anyhow::Result<()> {
        let data = self.marshal();
        self.pp.write_at(&data, 0)?;
        Ok(())
    }
}

/// Decodes the child offsets of a serialized node.
pub(crate) fn unmarshal_node(data: &[u8]) -> anyhow::Result<Vec<u64>> {
    if data.len() < NODE_HEADER_SIZE {
        return Err(anyhow!(
            "node page is truncated: {} bytes is smaller than the header",
            data.len()
        ));
    }

    let num_entries = data.read_u64();
    if num_entries > FANOUT {
        return Err(anyhow!(
            "node page is corrupted: {num_entries} entries exceeds the fanout {FANOUT}",
        ));
    }

    let mut off = NODE_HEADER_SIZE;
    let mut offsets = Vec::with_capacity(num_entries as usize);
    for i in 0..num_entries {
        if data.len() < off + 8 {
            return Err(anyhow!(
                "node page is corrupted: entry {i} is past the end of the page"
            ));
        }
        let Some((child_off, _)) = read_varint(&data[off..off + 8]) else {
            return Err(anyhow!("node page is corrupted: entry {i} does not decode"));
        };
        if child_off <= 0 || child_off as u64 % PAGE_SIZE != 0 {
            return Err(anyhow!(
                "node page is corrupted: entry {i} points at invalid offset {child_off}"
            ));
        }
        offsets.push(child_off as u64);
        off += 8;
    }
    Ok(offsets)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bins::SliceExt;
    use crate::page::PhysicalPage;
    use std::fs::OpenOptions;
    use std::sync::Arc;

    fn scratch_file(pages: u64) -> (tempfile::TempDir, Arc<std::fs::File>) {
        let dir = tempfile::tempdir().unwrap();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(dir.path().join("pages"))
            .unwrap();
        file.set_len(pages * PAGE_SIZE).unwrap();
        (dir, Arc::new(file))
    }

    #[test]
    fn test_node_roundtrip() {
        let (_dir, file) = scratch_file(8);

        let mut node = PageTable::new(0, PhysicalPage::new(file.clone(), 0, 0));
        for i in 1..4u64 {
            node.child_pages_mut()
                .push(PhysicalPage::new(file.clone(), i * PAGE_SIZE, PAGE_SIZE));
        }
        node.write_to_disk().unwrap();

        let mut buf = vec![0u8; PAGE_SIZE as usize];
        node.pp.read_at(&mut buf, 0).unwrap();
        let offsets = unmarshal_node(&buf).unwrap();
        assert_eq!(vec![PAGE_SIZE, 2 * PAGE_SIZE, 3 * PAGE_SIZE], offsets);
    }

    #[test]
    fn test_node_shrink_rewrites_entry_count() {
        let (_dir, file) = scratch_file(8);

        let mut node = PageTable::new(0, PhysicalPage::new(file.clone(), 0, 0));
        for i in 1..6u64 {
            node.child_pages_mut()
                .push(PhysicalPage::new(file.clone(), i * PAGE_SIZE, PAGE_SIZE));
        }
        node.write_to_disk().unwrap();

        node.child_pages_mut().truncate(2);
        node.write_to_disk().unwrap();

        let mut buf = vec![0u8; PAGE_SIZE as usize];
        node.pp.read_at(&mut buf, 0).unwrap();
        let offsets = unmarshal_node(&buf).unwrap();
        assert_eq!(vec![PAGE_SIZE, 2 * PAGE_SIZE], offsets);
    }

    #[test]
    fn test_unmarshal_rejects_oversized_entry_count() {
        let mut data = vec![0u8; PAGE_SIZE as usize];
        data.put_u64(FANOUT + 1);
        assert!(unmarshal_node(&data).is_err());
    }

    #[test]
    fn test_unmarshal_rejects_unaligned_offset() {
        let mut data = vec![0u8; PAGE_SIZE as usize];
        data.put_u64(1);
        put_varint(&mut data[8..16], 123);
        assert!(unmarshal_node(&data).is_err());
    }
}
