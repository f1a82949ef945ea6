use crate::bins::{const_assert, put_varint, read_varint};
use crate::manager::Allocator;
use crate::page::{PageRef, PhysicalPage, PAGE_SIZE};
use crate::table::{unmarshal_node, PageTable, FANOUT};
use anyhow::anyhow;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};

/// Size of one entry in a descriptor page: two 8-byte varint slots holding
/// `used_bytes` and the root node's page offset. The entry for the live root
/// sits at the slot indexed by the root's height.
pub(crate) const TIERED_ENTRY_SIZE: u64 = 16;

const_assert!(PAGE_SIZE % TIERED_ENTRY_SIZE == 0);

/// Number of pages a tree of the given height can address.
pub(crate) fn max_pages(height: u32) -> u64 {
    (FANOUT as u128)
        .checked_pow(height + 1)
        .map_or(u64::MAX, |v| v.min(u64::MAX as u128) as u64)
}

/// A tree of page table nodes rooted at a descriptor page. Entry trees store
/// data pages where only the final page may be partially used; the recycler
/// tree stores full pages only.
pub(crate) struct TieredPage {
    /// The descriptor page the tree is rooted at.
    pub(crate) pp: PageRef,
    pub(crate) root: PageTable,
    /// Total live bytes addressed by the tree.
    pub(crate) used_size: u64,
    /// All data pages of the tree, indexed by logical page number.
    pub(crate) pages: Vec<PageRef>,
}

impl TieredPage {
    /// Sets up a fresh tree on `pp`: a zeroed descriptor page plus an empty
    /// height-0 root node.
    pub(crate) fn create(pp: PageRef, alloc: &mut dyn Allocator) -> anyhow::Result<Self> {
        // A recycled descriptor page may carry stale slots which would shadow
        // the live root on recovery.
        pp.write_at(&[0u8; PAGE_SIZE as usize], 0)?;

        let root = PageTable::new(0, alloc.allocate_page()?);
        root.write_to_disk()?;
        write_descriptor_entry(&pp, 0, 0, root.pp.file_off())?;

        Ok(Self {
            pp,
            root,
            used_size: 0,
            pages: Vec::new(),
        })
    }

    /// The index at which the next data page is inserted.
    pub(crate) fn next_index(&self) -> u64 {
        self.used_size.div_ceil(PAGE_SIZE)
    }

    /// Inserts `page` into the tree at `index`, growing the tree upward until
    /// it can address the index and creating interior nodes along the descent
    /// path. Every touched node is persisted.
    pub(crate) fn insert_page(
        &mut self,
        index: u64,
        page: PageRef,
        alloc: &mut dyn Allocator,
    ) -> anyhow::Result<()> {
        while max_pages(self.root.height) <= index {
            self.grow_root(alloc)?;
        }

        let mut node = &mut self.root;
        while node.height > 0 {
            let slot = ((index / max_pages(node.height - 1)) % FANOUT) as usize;
            if slot == node.len() {
                let child = PageTable::new(node.height - 1, alloc.allocate_page()?);
                node.child_tables_mut().push(child);
                node.write_to_disk()?;
            } else {
                assert!(
                    slot < node.len(),
                    "inserting page {index} would leave a slot gap at height {}",
                    node.height,
                );
            }
            node = &mut node.child_tables_mut()[slot];
        }

        let slot = (index % FANOUT) as usize;
        assert!(
            node.len() < FANOUT as usize,
            "leaf node is full, page {index} does not belong here",
        );
        assert_eq!(
            slot,
            node.len(),
            "inserting page {index} would leave a slot gap in the leaf",
        );
        node.child_pages_mut().push(page);
        node.write_to_disk()
    }

    /// Adds one level on top of the tree. The current root becomes slot 0 of
    /// the new root. The new root's node is persisted by the insert descent
    /// that follows, which always attaches a second child to it.
    fn grow_root(&mut self, alloc: &mut dyn Allocator) -> anyhow::Result<()> {
        let new_root = PageTable::new(self.root.height + 1, alloc.allocate_page()?);
        log::trace!(
            "tree at {} grows to height {}",
            self.pp.file_off(),
            new_root.height,
        );
        let old_root = std::mem::replace(&mut self.root, new_root);
        self.root.child_tables_mut().push(old_root);
        Ok(())
    }

    /// Inserts `pages` at consecutive indices starting at `next_index`. When
    /// an insert grows the tree, the previous root's descriptor entry is
    /// rewritten with the full capacity of its subtree so the descriptor
    /// stays valid until the new root's entry lands.
    pub(crate) fn append_pages(
        &mut self,
        pages: &[PageRef],
        alloc: &mut dyn Allocator,
    ) -> anyhow::Result<()> {
        let mut index = self.next_index();
        for page in pages {
            let old_height = self.root.height;
            let old_off = self.root.pp.file_off();
            self.insert_page(index, page.clone(), alloc)?;
            if self.root.height != old_height {
                write_descriptor_entry(
                    &self.pp,
                    old_height,
                    max_pages(old_height) * PAGE_SIZE,
                    old_off,
                )?;
            }
            index += 1;
        }
        Ok(())
    }

    /// Removes pages from the tail of the tree until at most `size` bytes
    /// remain. Returns the freed pages: removed data pages first, then the
    /// node pages that became empty along the way.
    pub(crate) fn recursive_truncate(&mut self, size: u64) -> anyhow::Result<Vec<PageRef>> {
        let mut freed = Vec::new();
        let Self {
            root,
            used_size,
            pages,
            ..
        } = self;
        truncate_node(root, size, used_size, pages, &mut freed)?;
        Ok(freed)
    }

    /// Persists the current `used_size`, then collapses single-child roots
    /// until the root has height 0 or more than one child. Returns the freed
    /// root node pages.
    pub(crate) fn defrag(&mut self) -> anyhow::Result<Vec<PageRef>> {
        write_descriptor_entry(
            &self.pp,
            self.root.height,
            self.used_size,
            self.root.pp.file_off(),
        )?;

        let mut freed = Vec::new();
        while self.root.height > 0 && self.root.len() == 1 {
            let child = self.root.child_tables_mut().pop().unwrap();

            // The child's entry is written before the old root's entry is
            // zeroed; recovery picks the highest populated slot, so a crash
            // between the two writes still finds a valid tree.
            write_descriptor_entry(&self.pp, child.height, self.used_size, child.pp.file_off())?;
            write_descriptor_entry(&self.pp, self.root.height, 0, 0)?;

            let old_root = std::mem::replace(&mut self.root, child);
            log::trace!(
                "tree at {} collapses to height {}",
                self.pp.file_off(),
                self.root.height,
            );
            freed.push(old_root.pp.clone());
        }
        Ok(freed)
    }
}

/// Walks child slots from high to low, removing whole pages and finally
/// shrinking the last surviving page in place. Returns whether `node` became
/// empty; an emptied node's own page is freed by its parent.
fn truncate_node(
    node: &mut PageTable,
    size: u64,
    used_size: &mut u64,
    pages: &mut Vec<PageRef>,
    freed: &mut Vec<PageRef>,
) -> anyhow::Result<bool> {
    if node.height > 0 {
        for i in (0..node.len()).rev() {
            if *used_size <= size {
                return Ok(false);
            }

            let empty = truncate_node(
                &mut node.child_tables_mut()[i],
                size,
                used_size,
                pages,
                freed,
            )?;
            if empty {
                let child = node.child_tables_mut().pop().unwrap();
                debug_assert_eq!(i, node.len());
                freed.push(child.pp.clone());
                node.write_to_disk()?;
                if node.is_empty() {
                    return Ok(true);
                }
            }
        }
        return Ok(false);
    }

    let mut shrunk = false;
    loop {
        if *used_size <= size {
            break;
        }
        let Some(page) = node.child_pages().last().cloned() else {
            break;
        };

        let excess = *used_size - size;
        if excess < page.used_size() {
            // Only the last page may be partial; shrink it in place.
            page.set_used_size(page.used_size() - excess);
            *used_size -= excess;
            break;
        }

        let removed = node.child_pages_mut().pop().unwrap();
        let listed = pages
            .pop()
            .expect("the page list cannot be shorter than the tree");
        assert_eq!(
            listed.file_off(),
            removed.file_off(),
            "the last page of the list must be the last page of the tree",
        );
        *used_size -= removed.used_size();
        freed.push(removed);
        shrunk = true;

        if node.is_empty() {
            return Ok(true);
        }
    }
    if shrunk {
        node.write_to_disk()?;
    }
    Ok(false)
}

/// Writes the `(used_bytes, page_off)` entry at the descriptor slot for
/// `height`.
pub(crate) fn write_descriptor_entry(
    pp: &PhysicalPage,
    height: u32,
    used_bytes: u64,
    page_off: u64,
) -> anyhow::Result<()> {
    let mut data = [0u8; TIERED_ENTRY_SIZE as usize];
    put_varint(&mut data[..8], used_bytes as i64);
    put_varint(&mut data[8..], page_off as i64);
    pp.write_at(&data, u64::from(height) * TIERED_ENTRY_SIZE)?;
    Ok(())
}

/// Reads the descriptor entry at the slot for `height`. An empty slot decodes
/// as `(0, 0)`.
pub(crate) fn read_descriptor_entry(pp: &PhysicalPage, height: u32) -> anyhow::Result<(u64, u64)> {
    let mut data = [0u8; TIERED_ENTRY_SIZE as usize];
    pp.read_at(&mut data, u64::from(height) * TIERED_ENTRY_SIZE)?;

    let Some((used_bytes, _)) = read_varint(&data[..8]) else {
        return Err(anyhow!(
            "descriptor entry for height {height} has a corrupted used_bytes slot"
        ));
    };
    let Some((page_off, _)) = read_varint(&data[8..]) else {
        return Err(anyhow!(
            "descriptor entry for height {height} has a corrupted page_off slot"
        ));
    };
    if used_bytes < 0 || page_off < 0 {
        return Err(anyhow!(
            "descriptor entry for height {height} decodes to negative values"
        ));
    }
    Ok((used_bytes as u64, page_off as u64))
}

/// Rebuilds a tree from its descriptor page: scans the descriptor slots for
/// the live root (the highest populated slot), then reads every node and
/// reattaches the data pages in order.
pub(crate) fn load(pp: PageRef) -> anyhow::Result<TieredPage> {
    let mut live = None;
    for height in 0..(PAGE_SIZE / TIERED_ENTRY_SIZE) as u32 {
        let (used_bytes, page_off) = read_descriptor_entry(&pp, height)?;
        if page_off != 0 {
            live = Some((height, used_bytes, page_off));
        }
    }
    let Some((height, used_size, root_off)) = live else {
        return Err(anyhow!(
            "descriptor page at {} has no live root entry",
            pp.file_off()
        ));
    };
    if root_off % PAGE_SIZE != 0 {
        return Err(anyhow!(
            "descriptor page at {} points at unaligned root {root_off}",
            pp.file_off()
        ));
    }

    let root_pp = PhysicalPage::new(pp.file().clone(), root_off, PAGE_SIZE);
    let mut root = PageTable::new(height, root_pp);
    let mut pages = Vec::new();
    let mut remaining = used_size;
    recover_node(&mut root, &mut remaining, &mut pages)?;

    Ok(TieredPage {
        pp,
        root,
        used_size,
        pages,
    })
}

fn recover_node(
    node: &mut PageTable,
    remaining: &mut u64,
    pages: &mut Vec<PageRef>,
) -> anyhow::Result<()> {
    let mut buf = vec![0u8; PAGE_SIZE as usize];
    node.pp.read_at(&mut buf, 0)?;
    let offsets = unmarshal_node(&buf)?;

    let file = node.pp.file().clone();
    if node.height == 0 {
        for off in offsets {
            if *remaining == 0 {
                // A crash between a leaf rewrite and the descriptor update
                // can leave an entry past the accounted size.
                break;
            }
            let used = (*remaining).min(PAGE_SIZE);
            *remaining -= used;
            let page = PhysicalPage::new(file.clone(), off, used);
            node.child_pages_mut().push(page.clone());
            pages.push(page);
        }
    } else {
        let child_height = node.height - 1;
        for off in offsets {
            let child_pp = PhysicalPage::new(file.clone(), off, PAGE_SIZE);
            let mut child = PageTable::new(child_height, child_pp);
            recover_node(&mut child, remaining, pages)?;
            node.child_tables_mut().push(child);
        }
    }
    Ok(())
}

/// An entry's tree plus the count of open cursors on it. The counter is only
/// mutated under the page manager's lock.
pub(crate) struct EntryPage {
    pub(crate) state: RwLock<TieredPage>,
    instances: AtomicU64,
}

impl EntryPage {
    pub(crate) fn new(state: TieredPage) -> Self {
        Self {
            state: RwLock::new(state),
            instances: AtomicU64::new(1),
        }
    }

    pub(crate) fn acquire(&self) {
        self.instances.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns true when the released cursor was the last one.
    pub(crate) fn release(&self) -> bool {
        self.instances.fetch_sub(1, Ordering::AcqRel) == 1
    }

    /// Records freshly written pages in the tree. The caller has already
    /// appended them to the page list and written their payload; this inserts
    /// them at the tail of the tree and persists the descriptor.
    pub(crate) fn add_pages(
        state: &mut TieredPage,
        pages: &[PageRef],
        added_bytes: u64,
        alloc: &mut dyn Allocator,
    ) -> anyhow::Result<()> {
        if added_bytes == 0 {
            debug_assert!(pages.is_empty());
            return Ok(());
        }
        assert_eq!(
            state.next_index() + pages.len() as u64,
            state.pages.len() as u64,
            "the page list must already contain the pages being recorded",
        );

        state.append_pages(pages, alloc)?;
        state.used_size += added_bytes;
        write_descriptor_entry(
            &state.pp,
            state.root.height,
            state.used_size,
            state.root.pp.file_off(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::FileExtent;
    use std::fs::OpenOptions;
    use std::sync::Arc;

    fn scratch_extent() -> (tempfile::TempDir, FileExtent) {
        let dir = tempfile::tempdir().unwrap();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(dir.path().join("pages"))
            .unwrap();
        let extent = FileExtent::new(Arc::new(file), 0);
        (dir, extent)
    }

    fn scratch_tree() -> (tempfile::TempDir, FileExtent, TieredPage) {
        let (dir, mut extent) = scratch_extent();
        let desc = extent.allocate_page().unwrap();
        let tree = TieredPage::create(desc, &mut extent).unwrap();
        (dir, extent, tree)
    }

    fn grow_by_pages(tree: &mut TieredPage, extent: &mut FileExtent, count: u64) {
        let mut added = Vec::new();
        for _ in 0..count {
            let page = extent.allocate_page().unwrap();
            page.write_at(&[0x41; PAGE_SIZE as usize], 0).unwrap();
            tree.pages.push(page.clone());
            added.push(page);
        }
        EntryPage::add_pages(tree, &added, count * PAGE_SIZE, extent).unwrap();
    }

    #[test]
    fn test_insert_fills_single_leaf() {
        let (_dir, mut extent, mut tree) = scratch_tree();
        grow_by_pages(&mut tree, &mut extent, 3);

        assert_eq!(0, tree.root.height);
        assert_eq!(3, tree.root.len());
        assert_eq!(3 * PAGE_SIZE, tree.used_size);
        assert_eq!(3, tree.pages.len());
    }

    #[test]
    fn test_insert_grows_tree() {
        let (_dir, mut extent, mut tree) = scratch_tree();
        grow_by_pages(&mut tree, &mut extent, FANOUT + 1);

        assert_eq!(1, tree.root.height);
        assert_eq!(2, tree.root.len());
        assert_eq!(FANOUT as usize, tree.root.child_tables()[0].len());
        assert_eq!(1, tree.root.child_tables()[1].len());
    }

    #[test]
    fn test_growth_keeps_first_page() {
        let (_dir, mut extent, mut tree) = scratch_tree();
        grow_by_pages(&mut tree, &mut extent, 1);
        let first_off = tree.pages[0].file_off();

        grow_by_pages(&mut tree, &mut extent, FANOUT);
        assert_eq!(1, tree.root.height);
        assert_eq!(first_off, tree.pages[0].file_off());
    }

    #[test]
    fn test_truncate_frees_tail_pages() {
        let (_dir, mut extent, mut tree) = scratch_tree();
        grow_by_pages(&mut tree, &mut extent, 10);

        let freed = tree.recursive_truncate(4 * PAGE_SIZE + 100).unwrap();
        assert_eq!(5, freed.len());
        assert_eq!(4 * PAGE_SIZE + 100, tree.used_size);
        assert_eq!(5, tree.pages.len());
        assert_eq!(100, tree.pages[4].used_size());
    }

    #[test]
    fn test_truncate_is_idempotent() {
        let (_dir, mut extent, mut tree) = scratch_tree();
        grow_by_pages(&mut tree, &mut extent, 4);

        tree.recursive_truncate(PAGE_SIZE).unwrap();
        let freed = tree.recursive_truncate(PAGE_SIZE).unwrap();
        assert!(freed.is_empty());
        assert_eq!(PAGE_SIZE, tree.used_size);
        assert_eq!(1, tree.pages.len());
    }

    #[test]
    fn test_defrag_collapses_root() {
        let (_dir, mut extent, mut tree) = scratch_tree();
        grow_by_pages(&mut tree, &mut extent, FANOUT + 1);
        assert_eq!(1, tree.root.height);

        tree.recursive_truncate(PAGE_SIZE).unwrap();
        let freed = tree.defrag().unwrap();

        assert_eq!(0, tree.root.height);
        assert_eq!(1, freed.len());
        assert_eq!(1, tree.pages.len());
    }

    #[test]
    fn test_defrag_keeps_multi_child_root() {
        let (_dir, mut extent, mut tree) = scratch_tree();
        grow_by_pages(&mut tree, &mut extent, FANOUT + 2);

        let freed = tree.defrag().unwrap();
        assert!(freed.is_empty());
        assert_eq!(1, tree.root.height);
    }

    #[test]
    fn test_load_rebuilds_tree() {
        let (_dir, mut extent, mut tree) = scratch_tree();
        grow_by_pages(&mut tree, &mut extent, FANOUT + 1);
        tree.used_size -= 1000;
        tree.pages.last().unwrap().set_used_size(PAGE_SIZE - 1000);
        write_descriptor_entry(
            &tree.pp,
            tree.root.height,
            tree.used_size,
            tree.root.pp.file_off(),
        )
        .unwrap();

        let recovered = load(tree.pp.clone()).unwrap();
        assert_eq!(tree.used_size, recovered.used_size);
        assert_eq!(tree.root.height, recovered.root.height);
        assert_eq!(tree.pages.len(), recovered.pages.len());
        for (a, b) in tree.pages.iter().zip(recovered.pages.iter()) {
            assert_eq!(a.file_off(), b.file_off());
            assert_eq!(a.used_size(), b.used_size());
        }
    }

    #[test]
    fn test_load_after_defrag() {
        let (_dir, mut extent, mut tree) = scratch_tree();
        grow_by_pages(&mut tree, &mut extent, FANOUT + 1);
        tree.recursive_truncate(2 * PAGE_SIZE).unwrap();
        tree.defrag().unwrap();

        let recovered = load(tree.pp.clone()).unwrap();
        assert_eq!(0, recovered.root.height);
        assert_eq!(2 * PAGE_SIZE, recovered.used_size);
        assert_eq!(2, recovered.pages.len());
    }
}
