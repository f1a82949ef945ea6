use crate::manager::FileExtent;
use crate::page::{PageRef, PAGE_SIZE};
use crate::tiered::{write_descriptor_entry, TieredPage};
use anyhow::anyhow;

/// A tiered page used as a LIFO free-list of physical pages. Popping a page
/// off the tree truncates it by one page, which itself frees node pages;
/// those land in the `pages_to_free` buffer and are handed out first on
/// subsequent calls, amortizing the tree work.
pub(crate) struct RecyclingPage {
    tiered: TieredPage,
    pages_to_free: Vec<PageRef>,
}

impl RecyclingPage {
    pub(crate) fn new(tiered: TieredPage) -> Self {
        Self {
            tiered,
            pages_to_free: Vec::new(),
        }
    }

    /// Number of pages available for reuse.
    pub(crate) fn available_pages(&self) -> usize {
        self.pages_to_free.len() + self.tiered.pages.len()
    }

    /// Pops a page for reuse. The returned page's `used_size` is reset to 0.
    pub(crate) fn free_page(&mut self) -> anyhow::Result<PageRef> {
        if let Some(page) = self.pages_to_free.pop() {
            log::trace!("reuse buffered page at {}", page.file_off());
            page.set_used_size(0);
            return Ok(page);
        }

        let Some(page) = self.tiered.pages.last().cloned() else {
            return Err(anyhow!("ran out of free pages"));
        };

        // Truncate the tree by exactly one page. The first freed page has to
        // be the one we hand out; everything else truncate and defrag shed
        // goes into the reuse buffer.
        let target = self.tiered.used_size - PAGE_SIZE;
        let mut freed = self.tiered.recursive_truncate(target)?;
        assert!(
            freed.first().map(|p| p.file_off()) == Some(page.file_off()),
            "the truncated page does not match the page to return",
        );
        freed.remove(0);

        let collapsed = self.tiered.defrag()?;
        self.pages_to_free.extend(freed);
        self.pages_to_free.extend(collapsed);

        log::trace!("reuse recycled page at {}", page.file_off());
        page.set_used_size(0);
        Ok(page)
    }

    /// Inserts freed pages into the tree. Node pages needed while inserting
    /// are drawn from `extent` directly, never from the recycler itself, so
    /// the insertion cannot re-enter `free_page`.
    pub(crate) fn add_pages(
        &mut self,
        pages: Vec<PageRef>,
        extent: &mut FileExtent,
    ) -> anyhow::Result<()> {
        if pages.is_empty() {
            return Ok(());
        }
        log::trace!("recycling {} pages", pages.len());

        // Free pages are treated as if they were full so the tree invariants
        // hold.
        for page in &pages {
            page.set_used_size(PAGE_SIZE);
        }
        self.tiered.pages.extend(pages.iter().cloned());

        self.tiered.append_pages(&pages, extent)?;
        self.tiered.used_size += pages.len() as u64 * PAGE_SIZE;
        write_descriptor_entry(
            &self.tiered.pp,
            self.tiered.root.height,
            self.tiered.used_size,
            self.tiered.root.pp.file_off(),
        )
    }
}
