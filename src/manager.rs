use crate::entry::Entry;
use crate::file_lock::lock_exclusive;
use crate::id::Identifier;
use crate::page::{PageRef, PhysicalPage, PAGE_SIZE};
use crate::recycling::RecyclingPage;
use crate::tiered::{self, EntryPage, TieredPage};
use anyhow::anyhow;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::Arc;

/// Supplies physical pages to the page trees.
pub(crate) trait Allocator {
    fn allocate_page(&mut self) -> anyhow::Result<PageRef>;
}

/// Allocates pages by growing the backing file, one page at a time. This is
/// the allocator of last resort and the only one the recycler is allowed to
/// use while mutating its own tree.
pub(crate) struct FileExtent {
    file: Arc<File>,
    size: u64,
}

impl FileExtent {
    pub(crate) fn new(file: Arc<File>, size: u64) -> Self {
        debug_assert_eq!(size % PAGE_SIZE, 0);
        Self { file, size }
    }

    pub(crate) fn size(&self) -> u64 {
        self.size
    }
}

impl Allocator for FileExtent {
    fn allocate_page(&mut self) -> anyhow::Result<PageRef> {
        let off = self.size;
        self.size += PAGE_SIZE;
        self.file.set_len(self.size)?;
        log::trace!("extend file to {} bytes", self.size);
        Ok(PhysicalPage::new(self.file.clone(), off, 0))
    }
}

/// Allocator used outside the manager lock; every allocation takes the lock
/// for its duration.
pub(crate) struct ManagedAlloc<'a>(&'a PageManager);

impl<'a> ManagedAlloc<'a> {
    pub(crate) fn new(pm: &'a PageManager) -> Self {
        Self(pm)
    }
}

impl Allocator for ManagedAlloc<'_> {
    fn allocate_page(&mut self) -> anyhow::Result<PageRef> {
        self.0.managed_allocate_page()
    }
}

struct ManagerInner {
    extent: FileExtent,
    free: RecyclingPage,
    entries: HashMap<Identifier, Arc<EntryPage>>,
}

impl Allocator for ManagerInner {
    fn allocate_page(&mut self) -> anyhow::Result<PageRef> {
        if self.free.available_pages() > 0 {
            return self.free.free_page();
        }
        self.extent.allocate_page()
    }
}

/// Owns the backing file and dispenses entries. The first page of the file
/// is the recycler's descriptor page; every other descriptor page offset is
/// handed out as an entry identifier.
pub struct PageManager {
    file: Arc<File>,
    inner: Mutex<ManagerInner>,
}

impl PageManager {
    /// Opens the store at `path`, creating and initializing the backing file
    /// if it does not exist yet.
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        lock_exclusive(&file)?;
        if !file.metadata()?.is_file() {
            return Err(anyhow!("store path is not a regular file"));
        }

        let size = file.metadata()?.len();
        if size % PAGE_SIZE != 0 {
            return Err(anyhow!(
                "store file is corrupted: {size} bytes is not a multiple of the page size"
            ));
        }
        let file = Arc::new(file);

        let (extent, free) = if size == 0 {
            let mut extent = FileExtent::new(file.clone(), 0);
            let desc = extent.allocate_page()?;
            let tiered = TieredPage::create(desc, &mut extent)?;
            log::debug!("initialized fresh store at {}", path.display());
            (extent, RecyclingPage::new(tiered))
        } else {
            let desc = PhysicalPage::new(file.clone(), 0, PAGE_SIZE);
            let tiered = tiered::load(desc)?;
            log::debug!(
                "recovered store at {} with {} free pages",
                path.display(),
                tiered.pages.len(),
            );
            (FileExtent::new(file.clone(), size), RecyclingPage::new(tiered))
        };

        Ok(Self {
            file,
            inner: Mutex::new(ManagerInner {
                extent,
                free,
                entries: HashMap::new(),
            }),
        })
    }

    /// Creates a new empty entry and returns a cursor for it.
    pub fn create(&self) -> anyhow::Result<Entry<'_>> {
        let mut inner = self.inner.lock();

        let desc = inner.allocate_page()?;
        let id = Identifier::new(desc.file_off())
            .expect("the first page of the file belongs to the recycler");
        let tiered = TieredPage::create(desc, &mut *inner)?;

        let ep = Arc::new(EntryPage::new(tiered));
        inner.entries.insert(id, ep.clone());
        log::debug!("created entry {id:?}");
        Ok(Entry::new(self, ep, id))
    }

    /// Opens a cursor for an existing entry. Reuses the in-memory tree when
    /// another cursor already has the entry open, otherwise replays the
    /// entry's descriptor page from disk.
    pub fn open_entry(&self, id: Identifier) -> anyhow::Result<Entry<'_>> {
        let mut inner = self.inner.lock();

        if let Some(ep) = inner.entries.get(&id) {
            ep.acquire();
            return Ok(Entry::new(self, ep.clone(), id));
        }

        if id.get() % PAGE_SIZE != 0 || id.get() + PAGE_SIZE > inner.extent.size() {
            return Err(anyhow!("{id:?} is not a valid entry identifier"));
        }

        let desc = PhysicalPage::new(self.file.clone(), id.get(), PAGE_SIZE);
        let tiered = tiered::load(desc)?;
        log::debug!("opened entry {id:?} with {} bytes", tiered.used_size);

        let ep = Arc::new(EntryPage::new(tiered));
        inner.entries.insert(id, ep.clone());
        Ok(Entry::new(self, ep, id))
    }

    /// Allocates a page under the manager lock, preferring recycled pages
    /// over growing the file.
    pub(crate) fn managed_allocate_page(&self) -> anyhow::Result<PageRef> {
        self.inner.lock().allocate_page()
    }

    /// Returns pages to the recycler.
    pub(crate) fn free_pages(&self, pages: Vec<PageRef>) -> anyhow::Result<()> {
        if pages.is_empty() {
            return Ok(());
        }
        let mut inner = self.inner.lock();
        let ManagerInner { extent, free, .. } = &mut *inner;
        free.add_pages(pages, extent)
    }

    /// Drops a cursor reference; the last reference evicts the entry from
    /// the registry.
    pub(crate) fn close_entry(&self, id: Identifier, ep: &EntryPage) {
        let mut inner = self.inner.lock();
        if ep.release() {
            log::debug!("closed entry {id:?}");
            inner.entries.remove(&id);
        }
    }

    pub(crate) fn sync_file(&self) -> anyhow::Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_initializes_fresh_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store");
        let pm = PageManager::open(&path).unwrap();

        // Recycler descriptor plus its root node.
        assert_eq!(2 * PAGE_SIZE, std::fs::metadata(&path).unwrap().len());
        assert_eq!(0, pm.inner.lock().free.available_pages());
    }

    #[test]
    fn test_open_rejects_torn_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store");
        std::fs::write(&path, vec![0u8; PAGE_SIZE as usize + 1]).unwrap();
        assert!(PageManager::open(&path).is_err());
    }

    #[test]
    fn test_registry_tracks_open_cursors() {
        let dir = tempfile::tempdir().unwrap();
        let pm = PageManager::open(&dir.path().join("store")).unwrap();

        let entry = pm.create().unwrap();
        let id = entry.id();
        assert_eq!(1, pm.inner.lock().entries.len());

        let second = pm.open_entry(id).unwrap();
        assert_eq!(1, pm.inner.lock().entries.len());

        drop(entry);
        assert_eq!(1, pm.inner.lock().entries.len());
        drop(second);
        assert_eq!(0, pm.inner.lock().entries.len());
    }

    #[test]
    fn test_open_entry_rejects_bogus_id() {
        let dir = tempfile::tempdir().unwrap();
        let pm = PageManager::open(&dir.path().join("store")).unwrap();

        let id = Identifier::new(3 * PAGE_SIZE + 1).unwrap();
        assert!(pm.open_entry(id).is_err());
        let id = Identifier::new(64 * PAGE_SIZE).unwrap();
        assert!(pm.open_entry(id).is_err());
    }

    #[test]
    fn test_allocate_prefers_recycled_pages() {
        let dir = tempfile::tempdir().unwrap();
        let pm = PageManager::open(&dir.path().join("store")).unwrap();

        let pages: Vec<_> = (0..4)
            .map(|_| pm.managed_allocate_page().unwrap())
            .collect();
        let last_off = pages.last().unwrap().file_off();
        let size_before = pm.inner.lock().extent.size();

        pm.free_pages(pages).unwrap();
        let reused = pm.managed_allocate_page().unwrap();
        assert_eq!(last_off, reused.file_off());
        assert_eq!(size_before, pm.inner.lock().extent.size());
    }
}
