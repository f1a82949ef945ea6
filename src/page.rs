use std::fs::File;
use std::os::unix::fs::FileExt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Size of a physical page in bytes. The whole on-disk layout is derived from
/// this constant, so it has to match between writer and reader.
pub const PAGE_SIZE: u64 = 4096;

pub(crate) type PageRef = Arc<PhysicalPage>;

/// A fixed-size window into the backing file. All I/O goes through
/// `read_at`/`write_at` which translate intra-page offsets to absolute file
/// offsets and never cross the page boundary.
///
/// Reads use positioned I/O (`pread`/`pwrite`), so a shared `&File` serves
/// concurrent readers without touching a file cursor. `used_size` is atomic
/// because the same page is referenced both from its page table leaf and from
/// the tiered page's dense page list; mutation happens under the owning
/// entry's lock.
pub(crate) struct PhysicalPage {
    file: Arc<File>,
    file_off: u64,
    used_size: AtomicU64,
}

impl PhysicalPage {
    pub(crate) fn new(file: Arc<File>, file_off: u64, used_size: u64) -> PageRef {
        debug_assert_eq!(file_off % PAGE_SIZE, 0, "page offset must be aligned");
        Arc::new(Self {
            file,
            file_off,
            used_size: AtomicU64::new(used_size),
        })
    }

    #[inline]
    pub(crate) fn file(&self) -> &Arc<File> {
        &self.file
    }

    #[inline]
    pub(crate) fn file_off(&self) -> u64 {
        self.file_off
    }

    #[inline]
    pub(crate) fn used_size(&self) -> u64 {
        self.used_size.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn set_used_size(&self, size: u64) {
        debug_assert!(size <= PAGE_SIZE);
        self.used_size.store(size, Ordering::Release);
    }

    /// Reads at most `used_size - off` bytes starting at the intra-page
    /// offset `off`. Returns the number of bytes read; zero means the offset
    /// is at or past the end of the used region.
    pub(crate) fn read_at(&self, buf: &mut [u8], off: u64) -> anyhow::Result<usize> {
        let used = self.used_size();
        if off >= used {
            return Ok(0);
        }
        let len = (buf.len() as u64).min(used - off) as usize;
        self.file
            .read_exact_at(&mut buf[..len], self.file_off + off)?;
        Ok(len)
    }

    /// Writes at most `PAGE_SIZE - off` bytes starting at the intra-page
    /// offset `off` and extends `used_size` to cover the written region.
    pub(crate) fn write_at(&self, buf: &[u8], off: u64) -> anyhow::Result<usize> {
        assert!(off < PAGE_SIZE, "write offset {off} is beyond the page");
        let len = (buf.len() as u64).min(PAGE_SIZE - off) as usize;
        self.file.write_all_at(&buf[..len], self.file_off + off)?;
        let end = off + len as u64;
        if end > self.used_size() {
            self.set_used_size(end);
        }
        Ok(len)
    }
}

impl std::fmt::Debug for PhysicalPage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhysicalPage")
            .field("file_off", &self.file_off)
            .field("used_size", &self.used_size())
            .finish()
    }
}
