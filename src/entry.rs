use crate::id::Identifier;
use crate::manager::{Allocator, ManagedAlloc, PageManager};
use crate::page::PAGE_SIZE;
use crate::tiered::{EntryPage, TieredPage};
use anyhow::anyhow;
use std::io::SeekFrom;
use std::sync::Arc;

/// A random-access cursor over one entry. An entry behaves like a file:
/// reads and writes move the cursor, `read_at`/`write_at` address a byte
/// offset directly, and `truncate` shrinks the entry and recycles its pages.
///
/// Cursors of the same entry share the underlying page tree but each carries
/// its own position, so a cursor must not be shared across threads; open the
/// entry once per thread instead.
pub struct Entry<'m> {
    pm: &'m PageManager,
    ep: Arc<EntryPage>,
    id: Identifier,
    cursor_page: u64,
    cursor_off: u64,
}

/// Computes the cursor position `delta` bytes away from `(page, off)`. A
/// position at or past the end of the last page clamps to the EOF sentinel
/// `(pages_len, 0)`.
fn advance(pages_len: u64, page: u64, off: u64, delta: i64) -> anyhow::Result<(u64, u64)> {
    let pos = (page * PAGE_SIZE + off) as i64 + delta;
    if pos < 0 {
        return Err(anyhow!("cannot seek before the start of the entry"));
    }
    let mut page = pos as u64 / PAGE_SIZE;
    let mut off = pos as u64 % PAGE_SIZE;
    if page >= pages_len {
        page = pages_len;
        off = 0;
    }
    Ok((page, off))
}

fn read_locked(
    state: &TieredPage,
    mut page: u64,
    mut off: u64,
    buf: &mut [u8],
) -> anyhow::Result<(usize, u64, u64)> {
    let pages_len = state.pages.len() as u64;
    let mut copied = 0;
    while copied < buf.len() && page < pages_len {
        let n = state.pages[page as usize].read_at(&mut buf[copied..], off)?;
        if n == 0 {
            // The cursor sits at the end of the used region of the last page.
            break;
        }
        copied += n;
        (page, off) = advance(pages_len, page, off, n as i64)?;
    }
    Ok((copied, page, off))
}

impl<'m> Entry<'m> {
    pub(crate) fn new(pm: &'m PageManager, ep: Arc<EntryPage>, id: Identifier) -> Self {
        Self {
            pm,
            ep,
            id,
            cursor_page: 0,
            cursor_off: 0,
        }
    }

    /// The identifier under which this entry can be reopened.
    pub fn id(&self) -> Identifier {
        self.id
    }

    /// Current size of the entry in bytes.
    pub fn size(&self) -> u64 {
        self.ep.state.read().used_size
    }

    /// Reads up to `buf.len()` bytes at the cursor and advances it. Returns
    /// the number of bytes read; zero means end of entry.
    pub fn read(&mut self, buf: &mut [u8]) -> anyhow::Result<usize> {
        let state = self.ep.state.read();
        let (n, page, off) = read_locked(&state, self.cursor_page, self.cursor_off, buf)?;
        drop(state);
        self.cursor_page = page;
        self.cursor_off = off;
        Ok(n)
    }

    /// Reads up to `buf.len()` bytes at the byte offset `off` without moving
    /// the cursor.
    pub fn read_at(&self, buf: &mut [u8], off: u64) -> anyhow::Result<usize> {
        let delta = checked_delta(off)?;
        let state = self.ep.state.read();
        let (page, page_off) = advance(state.pages.len() as u64, 0, 0, delta)?;
        let (n, _, _) = read_locked(&state, page, page_off, buf)?;
        Ok(n)
    }

    /// Writes all of `buf` at the cursor and advances it past the written
    /// region.
    pub fn write(&mut self, buf: &[u8]) -> anyhow::Result<usize> {
        let (page, off) = self.write_inner(buf, self.cursor_page, self.cursor_off)?;
        self.cursor_page = page;
        self.cursor_off = off;
        Ok(buf.len())
    }

    /// Writes all of `buf` at the byte offset `off` without moving the
    /// cursor. An offset past the end of the entry clamps to the end.
    pub fn write_at(&self, buf: &[u8], off: u64) -> anyhow::Result<usize> {
        let delta = checked_delta(off)?;
        let (page, page_off) = {
            let state = self.ep.state.read();
            advance(state.pages.len() as u64, 0, 0, delta)?
        };
        self.write_inner(buf, page, page_off)?;
        Ok(buf.len())
    }

    /// Two-phase write: overwrites of existing bytes run under the shared
    /// lock; a write that would extend the entry drops the shared lock and
    /// replays from the start position under the exclusive lock, so the
    /// caller observes one atomic write either way.
    fn write_inner(&self, buf: &[u8], page: u64, off: u64) -> anyhow::Result<(u64, u64)> {
        if buf.is_empty() {
            return Ok((page, off));
        }

        {
            let state = self.ep.state.read();
            if let Some(cursor) = try_overwrite(&state, page, off, buf)? {
                return Ok(cursor);
            }
        }

        let mut state = self.ep.state.write();
        self.append_write(&mut state, page, off, buf)
    }

    fn append_write(
        &self,
        state: &mut TieredPage,
        page: u64,
        off: u64,
        buf: &[u8],
    ) -> anyhow::Result<(u64, u64)> {
        // Another cursor may have changed the entry between the locks; a
        // position past the current end lands at the end.
        let (mut page, mut off) = advance(state.pages.len() as u64, page, off, 0)?;

        let mut alloc = ManagedAlloc::new(self.pm);
        let mut added = Vec::new();
        let mut byte_increase = 0u64;
        let mut written = 0;
        while written < buf.len() {
            if page as usize >= state.pages.len() {
                let new_page = alloc.allocate_page()?;
                log::trace!(
                    "entry {:?} takes page at {}",
                    self.id,
                    new_page.file_off(),
                );
                state.pages.push(new_page.clone());
                added.push(new_page);
                continue;
            }

            let target = state.pages[page as usize].clone();
            let before = target.used_size();
            let n = target.write_at(&buf[written..], off)?;
            byte_increase += target.used_size() - before;
            written += n;
            (page, off) = advance(state.pages.len() as u64, page, off, n as i64)?;
        }

        EntryPage::add_pages(state, &added, byte_increase, &mut alloc)?;
        Ok((page, off))
    }

    /// Moves the cursor and returns the absolute byte offset. Seeking past
    /// the end clamps to the end; seeking before the start is an error.
    pub fn seek(&mut self, pos: SeekFrom) -> anyhow::Result<u64> {
        let state = self.ep.state.read();
        let pages_len = state.pages.len() as u64;
        drop(state);

        let (base_page, base_off, delta) = match pos {
            SeekFrom::Start(n) => (0, 0, checked_delta(n)?),
            SeekFrom::Current(d) => (self.cursor_page, self.cursor_off, d),
            SeekFrom::End(d) => (pages_len, 0, d),
        };
        let (page, off) = advance(pages_len, base_page, base_off, delta)?;
        self.cursor_page = page;
        self.cursor_off = off;
        Ok(page * PAGE_SIZE + off)
    }

    /// Shrinks the entry to at most `size` bytes and hands the freed pages
    /// to the recycler.
    pub fn truncate(&self, size: u64) -> anyhow::Result<()> {
        let mut state = self.ep.state.write();
        log::debug!(
            "truncate entry {:?} from {} to {size} bytes",
            self.id,
            state.used_size,
        );

        let mut freed = state.recursive_truncate(size)?;
        freed.extend(state.defrag()?);
        self.pm.free_pages(freed)
    }

    /// Flushes the backing file.
    pub fn sync(&self) -> anyhow::Result<()> {
        self.pm.sync_file()
    }
}

fn checked_delta(off: u64) -> anyhow::Result<i64> {
    i64::try_from(off).map_err(|_| anyhow!("offset {off} is out of range"))
}

fn try_overwrite(
    state: &TieredPage,
    page: u64,
    off: u64,
    buf: &[u8],
) -> anyhow::Result<Option<(u64, u64)>> {
    let end = page * PAGE_SIZE + off + buf.len() as u64;
    if end > state.used_size {
        return Ok(None);
    }

    // The write stays inside existing bytes: no page allocation, no
    // used_size change, safe under the shared lock.
    let pages_len = state.pages.len() as u64;
    let (mut page, mut off) = (page, off);
    let mut written = 0;
    while written < buf.len() {
        let n = state.pages[page as usize].write_at(&buf[written..], off)?;
        written += n;
        (page, off) = advance(pages_len, page, off, n as i64)?;
    }
    Ok(Some((page, off)))
}

impl Drop for Entry<'_> {
    fn drop(&mut self) {
        self.pm.close_entry(self.id, &self.ep);
    }
}

impl std::io::Read for Entry<'_> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        Entry::read(self, buf).map_err(std::io::Error::other)
    }
}

impl std::io::Write for Entry<'_> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        Entry::write(self, buf).map_err(std::io::Error::other)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.sync().map_err(std::io::Error::other)
    }
}

impl std::io::Seek for Entry<'_> {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        Entry::seek(self, pos).map_err(std::io::Error::other)
    }
}
