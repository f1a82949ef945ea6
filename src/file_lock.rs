use anyhow::anyhow;
use std::fs::File;
use syscalls::{syscall2, Sysno};

#[cfg(unix)]
use std::os::unix::io::AsRawFd;

/// Takes an exclusive advisory lock on `f` for the lifetime of the process.
/// Opening the same store from two processes corrupts the page trees, so the
/// second open must fail instead.
#[cfg(unix)]
pub(crate) fn lock_exclusive(f: &File) -> anyhow::Result<()> {
    const LOCK_EX: usize = 0x2;
    const LOCK_NB: usize = 0x4;
    let fd = f.as_raw_fd();
    let result = unsafe { syscall2(Sysno::flock, fd as usize, LOCK_EX | LOCK_NB) };
    if let Err(err) = result {
        Err(anyhow!("cannot lock store file fd={fd} errno={err}"))
    } else {
        Ok(())
    }
}
