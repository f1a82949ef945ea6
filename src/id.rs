use std::num::NonZeroU64;

/// Handle to a stored entry. The identifier of an entry is the file offset of
/// its descriptor page, which is never zero since the first page of the file
/// belongs to the recycler.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Identifier(NonZeroU64);

impl Identifier {
    #[inline]
    pub(crate) fn new(off: u64) -> Option<Self> {
        NonZeroU64::new(off).map(Self)
    }

    #[inline]
    pub(crate) fn get(&self) -> u64 {
        self.0.get()
    }
}
