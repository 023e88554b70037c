/// `alignment` must be a power of two.
pub(crate) fn align_down(val: u64, alignment: u64) -> u64 {
    val & !(alignment - 1)
}

/// `alignment` must be a power of two.
pub(crate) fn align_up(val: u64, alignment: u64) -> u64 {
    align_down(val + alignment - 1, alignment)
}

pub(crate) fn is_aligned(val: u64, alignment: u64) -> bool {
    val & (alignment - 1) == 0
}
