use core::convert::TryFrom;

use super::ResourceLocation;

impl ResourceLocation {
    /// Borrow the CPU-mapped memory of this allocation as a [`presser::Slab`], which you can then
    /// use to safely copy data into the raw, potentially-uninitialized buffer.
    ///
    /// Returns [`None`] if the allocation isn't CPU-visible, or if `self.size()` is > `isize::MAX`
    /// because this could lead to undefined behavior.
    ///
    /// # Example
    ///
    /// ```rust,ignore
    /// #[repr(C, align(16))]
    /// #[derive(Clone, Copy)]
    /// struct Constants {
    ///     view_projection: [f32; 16],
    /// }
    ///
    /// let mut slab = location.as_mapped_slab().unwrap();
    /// presser::copy_to_offset_with_align(&constants, &mut slab, 0, 256)?;
    /// ```
    ///
    /// # Safety
    ///
    /// This is technically not fully safe because we can't validate that the device is not
    /// using the data while `self` is borrowed. Allocations are only recycled after their
    /// fence completed, but writing to memory of a submission that is still in flight is on the
    /// caller.
    pub fn as_mapped_slab(&mut self) -> Option<MappedAllocationSlab<'_>> {
        let mapped_ptr = self.mapped_ptr()?.as_ptr();
        // size > isize::MAX is disallowed by `Slab` for safety reasons
        let size = isize::try_from(self.size()).ok()?;
        // this will always succeed since size can only be positive and < isize::MAX
        let size = size as usize;

        Some(MappedAllocationSlab {
            _borrowed_location: self,
            mapped_ptr,
            size,
        })
    }
}

/// A wrapper struct over a borrowed [`ResourceLocation`] that implements [`presser::Slab`].
///
/// This type should be acquired by calling [`ResourceLocation::as_mapped_slab`].
pub struct MappedAllocationSlab<'a> {
    _borrowed_location: &'a mut ResourceLocation,
    mapped_ptr: *mut u8,
    size: usize,
}

// SAFETY: See the safety comment of ResourceLocation::as_mapped_slab above.
unsafe impl<'a> presser::Slab for MappedAllocationSlab<'a> {
    fn base_ptr(&self) -> *const u8 {
        self.mapped_ptr
    }

    fn base_ptr_mut(&mut self) -> *mut u8 {
        self.mapped_ptr
    }

    fn size(&self) -> usize {
        self.size
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::backend::{DeviceBackend, HostBackend, ResourceDesc};
    use crate::resource::{ResourceHolder, ResourceLocation, ResourceStateMode};
    use crate::HeapKind;

    #[test]
    fn copies_land_in_mapped_memory() {
        let backend = HostBackend::new();
        let desc = ResourceDesc::buffer("upload", 256);
        let resource = backend
            .create_standalone_resource(HeapKind::CpuToGpu, &desc)
            .unwrap();
        let holder = Arc::new(ResourceHolder::new(
            resource,
            None,
            HeapKind::CpuToGpu,
            &desc,
            ResourceStateMode::SingleState,
        ));

        let mut location = ResourceLocation::new();
        location.init_fast_allocation(holder, 64, 64);

        let data = [1.0f32, 2.0, 3.0, 4.0];
        let mut slab = location.as_mapped_slab().unwrap();
        let record = presser::copy_from_slice_to_offset(&data, &mut slab, 0).unwrap();
        assert_eq!(record.copy_start_offset, 0);

        let ptr = location.mapped_ptr().unwrap().as_ptr() as *const f32;
        let written = unsafe { std::slice::from_raw_parts(ptr, 4) };
        assert_eq!(written, &data);
    }

    #[test]
    fn empty_location_has_no_slab() {
        let mut location = ResourceLocation::new();
        assert!(location.as_mapped_slab().is_none());
    }
}
