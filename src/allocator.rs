//! The allocate/free pair behind every [`Shared`][crate::Shared] allocation.
//!
//! `core::alloc::Allocator` is still unstable, so this crate defines the
//! smallest trait it needs. With the nightly-only `allocator_api` feature the
//! standard [`alloc::alloc::Global`] implements it as well.
use core::{alloc::Layout, ptr::NonNull};

/// Returned when an [`Allocator`] has no memory for the requested layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("memory allocation failed")]
pub struct AllocError;

/// A byte-granular allocator.
///
/// The allocator is moved into the allocation it creates and used from
/// whichever thread drops the last reference, so `Shared::try_new_in`
/// additionally requires it to be `Send + Sync + 'static`.
///
/// # Safety
///
/// `allocate` must return memory valid for `layout` until it is passed back to
/// `deallocate`, and `deallocate` must accept any pointer `allocate` returned
/// with the same layout, including after the allocator value was moved.
pub unsafe trait Allocator {
    fn allocate(&self, layout: Layout) -> Result<NonNull<u8>, AllocError>;

    /// # Safety
    ///
    /// `ptr` must come from `allocate` on this allocator with `layout`, and
    /// must not be used afterwards.
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout);
}

/// The global heap.
#[derive(Debug, Default, Clone, Copy)]
pub struct Global;

unsafe impl Allocator for Global {
    fn allocate(&self, layout: Layout) -> Result<NonNull<u8>, AllocError> {
        debug_assert!(layout.size() != 0);
        // Safety: every layout this crate asks for contains a header, so it is
        // never zero-sized.
        NonNull::new(unsafe { alloc::alloc::alloc(layout) }).ok_or(AllocError)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        unsafe { alloc::alloc::dealloc(ptr.as_ptr(), layout) }
    }
}

unsafe impl<A: Allocator + ?Sized> Allocator for &A {
    fn allocate(&self, layout: Layout) -> Result<NonNull<u8>, AllocError> {
        (**self).allocate(layout)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        unsafe { (**self).deallocate(ptr, layout) }
    }
}

#[cfg(feature = "allocator_api")]
unsafe impl Allocator for alloc::alloc::Global {
    fn allocate(&self, layout: Layout) -> Result<NonNull<u8>, AllocError> {
        core::alloc::Allocator::allocate(self, layout)
            .map(NonNull::cast)
            .map_err(|_| AllocError)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        unsafe { core::alloc::Allocator::deallocate(self, ptr, layout) }
    }
}
