//! # Type-Erased Trait Storage
//!
//! This module provides the column container used by chunks, plus a boxed
//! single-value holder used by records and deferred entries.
//!
//! ## Purpose
//! A chunk cannot name the Rust types of its columns, so each column is a
//! [`ScriptStructArray`]: a vector of equally sized elements manipulated
//! through the [`TraitOps`] function table stored in the trait registry.
//!
//! ## Design
//! Elements live in fixed-size pages:
//!
//! ```text
//! pages[0] -> [e0 e1 ... e(P-1)]
//! pages[1] -> [eP ...         ]
//! ```
//!
//! Each page is one contiguous allocation of `page_capacity` elements, and a
//! page never moves once allocated. Appending rows while a chunk is being
//! iterated therefore never invalidates the element addresses an iterator has
//! handed to user code.
//!
//! Growth allocates whole pages, geometrically (capacity grows by half of
//! itself, rounded up to pages). Shrinking uses hysteresis: pages are only
//! released once the unused tail exceeds both two pages and the live count,
//! so push/pop cycles around a page boundary do not thrash the allocator.
//!
//! ## Invariants
//! - `len <= capacity`.
//! - Elements `[0, len)` are initialised; `[len, capacity)` is raw memory.
//! - The element type is fixed at construction.
//!
//! ## Safety
//! Raw element pointers stay valid until the element is removed, swapped, or
//! the array is reset or dropped. Callers that keep pointers across other
//! engine calls rely on the chunk lock discipline that forbids reordering
//! rows while a chunk is locked.

use std::alloc::{alloc, dealloc, Layout};
use std::ptr::{self, NonNull};

use crate::engine::error::{ApparatusError, ApparatusResult};
use crate::engine::registry::{trait_info, Trait, TraitInfo};


/// Default number of bytes a storage page aims for.
pub const DEFAULT_PAGE_BYTES: usize = 16 * 1024;

/// Computes the page capacity in elements for an element size and byte target.
#[inline]
pub fn page_capacity_for(element_size: usize, page_bytes: usize) -> usize {
    if element_size == 0 {
        return usize::MAX;
    }
    (page_bytes / element_size).max(16)
}

/// Type-erased, paged vector of trait values.
pub struct ScriptStructArray {
    info: &'static TraitInfo,
    page_capacity: usize,
    pages: Vec<NonNull<u8>>,
    len: usize,
}

// Elements are `Send + Sync` by the `Trait` bound; pages are owned exclusively.
unsafe impl Send for ScriptStructArray {}
unsafe impl Sync for ScriptStructArray {}

impl ScriptStructArray {
    /// Creates an empty array for the trait type described by `info`.
    pub fn new(info: &'static TraitInfo, page_bytes: usize) -> Self {
        Self {
            info,
            page_capacity: page_capacity_for(info.ops().size, page_bytes),
            pages: Vec::new(),
            len: 0,
        }
    }

    /// Creates an empty array for `T`.
    pub fn of<T: Trait>() -> Self {
        Self::new(trait_info::<T>(), DEFAULT_PAGE_BYTES)
    }

    /// Creates an array with room for `capacity` elements.
    pub fn with_capacity(info: &'static TraitInfo, page_bytes: usize, capacity: usize) -> ApparatusResult<Self> {
        let mut array = Self::new(info, page_bytes);
        array.reserve(capacity)?;
        Ok(array)
    }

    /// Trait entry describing the element type.
    #[inline]
    pub fn info(&self) -> &'static TraitInfo {
        self.info
    }

    /// Element size in bytes.
    #[inline]
    pub fn element_size(&self) -> usize {
        self.info.ops().size
    }

    /// Elements per page.
    #[inline]
    pub fn page_capacity(&self) -> usize {
        self.page_capacity
    }

    /// Number of initialised elements.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// `true` if no element is initialised.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of elements the allocated pages can hold.
    #[inline]
    pub fn capacity(&self) -> usize {
        if self.is_zst() {
            usize::MAX
        } else {
            self.pages.len() * self.page_capacity
        }
    }

    #[inline]
    fn is_zst(&self) -> bool {
        self.info.ops().size == 0
    }

    #[inline]
    fn page_layout(&self) -> Layout {
        let ops = self.info.ops();
        // Size and alignment come from a real Rust type, so the layout is valid.
        Layout::from_size_align(ops.size * self.page_capacity, ops.align)
            .unwrap_or_else(|_| Layout::new::<u8>())
    }

    /// Address of element `index`, which must be `< capacity`.
    #[inline]
    pub fn ptr_at(&self, index: usize) -> *mut u8 {
        if self.is_zst() {
            return self.info.ops().align as *mut u8;
        }
        debug_assert!(index < self.capacity());
        let page = self.pages[index / self.page_capacity];
        // SAFETY: the offset stays inside the page allocation.
        unsafe { page.as_ptr().add((index % self.page_capacity) * self.info.ops().size) }
    }

    /// Address of initialised element `index`, checked.
    #[inline]
    pub fn get_ptr(&self, index: usize) -> ApparatusResult<*mut u8> {
        if index >= self.len {
            return Err(ApparatusError::OutOfRange { index, len: self.len }.surfaced());
        }
        Ok(self.ptr_at(index))
    }

    /// Ensures room for at least `capacity` elements.
    pub fn reserve(&mut self, capacity: usize) -> ApparatusResult<()> {
        if self.is_zst() {
            return Ok(());
        }
        let layout = self.page_layout();
        while self.capacity() < capacity {
            // SAFETY: the layout has non-zero size for non-zero-sized elements.
            let raw = unsafe { alloc(layout) };
            let page = NonNull::new(raw).ok_or_else(|| ApparatusError::NoMemory { bytes: layout.size() }.surfaced())?;
            self.pages.push(page);
        }
        Ok(())
    }

    fn grow_for(&mut self, required: usize) -> ApparatusResult<()> {
        if required <= self.capacity() {
            return Ok(());
        }
        let target = required + required / 2;
        self.reserve(target.max(self.page_capacity))
    }

    fn shrink_with_hysteresis(&mut self) {
        if self.is_zst() {
            return;
        }
        let spare = self.capacity() - self.len;
        if spare <= 2 * self.page_capacity || spare <= self.len {
            return;
        }
        let keep = (self.len + self.len / 4).div_ceil(self.page_capacity).max(1);
        let layout = self.page_layout();
        while self.pages.len() > keep {
            if let Some(page) = self.pages.pop() {
                // SAFETY: the page was allocated with this layout and holds no live elements.
                unsafe { dealloc(page.as_ptr(), layout) };
            }
        }
    }

    /// Appends a default-constructed element and returns its index.
    pub fn push_default(&mut self) -> ApparatusResult<usize> {
        self.grow_for(self.len + 1)?;
        let index = self.len;
        // SAFETY: slot `index` is raw memory inside the allocation.
        unsafe { (self.info.ops().default_in_place)(self.ptr_at(index)) };
        self.len += 1;
        Ok(index)
    }

    /// Appends a clone of the element at `src` and returns its index.
    ///
    /// # Safety
    /// `src` must point at an initialised value of this array's element type.
    pub unsafe fn push_clone_from(&mut self, src: *const u8) -> ApparatusResult<usize> {
        self.grow_for(self.len + 1)?;
        let index = self.len;
        unsafe { (self.info.ops().clone_into_uninit)(src, self.ptr_at(index)) };
        self.len += 1;
        Ok(index)
    }

    /// Drops the last `count` elements.
    pub fn pop(&mut self, count: usize) -> ApparatusResult<()> {
        if count > self.len {
            return Err(ApparatusError::OutOfRange { index: count, len: self.len }.surfaced());
        }
        for _ in 0..count {
            self.len -= 1;
            self.drop_at(self.len);
        }
        self.shrink_with_hysteresis();
        Ok(())
    }

    /// Drops every element and reallocates room for `capacity` elements.
    pub fn reset(&mut self, capacity: usize) -> ApparatusResult<()> {
        self.clear_all();
        self.release_pages();
        self.reserve(capacity)
    }

    /// Drops every element, keeping the allocation.
    pub fn clear_all(&mut self) {
        while self.len > 0 {
            self.len -= 1;
            self.drop_at(self.len);
        }
    }

    fn release_pages(&mut self) {
        if self.is_zst() {
            return;
        }
        let layout = self.page_layout();
        for page in self.pages.drain(..) {
            // SAFETY: every page was allocated with `layout`.
            unsafe { dealloc(page.as_ptr(), layout) };
        }
    }

    #[inline]
    fn drop_at(&mut self, index: usize) {
        if let Some(drop_fn) = self.info.ops().drop_in_place {
            // SAFETY: `index` held an initialised element that is now being retired.
            unsafe { drop_fn(self.ptr_at(index)) };
        }
    }

    /// Copies the value at `src` into element `index`.
    ///
    /// `destination_initialized` selects between clone-assign (`true`, the
    /// element is live) and clone-construct (`false`, the slot is raw).
    ///
    /// # Safety
    /// `src` must point at an initialised value of the element type, and
    /// `index` must be `< len` when `destination_initialized` is `true`, or
    /// a raw slot below capacity otherwise.
    pub unsafe fn copy_from_raw(&mut self, index: usize, src: *const u8, destination_initialized: bool) {
        let dst = self.ptr_at(index);
        let ops = self.info.ops();
        unsafe {
            if destination_initialized {
                (ops.clone_assign)(src, dst);
            } else {
                (ops.clone_into_uninit)(src, dst);
            }
        }
    }

    /// Copies element `index` out to `dst`.
    ///
    /// # Safety
    /// `dst` must point at memory for one element of this type, initialised
    /// when `destination_initialized` is `true`.
    pub unsafe fn copy_to_raw(&self, index: usize, dst: *mut u8, destination_initialized: bool) -> ApparatusResult<()> {
        let src = self.get_ptr(index)?;
        let ops = self.info.ops();
        unsafe {
            if destination_initialized {
                (ops.clone_assign)(src, dst);
            } else {
                (ops.clone_into_uninit)(src, dst);
            }
        }
        Ok(())
    }

    /// Swaps two elements.
    pub fn swap(&mut self, a: usize, b: usize) -> ApparatusResult<()> {
        let pa = self.get_ptr(a)?;
        let pb = self.get_ptr(b)?;
        if a != b {
            // SAFETY: distinct indices address non-overlapping elements.
            unsafe { ptr::swap_nonoverlapping(pa, pb, self.element_size()) };
        }
        Ok(())
    }

    /// Swaps element `index` with element `other_index` of another array of the same type.
    pub fn swap_across(&mut self, index: usize, other: &mut ScriptStructArray, other_index: usize) -> ApparatusResult<()> {
        if !std::ptr::eq(self.info, other.info) {
            return Err(ApparatusError::WrongType { expected: self.info.name(), actual: other.info.name() }.surfaced());
        }
        let pa = self.get_ptr(index)?;
        let pb = other.get_ptr(other_index)?;
        // SAFETY: distinct arrays own disjoint pages.
        unsafe { ptr::swap_nonoverlapping(pa, pb, self.element_size()) };
        Ok(())
    }

    /// Overwrites element `dst` with a clone of element `src`.
    pub fn clone_row(&mut self, dst: usize, src: usize) -> ApparatusResult<()> {
        let from = self.get_ptr(src)?;
        let to = self.get_ptr(dst)?;
        if dst != src {
            // SAFETY: both elements are initialised and distinct.
            unsafe { (self.info.ops().clone_assign)(from, to) };
        }
        Ok(())
    }

    /// Resets element `index` to the default value.
    pub fn clear_row(&mut self, index: usize) -> ApparatusResult<()> {
        let at = self.get_ptr(index)?;
        // SAFETY: the element is initialised.
        unsafe { (self.info.ops().assign_default)(at) };
        Ok(())
    }

    /// Drops element `index` and moves the last element into its place.
    pub fn swap_remove(&mut self, index: usize) -> ApparatusResult<()> {
        let at = self.get_ptr(index)?;
        self.drop_at(index);
        let last = self.len - 1;
        if index != last {
            // SAFETY: `last` is initialised and its bits are moved, not duplicated.
            unsafe { ptr::copy_nonoverlapping(self.ptr_at(last), at, self.element_size()) };
        }
        self.len = last;
        Ok(())
    }

    /// Typed shared access.
    #[inline]
    pub fn get<T: Trait>(&self, index: usize) -> ApparatusResult<&T> {
        self.info.expect_type::<T>()?;
        let at = self.get_ptr(index)?;
        // SAFETY: type checked above, element initialised.
        Ok(unsafe { &*at.cast::<T>() })
    }

    /// Typed exclusive access.
    #[inline]
    pub fn get_mut<T: Trait>(&mut self, index: usize) -> ApparatusResult<&mut T> {
        self.info.expect_type::<T>()?;
        let at = self.get_ptr(index)?;
        // SAFETY: type checked above, element initialised, `&mut self` is exclusive.
        Ok(unsafe { &mut *at.cast::<T>() })
    }

    /// Typed append.
    pub fn push<T: Trait>(&mut self, value: T) -> ApparatusResult<usize> {
        self.info.expect_type::<T>()?;
        self.grow_for(self.len + 1)?;
        let index = self.len;
        // SAFETY: raw slot inside the allocation, type checked.
        unsafe { self.ptr_at(index).cast::<T>().write(value) };
        self.len += 1;
        Ok(index)
    }
}

impl Drop for ScriptStructArray {
    fn drop(&mut self) {
        self.clear_all();
        self.release_pages();
    }
}

impl std::fmt::Debug for ScriptStructArray {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptStructArray")
            .field("type", &self.info.name())
            .field("len", &self.len)
            .field("capacity", &self.capacity())
            .finish()
    }
}


/// A single owned trait value of a type known only through the registry.
pub struct TraitValue {
    info: &'static TraitInfo,
    ptr: NonNull<u8>,
}

unsafe impl Send for TraitValue {}
unsafe impl Sync for TraitValue {}

impl TraitValue {
    fn layout(info: &'static TraitInfo) -> Layout {
        let ops = info.ops();
        Layout::from_size_align(ops.size, ops.align).unwrap_or_else(|_| Layout::new::<u8>())
    }

    fn allocate(info: &'static TraitInfo) -> ApparatusResult<NonNull<u8>> {
        if info.ops().size == 0 {
            return NonNull::new(info.ops().align as *mut u8)
                .ok_or(ApparatusError::SanityCheckFailed("zero alignment".into()));
        }
        let layout = Self::layout(info);
        // SAFETY: non-zero size.
        let raw = unsafe { alloc(layout) };
        NonNull::new(raw).ok_or_else(|| ApparatusError::NoMemory { bytes: layout.size() }.surfaced())
    }

    /// Boxes a typed value.
    pub fn new<T: Trait>(value: T) -> Self {
        let info = trait_info::<T>();
        let ptr = match Self::allocate(info) {
            Ok(ptr) => ptr,
            Err(_) => std::alloc::handle_alloc_error(Self::layout(info)),
        };
        // SAFETY: fresh allocation sized and aligned for `T`.
        unsafe { ptr.as_ptr().cast::<T>().write(value) };
        Self { info, ptr }
    }

    /// Boxes the default value of a registered type.
    pub fn default_of(info: &'static TraitInfo) -> ApparatusResult<Self> {
        let ptr = Self::allocate(info)?;
        // SAFETY: fresh allocation sized and aligned for the type.
        unsafe { (info.ops().default_in_place)(ptr.as_ptr()) };
        Ok(Self { info, ptr })
    }

    /// Boxes a clone of the value at `src`.
    ///
    /// # Safety
    /// `src` must point at an initialised value of the type described by `info`.
    pub unsafe fn clone_from_raw(info: &'static TraitInfo, src: *const u8) -> ApparatusResult<Self> {
        let ptr = Self::allocate(info)?;
        unsafe { (info.ops().clone_into_uninit)(src, ptr.as_ptr()) };
        Ok(Self { info, ptr })
    }

    /// Decodes a value from a record payload.
    pub fn decode(info: &'static TraitInfo, bytes: &[u8]) -> ApparatusResult<Self> {
        let codec = info.codec().ok_or_else(|| {
            ApparatusError::UnsupportedOperation(format!("trait `{}` has no payload codec", info.name()))
        })?;
        let ptr = Self::allocate(info)?;
        // SAFETY: raw memory sized and aligned for the type.
        match unsafe { (codec.decode)(bytes, ptr.as_ptr()) } {
            Ok(()) => Ok(Self { info, ptr }),
            Err(error) => {
                if info.ops().size != 0 {
                    // SAFETY: allocated above with this layout; nothing was written.
                    unsafe { dealloc(ptr.as_ptr(), Self::layout(info)) };
                }
                Err(error)
            }
        }
    }

    /// Encodes the value as a record payload.
    pub fn encode(&self) -> ApparatusResult<Vec<u8>> {
        let codec = self.info.codec().ok_or_else(|| {
            ApparatusError::UnsupportedOperation(format!("trait `{}` has no payload codec", self.info.name()))
        })?;
        // SAFETY: the value is initialised and of the codec's type.
        unsafe { (codec.encode)(self.ptr.as_ptr()) }
    }

    /// Trait entry of the held value.
    #[inline]
    pub fn info(&self) -> &'static TraitInfo {
        self.info
    }

    /// Raw pointer to the held value.
    #[inline]
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    /// Typed shared access.
    pub fn downcast_ref<T: Trait>(&self) -> ApparatusResult<&T> {
        self.info.expect_type::<T>()?;
        // SAFETY: type checked.
        Ok(unsafe { &*self.ptr.as_ptr().cast::<T>() })
    }

    /// Typed exclusive access.
    pub fn downcast_mut<T: Trait>(&mut self) -> ApparatusResult<&mut T> {
        self.info.expect_type::<T>()?;
        // SAFETY: type checked.
        Ok(unsafe { &mut *self.ptr.as_ptr().cast::<T>() })
    }

    /// Clone of the held value as `T`.
    pub fn get<T: Trait>(&self) -> ApparatusResult<T> {
        self.downcast_ref::<T>().cloned()
    }
}

impl Clone for TraitValue {
    fn clone(&self) -> Self {
        let ptr = match Self::allocate(self.info) {
            Ok(ptr) => ptr,
            Err(_) => std::alloc::handle_alloc_error(Self::layout(self.info)),
        };
        // SAFETY: fresh allocation; source initialised.
        unsafe { (self.info.ops().clone_into_uninit)(self.ptr.as_ptr(), ptr.as_ptr()) };
        Self { info: self.info, ptr }
    }
}

impl Drop for TraitValue {
    fn drop(&mut self) {
        if let Some(drop_fn) = self.info.ops().drop_in_place {
            // SAFETY: the value is initialised and dropped exactly once.
            unsafe { drop_fn(self.ptr.as_ptr()) };
        }
        if self.info.ops().size != 0 {
            // SAFETY: allocated with this layout.
            unsafe { dealloc(self.ptr.as_ptr(), Self::layout(self.info)) };
        }
    }
}

impl std::fmt::Debug for TraitValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TraitValue<{}>", self.info.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Clone, Debug, Default, PartialEq)]
    struct Named(String);

    #[derive(Clone, Default)]
    struct Counted(Option<Arc<AtomicUsize>>);

    impl Drop for Counted {
        fn drop(&mut self) {
            if let Some(counter) = &self.0 {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    #[test]
    fn push_default_initialises_and_tracks_length() {
        let mut array = ScriptStructArray::of::<Named>();
        assert_eq!(array.push_default().unwrap(), 0);
        assert_eq!(array.push(Named("b".into())).unwrap(), 1);
        assert_eq!(array.len(), 2);
        assert!(array.capacity() >= 2);
        assert_eq!(array.get::<Named>(0).unwrap(), &Named::default());
        assert_eq!(array.get::<Named>(1).unwrap().0, "b");
        assert_eq!(array.get::<u64>(1).unwrap_err().status(), crate::engine::error::Status::WrongType);
    }

    #[test]
    fn pages_keep_addresses_stable_while_growing() {
        let mut array = ScriptStructArray::new(trait_info::<u64>(), 128);
        array.push(7u64).unwrap();
        let first = array.ptr_at(0);
        for i in 0..10_000u64 {
            array.push(i).unwrap();
        }
        assert_eq!(first, array.ptr_at(0));
        assert_eq!(*array.get::<u64>(0).unwrap(), 7);
    }

    #[test]
    fn swap_remove_moves_last_into_hole() {
        let mut array = ScriptStructArray::of::<Named>();
        for name in ["a", "b", "c"] {
            array.push(Named(name.into())).unwrap();
        }
        array.swap_remove(0).unwrap();
        assert_eq!(array.len(), 2);
        assert_eq!(array.get::<Named>(0).unwrap().0, "c");
        assert_eq!(array.get::<Named>(1).unwrap().0, "b");
    }

    #[test]
    fn row_helpers_clone_clear_and_swap() {
        let mut array = ScriptStructArray::of::<Named>();
        array.push(Named("x".into())).unwrap();
        array.push(Named("y".into())).unwrap();
        array.swap(0, 1).unwrap();
        assert_eq!(array.get::<Named>(0).unwrap().0, "y");
        array.clone_row(1, 0).unwrap();
        assert_eq!(array.get::<Named>(1).unwrap().0, "y");
        array.clear_row(0).unwrap();
        assert_eq!(array.get::<Named>(0).unwrap(), &Named::default());
    }

    #[test]
    fn drops_run_exactly_once() {
        let counter = Arc::new(AtomicUsize::new(0));
        {
            let mut array = ScriptStructArray::of::<Counted>();
            for _ in 0..5 {
                array.push(Counted(Some(counter.clone()))).unwrap();
            }
            array.pop(2).unwrap();
            assert_eq!(counter.load(Ordering::SeqCst), 2);
            array.swap_remove(0).unwrap();
            assert_eq!(counter.load(Ordering::SeqCst), 3);
        }
        assert_eq!(counter.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn reset_empties_and_reserves() {
        let mut array = ScriptStructArray::of::<u32>();
        array.push(1u32).unwrap();
        array.reset(100).unwrap();
        assert!(array.is_empty());
        assert!(array.capacity() >= 100);
        assert_eq!(array.pop(1).unwrap_err().status(), crate::engine::error::Status::OutOfRange);
    }

    #[test]
    fn trait_value_clones_and_downcasts() {
        let value = TraitValue::new(Named("v".into()));
        let copy = value.clone();
        assert_eq!(copy.get::<Named>().unwrap().0, "v");
        assert!(copy.downcast_ref::<u8>().is_err());
    }
}
