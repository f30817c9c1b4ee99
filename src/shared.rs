//! `Shared<T>` and `Weak<T>`, the strong and weak handles to one allocation.
//!
//! Each allocation is a single block holding a `Header` (the packed count
//! plus two type-erased destructors), the allocator that produced it, and the
//! value. Handles carry an explicit pointer to the header next to the pointer
//! to the value, so a handle can be projected onto any part of the value (a
//! field, a slice, a `dyn Trait` view) and still find its counts.
//!
//! Both handles are nullable, like C++'s `shared_ptr` and `weak_ptr`.
use alloc::alloc::handle_alloc_error;
use core::{
    alloc::Layout,
    cmp, fmt,
    hash::{Hash, Hasher},
    marker::PhantomData,
    mem::{self, ManuallyDrop, MaybeUninit},
    ops::Deref,
    ptr::{self, NonNull},
};

use crate::{
    allocator::{AllocError, Allocator, Global},
    error::Error,
    state::State,
};

// Counts and destructors for one allocation.
struct Header {
    state: State,
    drop_value: unsafe fn(NonNull<Header>),
    dealloc: unsafe fn(NonNull<Header>),
}

#[repr(C)]
struct Slot<T, A> {
    header: Header,
    alloc: ManuallyDrop<A>,
    value: MaybeUninit<T>,
}

unsafe fn drop_value<T, A>(header: NonNull<Header>) {
    let slot = header.cast::<Slot<T, A>>().as_ptr();
    unsafe { ptr::drop_in_place(ptr::addr_of_mut!((*slot).value).cast::<T>()) };
}

unsafe fn dealloc<T, A: Allocator>(header: NonNull<Header>) {
    let slot = header.cast::<Slot<T, A>>();
    // Move the allocator out first: the block it is stored in is about to go.
    let alloc =
        ManuallyDrop::into_inner(unsafe { ptr::read(ptr::addr_of!((*slot.as_ptr()).alloc)) });
    unsafe { alloc.deallocate(slot.cast(), Layout::new::<Slot<T, A>>()) };
}

/// Give up one weak unit, freeing the allocation if it was the last
/// reference of any kind.
unsafe fn release_weak(header: NonNull<Header>) {
    let h = header.as_ptr();
    if unsafe { (*h).state.weak_release() } {
        trace_event!(header = ?header, "allocation freed");
        unsafe {
            let f = (*h).dealloc;
            f(header);
        }
    }
}

// Holds the weak unit of the last strong handle while the value is dropped,
// and releases it even if the value's destructor panics.
struct DestroyGuard(NonNull<Header>);

impl Drop for DestroyGuard {
    fn drop(&mut self) {
        unsafe { release_weak(self.0) }
    }
}

// The two pointers behind a non-null handle.
struct Raw<T: ?Sized> {
    header: NonNull<Header>,
    ptr: NonNull<T>,
}

impl<T: ?Sized> Clone for Raw<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T: ?Sized> Copy for Raw<T> {}

impl<T: ?Sized> Raw<T> {
    fn state(&self) -> &State {
        // Safety: the header lives as long as the handle holding this `Raw`
        // owns a weak unit, which every non-null handle does.
        unsafe { &self.header.as_ref().state }
    }

    fn addr(self) -> *const () {
        self.ptr.as_ptr() as *const ()
    }

    /// Give up one strong unit. The last one runs the value's destructor on
    /// this thread before letting go of its weak unit.
    unsafe fn release_strong(self) {
        if !self.state().strong_release() {
            return;
        }
        // last strong handle was just dropped
        let guard = DestroyGuard(self.header);
        unsafe {
            let f = self.header.as_ref().drop_value;
            f(self.header);
        }
        trace_event!(header = ?self.header, "value destroyed");
        drop(guard);
    }
}

// The construction-time `Weak` of `Shared::new_cyclic`. Only dropped if the
// value constructor unwinds, in which case the value is never born.
struct Unborn<T>(Weak<T>);

impl<T> Drop for Unborn<T> {
    fn drop(&mut self) {
        if let Some(raw) = self.0.raw {
            raw.state().abandon();
        }
    }
}

// A block from the allocator whose value has not been written yet. Dropping it
// returns the memory, which covers a constructor that fails or panics.
struct UninitSlot<T, A: Allocator> {
    slot: NonNull<Slot<T, A>>,
}

impl<T, A: Allocator + Send + Sync + 'static> UninitSlot<T, A> {
    fn allocate(alloc: A, state: State) -> Result<Self, AllocError> {
        let slot = alloc.allocate(Layout::new::<Slot<T, A>>())?.cast::<Slot<T, A>>();
        unsafe {
            ptr::addr_of_mut!((*slot.as_ptr()).header).write(Header {
                state,
                drop_value: drop_value::<T, A>,
                dealloc: dealloc::<T, A>,
            });
            ptr::addr_of_mut!((*slot.as_ptr()).alloc).write(ManuallyDrop::new(alloc));
        }
        Ok(UninitSlot { slot })
    }
}

impl<T, A: Allocator> UninitSlot<T, A> {
    /// Hand the block over to the counts in its header. The value is still
    /// uninitialized.
    fn into_raw(self) -> Raw<T> {
        let slot = self.slot;
        mem::forget(self);
        Raw {
            header: slot.cast(),
            // Safety: in bounds of a live allocation, so not null
            ptr: unsafe {
                NonNull::new_unchecked(ptr::addr_of_mut!((*slot.as_ptr()).value).cast::<T>())
            },
        }
    }
}

impl<T, A: Allocator> Drop for UninitSlot<T, A> {
    fn drop(&mut self) {
        unsafe { dealloc::<T, A>(self.slot.cast()) }
    }
}

/// A thread-safe reference-counted pointer, the strong half of the pair.
///
/// Like `std::sync::Arc`, but the strong and weak counts live in one packed
/// 64-bit word, and the handle may be null.
pub struct Shared<T: ?Sized> {
    raw: Option<Raw<T>>,
    phantom: PhantomData<T>,
}

/// A non-owning observer of a [`Shared`] allocation.
///
/// A `Weak` keeps the memory of the allocation resident, never the value.
/// Use [`Weak::upgrade`] to get at the value if it is still alive.
pub struct Weak<T: ?Sized> {
    raw: Option<Raw<T>>,
    phantom: PhantomData<T>,
}

unsafe impl<T: ?Sized + Send + Sync> Send for Shared<T> {}
unsafe impl<T: ?Sized + Send + Sync> Sync for Shared<T> {}
unsafe impl<T: ?Sized + Send + Sync> Send for Weak<T> {}
unsafe impl<T: ?Sized + Send + Sync> Sync for Weak<T> {}

impl<T> Shared<T> {
    /// Constructs a new `Shared<T>` with the given value.
    ///
    /// # Panics
    ///
    /// Calls [`handle_alloc_error`] if the global heap is out of memory. Use
    /// [`Shared::try_new`] to handle that.
    pub fn new(value: T) -> Self {
        match Self::try_new(value) {
            Ok(s) => s,
            Err(AllocError) => handle_alloc_error(Layout::new::<Slot<T, Global>>()),
        }
    }

    pub fn try_new(value: T) -> Result<Self, AllocError> {
        Self::try_new_in(value, Global)
    }

    /// Constructs a new `Shared<T>` in memory from `alloc`. The allocator is
    /// stored in the allocation and used again to free it.
    pub fn try_new_in<A>(value: T, alloc: A) -> Result<Self, AllocError>
    where
        A: Allocator + Send + Sync + 'static,
    {
        match Self::try_new_with_in(|| Ok::<T, core::convert::Infallible>(value), alloc) {
            Ok(s) => Ok(s),
            Err(Error::Alloc(e)) => Err(e),
            Err(Error::Construction(never)) => match never {},
        }
    }

    /// Allocates first, then builds the value with `f` directly into the new
    /// allocation.
    ///
    /// `f` runs exactly once, and only if memory was available. If it fails
    /// (or panics) the memory is returned before the failure propagates.
    ///
    /// ```
    /// use packrc::{Error, Shared};
    ///
    /// let p = Shared::try_new_with(|| "42".parse::<i32>()).unwrap();
    /// assert_eq!(*p, 42);
    ///
    /// let e = Shared::try_new_with(|| "nope".parse::<i32>()).unwrap_err();
    /// assert!(matches!(e, Error::Construction(_)));
    /// ```
    pub fn try_new_with<E, F>(f: F) -> Result<Self, Error<E>>
    where
        F: FnOnce() -> Result<T, E>,
    {
        Self::try_new_with_in(f, Global)
    }

    pub fn try_new_with_in<E, F, A>(f: F, alloc: A) -> Result<Self, Error<E>>
    where
        F: FnOnce() -> Result<T, E>,
        A: Allocator + Send + Sync + 'static,
    {
        let slot = UninitSlot::<T, A>::allocate(alloc, State::new())?;
        let value = match f() {
            Ok(value) => value,
            Err(e) => {
                trace_event!("value construction failed");
                // `slot` is dropped here and returns the memory
                return Err(Error::Construction(e));
            }
        };
        let raw = slot.into_raw();
        // Safety: freshly allocated and exclusively ours
        unsafe { raw.ptr.as_ptr().write(value) };
        Ok(Shared::from_raw(raw))
    }

    /// Constructs a new `Shared<T>` while giving you a `Weak<T>` to the
    /// allocation, to allow you to construct a `T` which holds a weak pointer
    /// to itself.
    ///
    /// See `std::sync::Arc::new_cyclic` for more details.
    ///
    /// While `data_fn` runs, the `Weak` it is given cannot be upgraded yet,
    /// but it is not expired either. If `data_fn` panics, every `Weak` it
    /// handed out becomes expired for good.
    pub fn new_cyclic<F>(data_fn: F) -> Self
    where
        F: FnOnce(&Weak<T>) -> T,
    {
        // Start with a single weak unit and no strong count, so `upgrade`
        // fails while `data_fn` runs and a panic frees the block without
        // touching the uninitialized value.
        let slot = match UninitSlot::<T, Global>::allocate(Global, State::new_unborn()) {
            Ok(slot) => slot,
            Err(AllocError) => handle_alloc_error(Layout::new::<Slot<T, Global>>()),
        };
        let raw = slot.into_raw();
        let unborn = Unborn(Weak {
            raw: Some(raw),
            phantom: PhantomData,
        });
        let value = data_fn(&unborn.0);
        // also forgets the weak unit inside, which the strong handle inherits
        mem::forget(unborn);

        // Safety: the value slot is still uninitialized and nobody can read it
        // while the strong count is 0.
        unsafe { raw.ptr.as_ptr().write(value) };
        // The weak unit we held becomes the one owned by the strong handle.
        raw.state().revive();
        Shared::from_raw(raw)
    }
}

impl<T: ?Sized> Shared<T> {
    /// A handle to nothing.
    pub const fn null() -> Self {
        Shared {
            raw: None,
            phantom: PhantomData,
        }
    }

    fn from_raw(raw: Raw<T>) -> Self {
        Shared {
            raw: Some(raw),
            phantom: PhantomData,
        }
    }

    pub fn is_null(this: &Self) -> bool {
        this.raw.is_none()
    }

    /// The value, or `None` for a null handle.
    pub fn get(this: &Self) -> Option<&T> {
        // Safety: a non-null handle keeps the value alive
        this.raw.map(|raw| unsafe { raw.ptr.as_ref() })
    }

    /// Address of the value, or a null pointer. This is what comparisons
    /// between handles look at.
    pub fn addr(this: &Self) -> *const () {
        this.raw.map_or(ptr::null(), Raw::addr)
    }

    /// Moves the target out of `this`, leaving it null. No count changes.
    pub fn take(this: &mut Self) -> Self {
        mem::replace(this, Shared::null())
    }

    /// Drops this handle's reference and leaves it null.
    ///
    /// If it was the last strong handle, the value is dropped before `reset`
    /// returns.
    pub fn reset(this: &mut Self) {
        drop(Shared::take(this));
    }

    /// Number of strong handles to this allocation, 0 for a null handle.
    /// Another thread may change it at any moment.
    pub fn use_count(this: &Self) -> usize {
        this.raw.map_or(0, |raw| raw.state().peek_strong() as usize)
    }

    /// Number of `Weak` handles to this allocation.
    pub fn weak_count(this: &Self) -> usize {
        this.raw
            .map_or(0, |raw| raw.state().peek_weak_handles() as usize)
    }

    /// Return a [`Weak`] pointer to this object. Null if `this` is null.
    pub fn downgrade(this: &Self) -> Weak<T> {
        if let Some(raw) = this.raw {
            raw.state().weak_increment();
        }
        Weak {
            raw: this.raw,
            phantom: PhantomData,
        }
    }

    /// Returns true if two `Shared` pointers point to the same object. Note
    /// that this is not the same as sharing the same allocation: both might
    /// point to different subobjects of one root value.
    pub fn ptr_eq(this: &Self, other: &Self) -> bool {
        Shared::addr(this) == Shared::addr(other)
    }

    /// Returns true if two `Shared` pointers share reference counts. They may
    /// still point to different parts of the value after `project()`. Two
    /// null handles compare equal.
    pub fn root_ptr_eq<U: ?Sized>(this: &Self, other: &Shared<U>) -> bool {
        this.raw.map(|r| r.header) == other.raw.map(|r| r.header)
    }

    /// Return a `Shared<U>` for anything reachable from the value, e.g. a
    /// field, an element of a slice, or a `&dyn` view of the object. The new
    /// handle takes over this handle's reference.
    ///
    /// To project while keeping the original, pass `this.clone()`.
    ///
    /// `T` must be `Send + Sync`: the projected handle may travel to another
    /// thread and drop the whole value there.
    ///
    /// ```compile_fail
    /// use packrc::Shared;
    /// use std::rc::Rc;
    ///
    /// let pair = Shared::new((Rc::new(1u8), 2u32));
    /// let second = Shared::project(pair, |p| &p.1);
    /// std::thread::spawn(move || drop(second));
    /// ```
    ///
    /// ```
    /// use packrc::Shared;
    /// use std::fmt::Debug;
    ///
    /// let pair = Shared::new((1, "two"));
    /// let second: Shared<&str> = Shared::project(pair.clone(), |p| &p.1);
    /// let dynamic: Shared<dyn Debug> = Shared::project(pair, |p| p as &dyn Debug);
    /// assert_eq!(*second, "two");
    /// assert_eq!(format!("{:?}", dynamic), r#"(1, "two")"#);
    /// assert_eq!(Shared::use_count(&second), 2);
    /// ```
    pub fn project<U: ?Sized, F>(this: Self, f: F) -> Shared<U>
    where
        T: Send + Sync + 'static,
        F: for<'x> FnOnce(&'x T) -> &'x U,
    {
        let Some(raw) = this.raw else {
            return Shared::null();
        };
        // Safety: `this` keeps the value alive while `f` runs
        let ptr = NonNull::from(f(unsafe { raw.ptr.as_ref() }));
        // Forget `this` so it doesn't adjust the refcount, since we moved it
        // into the result.
        mem::forget(this);
        Shared::from_raw(Raw {
            header: raw.header,
            ptr,
        })
    }

    /// Fallible version of `project()`. `None` drops the reference.
    pub fn try_project<U: ?Sized, F>(this: Self, f: F) -> Option<Shared<U>>
    where
        T: Send + Sync + 'static,
        F: for<'x> FnOnce(&'x T) -> Option<&'x U>,
    {
        let raw = this.raw?;
        let ptr = NonNull::from(f(unsafe { raw.ptr.as_ref() })?);
        mem::forget(this);
        Some(Shared::from_raw(Raw {
            header: raw.header,
            ptr,
        }))
    }

    /// Convert `Shared<T>` to `Shared<U>`, as long as `&T` converts to `&U`.
    ///
    /// This should be spelled `from()`, but that conflicts with the blanket
    /// impl converting T->T.
    pub fn cast<U: ?Sized>(this: Self) -> Shared<U>
    where
        T: Send + Sync + 'static,
        for<'u> &'u U: From<&'u T>,
    {
        Shared::project(this, |x| From::from(x))
    }
}

impl<T: ?Sized> Weak<T> {
    /// A weak handle to nothing. It never upgrades.
    pub const fn new() -> Self {
        Weak {
            raw: None,
            phantom: PhantomData,
        }
    }

    /// Attempts to get a strong handle. Succeeds only if some strong handle
    /// is alive at the instant of the attempt; the result then keeps the value
    /// alive for as long as it exists.
    pub fn upgrade(&self) -> Option<Shared<T>> {
        let raw = self.raw?;
        if raw.state().try_promote() {
            Some(Shared::from_raw(raw))
        } else {
            trace_event!(header = ?raw.header, "promotion refused, value is gone");
            None
        }
    }

    /// Like [`Weak::upgrade`], but returns a null `Shared` on failure.
    pub fn lock(&self) -> Shared<T> {
        self.upgrade().unwrap_or_else(Shared::null)
    }

    // Get the current strong count of the observed allocation
    pub fn use_count(&self) -> usize {
        self.raw.map_or(0, |raw| raw.state().peek_strong() as usize)
    }

    /// Get the current number of weak handles, this one included.
    ///
    /// While the value's destructor is running, the handle that dropped it
    /// still holds one weak unit, and that unit is counted here as well.
    pub fn weak_count(&self) -> usize {
        self.raw
            .map_or(0, |raw| raw.state().peek_weak_handles() as usize)
    }

    /// True once every strong handle is gone, so `upgrade` will return
    /// `None`. A null `Weak` is always expired. Once true, stays true.
    ///
    /// A value still being built by [`Shared::new_cyclic`] is not expired,
    /// even though it cannot be upgraded yet.
    pub fn is_expired(&self) -> bool {
        self.raw.map_or(true, |raw| raw.state().is_expired())
    }

    pub fn is_null(&self) -> bool {
        self.raw.is_none()
    }

    /// Moves the target out of `self`, leaving it null.
    pub fn take(&mut self) -> Self {
        mem::replace(self, Weak::new())
    }

    pub fn reset(&mut self) {
        drop(self.take());
    }

    /// Drops the current target, then observes `source`'s allocation only if
    /// its value is alive right now. Otherwise `self` stays null.
    ///
    /// This is a snapshot check: the value may die immediately afterwards.
    pub fn assign(&mut self, source: &Weak<T>) {
        self.reset();
        if let Some(raw) = source.raw {
            let state = raw.state();
            if state.peek_strong() != 0 {
                // `source` holds a weak unit, so the header is resident even
                // if the value dies right now.
                state.weak_increment();
                self.raw = Some(raw);
            }
        }
    }

    /// True if both handles observe the same object (or both are null).
    pub fn ptr_eq(&self, other: &Self) -> bool {
        self.raw.map_or(ptr::null(), Raw::addr) == other.raw.map_or(ptr::null(), Raw::addr)
    }
}

impl<T: ?Sized> Clone for Shared<T> {
    fn clone(&self) -> Self {
        if let Some(raw) = self.raw {
            raw.state().strong_copy_increment();
        }
        Shared {
            raw: self.raw,
            phantom: PhantomData,
        }
    }

    /// Reseats `self` onto `source`'s target. The new target is counted
    /// before the old one is released, so this is safe when both share an
    /// allocation.
    fn clone_from(&mut self, source: &Self) {
        if let (Some(mine), Some(theirs)) = (&mut self.raw, source.raw) {
            if mine.header == theirs.header {
                // same counts, only the view changes
                mine.ptr = theirs.ptr;
                return;
            }
        }
        *self = source.clone();
    }
}

impl<T: ?Sized> Clone for Weak<T> {
    fn clone(&self) -> Self {
        if let Some(raw) = self.raw {
            raw.state().weak_increment();
        }
        Weak {
            raw: self.raw,
            phantom: PhantomData,
        }
    }
}

impl<T: ?Sized> Drop for Shared<T> {
    fn drop(&mut self) {
        if let Some(raw) = self.raw.take() {
            unsafe { raw.release_strong() }
        }
    }
}

impl<T: ?Sized> Drop for Weak<T> {
    fn drop(&mut self) {
        if let Some(raw) = self.raw.take() {
            unsafe { release_weak(raw.header) }
        }
    }
}

impl<T: ?Sized> Default for Shared<T> {
    fn default() -> Self {
        Shared::null()
    }
}

impl<T: ?Sized> Default for Weak<T> {
    fn default() -> Self {
        Weak::new()
    }
}

impl<T> From<T> for Shared<T> {
    fn from(value: T) -> Self {
        Shared::new(value)
    }
}

impl<T: ?Sized> From<&Shared<T>> for Weak<T> {
    fn from(strong: &Shared<T>) -> Self {
        Shared::downgrade(strong)
    }
}

impl<T: ?Sized> Deref for Shared<T> {
    type Target = T;

    /// # Panics
    ///
    /// If the handle is null. Use [`Shared::get`] to check first.
    #[track_caller]
    fn deref(&self) -> &T {
        match Shared::get(self) {
            Some(value) => value,
            None => null_deref(),
        }
    }
}

#[cold]
#[track_caller]
fn null_deref() -> ! {
    panic!("dereferenced a null `Shared`");
}

impl<T: ?Sized> AsRef<T> for Shared<T> {
    fn as_ref(&self) -> &T {
        self
    }
}

// Handles compare by the address of the value they point at, across any two
// pointee types. Null sorts first.
impl<T: ?Sized, U: ?Sized> PartialEq<Shared<U>> for Shared<T> {
    #[inline]
    fn eq(&self, other: &Shared<U>) -> bool {
        Shared::addr(self) == Shared::addr(other)
    }
}

impl<T: ?Sized> Eq for Shared<T> {}

impl<T: ?Sized, U: ?Sized> PartialOrd<Shared<U>> for Shared<T> {
    fn partial_cmp(&self, other: &Shared<U>) -> Option<cmp::Ordering> {
        Some(Shared::addr(self).cmp(&Shared::addr(other)))
    }
}

impl<T: ?Sized> Ord for Shared<T> {
    fn cmp(&self, other: &Self) -> cmp::Ordering {
        Shared::addr(self).cmp(&Shared::addr(other))
    }
}

impl<T: ?Sized> Hash for Shared<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        Shared::addr(self).hash(state)
    }
}

impl<T: ?Sized + fmt::Display> fmt::Display for Shared<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match Shared::get(self) {
            Some(value) => fmt::Display::fmt(value, f),
            None => f.write_str("(null)"),
        }
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for Shared<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match Shared::get(self) {
            Some(value) => fmt::Debug::fmt(value, f),
            None => f.write_str("(null)"),
        }
    }
}

impl<T: ?Sized> fmt::Pointer for Shared<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Pointer::fmt(&Shared::addr(self), f)
    }
}

impl<T: ?Sized> fmt::Debug for Weak<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(Weak)")
    }
}
