/*!
This crate provides [`Shared<T>`] and [`Weak<T>`], a thread-safe strong/weak
reference-counted pointer pair in the spirit of C++'s `shared_ptr` and
`weak_ptr`, with both reference counts packed into a single 64-bit word that
lives in the same allocation as the value.

```rust
    use packrc::{Shared, Weak};

    let a = Shared::new(String::from("hello world!"));
    let b = a.clone();
    let w: Weak<String> = Shared::downgrade(&a);
    assert_eq!(Shared::use_count(&b), 2);

    drop(a);
    drop(b);

    // the value is gone, but `w` can still safely tell
    assert!(w.is_expired());
    assert!(w.upgrade().is_none());
```

# How the counts work

The word is split into a strong half and a weak half. Every strong handle also
holds one weak unit, so cloning or dropping a `Shared` moves both halves with
one atomic add, and the whole word reaches zero exactly when no reference of
either kind is left. One atomic result therefore tells a handle both whether to
drop the value and whether to free the memory.

Dropping the last strong handle is the one place where the two decisions are
split: that handle keeps its weak unit while it runs the value's destructor and
gives it up afterwards, so a `Weak` dropped on another thread can never free
the memory out from under a running destructor.

# Null handles

Both handle types can be null, like their C++ counterparts:
[`Shared::null`], [`Shared::take`] and [`Shared::reset`] move out of or clear a
handle without touching the value. Dereferencing a null `Shared` panics; use
[`Shared::get`] to check first.

```rust
    use packrc::Shared;

    let mut a = Shared::new(5);
    let b = Shared::take(&mut a);
    assert!(Shared::is_null(&a));
    assert_eq!(Shared::get(&a), None);
    assert_eq!(Shared::use_count(&b), 1);
```

# Views of other types

Each handle stores a pointer to the count header next to the pointer to the
value, so a handle can be converted to point at any part of its value with
[`Shared::project`], including fields at any offset and trait objects, and
still share ownership of the whole allocation. Projecting needs the value to
be `Send + Sync`, since the projected handle may end up dropping it on another
thread:

```rust
    use packrc::Shared;
    use std::fmt::Debug;

    struct Point2 { x: i32, y: i32 }
    struct Point3 { z: i32, base: Point2 }

    let p3 = Shared::new(Point3 { z: 3, base: Point2 { x: 1, y: 2 } });
    let p2: Shared<Point2> = Shared::project(p3.clone(), |p| &p.base);
    let d: Shared<dyn Debug> = Shared::project(p3, |p| &p.z as &dyn Debug);
    assert_eq!((p2.x, p2.y), (1, 2));
    assert_eq!(format!("{:?}", d), "3");
```

Comparison operators on `Shared` look at the address of the value pointed to,
not at the value itself, and work across pointee types.

# Cycles

There is no cycle collection: values that hold strong handles to each other
are never dropped. Hold a [`Weak`] on one side of the loop instead.

# Allocation

[`Shared::try_new_in`] and [`Shared::try_new_with_in`] take any
[`Allocator`]; the allocator is stored inside the allocation and used again to
free it, so it does not appear in the handle's type. Failures are reported as
[`AllocError`] or, for fallible constructors, [`Error`].

# Features

* `tracing`: emit `trace`-level events when a value is destroyed, an
  allocation is freed, a promotion is refused or a constructor fails
  (`cargo test --features tracing` checks them).
* `allocator_api` (nightly): implement [`Allocator`] for
  `alloc::alloc::Global`.

Building with `RUSTFLAGS="--cfg loom"` swaps the atomics for `loom`'s, for the
model-checking tests in `tests/loom.rs`.

# Differences from `std::sync::Arc`

Counts are 32 bits each. If a count would pass [`MAX_REFCOUNT`], the increment
is undone and the call panics, since there is no `abort()` in `no_std`.

`Default` makes a null handle rather than a default value.

There is no `get_mut` or `try_unwrap`: a projected handle can point at part of
the value, or at data outside it, so "the only handle" does not mean "owns the
whole value".
*/
#![no_std]
#![cfg_attr(feature = "allocator_api", feature(allocator_api))]
#[cfg(test)]
extern crate std;

extern crate alloc;

macro_rules! trace_event {
    ($($arg:tt)*) => {
        #[cfg(feature = "tracing")]
        tracing::trace!($($arg)*);
    };
}

pub mod allocator;
mod error;
mod shared;
mod state;
mod sync;

pub use self::allocator::{AllocError, Allocator, Global};
pub use self::error::Error;
pub use self::shared::{Shared, Weak};
pub use self::state::MAX_REFCOUNT;
