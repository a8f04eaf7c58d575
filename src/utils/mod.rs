//! Small, self-contained data structures shared across modules.
//!
//! Grounded on `r3_kernel`'s `utils` module: that crate keeps its
//! intrusive-list and binary-heap helpers here rather than folding them into
//! the modules that use them, since several subsystems need the same
//! structure. This reshaping keeps the same split but trades the teacher's
//! pointer-based intrusive lists (`utils::intrusive_list`) for an
//! index-stable arena (per the design notes: "Use arenas + stable indices ...
//! instead" of cyclic pointer ownership), and its `ArrayVec`-backed
//! `VecLike` for an `alloc`-backed one, since this crate assumes a
//! conforming allocator.
pub mod arena;
pub mod binary_heap;
