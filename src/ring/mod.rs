// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Mirrored-memory ring buffer.
//!
//! One physical region (an anonymous memfd) is mapped twice, back to back,
//! so an element reserved just past the logical end of the buffer is still
//! addressable without wrap-around arithmetic at the element level. On top
//! of that mapping sits a lock-free circular queue whose head and tail are
//! dispensed with atomic fetch-add and folded back at the capacity boundary.
//!
//! The pool uses the ring as a free list of client slot indices: preloaded
//! with every index at construction, drawn from on accept, returned to on
//! disconnect.

mod map;
mod queue;

pub use map::{page_size, MirrorMap};
pub use queue::AtomicRing;
