//! Scratch memory management
//!
//! Kernels take their temporaries from a per-context [`ScratchArena`]
//! rather than allocating on every invocation. Blocks are pooled and reused
//! best-fit; guards return them on drop.

pub mod arena;

pub use arena::{ArenaStats, ScratchArena, ScratchBuf};
