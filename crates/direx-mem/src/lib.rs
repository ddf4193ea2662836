//! `direx` manually-managed memory
//!
//! Containers whose storage lives in one fixed-capacity arena instead of the
//! global heap, for workloads that build and tear down large intermediate
//! data structures without per-object allocator traffic:
//!
//! - **Arena**: a contiguous region carved once; reservations never exceed
//!   its capacity
//! - **Allocation contexts**: exclusive ([`LocalContext`]) and
//!   concurrency-safe ([`SharedContext`]) sub-allocators every container
//!   reserves through
//! - **Containers**: [`Slice`], [`HashMap`] and the reference-counted
//!   [`RcString`], all small `Copy` handles into arena memory
//! - **String packing**: [`StringFactory`] places many small strings in one
//!   shared holder
//!
//! Nothing is freed implicitly. Every container is released with an explicit
//! `free(ctx)`, contents before containers, and contexts before their arena.
//! Handles carry the lifetime of the context they were allocated from, so
//! the borrow checker keeps both contexts and handles from outliving the
//! arena.
//!
//! ```
//! use direx_mem::{Arena, HashMap, MemoryContext, Slice, StringFactory};
//! use direx_mem::config::MB;
//!
//! let arena = Arena::new(MB).unwrap();
//! let ctx = arena.local_context();
//! let factory = StringFactory::new();
//!
//! let mut lengths = HashMap::new(0, &ctx).unwrap();
//! for word in ["arena", "slice", "map"] {
//!     let s = factory.create_from_str(word, &ctx).unwrap();
//!     lengths.put(s, s.len(), &ctx).unwrap();
//! }
//! let key = factory.create_from_str("slice", &ctx).unwrap();
//! assert_eq!(lengths.get(&key), Some(5));
//! key.free(&ctx);
//!
//! let mut keys = Slice::default();
//! for (key, _) in lengths.iter() {
//!     keys.append(key, &ctx).unwrap();
//! }
//! keys.iterate(|key| key.free(&ctx));
//! keys.free(&ctx);
//! lengths.free(&ctx);
//! factory.destroy(&ctx);
//!
//! assert_eq!(ctx.reserved(), 0);
//! ```
//!
//! Set `DIREX_LOG=debug` (or `trace`) and call [`direx_log::init_from_env`]
//! to follow arena and context lifecycles.

pub mod arena;
pub mod config;
pub mod context;
pub mod error;
pub mod factory;
pub mod map;
pub mod plain;
pub mod pointer;
pub mod slice;
pub mod string;

pub use arena::{Arena, ArenaStats};
pub use config::ArenaConfig;
pub use context::{ContextStats, LocalContext, MemoryContext, SharedContext};
pub use error::{Error, Result};
pub use factory::StringFactory;
pub use map::{HashMap, KeyHash, MapIter};
pub use plain::Plain;
pub use pointer::Pointer;
pub use slice::{Slice, SliceIter};
pub use string::RcString;
