//! Timeout management
//!
//! A single-level timing wheel with one bucket per millisecond:
//!
//! ```text
//!   start_ms                                   start_ms + horizon - 1
//!      │                                                 │
//!      ▼                                                 ▼
//!   ┌──────┬──────┬──────┬───────────────────────┬──────┐
//!   │cursor│ +1ms │ +2ms │          ...          │ last │ ◄── clamped
//!   └──────┴──────┴──────┴───────────────────────┴──────┘
//!      │
//!      ▼
//!   head ─► node ─► node ─► tail     (FIFO, doubly linked in a slab)
//! ```
//!
//! Removal is O(1) through a generation-checked [`TimeoutKey`].

mod wheel;

pub use wheel::{TimeoutKey, TimeoutWheel};
