//! Native graphics device surfaces for the prism compositor layer.
//!
//! The compositor core (`prism-gpu`) is written against two structurally
//! different native APIs:
//!
//! - [`legacy::LegacyDevice`], an immediate-mode device: implicit pipeline
//!   state, calls execute when issued, view objects per (image, kind, layer),
//!   timestamp queries whose results become readable after the next flush.
//! - [`modern::ModernDevice`], an explicit-mode device: commands are
//!   recorded into [`modern::CommandList`]s and executed at submit, views
//!   live in fixed-capacity descriptor heaps, pipelines are immutable
//!   objects built from bytecode plus a binding layout, and synchronization
//!   is a monotonic timeline fence.
//!
//! Both surfaces drive the same deterministic in-process execution engine
//! (kernel interpreter, triangle rasterizer, timestamp clock), so the whole
//! stack above them is testable without real drivers. Binding real drivers
//! replaces this crate's internals, not its API shape.

#![forbid(unsafe_code)]

mod error;
mod exec;
mod format;
mod resource;

pub mod legacy;
pub mod modern;

pub use error::NativeError;
pub use format::NativeFormat;
pub use resource::{BindFlags, ImageDesc};

/// Timestamp clock frequency in ticks per second (1 tick = 1 µs).
///
/// The clock advances once per executed command, so any non-empty span
/// between two timestamps has a positive duration.
pub const TIMESTAMP_HZ: u64 = 1_000_000;
