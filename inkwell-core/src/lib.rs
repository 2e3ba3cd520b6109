//! Inkwell Core - shared vocabulary for the request pipeline and cache layer.
//!
//! This crate holds the types both halves of the client core agree on:
//! the classified [`ApiError`] taxonomy, request [`Priority`] and
//! [`HttpMethod`], the [`Clock`] abstraction that lets tests drive expiry
//! deterministically, and [`TaskGroup`], the owner of every background task
//! a manager spawns.

pub mod clock;
pub mod enums;
pub mod error;
pub mod lifecycle;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use enums::{HttpMethod, Priority};
pub use error::{ApiError, ApiResult, ConfigError, ErrorCategory};
pub use lifecycle::TaskGroup;
