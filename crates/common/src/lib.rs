//! Common utilities and shared types for atelier.
//!
//! This crate provides foundational components used across all atelier crates:
//!
//! - **Configuration**: Application settings via [`Config`]
//! - **Error handling**: Unified error types via [`AppError`] and [`AppResult`]
//! - **ID Generation**: ULID-based unique identifiers via [`IdGenerator`]
//! - **Clocks**: Injectable time sources via [`SharedClock`]
//!
//! # Example
//!
//! ```no_run
//! use atelier_common::{Config, IdGenerator, AppResult};
//!
//! fn example() -> AppResult<()> {
//!     let config = Config::load()?;
//!     let id_gen = IdGenerator::new();
//!     let id = id_gen.generate();
//!     println!("{} generated {}", config.email.site_name, id);
//!     Ok(())
//! }
//! ```

pub mod clock;
pub mod config;
pub mod error;
pub mod id;

pub use clock::{Clock, ManualClock, SharedClock, system_clock};
pub use config::{Config, Environment};
pub use error::{AppError, AppResult};
pub use id::IdGenerator;
