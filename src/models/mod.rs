// src/models/mod.rs
pub mod dispatch;
pub mod driver;
pub mod events;
pub mod ride;

pub use dispatch::*;
pub use driver::*;
