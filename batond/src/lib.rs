#![deny(clippy::as_conversions)]

mod node;
mod task;

pub use node::*;
