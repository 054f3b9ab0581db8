#![cfg_attr(not(test), no_std)]

// This mod MUST go first, so that the others see its macros.
mod fmt;

pub mod config;
pub mod defines;
pub mod login;
pub mod rx;
pub mod tx;

mod alias_mapping;
mod assembly;
mod buffer_store;
mod driver;
mod fifo;
mod frame;
mod gridconnect;
mod message;
mod node;
mod resources;
mod stack;

pub use alias_mapping::*;
pub use assembly::*;
pub use buffer_store::*;
pub use driver::*;
pub use fifo::*;
pub use frame::*;
pub use gridconnect::*;
pub use message::*;
pub use node::*;
pub use resources::*;
pub use stack::*;

pub use embedded_can::{ExtendedId, Id};
