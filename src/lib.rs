#[macro_use]
extern crate num_derive;

pub mod cli;
pub mod client;
pub mod config;
pub mod error;
pub mod interop;
pub mod link;
pub mod state;
pub mod ugv;
