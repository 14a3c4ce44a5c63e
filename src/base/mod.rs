//! Base types and error handling.
//!
//! - [`NetError`]: network error codes in the spirit of `net_error_list.h`
//! - [`EventLoop`]: the single-threaded loop everything schedules on
//! - [`LoadState`]: progress states of an HTTP exchange

pub mod context;
pub mod eventloop;
pub mod loadstate;
pub mod neterror;

pub use eventloop::EventLoop;
pub use loadstate::LoadState;
pub use neterror::{ErrorClass, NetError};

#[cfg(test)]
mod tests;
