// src/error.rs
//
// Setup/teardown error type for the supervisor: signal registration, pipe
// creation, config loading. The task-outcome taxonomy in the monitor loops
// (success / signal death / pre-execution exit) never flows through here —
// those stay `Option<i32>` plus the callback objects, exactly as the contract
// requires. This only covers things that are bugs or environment failures,
// not task outcomes.

pub use dusa_collection_utils::core::errors::{ErrorArrayItem, Errors};

pub type Result<T> = std::result::Result<T, ErrorArrayItem>;

pub fn os_error(context: &str, errno: nix::errno::Errno) -> ErrorArrayItem {
    ErrorArrayItem::new(Errors::InputOutput, format!("{context}: {errno}"))
}

pub fn general(message: impl Into<String>) -> ErrorArrayItem {
    ErrorArrayItem::new(Errors::GeneralError, message.into())
}
