//! Testing utilities for plugin development and runtime tests

pub mod mocks;

pub use mocks::{CallLog, MockPlugin};
