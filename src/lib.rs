#![doc = include_str!("../README.md")]

pub mod cli;
pub mod config;
pub mod coupon;
pub mod error;
pub mod evaluator;
pub mod executor;
pub mod handle;
pub mod relater;
pub mod repository;
pub mod runner;
pub mod scheduler;
pub mod storage;

pub use error::{FixError, Result};
pub use handle::Fix;
pub use relater::Relater;
pub use storage::RuntimeStorage;
