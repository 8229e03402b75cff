//! # btc-tests
//!
//! Integration tests for the synchronization core.
//!
//! This crate provides:
//! - A simulated peer network driving a real connection manager
//! - Chain and transaction generators
//! - Scenario tests for downloads, thin blocks and chain assembly
//! - Property-based tests for the scheduling and locator invariants

pub mod generators;
pub mod harness;

#[cfg(test)]
mod manager_tests;



#[cfg(test)]
mod builder_tests;


pub use generators::*;
pub use harness::*;
