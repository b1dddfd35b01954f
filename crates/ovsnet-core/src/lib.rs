//! Core types and utilities for ovsnet
//!
//! # Modules
//!
//! - `config`: environment file loading and typed env lookups
//! - `error`: error taxonomy and Result alias
//! - `naming`: deterministic names and MACs for created objects

pub mod config;
pub mod error;
pub mod naming;

pub use error::{Backend, Error, Result};
