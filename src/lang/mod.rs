//! # Cinder source language model
//!
//! This module defines the Abstract Syntax Tree (AST) for Cinder programs,
//! the static type tags shared by every compiler pass, and the host-facing
//! values used to seed globals and talk to native functions.
//!
//! ## Conventions
//!
//! - Every expression and statement carries a [`node::NodeId`] that is unique
//!   within one parsed [`program::Program`]. Analysis passes attach their
//!   results to the tree through side tables keyed by these ids instead of
//!   mutating the AST.
//! - Source positions are 1-based `line:col` spans coming from the lexer.

pub mod node;
pub mod program;
pub mod types;
pub mod value;
