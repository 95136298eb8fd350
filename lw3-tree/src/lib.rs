//! # lw3-tree
//!
//! In-memory node tree served over the LW3 protocol.
//!
//! This crate provides:
//! - Nodes holding child nodes, properties and methods under unique names
//! - Properties with rw flag, manual text, optional setter and getter
//! - Synchronous and asynchronous methods
//! - Change listeners with `property=value` filters and invocation counts
//! - JSON import and export
//!
//! Lookups through [`Tree::resolve`] never create anything; only the owning
//! application grows the tree, through [`Tree::node`] and the `Node` setters.

pub mod error;
pub mod json;
pub mod listener;
pub mod method;
pub mod node;
pub mod path;
pub mod property;
pub mod tree;

pub use error::{EntryKind, TreeError};
pub use json::value_to_json;
pub use listener::{ChangeEvent, ListenerCallback, ListenerRule};
pub use method::{Method, MethodError, MethodFuture, MethodHandler, MethodInfo, MethodResult};
pub use node::{Entry, Node};
pub use property::{Getter, Property, PropertyInfo, Setter};
pub use tree::Tree;
