//! Expression tree and SQL compiler for keel.
//!
//! `keel-query` is the **statement construction layer**. It provides a closed
//! [`Expr`] node type covering predicates, arithmetic and the four statement
//! kinds, and lowers trees to parameterized SQL for a [`DialectProfile`].
//!
//! # Role In The Architecture
//!
//! - **Expression tree**: [`Expr`], [`Column`], [`Table`], [`Join`] and the
//!   statement nodes [`Select`], [`Insert`], [`Update`], [`Delete`].
//! - **Compiler**: [`compile`] is the reference renderer; [`Compiler`] adds a
//!   shape-keyed [`StatementCache`] with identical output.
//!
//! The Store in `keel-store` builds trees and sends the compiled SQL through a
//! `Connection`.
//!
//! [`DialectProfile`]: keel_core::DialectProfile

pub mod cache;
pub mod compiler;
pub mod expr;
pub mod join;
pub mod select;
pub mod statement;

pub use cache::{ShapeKey, StatementCache, shape_key};
pub use compiler::{Compiled, Compiler, compile};
pub use expr::{ArithOp, Column, CompareOp, Expr, Table};
pub use join::{Join, JoinKind};
pub use select::Select;
pub use statement::{Delete, Insert, Update};
