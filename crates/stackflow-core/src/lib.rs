//! StackFlow configuration language
//!
//! Parses KDL stack files into the engine's [`ResourceSet`](stackflow_engine::ResourceSet).
//!
//! ```kdl
//! project "demo"
//!
//! variables {
//!     prefix "demo"
//! }
//!
//! resource "local_directory" "out" {
//!     path "out"
//! }
//!
//! resource "local_file" "page" {
//!     count 3
//!     path "${local_directory.out.path}/${var.prefix}-${count.index}.txt"
//!     content "page ${count.index}"
//!     lifecycle {
//!         create_before_destroy #true
//!     }
//! }
//!
//! output "pages" {
//!     value "${local_file.page.path}"
//! }
//! ```

pub mod discovery;
pub mod error;
pub mod expression;
pub mod model;
pub mod parser;

pub use discovery::{find_project_root, find_project_root_from, project_root_for};
pub use error::{ExpressionError, Result, StackError};
pub use expression::{Variables, parse_expression, parse_template};
pub use model::Stack;
pub use parser::{parse_stack_file, parse_stack_string, parse_stack_string_with_variables};
