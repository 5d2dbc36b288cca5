//! The front-end of the compiler.

pub mod ast;
pub mod cpp;
pub mod lex;
pub mod parse;

pub use ast::*;
pub use cpp::Preprocessor;
pub use parse::{parse, parse_with};
