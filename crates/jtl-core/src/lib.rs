//! JTL core crate: a JSON toolkit and template language.
//!
//! The pipeline from source text to output value runs in stages:
//!
//! - `lexer`: modal tokenizer; string modes carry interpolation back into
//!   the default mode and out again.
//! - `grammar` + `table`: the grammar is declared as data and the LR
//!   shift/reduce table is generated from it at startup.
//! - `parser` + `ast`: two-stack driver building syntax nodes, static
//!   checks, and compilation into a linear instruction program with
//!   constant folding.
//! - `instr` + `exec`: the sealed program and the frame-based engine that
//!   runs it against a context.
//! - `runtime` + `vfl`: the evaluation context, its layered scopes and
//!   user-defined functions.
//!
//! The design rule throughout: parse and compile once, run many times.
//! A [`Template`] is immutable and every run gets its own
//! [`TemplateContext`].

pub mod ast;
pub mod error;
pub mod exec;
pub mod expr;
pub mod grammar;
pub mod instr;
pub mod json;
pub mod lexer;
pub mod operators;
pub mod parser;
pub mod runtime;
pub mod table;
pub mod template;
pub mod token;
pub mod vfl;

pub use error::{ErrorKind, EvalError, ExceptionType, TemplateError};
pub use json::{JsonType, JsonValue};
pub use lexer::Lexer;
pub use runtime::{ErrorHook, TemplateContext};
pub use template::Template;
pub use token::{Pos, Span, Token, TokenType};
