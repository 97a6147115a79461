use crate::token::Span;
use thiserror::Error;

/// What stage of the pipeline rejected the input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Lexical,
    Syntax,
    Semantic,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ErrorKind::Lexical => "lexical error",
            ErrorKind::Syntax => "syntax error",
            ErrorKind::Semantic => "semantic error",
        })
    }
}

/// A compile-time diagnostic: lexical, syntactic or static-semantic, always
/// carrying the source range it points at.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{kind} at {span}: {message}")]
pub struct TemplateError {
    pub kind: ErrorKind,
    pub span: Span,
    pub message: String,
}

impl TemplateError {
    pub fn lexical(span: Span, message: impl Into<String>) -> TemplateError {
        TemplateError {
            kind: ErrorKind::Lexical,
            span,
            message: message.into(),
        }
    }

    pub fn syntax(span: Span, message: impl Into<String>) -> TemplateError {
        TemplateError {
            kind: ErrorKind::Syntax,
            span,
            message: message.into(),
        }
    }

    pub fn semantic(span: Span, message: impl Into<String>) -> TemplateError {
        TemplateError {
            kind: ErrorKind::Semantic,
            span,
            message: message.into(),
        }
    }
}

/// Classification of runtime evaluation failures. Hosts can pattern-match
/// these, and the error hook receives them verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionType {
    UndefinedVariable,
    UndefinedFunction,
    FunctionParamMismatch,
    IncorrectTypes,
    NoScopeInRoot,
    InvalidKey,
    RecursionLimit,
    ExecutionException,
}

impl ExceptionType {
    pub fn name(self) -> &'static str {
        match self {
            ExceptionType::UndefinedVariable => "undefined_variable",
            ExceptionType::UndefinedFunction => "undefined_function",
            ExceptionType::FunctionParamMismatch => "function_param_mismatch",
            ExceptionType::IncorrectTypes => "incorrect_types",
            ExceptionType::NoScopeInRoot => "no_scope_in_root",
            ExceptionType::InvalidKey => "invalid_key",
            ExceptionType::RecursionLimit => "recursion_limit",
            ExceptionType::ExecutionException => "execution_exception",
        }
    }
}

impl std::fmt::Display for ExceptionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A runtime evaluation error. Aborts the current execution unless the
/// context's error hook substitutes a value for it.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{exception}: {message}")]
pub struct EvalError {
    pub exception: ExceptionType,
    pub message: String,
}

impl EvalError {
    pub fn new(exception: ExceptionType, message: impl Into<String>) -> EvalError {
        EvalError {
            exception,
            message: message.into(),
        }
    }

    pub fn incorrect_types(message: impl Into<String>) -> EvalError {
        EvalError::new(ExceptionType::IncorrectTypes, message)
    }
}
