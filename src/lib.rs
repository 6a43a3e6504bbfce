//! Guardedness checking for mutual fixpoints over inductive types.
//!
//! The entry point is [`checker::check_fix`]: given a global environment,
//! a local context and a `Fix` term, it decides whether every recursive
//! call of the block is made on a structurally smaller argument. Subterm
//! information is tracked with recursive-argument trees ([`rtree`]) so
//! that recursion through nested inductives (a tree of lists of trees,
//! say) is recognized.
//!
//! The crate performs no evaluation and no type checking; terms are
//! expected to be well typed. Diagnostic events are emitted through
//! [`tracing`] and can be collected by installing a subscriber.

pub mod ast;
pub mod checker;
pub mod reduce;
pub mod rtree;

pub use checker::{check_fix, check_fix_with_fuel, Context, Env, RelDecl};

use std::rc::Rc;

use thiserror::Error;

use ast::{IndRef, Term};

/// Classification of a [`GuardError`], exposed alongside each variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// Internal invariant violated; never recoverable.
    Programming,
    /// A global lookup failed, with the offending name.
    Env(String),
    /// An index was out of bounds.
    Index(usize),
    /// Wrong-shape term or unsupported construct.
    Other,
    /// A recursive call could not be shown structurally decreasing.
    Guard,
    /// The step budget ran out.
    Timeout,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GuardError {
    #[error("fixpoint {fix}: recursive call on a term that is not a strict subterm of the decreasing argument: {arg:?}")]
    IllegalRecCall { fix: String, arg: Rc<Term> },
    #[error("fixpoint {fix}: a recursive call does not carry the decreasing argument")]
    PartialApply { fix: String },
    #[error("fixpoint {fix}: not enough information on the decreasing argument of a recursive call")]
    NotEnoughInfo { fix: String },
    #[error("fixpoint {fix}: the recursive argument has a non-inductive type {ty:?}")]
    RecursionNotOnInductiveType { fix: String, ty: Rc<Term> },
    #[error("fixpoint {fix}: the recursive argument is of the co-inductive type {ind:?}")]
    RecursionOnNonFinite { fix: String, ind: IndRef },
    #[error("fixpoint {fix}: the body has fewer abstractions than the decreasing-argument index")]
    NotEnoughAbstractions { fix: String },
    #[error("unknown global {0}")]
    UnboundGlobal(String),
    #[error("inductive block {name} has no body at index {index}")]
    BadInductiveIndex { name: String, index: usize },
    #[error("projected field {arg} is out of range for the record tree")]
    BadProjectionIndex { arg: usize },
    #[error("{0} are not supported by the guardedness checker")]
    Unsupported(&'static str),
    #[error("guardedness checker invariant broken: {0}")]
    Internal(&'static str),
    #[error("step budget exhausted during guardedness checking")]
    Timeout,
}

impl GuardError {
    pub fn kind(&self) -> ErrorKind {
        use GuardError::*;
        match self {
            IllegalRecCall { .. }
            | PartialApply { .. }
            | NotEnoughInfo { .. }
            | RecursionNotOnInductiveType { .. }
            | RecursionOnNonFinite { .. }
            | NotEnoughAbstractions { .. } => ErrorKind::Guard,
            UnboundGlobal(name) => ErrorKind::Env(name.clone()),
            BadInductiveIndex { index, .. } => ErrorKind::Index(*index),
            BadProjectionIndex { arg } => ErrorKind::Index(*arg),
            Unsupported(_) => ErrorKind::Other,
            Internal(_) => ErrorKind::Programming,
            Timeout => ErrorKind::Timeout,
        }
    }

    /// Name of the fixpoint the failure was detected in, when known.
    pub fn location(&self) -> Option<&str> {
        use GuardError::*;
        match self {
            IllegalRecCall { fix, .. }
            | PartialApply { fix }
            | NotEnoughInfo { fix }
            | RecursionNotOnInductiveType { fix, .. }
            | RecursionOnNonFinite { fix, .. }
            | NotEnoughAbstractions { fix } => Some(fix),
            _ => None,
        }
    }

    /// Whether the walker's reduction fallbacks may catch this error and
    /// retry after reducing further.
    pub(crate) fn recoverable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Guard | ErrorKind::Other)
    }
}
