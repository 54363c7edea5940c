//! User-facing findings of the analysis.
//!
//! Diagnostics are collected in a set, so the same finding reported from many fixpoint
//! iterations surfaces once. Fatal errors abort the analysis immediately; diagnostics are
//! carried into the refined output for the caller to report.

use opal_common::report_error::Reportable;
use std::io;

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, thiserror::Error)]
pub enum Diagnostic {
    #[error(
        "abstract feature `{routine}` is not implemented by `{target}`\n\
         first instantiated at {instantiated_at}"
    )]
    AbstractMissing {
        target: String,
        routine: String,
        instantiated_at: String,
    },

    #[error("call to abstract feature `{routine}` can never be dispatched")]
    CallToAbstract { routine: String },

    #[error("effect `{effect}` is used but never installed and has no default")]
    MissingEffect { effect: String },

    #[error("instance of `{clazz}` escapes its loop iteration\nescape route: {}", route.join(" -> "))]
    LoopInstanceEscapes { clazz: String, route: Vec<String> },

    #[error("intrinsic `{name}` is not supported by this analysis")]
    UnimplementedIntrinsic { name: String },
}

#[derive(Debug, thiserror::Error)]
pub enum Fatal {
    #[error("malformed serialized constant for clazz `{0}`")]
    MalformedConstant(String),

    #[error("match subject at `{0}` is not a choice or boolean value")]
    UnexpectedMatchValue(String),

    #[error("array intrinsic `{0}` applied to a non-array value")]
    ExpectedArray(String),

    #[error("failed to write analysis artifacts")]
    WriteArtifacts(#[from] io::Error),
}

impl Reportable for Fatal {
    fn report(&self, dest: &mut impl io::Write) -> io::Result<()> {
        writeln!(dest, "error: {self}")
    }
}
