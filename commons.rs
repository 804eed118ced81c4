//! Small shared types used across the front end and middle end: a marker
//! for values that have passed validation, and the diagnostic/error shapes
//! described in §7.

use std::fmt;
use std::ops::AddAssign;

use derive_more::Display;

use crate::ir::Loc;

/// A value that has been run through [`crate::ir::validate`] (or the front
/// end's equivalent check) and is safe to hand to the middle-end passes
/// without re-checking structural invariants on every call.
///
/// `Valid` carries no behavior of its own; it exists so a pass's signature
/// (`fn run(module: &Valid<Module>) -> ...`) documents, at the type level,
/// that it does not re-validate its input.
#[derive(Clone, Debug)]
pub struct Valid<T>(pub T);

impl<T> Valid<T> {
    /// Assert that `inner` has already been validated by the caller.
    pub fn assume(inner: T) -> Self {
        Valid(inner)
    }

    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> std::ops::Deref for Valid<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.0
    }
}

impl<T> std::ops::DerefMut for Valid<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.0
    }
}

/// A single user-facing diagnostic: a source location plus a message,
/// carried back to the front end through [`Diagnostics`] (§6, §7).
#[derive(Clone, Debug, PartialEq)]
pub struct Diagnostic {
    pub loc: Loc,
    pub message: String,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.loc, self.message)
    }
}

/// The two analysis errors named in §4.2, surfaced with
/// `derive_more::Display` the same way the lattice value types elsewhere in
/// this crate are.
#[derive(Clone, Debug, Display, PartialEq)]
pub enum AnalysisError {
    #[display(fmt = "{loc}: use of possibly-uninitialized variable {var}")]
    UseBeforeInit { var: String, loc: Loc },
    #[display(fmt = "{loc}: function may fall off its end without returning")]
    MissingReturn { loc: Loc },
}

impl AnalysisError {
    pub fn loc(&self) -> Loc {
        match self {
            AnalysisError::UseBeforeInit { loc, .. } => *loc,
            AnalysisError::MissingReturn { loc } => *loc,
        }
    }

    pub fn into_diagnostic(self) -> Diagnostic {
        let loc = self.loc();
        Diagnostic {
            loc,
            message: self.to_string(),
        }
    }
}

/// An accumulator of independent diagnostics, mirroring the
/// `ValidationError` pattern in `front_end/ast/validate.rs`: every check
/// runs regardless of whether an earlier one failed, and the caller decides
/// whether a non-empty accumulator should abort the pipeline.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Diagnostics(pub Vec<Diagnostic>);

impl Diagnostics {
    pub fn new() -> Self {
        Diagnostics(Vec::new())
    }

    pub fn push(&mut self, d: Diagnostic) {
        self.0.push(d);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_vec(self) -> Vec<Diagnostic> {
        self.0
    }
}

impl AddAssign for Diagnostics {
    fn add_assign(&mut self, other: Self) {
        self.0.extend(other.0);
    }
}

impl AddAssign<Diagnostic> for Diagnostics {
    fn add_assign(&mut self, other: Diagnostic) {
        self.0.push(other);
    }
}

impl FromIterator<Diagnostic> for Diagnostics {
    fn from_iter<I: IntoIterator<Item = Diagnostic>>(iter: I) -> Self {
        Diagnostics(iter.into_iter().collect())
    }
}

impl FromIterator<AnalysisError> for Diagnostics {
    fn from_iter<I: IntoIterator<Item = AnalysisError>>(iter: I) -> Self {
        Diagnostics(iter.into_iter().map(AnalysisError::into_diagnostic).collect())
    }
}

impl IntoIterator for Diagnostics {
    type Item = Diagnostic;
    type IntoIter = std::vec::IntoIter<Diagnostic>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diagnostics_accumulate_across_add_assign() {
        let mut errs = Diagnostics::new();
        errs += Diagnostic {
            loc: Loc { line: 1, col: 1 },
            message: "first".into(),
        };
        errs += Diagnostics(vec![Diagnostic {
            loc: Loc { line: 2, col: 1 },
            message: "second".into(),
        }]);
        assert_eq!(errs.0.len(), 2);
    }

    #[test]
    fn analysis_error_display_matches_diagnostic_message() {
        let err = AnalysisError::UseBeforeInit {
            var: "x".into(),
            loc: Loc { line: 3, col: 4 },
        };
        let diag = err.clone().into_diagnostic();
        assert_eq!(diag.message, err.to_string());
        assert_eq!(diag.loc, Loc { line: 3, col: 4 });
    }
}
