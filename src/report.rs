//! Diagnostic reporting.
//!
//! User-level errors never unwind: passes record them here and continue
//! locally so that one compile collects as many diagnostics as possible.
//! Downstream passes consult [`Reporter::error_count`] and short-circuit.
//! Compiler invariant violations are not diagnostics; those panic at the
//! point of violation.

use std::fmt::{self, Display};

use crate::types::{Bookmark, FileId, Idx, IdxVec};

/// The severity classes of user-facing diagnostics.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Severity {
  /// A malformed construct or unresolved reference. Compilation fails.
  Error,
  /// An advisory that does not stop compilation.
  Warning,
  /// A semantic check that may indicate a bug in the compiled program
  /// (array index may overflow, assertion has side effects). Counted
  /// separately; a final advisory is printed when any accumulated.
  LogicWarning,
  /// A declaration whose type cannot be implemented on the current
  /// platform. Reported at the declaration's bookmark.
  PlatformNotSupported,
}

impl Display for Severity {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Severity::Error => write!(f, "error"),
      Severity::Warning => write!(f, "warning"),
      Severity::LogicWarning => write!(f, "logic warning"),
      Severity::PlatformNotSupported => write!(f, "not supported on this platform"),
    }
  }
}

/// A single recorded diagnostic.
#[derive(Clone, Debug)]
pub struct Diag {
  pub severity: Severity,
  pub bookmark: Bookmark,
  pub message: String,
}

/// Collects diagnostics and counts them by severity.
#[derive(Default)]
pub struct Reporter {
  diags: Vec<Diag>,
  files: IdxVec<FileId, String>,
  errors: u32,
  logic_warnings: u32,
}

impl Reporter {
  /// Register a source file name, returning its id for bookmarks.
  pub fn add_file(&mut self, name: impl Into<String>) -> FileId {
    self.files.push(name.into())
  }

  /// The name of a registered file.
  #[must_use] pub fn file_name(&self, file: FileId) -> &str { &self.files[file] }

  /// The number of hard errors recorded so far.
  #[must_use] pub fn error_count(&self) -> u32 { self.errors }

  /// The number of logic warnings recorded so far.
  #[must_use] pub fn logic_warning_count(&self) -> u32 { self.logic_warnings }

  /// All diagnostics recorded so far, in order.
  #[must_use] pub fn diags(&self) -> &[Diag] { &self.diags }

  /// True when any hard error was recorded; passes that depend on a
  /// previous pass succeeding check this and short-circuit.
  #[must_use] pub fn failed(&self) -> bool { self.errors > 0 }

  fn record(&mut self, severity: Severity, bookmark: Bookmark, message: String) {
    match severity {
      Severity::Error | Severity::PlatformNotSupported => self.errors += 1,
      Severity::LogicWarning => self.logic_warnings += 1,
      Severity::Warning => {}
    }
    let place = match bookmark.file {
      Some(f) => format!("{}:{}:{}", self.files[f], bookmark.line, bookmark.col),
      None if bookmark.line != 0 => format!("{}:{}", bookmark.line, bookmark.col),
      None => "<generated>".into(),
    };
    log::warn!("{place}: {severity}: {message}");
    self.diags.push(Diag { severity, bookmark, message });
  }

  /// Record a syntax-severity error at a bookmark.
  pub fn error(&mut self, bookmark: Bookmark, message: impl Into<String>) {
    self.record(Severity::Error, bookmark, message.into());
  }

  /// Record an advisory warning.
  pub fn warning(&mut self, bookmark: Bookmark, message: impl Into<String>) {
    self.record(Severity::Warning, bookmark, message.into());
  }

  /// Record a logic warning (does not prevent compilation).
  pub fn logic_warning(&mut self, bookmark: Bookmark, message: impl Into<String>) {
    self.record(Severity::LogicWarning, bookmark, message.into());
  }

  /// Record that a declaration cannot be implemented on this platform.
  pub fn platform_not_supported(&mut self, bookmark: Bookmark, message: impl Into<String>) {
    self.record(Severity::PlatformNotSupported, bookmark, message.into());
  }

  /// Emit the final advisory if logic warnings accumulated without errors.
  pub fn finish(&mut self) {
    if self.logic_warnings > 0 && self.errors == 0 {
      self.record(
        Severity::Warning,
        Bookmark::NONE,
        "There were logical errors.\nCompilation will proceed, \
         but the resulting program may be erroneous."
          .into(),
      );
    }
  }
}
