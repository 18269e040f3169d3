// Compile commands
mod compile;
mod compile_check;

pub use compile::*;
pub use compile_check::*;

// Documentation commands
mod doc;
mod doc_check;

pub use doc::*;
pub use doc_check::*;
pub use doc_test::*;

// Lint commands
mod clippy;
mod format;
mod lints;

pub use clippy::*;
pub use format::*;
pub use lints::*;

// Test commands
mod bench_check;

pub use bench_check::*;
pub use test::*;

// Shuttle test suite commands
mod shuttle;
mod shuttle_check;
mod shuttle_clippy;

pub use shuttle::*;
pub use shuttle_check::*;
pub use shuttle_clippy::*;
pub use shuttle_test::*;
