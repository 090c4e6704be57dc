//! Testing infrastructure for fixloop.
//!
//! Scripted stand-ins for the external oracles and a fixture builder for
//! small generated projects, so sessions can run without real compilers or
//! models.
//!
//! # Example
//!
//! ```rust,ignore
//! use fixloop::testing::{MockFixOracle, ProjectFixture, ScriptedValidationOracle};
//!
//! let validation = ScriptedValidationOracle::clean();
//! let oracle = MockFixOracle::always_failing();
//! ProjectFixture::new(temp.path())
//!     .file("src/a.ts", FileRole::Util, "export const a = 1;\n")
//!     .write()?;
//! ```

pub mod fixtures;
pub mod mocks;

pub use fixtures::ProjectFixture;
pub use mocks::{MockFixOracle, ScriptedValidationOracle};
