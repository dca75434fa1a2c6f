//! Testing infrastructure for tetrad.
//!
//! This module provides test doubles and assertions for exercising the
//! scheduler without real drivers or a human at the terminal.
//!
//! # Architecture
//!
//! - **Mocks**: scripted [`RoleDriver`](crate::driver::RoleDriver) and
//!   [`Approver`](crate::approval::Approver) implementations
//! - **Fixtures**: temporary workspaces wired to a scheduler (test-only)
//! - **Assertions**: checks over session state and attempt history
//!
//! # Example
//!
//! ```rust,ignore
//! use tetrad::testing::{ScriptedApprover, ScriptedDriver};
//!
//! let driver = ScriptedDriver::new()
//!     .respond(DriverResponse::approve())
//!     .fail("garbled");
//! let approver = ScriptedApprover::new().approve().deny("too risky");
//! ```

pub mod assertions;
#[cfg(test)]
pub mod fixtures;
pub mod mocks;

pub use assertions::*;
#[cfg(test)]
pub use fixtures::*;
pub use mocks::*;
