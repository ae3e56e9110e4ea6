//! Internal tests module
//!
//! Scenario tests spanning several cluster components, with full access to
//! crate internals.

mod test_utils;
