//! TangoFS test infrastructure.
//!
//! [`harness`] builds a populated in-memory control system and the
//! filesystem over it. The test modules drive that filesystem the way a
//! shell or an editor would.

pub mod harness;

#[cfg(test)]
mod concurrency_tests;
#[cfg(test)]
mod proptest_namespace;

pub use harness::TestTango;
