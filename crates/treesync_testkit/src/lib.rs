//! # treesync Testkit
//!
//! Test utilities for treesync.
//!
//! This crate provides:
//! - Clinical entity fixtures (patients, encounters, observations)
//! - In-process parent/child trees wired over loopback transports
//! - Property-based test generators using proptest
//!
//! ## Usage
//!
//! ```rust,ignore
//! use treesync_testkit::prelude::*;
//!
//! #[test]
//! fn child_reaches_parent() {
//!     let hq = TestNode::new("hq");
//!     let clinic = TestNode::new("clinic");
//!     let engine = link(&hq, &clinic);
//!
//!     clinic.create(PATIENT, patient_fields("Ana")).unwrap();
//!     engine.synchronize().unwrap();
//!     assert_eq!(hq.objects.len(), 1);
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod integration;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::integration::*;
}

pub use fixtures::*;
pub use generators::*;
pub use integration::*;
