//! An association-oriented DIMSE engine.
//!
//! [`association`] negotiates presentation contexts and owns the lifecycle of associations.
//! [`dimse`] dispatches operations on them and answers the requests peers send back, and
//! [`forward`] relays retrieved instances to a third node on an association that is
//! renegotiated whenever a new kind of instance arrives. Every operation reports to a
//! [`progress::Progress`].

pub mod association;
pub mod config;
pub mod dimse;
pub mod forward;
pub mod node;
pub mod progress;
pub mod types;

/// The implementation class UID for DICOM-RELAY.
/// The UID is a randomly generated UUID represented as a single integer value under the 2.25 root.
pub const IMPLEMENTATION_CLASS_UID: &str = "2.25.94508551356620097453554517680708411706";

/// The implementation version name for DICOM-RELAY.
/// It consists of the string "DICOM-RELAY" followed by the crate version.
pub const IMPLEMENTATION_VERSION_NAME: &str = concat!("DICOM-RELAY ", env!("CARGO_PKG_VERSION"));

pub const DEFAULT_AET: &str = "DICOM-RELAY";
