//! Linux namespace handling.
//!
//! The OCI runtime creates every namespace of a container; the agent only
//! needs to step into a container's network namespace to configure its
//! interface.

pub mod network;
