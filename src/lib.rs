#![doc = include_str!("../README.md")]
#![forbid(unsafe_code)]
#![deny(missing_debug_implementations, nonstandard_style)]
#![warn(unreachable_pub)]

#[macro_use]
extern crate serde_derive;

extern crate serde;
extern crate serde_json;

#[cfg(doctest)]
mod doctests {
    doc_comment::doctest!("../README.md");
}

pub mod builder;
pub mod bundle;
pub mod catalog;
pub mod engine;
pub mod host;
pub mod instance;
pub mod profile;
pub mod registry;

pub use host::Host;
pub use instance::{InstanceController, InstanceError, InstanceEvent, InstanceState};
pub use profile::{GuestKind, VmId, VmProfile};
pub use registry::{InstanceRegistry, RegistryError};
