#![forbid(unsafe_code)]
//! Typed host-side control surface for the zones daemon.
//!
//! The daemon exposes its zone lifecycle and provisioning operations over
//! the `zones-ipc` transport; this crate pins down the method-id table and
//! the record types of that protocol and wraps them in [`HostConnection`],
//! one typed call per operation plus notification subscription.
//!
//! ```no_run
//! use zones_control::HostConnection;
//!
//! # fn main() -> Result<(), zones_control::ControlError> {
//! let connection = HostConnection::connect("/run/zones/host.socket".as_ref())?;
//! for id in connection.get_zone_ids()? {
//!     println!("{id}");
//! }
//! connection.start_zone("sandbox")?;
//! # Ok(()) }
//! ```

mod connection;
mod error;
pub mod messages;
pub mod methods;

pub use connection::HostConnection;
pub use error::ControlError;

#[cfg(test)]
mod tests;
