//! Types shared by every huddle crate: identifiers, session domain records,
//! the signaling wire protocol and the error taxonomy.

pub mod constants;
pub mod error;
pub mod models;
pub mod protocol;
pub mod types;

pub use error::{
    DeviceSwitchError, MediaAccessError, NegotiationError, SessionError, TransportError,
    ValidationError,
};
