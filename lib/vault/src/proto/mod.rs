//! The protocol modules handle framing and transport of the request/reply
//! messages exchanged between clients and the storage daemon.

pub mod message;
pub mod support;
