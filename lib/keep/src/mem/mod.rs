//! Hardened memory: page granular, `mlock` pinned storage that is filled
//! with entropy on release so secret material never outlives its owner.

pub mod alloc;
pub mod secured;
