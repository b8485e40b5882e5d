//! Local filesystem access: tree walking and content fingerprints.

pub mod fingerprint;
pub mod walker;

pub use fingerprint::Fingerprint;
