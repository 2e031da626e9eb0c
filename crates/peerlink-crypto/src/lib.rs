#![forbid(unsafe_code)]

pub mod hash;
pub mod transcript;
pub mod signature;
pub mod certificate;

pub mod protocol;
pub mod session;
pub mod wrapping;

#[cfg(test)]
mod proptests;
