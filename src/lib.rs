pub mod envelope;
pub mod error;
pub mod installer;
pub mod keys;
pub mod package;
pub mod password;
pub mod wire;
