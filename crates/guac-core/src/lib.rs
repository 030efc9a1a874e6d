//! guac-core: Shared protocol library for the guacd gateway.
//!
//! Provides the length-prefixed instruction codec, encrypted connection
//! token handling, connection settings resolution, and upgrade-request
//! query parsing.

pub mod codec;
pub mod error;
pub mod query;
pub mod settings;
pub mod token;

// Re-export commonly used items at crate root.
pub use codec::{decode_one, encode, Instruction, InstructionBuffer};
pub use error::{GuacError, GuacResult};
pub use query::QueryParams;
pub use settings::{ConnectionSettings, ConnectionType, Dimensions, SettingsResolver};
pub use token::{generate_key, CipherAlgorithm, TokenCipher, TokenPayload};
