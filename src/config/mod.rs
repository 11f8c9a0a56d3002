//! Configuration
//!
//! Read once at startup from an optional JSON file, then shared immutably.

mod loader;
mod schema;
mod secrets;

pub use schema::*;
pub use secrets::{
    CredentialProvider, EnvCredentialProvider, StaticCredentialProvider, TurnCredentials,
    TURN_CREDENTIAL_ENV, TURN_USERNAME_ENV,
};
