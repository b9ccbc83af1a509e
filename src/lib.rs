// Append-only audit trail
pub mod audit;

// Operational command line
pub mod cli;

// TOML + environment configuration
pub mod config;

// Explicit process wiring
pub mod context;

// OAuth credential payload
pub mod credential;

// Key derivation, AEAD, secret hygiene
pub mod crypto;

// Token issuer seam and OAuth implementation
pub mod issuer;

// Versioned key registry
pub mod keys;

// Credential state machine and refresh coalescing
pub mod lifecycle;

// Rotate / migrate / verify / authorize reports
pub mod ops;

// Encrypted credential persistence
pub mod store;

pub use context::CredentialContext;
pub use credential::{Credential, TokenGrant};
pub use lifecycle::{LifecycleError, LifecycleManager, LifecycleState, TokenSource};
