pub mod auth;
pub mod credential;
pub mod encrypted;
pub mod memory;

pub use auth::{validate_ref_id, AuthCredentialStore};
pub use credential::{CredentialInfo, CredentialRecord, CredentialStore};
pub use encrypted::EncryptedFileStore;
pub use memory::MemoryCredentialStore;
