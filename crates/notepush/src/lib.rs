pub mod accounts;
pub mod actions;
pub mod auth;
pub mod bunker;
mod error;
pub mod mailbox;
mod signer;
pub mod storage;

pub use accounts::{AccountKey, Accounts};
pub use bunker::registry::SignerRegistry;
pub use bunker::{BridgeConfig, BridgeState, BunkerConnection, BunkerPointer, NIP46_KIND};
pub use error::{Error, Result};
pub use mailbox::{Mailbox, MailboxMessage, MailboxMessageType, MAILBOX_KIND};
pub use signer::{LocalSigner, Signer};
pub use storage::{DataPath, FileKeyStorage};
