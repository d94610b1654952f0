mod client;
mod error;
mod filter;
mod keypair;
mod note;
mod profile;
mod pubkey;
mod relay;

pub use client::ClientMessage;
pub use error::Error;
pub use filter::Filter;
pub use keypair::{FilledKeypair, FullKeypair, Keypair, SerializableKeypair};
pub use nostr::SecretKey;
pub use note::{Note, NoteBuilder, NoteId, UnsignedNote};
pub use profile::ProfileMetadata;
pub use pubkey::Pubkey;
pub use relay::message::{CommandResult, RelayMessage};
pub use relay::pool::{PoolConfig, RelayAck, RelayPool, Subscription};
pub use relay::{Relay, RelayStatus};

pub type Result<T> = std::result::Result<T, error::Error>;
