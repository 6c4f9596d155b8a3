pub mod config;
pub mod credentials;
pub mod crypto;
pub mod devices;
pub mod error;
pub mod groups;
pub mod guard;
pub mod jid;
pub mod message;
pub mod node;
pub mod relay;
pub mod retry;
pub mod sender_key_memory;
pub mod session_store;
pub mod sessions;
pub mod stanza;
pub mod storage;
pub mod test_utils;
pub mod trackers;
pub mod transport;

pub use config::RelayConfig;
pub use credentials::{Credentials, CredentialsHandle};
pub use crypto::{
    CiphertextType, CryptoPrimitives, CryptoRepository, Envelope, GroupCiphertext, PreKey,
    PreKeyBundle, SignedPreKey,
};
pub use devices::DeviceDirectory;
pub use error::{Error, ErrorKind, Result};
pub use groups::{AddressingMode, GroupDirectory, GroupMetadata, GroupParticipant};
pub use guard::ExclusiveGuard;
pub use jid::{DeviceEntry, Jid, ProtocolAddress, Server};
pub use message::{generate_message_id, MediaInfo, Message, MessageKey};
pub use node::{BinaryNode, NodeContent};
pub use relay::{
    DestinationKind, MessageRelay, RelayContext, RelayOptions, RetryReceipt, TickReport,
};
pub use retry::{RetryConfig, RetryQueue, RetryRecord, RetryScheduler, RetryState};
pub use sender_key_memory::SenderKeyMemory;
pub use session_store::{SenderKeyName, SenderKeyRecord, SessionRecord, SessionStore};
pub use sessions::SessionAssertion;
pub use stanza::{participant_hash, DeviceCiphertext, StanzaBuilder};
pub use storage::{InMemoryStorage, StorageAdapter};
pub use trackers::{
    Mutation, MutationKind, MutationTracker, Presence, PresenceTracker, PresenceUpdate,
    RecentMessageCache, RetryReceiptCounter, TrackerTable, Trackers,
};
pub use transport::{ChannelTransport, Transport, TransportEvent};
