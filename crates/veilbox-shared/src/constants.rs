/// Number of characters kept from the encoded digest in a share-link token.
pub const TOKEN_LEN: usize = 20;

/// Size of a freshly generated salt in bytes.
pub const SALT_LEN: usize = 16;

/// Prefix of the `/start` payload that opens a chat with a token owner.
pub const CHAT_LINK_PREFIX: &str = "chat-";

/// Default HTTP API port (server)
pub const DEFAULT_HTTP_PORT: u16 = 8080;

/// Snapshot file names inside the data directory
pub const STATES_FILE: &str = "states.json";
pub const BLOCKS_FILE: &str = "blocks.json";
pub const INBOX_FILE: &str = "inbox.json";
pub const HASHES_FILE: &str = "hashes.json";
pub const SALT_FILE: &str = "salt.secret";
