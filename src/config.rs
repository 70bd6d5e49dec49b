use serde::{Deserialize, Serialize};

/// Settings shared by the accept server and its per-connection channels.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Listen backlog for the accepting socket.
    pub backlog: u32,
    /// Chunk size reserved ahead of each socket read.
    pub read_chunk_size: usize,
    /// Upper bound on unflushed bytes queued for one connection. Appends
    /// past this limit fail instead of growing the buffer.
    pub write_high_water: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 1337,
            backlog: 100,
            read_chunk_size: 4096,
            write_high_water: 4 * 1024 * 1024,
        }
    }
}
