use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Current protocol version.  Bump this when the wire format changes in a
/// breaking way.  UI clients check this on connect.
pub const PROTOCOL_VERSION: u32 = 1;

/// Largest frame body either side accepts.
pub const MAX_FRAME_LEN: usize = 1 << 20;

/// Messages sent from the UI to the daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "cmd")]
pub enum Command {
    /// Drop the current session and re-authenticate.
    Logout,
    /// Ask for a fresh property snapshot.
    GetProperties,
}

/// Messages sent from the daemon to the UI (broadcasts)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "broadcast")]
pub enum Broadcast {
    /// Sent immediately on connect: protocol version + full property snapshot.
    Hello {
        protocol_version: u32,
        rev: u64,
        properties: BTreeMap<String, String>,
    },
    /// The shared properties changed.
    Properties {
        rev: u64,
        properties: BTreeMap<String, String>,
    },
    /// The UI should re-render whatever it shows from the session.
    Refresh,
    Log {
        message: String,
    },
}

/// Wrapper for socket communication
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Message {
    Command(Command),
    Broadcast(Broadcast),
}

impl Message {
    pub fn encode(&self) -> anyhow::Result<Vec<u8>> {
        let json = serde_json::to_vec(self)?;
        let len = json.len() as u32;
        let mut result = Vec::with_capacity(4 + json.len());
        result.extend_from_slice(&len.to_be_bytes());
        result.extend_from_slice(&json);
        Ok(result)
    }

    /// Body length announced by the frame header, if the header is complete.
    pub fn frame_len(data: &[u8]) -> Option<usize> {
        let header: [u8; 4] = data.get(..4)?.try_into().ok()?;
        Some(u32::from_be_bytes(header) as usize)
    }

    pub fn decode(data: &[u8]) -> anyhow::Result<(Self, usize)> {
        if data.len() < 4 {
            anyhow::bail!("Insufficient data for length header");
        }
        let len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
        if data.len() < 4 + len {
            anyhow::bail!("Insufficient data for message");
        }
        let msg: Self = serde_json::from_slice(&data[4..4 + len])?;
        Ok((msg, 4 + len))
    }
}
