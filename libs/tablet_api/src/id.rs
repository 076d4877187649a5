use std::{fmt, str::FromStr};

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum IdError {
    #[error("invalid hex id: {0}")]
    BadHex(#[from] hex::FromHexError),
}

/// Unique ID of a cluster node. Issued by the topology source; stable for the
/// lifetime of the node.
#[derive(Clone, Copy, Eq, Ord, PartialEq, PartialOrd, Hash, Debug, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HostId(pub u64);

impl fmt::Display for HostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A logical CPU-pinned execution unit within a node. Valid values are
/// `0..node.shard_count`.
#[derive(Clone, Copy, Eq, Ord, PartialEq, PartialOrd, Hash, Debug, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ShardId(pub u32);

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Index of a tablet within its table's tablet map.
#[derive(Clone, Copy, Eq, Ord, PartialEq, PartialOrd, Hash, Debug, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TabletId(pub u64);

impl fmt::Display for TabletId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 128-bit random table ID, rendered as a hex string.
#[derive(Clone, Copy, Eq, Ord, PartialEq, PartialOrd, Hash, Serialize, Deserialize)]
pub struct TableId([u8; 16]);

impl TableId {
    pub fn generate() -> Self {
        let mut buf = [0u8; 16];
        rand::thread_rng().fill(&mut buf);
        TableId(buf)
    }
}

impl From<[u8; 16]> for TableId {
    fn from(b: [u8; 16]) -> Self {
        TableId(b)
    }
}

impl FromStr for TableId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<TableId, Self::Err> {
        let mut buf = [0u8; 16];
        hex::decode_to_slice(s, &mut buf)?;
        Ok(TableId(buf))
    }
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}
