//! State Codec
//!
//! Serializes cluster-state snapshots for the wire. The first byte is a
//! format version so incompatible encodings fail loudly instead of
//! decoding garbage.

use bytes::Bytes;

use crate::error::{Error, Result};
use crate::state::ClusterState;

/// Encode/decode cluster-state snapshots
pub trait StateCodec: Send + Sync + 'static {
    fn encode(&self, state: &ClusterState) -> Result<Bytes>;
    fn decode(&self, bytes: &[u8]) -> Result<ClusterState>;
}

/// Current encoding format version
const FORMAT_VERSION: u8 = 1;

/// Default codec: format byte + bincode body
#[derive(Debug, Clone, Copy, Default)]
pub struct BincodeStateCodec;

impl StateCodec for BincodeStateCodec {
    fn encode(&self, state: &ClusterState) -> Result<Bytes> {
        let mut buf = vec![FORMAT_VERSION];
        bincode::serialize_into(&mut buf, state)?;
        Ok(Bytes::from(buf))
    }

    fn decode(&self, bytes: &[u8]) -> Result<ClusterState> {
        let (&version, body) = bytes
            .split_first()
            .ok_or_else(|| Error::Network("empty state payload".into()))?;
        if version != FORMAT_VERSION {
            return Err(Error::UnsupportedStateVersion(version));
        }
        Ok(bincode::deserialize(body)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::membership::{Address, NodeId};
    use crate::state::NodeInfo;

    #[test]
    fn test_roundtrip() {
        let mut state = ClusterState::initial();
        state.version = 12;
        let id = NodeId::from_raw("n1");
        state.master_node_id = Some(id.clone());
        state.nodes.nodes.insert(
            id.clone(),
            NodeInfo {
                node_id: id,
                address: Address::new("seed-1", 9400),
            },
        );

        let codec = BincodeStateCodec;
        let bytes = codec.encode(&state).unwrap();
        let decoded = codec.decode(&bytes).unwrap();
        assert_eq!(decoded, state);
    }

    #[test]
    fn test_unknown_format_version_rejected() {
        let codec = BincodeStateCodec;
        let mut bytes = codec.encode(&ClusterState::initial()).unwrap().to_vec();
        bytes[0] = 99;
        let err = codec.decode(&bytes).unwrap_err();
        assert!(matches!(err, Error::UnsupportedStateVersion(99)));
    }

    #[test]
    fn test_empty_payload_rejected() {
        assert!(BincodeStateCodec.decode(&[]).is_err());
    }
}
