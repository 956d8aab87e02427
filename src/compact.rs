//! Compact peer and node records of the KRPC protocol.
//!
//! A peer is `ip || port` (6 bytes for IPv4, 18 for IPv6), a node is `id || ipv4 || port`.

use crate::id::NODE_ID_LEN;
use std::{
    convert::TryInto,
    net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6},
};

const PEER_V4_LEN: usize = 6;
const PEER_V6_LEN: usize = 18;

/// Length of a compact node record.
pub(crate) const NODE_HANDLE_V4_LEN: usize = NODE_ID_LEN + PEER_V4_LEN;

/// `values`: a list of compact peers, one byte string each.
pub(crate) mod values {
    use serde::{de::Error as _, Deserialize, Deserializer, Serialize, Serializer};
    use serde_bytes::ByteBuf;
    use std::net::SocketAddr;

    pub(crate) fn serialize<S: Serializer>(addrs: &[SocketAddr], s: S) -> Result<S::Ok, S::Error> {
        addrs
            .iter()
            .map(|addr| ByteBuf::from(super::encode_peer(addr)))
            .collect::<Vec<_>>()
            .serialize(s)
    }

    pub(crate) fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<SocketAddr>, D::Error> {
        Vec::<ByteBuf>::deserialize(d)?
            .iter()
            .map(|peer| {
                super::decode_peer(peer).ok_or_else(|| {
                    D::Error::invalid_length(peer.len(), &"a 6 or 18 byte compact peer")
                })
            })
            .collect()
    }
}

/// `nodes`: a single byte string of concatenated compact IPv4 nodes.
pub(crate) mod nodes_v4 {
    use super::{decode_peer, encode_peer, NODE_HANDLE_V4_LEN};
    use crate::{id::NODE_ID_LEN, routing::node::NodeHandle};
    use serde::{de::Error as _, ser::Error as _, Deserialize, Deserializer, Serializer};
    use serde_bytes::ByteBuf;
    use std::convert::TryFrom;

    pub(crate) fn serialize<S: Serializer>(nodes: &[NodeHandle], s: S) -> Result<S::Ok, S::Error> {
        let mut buffer = Vec::with_capacity(nodes.len() * NODE_HANDLE_V4_LEN);

        for node in nodes {
            if !node.addr.is_ipv4() {
                return Err(S::Error::custom(format!("{} is not an ipv4 node", node.addr)));
            }

            buffer.extend_from_slice(node.id.as_ref());
            buffer.extend_from_slice(&encode_peer(&node.addr));
        }

        s.serialize_bytes(&buffer)
    }

    pub(crate) fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<NodeHandle>, D::Error> {
        let buffer = ByteBuf::deserialize(d)?;

        if buffer.len() % NODE_HANDLE_V4_LEN != 0 {
            return Err(D::Error::invalid_length(buffer.len(), &"a multiple of 26 bytes"));
        }

        buffer
            .chunks_exact(NODE_HANDLE_V4_LEN)
            .map(|record| {
                let (id, peer) = record.split_at(NODE_ID_LEN);

                match (TryFrom::try_from(id), decode_peer(peer)) {
                    (Ok(id), Some(addr)) => Ok(NodeHandle::new(id, addr)),
                    _ => Err(D::Error::custom("malformed compact node")),
                }
            })
            .collect()
    }
}

fn decode_peer(bytes: &[u8]) -> Option<SocketAddr> {
    match bytes.len() {
        PEER_V4_LEN => {
            let ip: [u8; 4] = bytes[..4].try_into().ok()?;
            let port = u16::from_be_bytes(bytes[4..].try_into().ok()?);
            Some(SocketAddrV4::new(Ipv4Addr::from(ip), port).into())
        }
        PEER_V6_LEN => {
            let ip: [u8; 16] = bytes[..16].try_into().ok()?;
            let port = u16::from_be_bytes(bytes[16..].try_into().ok()?);
            Some(SocketAddrV6::new(Ipv6Addr::from(ip), port, 0, 0).into())
        }
        _ => None,
    }
}

fn encode_peer(addr: &SocketAddr) -> Vec<u8> {
    let mut bytes = match addr {
        SocketAddr::V4(addr) => addr.ip().octets().to_vec(),
        SocketAddr::V6(addr) => addr.ip().octets().to_vec(),
    };

    bytes.extend_from_slice(&addr.port().to_be_bytes());
    bytes
}
