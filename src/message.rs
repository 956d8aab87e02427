use crate::{
    bloom::BloomFilter,
    compact,
    id::{InfoHash, NodeId},
    routing::node::NodeHandle,
};
use serde::{
    de::{Deserializer, Error as _, IgnoredAny, SeqAccess, Visitor},
    ser::{SerializeSeq, Serializer},
    Deserialize, Serialize,
};
use std::{convert::TryFrom, fmt, net::SocketAddr};

#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub(crate) struct Message {
    #[serde(rename = "t", with = "serde_bytes")]
    pub transaction_id: Vec<u8>,
    #[serde(
        rename = "v",
        with = "serde_bytes",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub version: Option<Vec<u8>>,
    #[serde(flatten)]
    pub body: MessageBody,
}

impl Message {
    /// Decode the message from bencode.
    pub fn decode(input: &[u8]) -> Result<Self, serde_bencode::Error> {
        serde_bencode::from_bytes(input)
    }

    /// Encode the message into bencode.
    pub fn encode(&self) -> Result<Vec<u8>, serde_bencode::Error> {
        serde_bencode::to_bytes(self)
    }
}

#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
#[serde(tag = "y")]
pub(crate) enum MessageBody {
    #[serde(rename = "q")]
    Request(Request),
    #[serde(rename = "r", with = "unflatten::response")]
    Response(Response),
    #[serde(rename = "e", with = "unflatten::error")]
    Error(Error),
}

// Opposite of `serde(flatten)` - artificially add one level of nesting to a field.
mod unflatten {
    macro_rules! impl_unflatten {
        ($mod:ident, $field:literal) => {
            pub(crate) mod $mod {
                use serde::{Deserialize, Deserializer, Serialize, Serializer};

                #[derive(Serialize, Deserialize)]
                struct Wrapper<T> {
                    #[serde(rename = $field)]
                    field: T,
                }

                pub(crate) fn serialize<T: Serialize, S: Serializer>(
                    value: &T,
                    s: S,
                ) -> Result<S::Ok, S::Error> {
                    Wrapper { field: value }.serialize(s)
                }

                pub(crate) fn deserialize<'de, T: Deserialize<'de>, D: Deserializer<'de>>(
                    d: D,
                ) -> Result<T, D::Error> {
                    let wrapper = Wrapper::deserialize(d)?;
                    Ok(wrapper.field)
                }
            }
        };
    }

    impl_unflatten!(response, "r");
    impl_unflatten!(error, "e");
}

#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
#[serde(tag = "q", content = "a")]
#[serde(rename_all = "snake_case")]
pub(crate) enum Request {
    Ping(PingRequest),
    FindNode(FindNodeRequest),
    GetPeers(GetPeersRequest),
}

impl Request {
    /// Id of the querying node.
    pub fn sender_id(&self) -> NodeId {
        match self {
            Self::Ping(r) => r.id,
            Self::FindNode(r) => r.id,
            Self::GetPeers(r) => r.id,
        }
    }
}

#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub(crate) struct PingRequest {
    pub id: NodeId,
}

#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub(crate) struct FindNodeRequest {
    pub id: NodeId,
    pub target: NodeId,
}

#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub(crate) struct GetPeersRequest {
    pub id: NodeId,
    pub info_hash: InfoHash,

    // BEP33: do not include seeds in `values`.
    #[serde(with = "flag", default, skip_serializing_if = "is_false")]
    pub noseed: bool,

    // BEP33: reply with the `BFsd` and `BFpe` Bloom filters.
    #[serde(with = "flag", default, skip_serializing_if = "is_false")]
    pub scrape: bool,
}

fn is_false(b: &bool) -> bool {
    !*b
}

/// Boolean carried as a bencoded integer (`i1e`).
mod flag {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub(super) fn serialize<S: Serializer>(flag: &bool, s: S) -> Result<S::Ok, S::Error> {
        (*flag as u8).serialize(s)
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<bool, D::Error> {
        let num = i64::deserialize(d)?;
        Ok(num > 0)
    }
}

/// Response to any of the queries. Which query it answers is only known from the transaction
/// id, so every field but `id` is optional.
#[derive(Clone, Eq, PartialEq, Debug, Default, Serialize, Deserialize)]
pub(crate) struct Response {
    pub id: NodeId,

    #[serde(
        with = "compact::nodes_v4",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub nodes: Vec<NodeHandle>,

    #[serde(
        with = "compact::values",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub values: Vec<SocketAddr>,

    #[serde(with = "serde_bytes", default, skip_serializing_if = "Option::is_none")]
    pub token: Option<Vec<u8>>,

    #[serde(
        rename = "BFsd",
        with = "serde_bytes",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub bf_seeders: Option<Vec<u8>>,

    #[serde(
        rename = "BFpe",
        with = "serde_bytes",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub bf_peers: Option<Vec<u8>>,
}

/// What a response carries for a health lookup.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub(crate) enum ScrapeFilters {
    /// Neither filter present: the response is only a walk hint.
    Missing,
    /// At least one filter is absent or has the wrong length.
    Malformed,
    Valid {
        seeders: BloomFilter,
        peers: BloomFilter,
    },
}

impl Response {
    pub fn scrape_filters(&self) -> ScrapeFilters {
        match (&self.bf_seeders, &self.bf_peers) {
            (None, None) => ScrapeFilters::Missing,
            (Some(seeders), Some(peers)) => {
                match (
                    BloomFilter::try_from(&seeders[..]),
                    BloomFilter::try_from(&peers[..]),
                ) {
                    (Ok(seeders), Ok(peers)) => ScrapeFilters::Valid { seeders, peers },
                    _ => ScrapeFilters::Malformed,
                }
            }
            _ => ScrapeFilters::Malformed,
        }
    }
}

#[derive(Clone, Eq, PartialEq, Debug)]
pub(crate) struct Error {
    pub code: u8,
    pub message: String,
}

// Using custom Serialize/Deserialize impls because the format is too weird.
impl Serialize for Error {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        let mut seq = s.serialize_seq(Some(2))?;
        seq.serialize_element(&self.code)?;
        seq.serialize_element(&self.message)?;
        seq.end()
    }
}

impl<'de> Deserialize<'de> for Error {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        struct ErrorVisitor;

        impl<'de> Visitor<'de> for ErrorVisitor {
            type Value = Error;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                write!(f, "a list of two elements: an integer and a string")
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
                let code: u8 = seq
                    .next_element()?
                    .ok_or_else(|| A::Error::invalid_length(0, &self))?;
                let message = seq
                    .next_element()?
                    .ok_or_else(|| A::Error::invalid_length(1, &self))?;

                // Make sure the list is consumed to the end.
                if seq.next_element::<IgnoredAny>()?.is_some() {
                    return Err(A::Error::invalid_length(3, &self));
                }

                Ok(Error { code, message })
            }
        }

        d.deserialize_seq(ErrorVisitor)
    }
}

pub mod error_code {
    // some of these codes are not used in this crate but we still list them here for completeness.
    #![allow(unused)]

    pub const GENERIC_ERROR: u8 = 201;
    pub const SERVER_ERROR: u8 = 202;
    pub const PROTOCOL_ERROR: u8 = 203;
    pub const METHOD_UNKNOWN: u8 = 204;
}
