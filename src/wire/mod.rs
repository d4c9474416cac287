//! Wire message types and their `%LOR` binary encoding (spec §4.3, §6).

pub mod codec;

use codec::{Reader, WireError, write_bytes, write_magic, write_string, write_uleb128};

use crate::channel::ChannelId;
use crate::identity::{PeerKind, RepoIdentity};

pub type DocId = String;
pub type Namespace = String;

/// Opaque version-vector bytes as produced by the CRDT runtime. The
/// synchronizer never interprets these bytes itself — it only compares
/// them for equality and forwards them verbatim (spec §1 Non-goals).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct VersionVector(pub Vec<u8>);

impl VersionVector {
    pub fn empty() -> Self {
        Self(Vec::new())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncTransmission {
    Snapshot { data: Vec<u8>, version: VersionVector },
    Update { data: Vec<u8>, version: VersionVector },
    UpToDate { version: VersionVector },
    Unavailable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EphemeralEntry {
    pub peer_id: String,
    pub namespace: Namespace,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelMsg {
    EstablishRequest { identity: RepoIdentity },
    EstablishResponse { identity: RepoIdentity },
    DirectoryRequest,
    DirectoryResponse { doc_ids: Vec<DocId> },
    SyncRequest { doc_id: DocId, requester_version: VersionVector, bidirectional: bool },
    Sync { doc_id: DocId, transmission: SyncTransmission },
    Delete { doc_id: DocId },
    Ephemeral { doc_id: DocId, hops_remaining: u8, stores: Vec<EphemeralEntry> },
    Batch { messages: Vec<ChannelMsg> },
}

const TYPE_ESTABLISH_REQUEST: u8 = 0;
const TYPE_ESTABLISH_RESPONSE: u8 = 1;
const TYPE_DIRECTORY_REQUEST: u8 = 2;
const TYPE_DIRECTORY_RESPONSE: u8 = 3;
const TYPE_SYNC_REQUEST: u8 = 4;
const TYPE_SYNC: u8 = 5;
const TYPE_DELETE: u8 = 6;
const TYPE_EPHEMERAL: u8 = 7;
const TYPE_BATCH: u8 = 8;

const TRANS_SNAPSHOT: u8 = 0;
const TRANS_UPDATE: u8 = 1;
const TRANS_UP_TO_DATE: u8 = 2;
const TRANS_UNAVAILABLE: u8 = 3;

fn write_identity(buf: &mut Vec<u8>, identity: &RepoIdentity) {
    write_string(buf, &identity.peer_id);
    write_string(buf, &identity.name);
    buf.push(match identity.kind {
        PeerKind::User => 0,
        PeerKind::Service => 1,
    });
}

fn read_identity(r: &mut Reader) -> Result<RepoIdentity, WireError> {
    let peer_id = r.read_string()?;
    let name = r.read_string()?;
    let kind = match r.read_u8()? {
        0 => PeerKind::User,
        1 => PeerKind::Service,
        other => return Err(WireError::UnknownType(other)),
    };
    Ok(RepoIdentity::new(peer_id, name, kind))
}

fn write_version(buf: &mut Vec<u8>, v: &VersionVector) {
    write_bytes(buf, &v.0);
}

fn read_version(r: &mut Reader) -> Result<VersionVector, WireError> {
    Ok(VersionVector(r.read_bytes()?.to_vec()))
}

fn write_transmission(buf: &mut Vec<u8>, t: &SyncTransmission) {
    match t {
        SyncTransmission::Snapshot { data, version } => {
            buf.push(TRANS_SNAPSHOT);
            write_bytes(buf, data);
            write_version(buf, version);
        }
        SyncTransmission::Update { data, version } => {
            buf.push(TRANS_UPDATE);
            write_bytes(buf, data);
            write_version(buf, version);
        }
        SyncTransmission::UpToDate { version } => {
            buf.push(TRANS_UP_TO_DATE);
            write_version(buf, version);
        }
        SyncTransmission::Unavailable => {
            buf.push(TRANS_UNAVAILABLE);
        }
    }
}

fn read_transmission(r: &mut Reader) -> Result<SyncTransmission, WireError> {
    Ok(match r.read_u8()? {
        TRANS_SNAPSHOT => SyncTransmission::Snapshot { data: r.read_bytes()?.to_vec(), version: read_version(r)? },
        TRANS_UPDATE => SyncTransmission::Update { data: r.read_bytes()?.to_vec(), version: read_version(r)? },
        TRANS_UP_TO_DATE => SyncTransmission::UpToDate { version: read_version(r)? },
        TRANS_UNAVAILABLE => SyncTransmission::Unavailable,
        other => return Err(WireError::UnknownType(other)),
    })
}

impl ChannelMsg {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        write_magic(&mut buf);
        self.encode_body(&mut buf);
        buf
    }

    /// Encodes type tag + fields, without the magic prefix — used both for
    /// top-level frames and for messages nested inside a `Batch`.
    fn encode_body(&self, buf: &mut Vec<u8>) {
        match self {
            ChannelMsg::EstablishRequest { identity } => {
                buf.push(TYPE_ESTABLISH_REQUEST);
                write_identity(buf, identity);
            }
            ChannelMsg::EstablishResponse { identity } => {
                buf.push(TYPE_ESTABLISH_RESPONSE);
                write_identity(buf, identity);
            }
            ChannelMsg::DirectoryRequest => {
                buf.push(TYPE_DIRECTORY_REQUEST);
            }
            ChannelMsg::DirectoryResponse { doc_ids } => {
                buf.push(TYPE_DIRECTORY_RESPONSE);
                write_uleb128(buf, doc_ids.len() as u64);
                for id in doc_ids {
                    write_string(buf, id);
                }
            }
            ChannelMsg::SyncRequest { doc_id, requester_version, bidirectional } => {
                buf.push(TYPE_SYNC_REQUEST);
                write_string(buf, doc_id);
                write_version(buf, requester_version);
                buf.push(u8::from(*bidirectional));
            }
            ChannelMsg::Sync { doc_id, transmission } => {
                buf.push(TYPE_SYNC);
                write_string(buf, doc_id);
                write_transmission(buf, transmission);
            }
            ChannelMsg::Delete { doc_id } => {
                buf.push(TYPE_DELETE);
                write_string(buf, doc_id);
            }
            ChannelMsg::Ephemeral { doc_id, hops_remaining, stores } => {
                buf.push(TYPE_EPHEMERAL);
                write_string(buf, doc_id);
                buf.push(*hops_remaining);
                write_uleb128(buf, stores.len() as u64);
                for entry in stores {
                    write_string(buf, &entry.peer_id);
                    write_string(buf, &entry.namespace);
                    write_bytes(buf, &entry.data);
                }
            }
            ChannelMsg::Batch { messages } => {
                buf.push(TYPE_BATCH);
                write_uleb128(buf, messages.len() as u64);
                for m in messages {
                    m.encode_body(buf);
                }
            }
        }
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        let mut r = Reader::new(bytes);
        r.read_magic()?;
        Self::decode_body(&mut r)
    }

    fn decode_body(r: &mut Reader) -> Result<Self, WireError> {
        let tag = r.read_u8()?;
        Ok(match tag {
            TYPE_ESTABLISH_REQUEST => ChannelMsg::EstablishRequest { identity: read_identity(r)? },
            TYPE_ESTABLISH_RESPONSE => ChannelMsg::EstablishResponse { identity: read_identity(r)? },
            TYPE_DIRECTORY_REQUEST => ChannelMsg::DirectoryRequest,
            TYPE_DIRECTORY_RESPONSE => {
                let count = r.read_uleb128()?;
                let mut doc_ids = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    doc_ids.push(r.read_string()?);
                }
                ChannelMsg::DirectoryResponse { doc_ids }
            }
            TYPE_SYNC_REQUEST => {
                let doc_id = r.read_string()?;
                let requester_version = read_version(r)?;
                let bidirectional = r.read_u8()? != 0;
                ChannelMsg::SyncRequest { doc_id, requester_version, bidirectional }
            }
            TYPE_SYNC => {
                let doc_id = r.read_string()?;
                let transmission = read_transmission(r)?;
                ChannelMsg::Sync { doc_id, transmission }
            }
            TYPE_DELETE => ChannelMsg::Delete { doc_id: r.read_string()? },
            TYPE_EPHEMERAL => {
                let doc_id = r.read_string()?;
                let hops_remaining = r.read_u8()?;
                let count = r.read_uleb128()?;
                let mut stores = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    stores.push(EphemeralEntry {
                        peer_id: r.read_string()?,
                        namespace: r.read_string()?,
                        data: r.read_bytes()?.to_vec(),
                    });
                }
                ChannelMsg::Ephemeral { doc_id, hops_remaining, stores }
            }
            TYPE_BATCH => {
                let count = r.read_uleb128()?;
                let mut messages = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    messages.push(Self::decode_body(r)?);
                }
                ChannelMsg::Batch { messages }
            }
            other => return Err(WireError::UnknownType(other)),
        })
    }
}

/// A send unit. Establishment envelopes may reach `Pending` channels;
/// established envelopes are dropped by the adapter for any target not
/// currently `Established` (spec §4.2, §4.3).
#[derive(Debug, Clone)]
pub enum Envelope {
    Establishment { to: ChannelId, msg: ChannelMsg },
    Established { to: Vec<ChannelId>, msg: ChannelMsg },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::PeerKind;

    fn sample_messages() -> Vec<ChannelMsg> {
        vec![
            ChannelMsg::EstablishRequest {
                identity: RepoIdentity::new("1", "alice", PeerKind::User),
            },
            ChannelMsg::DirectoryRequest,
            ChannelMsg::DirectoryResponse { doc_ids: vec!["d1".into(), "文档".into()] },
            ChannelMsg::SyncRequest {
                doc_id: "d1".into(),
                requester_version: VersionVector::empty(),
                bidirectional: true,
            },
            ChannelMsg::Sync {
                doc_id: "d1".into(),
                transmission: SyncTransmission::Snapshot {
                    data: vec![1, 2, 3],
                    version: VersionVector(vec![9, 9]),
                },
            },
            ChannelMsg::Sync { doc_id: "d1".into(), transmission: SyncTransmission::Unavailable },
            ChannelMsg::Delete { doc_id: "d1".into() },
            ChannelMsg::Ephemeral {
                doc_id: "d1".into(),
                hops_remaining: 1,
                stores: vec![EphemeralEntry { peer_id: "2".into(), namespace: "cursor".into(), data: vec![] }],
            },
        ]
    }

    #[test]
    fn every_message_kind_round_trips() {
        for msg in sample_messages() {
            let bytes = msg.encode();
            let decoded = ChannelMsg::decode(&bytes).unwrap();
            assert_eq!(msg, decoded);
        }
    }

    #[test]
    fn batch_nests_and_round_trips() {
        let batch = ChannelMsg::Batch { messages: sample_messages() };
        let bytes = batch.encode();
        assert_eq!(ChannelMsg::decode(&bytes).unwrap(), batch);
    }

    #[test]
    fn bad_magic_raises_decode_error() {
        let err = ChannelMsg::decode(&[0, 0, 0, 0, 0]).unwrap_err();
        assert_eq!(err, WireError::BadMagic);
    }

    #[test]
    fn unknown_type_raises_decode_error() {
        let mut bytes = codec::MAGIC.to_vec();
        bytes.push(0xFF);
        assert_eq!(ChannelMsg::decode(&bytes).unwrap_err(), WireError::UnknownType(0xFF));
    }
}
