//! Wire messages for the three replication calls and the change payloads
//! they carry.
//!
//! A pull conversation is one or more `GetChanges` round trips followed
//! by an optional `UpdateRefs`. Notifies are a single `ReplicaSync`.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ids::{DsaId, InvocationId, NcId, Usn};
use crate::metadata::UtdEntry;

/// Result code for a successful remote call.
pub const DRS_OK: u32 = 0;

/// Operations master roles a server can hold for a partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FsmoRole {
    /// Owns schema changes.
    Schema,
    /// Owns partition creation and removal.
    DomainNaming,
    /// Hands out relative-identifier pools.
    Rid,
    /// Primary emulator for legacy operations and urgent changes.
    Pdc,
    /// Owns cross-partition reference fixup.
    Infrastructure,
}

/// Extended operation piggybacked on a pull. An extended pull makes
/// exactly one `GetChanges` call regardless of how much data remains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExtendedOp {
    /// Ask the current owner to hand over a role.
    FsmoTransfer {
        /// Role to transfer.
        role: FsmoRole,
    },
    /// Ask the pool master for a fresh identifier-pool allocation.
    RidAllocation,
    /// Replicate a single secret-bearing object immediately.
    SecretReplication {
        /// The object whose secrets are needed.
        object: Uuid,
    },
}

/// A `GetChanges` request: give me changes for `nc` past `cursor` that I
/// have not already seen according to `utd`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequest {
    /// Partition to pull.
    pub nc: NcId,
    /// Requesting server GUID.
    pub dest_guid: DsaId,
    /// Requesting server database epoch.
    pub dest_invocation: InvocationId,
    /// Highest source USN already applied; the source resumes past it.
    pub cursor: Usn,
    /// The requester's up-to-dateness vector, used by the source to skip
    /// changes the requester already has from elsewhere.
    pub utd: Vec<UtdEntry>,
    /// Batch limit in objects.
    pub max_objects: u32,
    /// Batch limit in value bytes.
    pub max_bytes: u32,
    /// Option bits; see [`crate::objects::options`].
    pub options: u32,
    /// Extended operation, if this pull carries one.
    pub extended: Option<ExtendedOp>,
    /// For extended operations, the source USN the requester must reach
    /// before the operation is complete, when known.
    pub target_usn: Option<Usn>,
}

/// One attribute of a replicated object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplAttr {
    /// Attribute identifier.
    pub attr_id: u32,
    /// Per-attribute version, incremented on every originating write.
    pub version: u32,
    /// Originating epoch of the newest write.
    pub originating_invocation: InvocationId,
    /// Originating USN of the newest write.
    pub originating_usn: Usn,
    /// Attribute values. Encoding depends on the attribute's syntax.
    pub values: Vec<Bytes>,
}

/// One replicated object in a pull reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplObject {
    /// Object GUID.
    pub guid: Uuid,
    /// Distinguished name at the source.
    pub dn: String,
    /// Object class identifier.
    pub class_id: u32,
    /// True if the object is a tombstone.
    pub is_deleted: bool,
    /// Attributes at or past the requested cursor.
    pub attrs: Vec<ReplAttr>,
}

/// One linked multi-value entry, shipped separately from its owner so
/// large groups replicate incrementally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkedValue {
    /// Object owning the link.
    pub owner: Uuid,
    /// Linked attribute identifier.
    pub attr_id: u32,
    /// Referenced object.
    pub target: Uuid,
    /// True if the value is present, false if removed.
    pub present: bool,
    /// Originating USN of the link change.
    pub usn: Usn,
}

/// A `GetChanges` reply: one batch of changes plus resume state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullReply {
    /// Objects in this batch, in source USN order.
    pub objects: Vec<ReplObject>,
    /// Linked values in this batch.
    pub linked_values: Vec<LinkedValue>,
    /// New cursor: the destination records this once the batch commits.
    pub new_cursor: Usn,
    /// The source's up-to-dateness vector, sent on the final batch.
    pub new_utd: Option<Vec<UtdEntry>>,
    /// True if more batches remain past `new_cursor`.
    pub more_data: bool,
    /// In-band result code; [`DRS_OK`] on success.
    pub remote_status: u32,
}

impl PullReply {
    /// An empty terminal reply leaving the cursor at `cursor`.
    pub fn empty(cursor: Usn) -> Self {
        PullReply {
            objects: Vec::new(),
            linked_values: Vec::new(),
            new_cursor: cursor,
            new_utd: None,
            more_data: false,
            remote_status: DRS_OK,
        }
    }
}

/// A `ReplicaSync` request: the named source has changes, pull from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRequest {
    /// Partition with new changes.
    pub nc: NcId,
    /// Source server the receiver should pull from.
    pub source_guid: DsaId,
    /// Option bits; see [`crate::objects::options`].
    pub options: u32,
}

/// An `UpdateRefs` request: maintain the receiver's notify-target list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefsRequest {
    /// Partition the reference applies to.
    pub nc: NcId,
    /// Server to add or remove as a notify target.
    pub dest_guid: DsaId,
    /// DNS name of that server.
    pub dest_dns: String,
    /// [`crate::objects::options::REF_ADD`], [`crate::objects::options::REF_DELETE`],
    /// or both for replace, plus notify-related bits to store.
    pub options: u32,
}

/// Well-known object class identifiers.
pub mod classes {
    /// Schema object defining an attribute.
    pub const ATTRIBUTE_DEF: u32 = 10;
    /// Schema object defining an object class.
    pub const CLASS_DEF: u32 = 11;
}

/// Well-known attribute identifiers carried by schema objects.
pub mod attrs {
    /// On an attribute definition: the attribute id it defines.
    pub const ATTRIBUTE_ID: u32 = 1;
    /// On an attribute definition: the value syntax.
    pub const ATTRIBUTE_SYNTAX: u32 = 2;
    /// On an attribute definition: the link id, if the attribute is a
    /// linked multi-value.
    pub const LINK_ID: u32 = 3;
}

/// Decoded definition of one attribute, from the schema partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeDef {
    /// The attribute this definition governs.
    pub attr_id: u32,
    /// Value syntax identifier.
    pub syntax: u32,
    /// Link id for linked multi-values.
    pub link_id: Option<u32>,
}

/// Attribute definitions decoded from a schema batch. When a pull of the
/// schema partition delivers definitions, the rest of the same batch must
/// be interpreted with these definitions, not the persisted ones.
#[derive(Debug, Clone, Default)]
pub struct WorkingSchema {
    defs: std::collections::HashMap<u32, AttributeDef>,
}

fn read_u32_le(bytes: &Bytes) -> Option<u32> {
    let arr: [u8; 4] = bytes.as_ref().try_into().ok()?;
    Some(u32::from_le_bytes(arr))
}

impl WorkingSchema {
    /// Decodes attribute definitions from the objects of a batch.
    /// Returns `None` if the batch defines no attributes.
    pub fn from_batch(objects: &[ReplObject]) -> Option<WorkingSchema> {
        let mut schema = WorkingSchema::default();
        for obj in objects {
            if obj.class_id != classes::ATTRIBUTE_DEF || obj.is_deleted {
                continue;
            }
            let mut attr_id = None;
            let mut syntax = None;
            let mut link_id = None;
            for attr in &obj.attrs {
                let value = attr.values.first().and_then(read_u32_le);
                match attr.attr_id {
                    attrs::ATTRIBUTE_ID => attr_id = value,
                    attrs::ATTRIBUTE_SYNTAX => syntax = value,
                    attrs::LINK_ID => link_id = value,
                    _ => {}
                }
            }
            if let (Some(attr_id), Some(syntax)) = (attr_id, syntax) {
                schema.defs.insert(
                    attr_id,
                    AttributeDef {
                        attr_id,
                        syntax,
                        link_id,
                    },
                );
            }
        }
        if schema.defs.is_empty() {
            None
        } else {
            Some(schema)
        }
    }

    /// Folds another batch's definitions over these; the newer batch
    /// wins on overlap.
    pub fn absorb(&mut self, newer: WorkingSchema) {
        self.defs.extend(newer.defs);
    }

    /// Looks up the working definition of an attribute.
    pub fn lookup(&self, attr_id: u32) -> Option<&AttributeDef> {
        self.defs.get(&attr_id)
    }

    /// Number of attributes defined by the batch.
    pub fn len(&self) -> usize {
        self.defs.len()
    }

    /// True if the batch defined no attributes.
    pub fn is_empty(&self) -> bool {
        self.defs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u128) -> Uuid {
        Uuid::from_u128(n)
    }

    fn u32_value(v: u32) -> Vec<Bytes> {
        vec![Bytes::copy_from_slice(&v.to_le_bytes())]
    }

    fn attr(attr_id: u32, value: u32) -> ReplAttr {
        ReplAttr {
            attr_id,
            version: 1,
            originating_invocation: id(1),
            originating_usn: 1,
            values: u32_value(value),
        }
    }

    fn attribute_def_object(defines: u32, syntax: u32) -> ReplObject {
        ReplObject {
            guid: Uuid::new_v4(),
            dn: format!("cn=attr-{defines},cn=schema"),
            class_id: classes::ATTRIBUTE_DEF,
            is_deleted: false,
            attrs: vec![attr(attrs::ATTRIBUTE_ID, defines), attr(attrs::ATTRIBUTE_SYNTAX, syntax)],
        }
    }

    #[test]
    fn empty_reply_is_terminal() {
        let r = PullReply::empty(42);
        assert_eq!(r.new_cursor, 42);
        assert!(!r.more_data);
        assert_eq!(r.remote_status, DRS_OK);
        assert!(r.objects.is_empty());
    }

    #[test]
    fn pull_request_roundtrips_through_bincode() {
        let req = PullRequest {
            nc: id(5),
            dest_guid: id(6),
            dest_invocation: id(7),
            cursor: 1000,
            utd: vec![UtdEntry {
                invocation_id: id(8),
                usn: 77,
            }],
            max_objects: 100,
            max_bytes: 1 << 20,
            options: 0,
            extended: Some(ExtendedOp::FsmoTransfer {
                role: FsmoRole::Rid,
            }),
            target_usn: Some(2000),
        };
        let bytes = bincode::serialize(&req).unwrap();
        let back: PullRequest = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back, req);
    }

    mod working_schema {
        use super::*;

        #[test]
        fn decodes_attribute_definitions() {
            let objects = vec![attribute_def_object(500, 2), attribute_def_object(501, 9)];
            let schema = WorkingSchema::from_batch(&objects).unwrap();
            assert_eq!(schema.len(), 2);
            assert_eq!(schema.lookup(500).unwrap().syntax, 2);
            assert_eq!(schema.lookup(501).unwrap().syntax, 9);
            assert!(schema.lookup(502).is_none());
        }

        #[test]
        fn decodes_link_ids() {
            let mut obj = attribute_def_object(600, 1);
            obj.attrs.push(attr(attrs::LINK_ID, 4));
            let schema = WorkingSchema::from_batch(&[obj]).unwrap();
            assert_eq!(schema.lookup(600).unwrap().link_id, Some(4));
        }

        #[test]
        fn absorbed_batches_accumulate_with_newer_winning() {
            let mut schema =
                WorkingSchema::from_batch(&[attribute_def_object(500, 2)]).unwrap();
            schema.absorb(
                WorkingSchema::from_batch(&[
                    attribute_def_object(500, 7),
                    attribute_def_object(501, 9),
                ])
                .unwrap(),
            );
            assert_eq!(schema.len(), 2);
            assert_eq!(schema.lookup(500).unwrap().syntax, 7);
            assert_eq!(schema.lookup(501).unwrap().syntax, 9);
        }

        #[test]
        fn ignores_non_schema_objects() {
            let obj = ReplObject {
                guid: Uuid::new_v4(),
                dn: "cn=user".into(),
                class_id: 42,
                is_deleted: false,
                attrs: vec![attr(attrs::ATTRIBUTE_ID, 500)],
            };
            assert!(WorkingSchema::from_batch(&[obj]).is_none());
        }

        #[test]
        fn ignores_deleted_definitions() {
            let mut obj = attribute_def_object(500, 2);
            obj.is_deleted = true;
            assert!(WorkingSchema::from_batch(&[obj]).is_none());
        }

        #[test]
        fn incomplete_definitions_are_skipped() {
            let obj = ReplObject {
                guid: Uuid::new_v4(),
                dn: "cn=attr-broken".into(),
                class_id: classes::ATTRIBUTE_DEF,
                is_deleted: false,
                attrs: vec![attr(attrs::ATTRIBUTE_ID, 700)],
            };
            assert!(WorkingSchema::from_batch(&[obj]).is_none());
        }
    }
}
