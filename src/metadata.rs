//! Wire codec for the metadata tables and the cache journal.
//!
//! Each of the `users`, `groups`, and `fat` tables is persisted as an
//! encrypted stream whose plaintext is:
//!
//! | Field   | Size | Description |
//! |---------|------|-------------|
//! | version | 8    | table version, u64 LE |
//! | count   | 4    | number of records, u32 LE |
//! | records | n    | length-prefixed records (u32 LE + payload) |
//!
//! The cache journal plaintext is a `count:u32-LE` followed by entries of
//! `table_tag:u8, version:u64-LE, op_tag:u8, payload_len:u32-LE, payload`.
//! Upsert payloads carry the full record; delete payloads carry only the
//! serialized id.
//!
//! All integers are little-endian. Strings are u32-length-prefixed UTF-8;
//! digests and IVs are raw fixed-size bytes.

use std::collections::{HashMap, HashSet};
use std::io::{self, Read, Write};

use thiserror::Error;

use crate::crypto::{Iv, IV_SIZE};
use crate::dirent::{Dirent, DirentId, DirentKind, MD5_SIZE};
use crate::identity::{Group, GroupId, Permission, User, UserId, PASSWORD_HASH_SIZE};

/// Backend names of the metadata blobs.
pub const USERS_BLOB: &str = "users";
pub const GROUPS_BLOB: &str = "groups";
pub const FAT_BLOB: &str = "fat";
pub const CACHE_BLOB: &str = "cache";

/// Upper bound on any single length-prefixed field; a larger length means
/// the stream is corrupt (or decrypted with the wrong key).
const MAX_FIELD_LEN: usize = 16 * 1024 * 1024;

/// The three journaled metadata tables.
///
/// The wire tags double as the IV-derivation tags for the corresponding
/// table streams; [`CACHE_IV_TAG`] extends the sequence for the journal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TableKind {
    Users,
    Groups,
    Fat,
}

impl TableKind {
    pub fn tag(self) -> u8 {
        match self {
            TableKind::Users => 1,
            TableKind::Groups => 2,
            TableKind::Fat => 3,
        }
    }

    pub fn from_tag(tag: u8) -> Result<Self, MetadataError> {
        match tag {
            1 => Ok(TableKind::Users),
            2 => Ok(TableKind::Groups),
            3 => Ok(TableKind::Fat),
            _ => Err(MetadataError::Corrupt {
                field: "table tag",
                reason: format!("unknown value {tag}"),
            }),
        }
    }
}

/// IV-derivation tag for the cache journal stream.
pub const CACHE_IV_TAG: u8 = 4;

/// Errors decoding or encoding metadata streams.
#[derive(Error, Debug)]
pub enum MetadataError {
    #[error("I/O error in metadata stream: {0}")]
    Io(#[from] io::Error),

    #[error("corrupt metadata stream: invalid {field}: {reason}")]
    Corrupt { field: &'static str, reason: String },
}

// ============================================================================
// Primitive field codecs
// ============================================================================

fn read_u8<R: Read>(r: &mut R) -> Result<u8, MetadataError> {
    let mut buf = [0u8; 1];
    r.read_exact(&mut buf)?;
    Ok(buf[0])
}

fn read_u32<R: Read>(r: &mut R) -> Result<u32, MetadataError> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64<R: Read>(r: &mut R) -> Result<u64, MetadataError> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

fn read_i64<R: Read>(r: &mut R) -> Result<i64, MetadataError> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(i64::from_le_bytes(buf))
}

fn read_len<R: Read>(r: &mut R, field: &'static str) -> Result<usize, MetadataError> {
    let len = read_u32(r)? as usize;
    if len > MAX_FIELD_LEN {
        return Err(MetadataError::Corrupt {
            field,
            reason: format!("length {len} exceeds maximum {MAX_FIELD_LEN}"),
        });
    }
    Ok(len)
}

fn read_string<R: Read>(r: &mut R, field: &'static str) -> Result<String, MetadataError> {
    let len = read_len(r, field)?;
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)?;
    String::from_utf8(buf).map_err(|e| MetadataError::Corrupt {
        field,
        reason: format!("invalid UTF-8: {e}"),
    })
}

fn write_u8<W: Write>(w: &mut W, value: u8) -> Result<(), MetadataError> {
    w.write_all(&[value])?;
    Ok(())
}

fn write_u32<W: Write>(w: &mut W, value: u32) -> Result<(), MetadataError> {
    w.write_all(&value.to_le_bytes())?;
    Ok(())
}

fn write_u64<W: Write>(w: &mut W, value: u64) -> Result<(), MetadataError> {
    w.write_all(&value.to_le_bytes())?;
    Ok(())
}

// ============================================================================
// Record codecs
// ============================================================================

fn push_string(buf: &mut Vec<u8>, value: &str) {
    buf.extend_from_slice(&(value.len() as u32).to_le_bytes());
    buf.extend_from_slice(value.as_bytes());
}

/// Serialize a user record: id, name, password digest.
pub fn encode_user(user: &User) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + 4 + user.name.len() + PASSWORD_HASH_SIZE);
    buf.extend_from_slice(&user.id.to_le_bytes());
    push_string(&mut buf, &user.name);
    buf.extend_from_slice(&user.password_hash);
    buf
}

pub fn decode_user<R: Read>(r: &mut R) -> Result<User, MetadataError> {
    let id = read_u32(r)?;
    let name = read_string(r, "user name")?;
    let mut password_hash = [0u8; PASSWORD_HASH_SIZE];
    r.read_exact(&mut password_hash)?;
    Ok(User {
        id,
        name,
        password_hash,
    })
}

fn push_user_id_set(buf: &mut Vec<u8>, set: &HashSet<UserId>) {
    buf.extend_from_slice(&(set.len() as u32).to_le_bytes());
    for &id in set {
        buf.extend_from_slice(&id.to_le_bytes());
    }
}

fn read_user_id_set<R: Read>(r: &mut R, field: &'static str) -> Result<HashSet<UserId>, MetadataError> {
    let count = read_len(r, field)?;
    let mut set = HashSet::with_capacity(count);
    for _ in 0..count {
        set.insert(read_u32(r)?);
    }
    Ok(set)
}

/// Serialize a group record: id, name, members, admins.
pub fn encode_group(group: &Group) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&group.id.to_le_bytes());
    push_string(&mut buf, &group.name);
    push_user_id_set(&mut buf, &group.members);
    push_user_id_set(&mut buf, &group.admins);
    buf
}

pub fn decode_group<R: Read>(r: &mut R) -> Result<Group, MetadataError> {
    let id = read_u32(r)?;
    let name = read_string(r, "group name")?;
    let members = read_user_id_set(r, "group members")?;
    let admins = read_user_id_set(r, "group admins")?;
    Ok(Group {
        id,
        name,
        members,
        admins,
    })
}

/// Serialize a dirent record. Field order: id, name, is-file flag, parent,
/// owner, creation timestamp, modification timestamp, size, content MD5
/// (files only), group permissions, content IV (files only).
pub fn encode_dirent(dirent: &Dirent) -> Vec<u8> {
    let mut buf = Vec::new();
    push_string(&mut buf, dirent.id.as_str());
    push_string(&mut buf, &dirent.name);
    buf.push(u8::from(dirent.is_file()));
    push_string(&mut buf, dirent.parent.as_str());
    buf.extend_from_slice(&dirent.owner.to_le_bytes());
    buf.extend_from_slice(&dirent.create_timestamp.to_le_bytes());
    buf.extend_from_slice(&dirent.mod_timestamp.to_le_bytes());
    buf.extend_from_slice(&dirent.size().to_le_bytes());
    if let Some(md5) = dirent.content_md5() {
        buf.extend_from_slice(md5);
    }
    buf.extend_from_slice(&(dirent.group_permissions.len() as u32).to_le_bytes());
    for (&group, &permission) in &dirent.group_permissions {
        buf.extend_from_slice(&group.to_le_bytes());
        buf.push(permission.to_wire());
    }
    if let Some(iv) = dirent.content_iv() {
        buf.extend_from_slice(iv);
    }
    buf
}

pub fn decode_dirent<R: Read>(r: &mut R) -> Result<Dirent, MetadataError> {
    let id = DirentId::from(read_string(r, "dirent id")?);
    let name = read_string(r, "dirent name")?;
    let is_file = match read_u8(r)? {
        0 => false,
        1 => true,
        other => {
            return Err(MetadataError::Corrupt {
                field: "dirent kind flag",
                reason: format!("expected 0 or 1, got {other}"),
            })
        }
    };
    let parent = DirentId::from(read_string(r, "dirent parent")?);
    let owner = read_u32(r)?;
    let create_timestamp = read_i64(r)?;
    let mod_timestamp = read_i64(r)?;
    let size = read_u64(r)?;

    let mut md5 = [0u8; MD5_SIZE];
    if is_file {
        r.read_exact(&mut md5)?;
    }

    let count = read_len(r, "permission count")?;
    let mut group_permissions = HashMap::with_capacity(count);
    for _ in 0..count {
        let group: GroupId = read_u32(r)?;
        let byte = read_u8(r)?;
        let permission = Permission::from_wire(byte).ok_or_else(|| MetadataError::Corrupt {
            field: "permission byte",
            reason: format!("expected 2, 4, or 6, got {byte}"),
        })?;
        group_permissions.insert(group, permission);
    }

    let kind = if is_file {
        let mut iv: Iv = [0u8; IV_SIZE];
        r.read_exact(&mut iv)?;
        DirentKind::File { size, md5, iv }
    } else {
        DirentKind::Directory
    };

    Ok(Dirent {
        id,
        name,
        parent,
        owner,
        create_timestamp,
        mod_timestamp,
        group_permissions,
        kind,
    })
}

// Id-only payloads for journal delete entries.

pub fn encode_user_id(id: UserId) -> Vec<u8> {
    id.to_le_bytes().to_vec()
}

pub fn decode_user_id<R: Read>(r: &mut R) -> Result<UserId, MetadataError> {
    read_u32(r)
}

pub fn encode_group_id(id: GroupId) -> Vec<u8> {
    id.to_le_bytes().to_vec()
}

pub fn decode_group_id<R: Read>(r: &mut R) -> Result<GroupId, MetadataError> {
    read_u32(r)
}

pub fn encode_dirent_id(id: &DirentId) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + id.as_str().len());
    push_string(&mut buf, id.as_str());
    buf
}

pub fn decode_dirent_id<R: Read>(r: &mut R) -> Result<DirentId, MetadataError> {
    Ok(DirentId::from(read_string(r, "dirent id")?))
}

// ============================================================================
// Table blobs
// ============================================================================

fn write_table<W: Write>(
    w: &mut W,
    version: u64,
    records: impl Iterator<Item = Vec<u8>>,
    count: usize,
) -> Result<(), MetadataError> {
    write_u64(w, version)?;
    write_u32(w, count as u32)?;
    for record in records {
        write_u32(w, record.len() as u32)?;
        w.write_all(&record)?;
    }
    Ok(())
}

fn read_records<R: Read, T>(
    r: &mut R,
    decode: impl Fn(&mut &[u8]) -> Result<T, MetadataError>,
) -> Result<(u64, Vec<T>), MetadataError> {
    let version = read_u64(r)?;
    let count = read_len(r, "record count")?;
    let mut records = Vec::with_capacity(count);
    for _ in 0..count {
        let len = read_len(r, "record length")?;
        let mut buf = vec![0u8; len];
        r.read_exact(&mut buf)?;
        let mut slice = buf.as_slice();
        records.push(decode(&mut slice)?);
    }
    Ok((version, records))
}

pub fn write_users_table<W: Write>(
    w: &mut W,
    version: u64,
    users: &HashMap<UserId, User>,
) -> Result<(), MetadataError> {
    write_table(w, version, users.values().map(encode_user), users.len())
}

pub fn read_users_table<R: Read>(
    r: &mut R,
) -> Result<(u64, HashMap<UserId, User>), MetadataError> {
    let (version, records) = read_records(r, |slice| decode_user(slice))?;
    Ok((version, records.into_iter().map(|u| (u.id, u)).collect()))
}

pub fn write_groups_table<W: Write>(
    w: &mut W,
    version: u64,
    groups: &HashMap<GroupId, Group>,
) -> Result<(), MetadataError> {
    write_table(w, version, groups.values().map(encode_group), groups.len())
}

pub fn read_groups_table<R: Read>(
    r: &mut R,
) -> Result<(u64, HashMap<GroupId, Group>), MetadataError> {
    let (version, records) = read_records(r, |slice| decode_group(slice))?;
    Ok((version, records.into_iter().map(|g| (g.id, g)).collect()))
}

pub fn write_fat_table<W: Write>(
    w: &mut W,
    version: u64,
    fat: &HashMap<DirentId, Dirent>,
) -> Result<(), MetadataError> {
    write_table(w, version, fat.values().map(encode_dirent), fat.len())
}

pub fn read_fat_table<R: Read>(
    r: &mut R,
) -> Result<(u64, HashMap<DirentId, Dirent>), MetadataError> {
    let (version, records) = read_records(r, |slice| decode_dirent(slice))?;
    Ok((
        version,
        records.into_iter().map(|d| (d.id.clone(), d)).collect(),
    ))
}

// ============================================================================
// Cache journal
// ============================================================================

/// Journal operation kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CacheOp {
    Upsert,
    Delete,
}

impl CacheOp {
    pub fn tag(self) -> u8 {
        match self {
            CacheOp::Upsert => 1,
            CacheOp::Delete => 2,
        }
    }

    pub fn from_tag(tag: u8) -> Result<Self, MetadataError> {
        match tag {
            1 => Ok(CacheOp::Upsert),
            2 => Ok(CacheOp::Delete),
            _ => Err(MetadataError::Corrupt {
                field: "journal op tag",
                reason: format!("unknown value {tag}"),
            }),
        }
    }
}

/// One journaled table mutation.
#[derive(Clone, Debug)]
pub struct CacheEntry {
    pub table: TableKind,
    /// Table version this mutation produced.
    pub version: u64,
    pub op: CacheOp,
    /// Full record for upserts; serialized id for deletes.
    pub payload: Vec<u8>,
}

impl CacheEntry {
    /// Size of this entry on the wire.
    pub fn encoded_len(&self) -> usize {
        1 + 8 + 1 + 4 + self.payload.len()
    }
}

pub fn write_journal<W: Write>(w: &mut W, entries: &[CacheEntry]) -> Result<(), MetadataError> {
    write_u32(w, entries.len() as u32)?;
    for entry in entries {
        write_u8(w, entry.table.tag())?;
        write_u64(w, entry.version)?;
        write_u8(w, entry.op.tag())?;
        write_u32(w, entry.payload.len() as u32)?;
        w.write_all(&entry.payload)?;
    }
    Ok(())
}

pub fn read_journal<R: Read>(r: &mut R) -> Result<Vec<CacheEntry>, MetadataError> {
    let count = read_len(r, "journal entry count")?;
    let mut entries = Vec::with_capacity(count);
    for _ in 0..count {
        let table = TableKind::from_tag(read_u8(r)?)?;
        let version = read_u64(r)?;
        let op = CacheOp::from_tag(read_u8(r)?)?;
        let len = read_len(r, "journal payload length")?;
        let mut payload = vec![0u8; len];
        r.read_exact(&mut payload)?;
        entries.push(CacheEntry {
            table,
            version,
            op,
            payload,
        });
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::random_iv;
    use crate::identity::EVERYONE_GROUP_ID;

    fn sample_user() -> User {
        User::new(3, "alice", [0xCD; PASSWORD_HASH_SIZE])
    }

    fn sample_group() -> Group {
        let mut group = Group::new(5, "devs", 3);
        group.members.insert(7);
        group
    }

    fn sample_file() -> Dirent {
        let mut perms = HashMap::new();
        perms.insert(EVERYONE_GROUP_ID, Permission::new(true, false));
        perms.insert(5, Permission::new(true, true));
        Dirent::new_file(
            DirentId::random(),
            "notes.txt",
            DirentId::root(),
            3,
            perms,
            1234,
            [0xEF; MD5_SIZE],
            random_iv(),
        )
    }

    #[test]
    fn test_user_record_round_trip() {
        let user = sample_user();
        let encoded = encode_user(&user);
        let decoded = decode_user(&mut encoded.as_slice()).unwrap();
        assert_eq!(decoded, user);
    }

    #[test]
    fn test_group_record_round_trip() {
        let group = sample_group();
        let encoded = encode_group(&group);
        let decoded = decode_group(&mut encoded.as_slice()).unwrap();
        assert_eq!(decoded, group);
    }

    #[test]
    fn test_dirent_record_round_trip() {
        let file = sample_file();
        let encoded = encode_dirent(&file);
        let decoded = decode_dirent(&mut encoded.as_slice()).unwrap();
        assert_eq!(decoded, file);

        let dir = Dirent::new_directory(DirentId::random(), "d", DirentId::root(), 0, HashMap::new());
        let encoded = encode_dirent(&dir);
        let decoded = decode_dirent(&mut encoded.as_slice()).unwrap();
        assert_eq!(decoded, dir);
    }

    #[test]
    fn test_bad_permission_byte_is_corrupt() {
        let mut file = sample_file();
        file.group_permissions.clear();
        let mut encoded = encode_dirent(&file);
        // Append a permission pair with an invalid byte in place of the
        // empty map: count=1, group=9, perm=7, then the IV.
        let iv_start = encoded.len() - IV_SIZE;
        let iv: Vec<u8> = encoded.split_off(iv_start);
        let count_start = encoded.len() - 4;
        encoded.truncate(count_start);
        encoded.extend_from_slice(&1u32.to_le_bytes());
        encoded.extend_from_slice(&9u32.to_le_bytes());
        encoded.push(7);
        encoded.extend_from_slice(&iv);

        assert!(matches!(
            decode_dirent(&mut encoded.as_slice()),
            Err(MetadataError::Corrupt { field: "permission byte", .. })
        ));
    }

    #[test]
    fn test_truncated_record_is_an_error() {
        let encoded = encode_user(&sample_user());
        let truncated = &encoded[..encoded.len() - 1];
        assert!(decode_user(&mut &truncated[..]).is_err());
    }

    #[test]
    fn test_users_table_round_trip() {
        let mut users = HashMap::new();
        users.insert(0, User::new(0, "root", [1; PASSWORD_HASH_SIZE]));
        users.insert(3, sample_user());

        let mut blob = Vec::new();
        write_users_table(&mut blob, 9, &users).unwrap();
        let (version, decoded) = read_users_table(&mut blob.as_slice()).unwrap();
        assert_eq!(version, 9);
        assert_eq!(decoded, users);
    }

    #[test]
    fn test_fat_table_round_trip() {
        let mut fat = HashMap::new();
        let root = Dirent::root_directory(0);
        let file = sample_file();
        fat.insert(root.id.clone(), root);
        fat.insert(file.id.clone(), file);

        let mut blob = Vec::new();
        write_fat_table(&mut blob, 2, &fat).unwrap();
        let (version, decoded) = read_fat_table(&mut blob.as_slice()).unwrap();
        assert_eq!(version, 2);
        assert_eq!(decoded, fat);
    }

    #[test]
    fn test_journal_round_trip() {
        let entries = vec![
            CacheEntry {
                table: TableKind::Fat,
                version: 4,
                op: CacheOp::Upsert,
                payload: encode_dirent(&sample_file()),
            },
            CacheEntry {
                table: TableKind::Users,
                version: 2,
                op: CacheOp::Delete,
                payload: encode_user_id(3),
            },
        ];

        let mut blob = Vec::new();
        write_journal(&mut blob, &entries).unwrap();
        let decoded = read_journal(&mut blob.as_slice()).unwrap();

        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[0].table, TableKind::Fat);
        assert_eq!(decoded[0].version, 4);
        assert_eq!(decoded[0].op, CacheOp::Upsert);
        assert_eq!(decoded[0].payload, entries[0].payload);
        assert_eq!(decoded[1].op, CacheOp::Delete);
        assert_eq!(decode_user_id(&mut decoded[1].payload.as_slice()).unwrap(), 3);
    }

    #[test]
    fn test_table_tags_are_stable() {
        assert_eq!(TableKind::Users.tag(), 1);
        assert_eq!(TableKind::Groups.tag(), 2);
        assert_eq!(TableKind::Fat.tag(), 3);
        assert_eq!(CACHE_IV_TAG, 4);
        assert!(TableKind::from_tag(9).is_err());
    }
}
