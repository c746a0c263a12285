//! The value wire codec used for storage read-through and write-back.
//!
//! Strings take the fast path:
//!
//! ```text
//! [type=0][mvcc: u64 LE][encoding: u8][lru: u32 LE][word: u64 LE][payload][aux...]
//! ```
//!
//! where `word` holds the integer itself for integer-encoded strings
//! (no payload follows) or the payload length for raw/embedded ones.
//! Every other type is a framed dump behind its type byte:
//!
//! ```text
//! [type][dump][aux...]
//! ```
//!
//! Aux records trail the payload: `0xFA` carries the MVCC stamp (for
//! non-string types, whose fixed layout has no stamp slot) and `0xFB`
//! the whole-key expiration. Decoding dispatches on the leading type
//! byte; an unrecognised byte is a fatal decode error.

use std::collections::VecDeque;
use std::io::{Cursor, Read, Write};

use ahash::{AHashMap, AHashSet};
use bytes::Bytes;

use cinder_storage::format::{
    self, read_bytes, read_f64, read_i64, read_u32, read_u64, read_u8, write_bytes, write_f64,
    write_i64, write_len, write_u32, write_u64, write_u8, FormatError,
};

use crate::mvcc::MVCC_INVALID;
use crate::value::{
    Encoding, ModuleValue, ObjRef, Object, Payload, SortedSet, Stream, StreamEntry, StreamId,
    TypeTag,
};

/// Aux marker: MVCC stamp for non-string types.
const AUX_MVCC: u8 = 0xFA;

/// Aux marker: whole-key expiration in absolute milliseconds.
const AUX_EXPIRE: u8 = 0xFB;

/// Serialises an object (plus its whole-key expiration, when present)
/// into the storage record format.
pub fn serialize(obj: &Object, expire_ms: Option<u64>) -> Vec<u8> {
    let mut out = Vec::new();
    write_record(&mut out, obj, expire_ms).expect("writing to a Vec cannot fail");
    out
}

fn write_record(w: &mut Vec<u8>, obj: &Object, expire_ms: Option<u64>) -> std::io::Result<()> {
    let tag = obj.type_tag();
    write_u8(w, tag as u8)?;
    match obj.payload() {
        Payload::Int(n) => {
            write_u64(w, obj.mvcc())?;
            write_u8(w, Encoding::Int as u8)?;
            write_u32(w, obj.lru_word())?;
            write_u64(w, *n as u64)?;
        }
        Payload::Str(b) => {
            write_u64(w, obj.mvcc())?;
            write_u8(w, obj.encoding() as u8)?;
            write_u32(w, obj.lru_word())?;
            write_u64(w, b.len() as u64)?;
            w.write_all(b)?;
        }
        Payload::List(items) => {
            write_len(w, items.len())?;
            for item in items {
                write_bytes(w, item)?;
            }
            write_aux_mvcc(w, obj)?;
        }
        Payload::Set(members) => {
            write_len(w, members.len())?;
            for member in members {
                write_bytes(w, member)?;
            }
            write_aux_mvcc(w, obj)?;
        }
        Payload::SortedSet(ss) => {
            write_len(w, ss.len())?;
            for (score, member) in ss.iter() {
                write_f64(w, score)?;
                write_bytes(w, member)?;
            }
            write_aux_mvcc(w, obj)?;
        }
        Payload::Hash(fields) => {
            write_len(w, fields.len())?;
            for (field, value) in fields {
                write_bytes(w, field)?;
                write_bytes(w, value)?;
            }
            write_aux_mvcc(w, obj)?;
        }
        Payload::Stream(stream) => {
            write_len(w, stream.entries.len())?;
            for entry in &stream.entries {
                write_u64(w, entry.id.ms)?;
                write_u64(w, entry.id.seq)?;
                write_len(w, entry.fields.len())?;
                for (field, value) in &entry.fields {
                    write_bytes(w, field)?;
                    write_bytes(w, value)?;
                }
            }
            write_u64(w, stream.last_id.ms)?;
            write_u64(w, stream.last_id.seq)?;
            write_aux_mvcc(w, obj)?;
        }
        Payload::Module(module) => {
            write_bytes(w, module.type_name.as_bytes())?;
            write_bytes(w, &module.data)?;
            write_aux_mvcc(w, obj)?;
        }
    }
    if let Some(when) = expire_ms {
        write_u8(w, AUX_EXPIRE)?;
        write_i64(w, when as i64)?;
    }
    Ok(())
}

fn write_aux_mvcc(w: &mut Vec<u8>, obj: &Object) -> std::io::Result<()> {
    if obj.mvcc() != MVCC_INVALID {
        write_u8(w, AUX_MVCC)?;
        write_u64(w, obj.mvcc())?;
    }
    Ok(())
}

/// Decodes a storage record back into an object and its whole-key
/// expiration. The inverse of [`serialize`].
pub fn deserialize(data: &[u8]) -> Result<(ObjRef, Option<u64>), FormatError> {
    let mut r = Cursor::new(data);
    let type_byte = read_u8(&mut r)?;
    let tag = TypeTag::from_byte(type_byte).ok_or(FormatError::UnknownType(type_byte))?;

    let mut mvcc = MVCC_INVALID;
    let mut lru = 0u32;
    let payload = match tag {
        TypeTag::String => {
            mvcc = read_u64(&mut r)?;
            let enc_byte = read_u8(&mut r)?;
            let encoding =
                Encoding::from_byte(enc_byte).ok_or(FormatError::UnknownEncoding(enc_byte))?;
            lru = read_u32(&mut r)?;
            let word = read_u64(&mut r)?;
            match encoding {
                Encoding::Int => Payload::Int(word as i64),
                Encoding::Raw | Encoding::Embed => {
                    let len = word as usize;
                    if len > format::MAX_FIELD_LEN {
                        return Err(FormatError::InvalidData(format!(
                            "string length {len} exceeds maximum"
                        )));
                    }
                    let mut buf = vec![0u8; len];
                    r.read_exact(&mut buf).map_err(FormatError::Io)?;
                    Payload::Str(Bytes::from(buf))
                }
            }
        }
        TypeTag::List => {
            let count = read_u32(&mut r)?;
            format::validate_collection_count(count, "list")?;
            let mut items = VecDeque::with_capacity(format::capped_capacity(count));
            for _ in 0..count {
                items.push_back(Bytes::from(read_bytes(&mut r)?));
            }
            Payload::List(items)
        }
        TypeTag::Set => {
            let count = read_u32(&mut r)?;
            format::validate_collection_count(count, "set")?;
            let mut members = AHashSet::with_capacity(format::capped_capacity(count));
            for _ in 0..count {
                members.insert(Bytes::from(read_bytes(&mut r)?));
            }
            Payload::Set(members)
        }
        TypeTag::SortedSet => {
            let count = read_u32(&mut r)?;
            format::validate_collection_count(count, "sorted set")?;
            let mut ss = SortedSet::new();
            for _ in 0..count {
                let score = read_f64(&mut r)?;
                let member = Bytes::from(read_bytes(&mut r)?);
                ss.insert(score, member);
            }
            Payload::SortedSet(ss)
        }
        TypeTag::Hash => {
            let count = read_u32(&mut r)?;
            format::validate_collection_count(count, "hash")?;
            let mut fields = AHashMap::with_capacity(format::capped_capacity(count));
            for _ in 0..count {
                let field = Bytes::from(read_bytes(&mut r)?);
                let value = Bytes::from(read_bytes(&mut r)?);
                fields.insert(field, value);
            }
            Payload::Hash(fields)
        }
        TypeTag::Stream => {
            let count = read_u32(&mut r)?;
            format::validate_collection_count(count, "stream")?;
            let mut entries = Vec::with_capacity(format::capped_capacity(count));
            for _ in 0..count {
                let ms = read_u64(&mut r)?;
                let seq = read_u64(&mut r)?;
                let field_count = read_u32(&mut r)?;
                format::validate_collection_count(field_count, "stream fields")?;
                let mut fields = Vec::with_capacity(format::capped_capacity(field_count));
                for _ in 0..field_count {
                    let field = Bytes::from(read_bytes(&mut r)?);
                    let value = Bytes::from(read_bytes(&mut r)?);
                    fields.push((field, value));
                }
                entries.push(StreamEntry {
                    id: StreamId { ms, seq },
                    fields,
                });
            }
            let last_ms = read_u64(&mut r)?;
            let last_seq = read_u64(&mut r)?;
            Payload::Stream(Stream {
                entries,
                last_id: StreamId {
                    ms: last_ms,
                    seq: last_seq,
                },
            })
        }
        TypeTag::Module => {
            let type_name = String::from_utf8(read_bytes(&mut r)?)
                .map_err(|e| FormatError::InvalidData(e.to_string()))?;
            let data = Bytes::from(read_bytes(&mut r)?);
            Payload::Module(ModuleValue { type_name, data })
        }
    };

    // trailing aux records
    let mut expire_ms = None;
    while (r.position() as usize) < data.len() {
        let marker = read_u8(&mut r)?;
        match marker {
            AUX_MVCC => mvcc = read_u64(&mut r)?,
            AUX_EXPIRE => expire_ms = Some(read_i64(&mut r)? as u64),
            other => return Err(FormatError::InvalidData(format!(
                "unknown aux marker {other:#04x}"
            ))),
        }
    }

    let obj = Object::new(payload);
    obj.set_mvcc(mvcc);
    obj.set_lru_word(lru);
    Ok((ObjRef::Counted(std::sync::Arc::new(obj)), expire_ms))
}
