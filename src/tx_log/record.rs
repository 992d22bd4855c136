use std::fmt;

use bytes::{Buf, BufMut, BytesMut};

use crate::{error::SmallError, storage::PagePosition, types::SmallResult};

pub trait Encodeable {
    fn encode(&self, buf: &mut BytesMut);

    fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        buf.to_vec()
    }
}

pub trait Decodeable: Sized {
    fn decode_from<B: Buf>(buf: &mut B) -> SmallResult<Self>;
}

fn ensure<B: Buf>(buf: &B, len: usize) -> SmallResult {
    if buf.remaining() < len {
        return Err(SmallError::corruption(&format!(
            "truncated log record, need {} bytes, {} left",
            len,
            buf.remaining()
        )));
    }
    Ok(())
}

fn get_u8<B: Buf>(buf: &mut B) -> SmallResult<u8> {
    ensure(buf, 1)?;
    Ok(buf.get_u8())
}

fn get_u16<B: Buf>(buf: &mut B) -> SmallResult<u16> {
    ensure(buf, 2)?;
    Ok(buf.get_u16_le())
}

fn get_u32<B: Buf>(buf: &mut B) -> SmallResult<u32> {
    ensure(buf, 4)?;
    Ok(buf.get_u32_le())
}

fn get_u64<B: Buf>(buf: &mut B) -> SmallResult<u64> {
    ensure(buf, 8)?;
    Ok(buf.get_u64_le())
}

fn get_i64<B: Buf>(buf: &mut B) -> SmallResult<i64> {
    ensure(buf, 8)?;
    Ok(buf.get_i64_le())
}

fn get_i32<B: Buf>(buf: &mut B) -> SmallResult<i32> {
    ensure(buf, 4)?;
    Ok(buf.get_i32_le())
}

/// Length-prefixed (u16) byte string.
fn get_blob<B: Buf>(buf: &mut B) -> SmallResult<Vec<u8>> {
    let len = get_u16(buf)? as usize;
    ensure(buf, len)?;
    let mut v = vec![0; len];
    buf.copy_to_slice(&mut v);
    Ok(v)
}

fn put_blob(buf: &mut BytesMut, v: &[u8]) {
    buf.put_u16_le(v.len() as u16);
    buf.put_slice(v);
}

impl Encodeable for PagePosition {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_i32_le(self.file_id);
        buf.put_i64_le(self.page_number);
    }
}

impl Decodeable for PagePosition {
    fn decode_from<B: Buf>(buf: &mut B) -> SmallResult<Self> {
        let file_id = get_i32(buf)?;
        let page_number = get_i64(buf)?;
        Ok(PagePosition::new(file_id, page_number))
    }
}

/// One physical mutation emitted by the trees.
///
/// Multi-page mutations (splits, page removal) are bracketed by
/// `BeginMulti` / `EndMulti` so they can be replayed as a unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogRecord {
    BeginMulti,
    FileRaise {
        file_id: i32,
        length: i64,
    },
    SetByte1 {
        pos: PagePosition,
        offset: u16,
        value: u8,
    },
    SetByte2 {
        pos: PagePosition,
        offset: u16,
        value: u16,
    },
    SetByte4 {
        pos: PagePosition,
        offset: u16,
        value: u32,
    },
    SetByte8 {
        pos: PagePosition,
        offset: u16,
        value: u64,
    },
    SetBytes {
        pos: PagePosition,
        offset: u16,
        bytes: Vec<u8>,
    },
    LeafInsert {
        pos: PagePosition,
        flags: u8,
        key: Vec<u8>,
        value: Vec<u8>,
    },
    BranchInsert {
        pos: PagePosition,
        key: Vec<u8>,
        left_page: i64,
        right_page: i64,
    },
    PageCreated {
        pos: PagePosition,
        flags: u8,
        depth: u8,
        element_size: Option<u16>,
    },
    CopyEntries {
        from: PagePosition,
        to: PagePosition,
        start_index: u16,
    },
    PageFreed {
        pos: PagePosition,
    },
    RootSplit {
        pos: PagePosition,
    },
    RootInit {
        pos: PagePosition,
    },
    LeafRemove {
        pos: PagePosition,
        index: u16,
    },
    BranchRemove {
        pos: PagePosition,
        index: u16,
    },
    EndMulti,
}

impl LogRecord {
    fn tag(&self) -> u8 {
        match self {
            LogRecord::BeginMulti => 0,
            LogRecord::FileRaise { .. } => 1,
            LogRecord::SetByte1 { .. } => 2,
            LogRecord::SetByte2 { .. } => 3,
            LogRecord::SetByte4 { .. } => 4,
            LogRecord::SetByte8 { .. } => 5,
            LogRecord::SetBytes { .. } => 6,
            LogRecord::LeafInsert { .. } => 7,
            LogRecord::BranchInsert { .. } => 8,
            LogRecord::PageCreated { .. } => 9,
            LogRecord::CopyEntries { .. } => 10,
            LogRecord::PageFreed { .. } => 11,
            LogRecord::RootSplit { .. } => 12,
            LogRecord::RootInit { .. } => 13,
            LogRecord::LeafRemove { .. } => 14,
            LogRecord::BranchRemove { .. } => 15,
            LogRecord::EndMulti => 16,
        }
    }

    /// The page the record mutates, if it targets exactly one.
    pub fn position(&self) -> Option<PagePosition> {
        match self {
            LogRecord::SetByte1 { pos, .. }
            | LogRecord::SetByte2 { pos, .. }
            | LogRecord::SetByte4 { pos, .. }
            | LogRecord::SetByte8 { pos, .. }
            | LogRecord::SetBytes { pos, .. }
            | LogRecord::LeafInsert { pos, .. }
            | LogRecord::BranchInsert { pos, .. }
            | LogRecord::PageCreated { pos, .. }
            | LogRecord::PageFreed { pos }
            | LogRecord::RootSplit { pos }
            | LogRecord::RootInit { pos }
            | LogRecord::LeafRemove { pos, .. }
            | LogRecord::BranchRemove { pos, .. } => Some(*pos),
            LogRecord::CopyEntries { to, .. } => Some(*to),
            LogRecord::BeginMulti | LogRecord::FileRaise { .. } | LogRecord::EndMulti => None,
        }
    }
}

impl Encodeable for LogRecord {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.tag());
        match self {
            LogRecord::BeginMulti | LogRecord::EndMulti => {}
            LogRecord::FileRaise { file_id, length } => {
                buf.put_i32_le(*file_id);
                buf.put_i64_le(*length);
            }
            LogRecord::SetByte1 { pos, offset, value } => {
                pos.encode(buf);
                buf.put_u16_le(*offset);
                buf.put_u8(*value);
            }
            LogRecord::SetByte2 { pos, offset, value } => {
                pos.encode(buf);
                buf.put_u16_le(*offset);
                buf.put_u16_le(*value);
            }
            LogRecord::SetByte4 { pos, offset, value } => {
                pos.encode(buf);
                buf.put_u16_le(*offset);
                buf.put_u32_le(*value);
            }
            LogRecord::SetByte8 { pos, offset, value } => {
                pos.encode(buf);
                buf.put_u16_le(*offset);
                buf.put_u64_le(*value);
            }
            LogRecord::SetBytes { pos, offset, bytes } => {
                pos.encode(buf);
                buf.put_u16_le(*offset);
                put_blob(buf, bytes);
            }
            LogRecord::LeafInsert {
                pos,
                flags,
                key,
                value,
            } => {
                pos.encode(buf);
                buf.put_u8(*flags);
                put_blob(buf, key);
                put_blob(buf, value);
            }
            LogRecord::BranchInsert {
                pos,
                key,
                left_page,
                right_page,
            } => {
                pos.encode(buf);
                put_blob(buf, key);
                buf.put_i64_le(*left_page);
                buf.put_i64_le(*right_page);
            }
            LogRecord::PageCreated {
                pos,
                flags,
                depth,
                element_size,
            } => {
                pos.encode(buf);
                buf.put_u8(*flags);
                buf.put_u8(*depth);
                match element_size {
                    Some(size) => {
                        buf.put_u8(1);
                        buf.put_u16_le(*size);
                    }
                    None => buf.put_u8(0),
                }
            }
            LogRecord::CopyEntries {
                from,
                to,
                start_index,
            } => {
                from.encode(buf);
                to.encode(buf);
                buf.put_u16_le(*start_index);
            }
            LogRecord::PageFreed { pos }
            | LogRecord::RootSplit { pos }
            | LogRecord::RootInit { pos } => pos.encode(buf),
            LogRecord::LeafRemove { pos, index } | LogRecord::BranchRemove { pos, index } => {
                pos.encode(buf);
                buf.put_u16_le(*index);
            }
        }
    }
}

impl Decodeable for LogRecord {
    fn decode_from<B: Buf>(buf: &mut B) -> SmallResult<Self> {
        let tag = get_u8(buf)?;
        let record = match tag {
            0 => LogRecord::BeginMulti,
            1 => LogRecord::FileRaise {
                file_id: get_i32(buf)?,
                length: get_i64(buf)?,
            },
            2 => LogRecord::SetByte1 {
                pos: PagePosition::decode_from(buf)?,
                offset: get_u16(buf)?,
                value: get_u8(buf)?,
            },
            3 => LogRecord::SetByte2 {
                pos: PagePosition::decode_from(buf)?,
                offset: get_u16(buf)?,
                value: get_u16(buf)?,
            },
            4 => LogRecord::SetByte4 {
                pos: PagePosition::decode_from(buf)?,
                offset: get_u16(buf)?,
                value: get_u32(buf)?,
            },
            5 => LogRecord::SetByte8 {
                pos: PagePosition::decode_from(buf)?,
                offset: get_u16(buf)?,
                value: get_u64(buf)?,
            },
            6 => LogRecord::SetBytes {
                pos: PagePosition::decode_from(buf)?,
                offset: get_u16(buf)?,
                bytes: get_blob(buf)?,
            },
            7 => LogRecord::LeafInsert {
                pos: PagePosition::decode_from(buf)?,
                flags: get_u8(buf)?,
                key: get_blob(buf)?,
                value: get_blob(buf)?,
            },
            8 => LogRecord::BranchInsert {
                pos: PagePosition::decode_from(buf)?,
                key: get_blob(buf)?,
                left_page: get_i64(buf)?,
                right_page: get_i64(buf)?,
            },
            9 => {
                let pos = PagePosition::decode_from(buf)?;
                let flags = get_u8(buf)?;
                let depth = get_u8(buf)?;
                let element_size = match get_u8(buf)? {
                    0 => None,
                    _ => Some(get_u16(buf)?),
                };
                LogRecord::PageCreated {
                    pos,
                    flags,
                    depth,
                    element_size,
                }
            }
            10 => LogRecord::CopyEntries {
                from: PagePosition::decode_from(buf)?,
                to: PagePosition::decode_from(buf)?,
                start_index: get_u16(buf)?,
            },
            11 => LogRecord::PageFreed {
                pos: PagePosition::decode_from(buf)?,
            },
            12 => LogRecord::RootSplit {
                pos: PagePosition::decode_from(buf)?,
            },
            13 => LogRecord::RootInit {
                pos: PagePosition::decode_from(buf)?,
            },
            14 => LogRecord::LeafRemove {
                pos: PagePosition::decode_from(buf)?,
                index: get_u16(buf)?,
            },
            15 => LogRecord::BranchRemove {
                pos: PagePosition::decode_from(buf)?,
                index: get_u16(buf)?,
            },
            16 => LogRecord::EndMulti,
            _ => {
                return Err(SmallError::corruption(&format!(
                    "invalid log record tag: {}",
                    tag
                )))
            }
        };
        Ok(record)
    }
}

impl fmt::Display for LogRecord {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            LogRecord::LeafInsert { pos, key, value, .. } => write!(
                f,
                "LeafInsert({}, key: {}, value: {} bytes)",
                pos,
                hex::encode(key),
                value.len()
            ),
            LogRecord::BranchInsert {
                pos,
                key,
                left_page,
                right_page,
            } => write!(
                f,
                "BranchInsert({}, key: {}, {} | {})",
                pos,
                hex::encode(key),
                left_page,
                right_page
            ),
            other => write!(f, "{:?}", other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncated_record() {
        let record = LogRecord::LeafInsert {
            pos: PagePosition::new(1, 2),
            flags: 2,
            key: b"key".to_vec(),
            value: vec![7; 40],
        };
        let bytes = record.to_bytes();

        let mut whole = &bytes[..];
        assert_eq!(LogRecord::decode_from(&mut whole).unwrap(), record);
        assert_eq!(whole.len(), 0);

        let mut cut = &bytes[..bytes.len() - 1];
        let err = LogRecord::decode_from(&mut cut).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::StructuralCorruption);
    }

    #[test]
    fn test_unknown_tag() {
        let mut bytes: &[u8] = &[200];
        assert!(LogRecord::decode_from(&mut bytes).is_err());
    }
}
