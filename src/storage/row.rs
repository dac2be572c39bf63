// Row codec and the tagged-variant descriptor that decides where a row's
// bytes actually live (inline in the slot, in a chain of overflow pages, or
// in an external blob file).

use crate::common::{PageId, Value};
use crate::error::{CorruptionDetail, DbError, Result};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RowStorage {
    Inline,
    ChainHead {
        first_page: PageId,
        total_len: u64,
        digest: Option<[u8; 32]>,
    },
    External {
        blob_id: Uuid,
        size: u64,
        digest: [u8; 32],
    },
}

#[repr(u8)]
enum TypeTag {
    Null = 0,
    Boolean = 1,
    Integer = 2,
    Float = 3,
    Text = 4,
    Bytes = 5,
    Date = 6,
    Timestamp = 7,
    Decimal = 8,
    Uuid = 9,
    Vector = 10,
}

fn tag_of(v: &Value) -> u8 {
    (match v {
        Value::Null => TypeTag::Null,
        Value::Boolean(_) => TypeTag::Boolean,
        Value::Integer(_) => TypeTag::Integer,
        Value::Float(_) => TypeTag::Float,
        Value::Text(_) => TypeTag::Text,
        Value::Bytes(_) => TypeTag::Bytes,
        Value::Date(_) => TypeTag::Date,
        Value::Timestamp(_) => TypeTag::Timestamp,
        Value::Decimal { .. } => TypeTag::Decimal,
        Value::Uuid(_) => TypeTag::Uuid,
        Value::Vector(_) => TypeTag::Vector,
    }) as u8
}

/// Encode a row as: `u16` column count, then per column a 1-byte type tag
/// (NULL is its own tag, no value bytes follow) and the value's bytes,
/// length-prefixed with `u32` for variable-width types.
pub fn encode_row(values: &[Value]) -> Vec<u8> {
    let mut out = Vec::with_capacity(values.len() * 9 + 2);
    out.extend_from_slice(&(values.len() as u16).to_le_bytes());
    for v in values {
        out.push(tag_of(v));
        match v {
            Value::Null => {}
            Value::Boolean(b) => out.push(*b as u8),
            Value::Integer(i) => out.extend_from_slice(&i.to_le_bytes()),
            Value::Float(f) => out.extend_from_slice(&f.to_le_bytes()),
            Value::Date(d) => out.extend_from_slice(&d.to_le_bytes()),
            Value::Timestamp(t) => out.extend_from_slice(&t.to_le_bytes()),
            Value::Decimal { unscaled, scale } => {
                out.extend_from_slice(&unscaled.to_le_bytes());
                out.push(*scale);
            }
            Value::Uuid(u) => out.extend_from_slice(u.as_bytes()),
            Value::Text(s) => {
                out.extend_from_slice(&(s.len() as u32).to_le_bytes());
                out.extend_from_slice(s.as_bytes());
            }
            Value::Bytes(b) => {
                out.extend_from_slice(&(b.len() as u32).to_le_bytes());
                out.extend_from_slice(b);
            }
            Value::Vector(vec) => {
                out.extend_from_slice(&(vec.len() as u32).to_le_bytes());
                for x in vec {
                    out.extend_from_slice(&x.to_le_bytes());
                }
            }
        }
    }
    out
}

pub fn decode_row(buf: &[u8]) -> Result<Vec<Value>> {
    let mut cursor = Cursor { buf, pos: 0 };
    let count = cursor.read_u16()? as usize;
    let mut values = Vec::with_capacity(count);
    for _ in 0..count {
        let tag = cursor.read_u8()?;
        let value = match tag {
            t if t == TypeTag::Null as u8 => Value::Null,
            t if t == TypeTag::Boolean as u8 => Value::Boolean(cursor.read_u8()? != 0),
            t if t == TypeTag::Integer as u8 => Value::Integer(cursor.read_i64()?),
            t if t == TypeTag::Float as u8 => Value::Float(cursor.read_f64()?),
            t if t == TypeTag::Date as u8 => Value::Date(cursor.read_i32()?),
            t if t == TypeTag::Timestamp as u8 => Value::Timestamp(cursor.read_i64()?),
            t if t == TypeTag::Decimal as u8 => {
                let unscaled = cursor.read_i128()?;
                let scale = cursor.read_u8()?;
                Value::Decimal { unscaled, scale }
            }
            t if t == TypeTag::Uuid as u8 => {
                let bytes = cursor.read_bytes(16)?;
                Value::Uuid(Uuid::from_slice(bytes).map_err(|e| {
                    DbError::PageCorrupt(CorruptionDetail::new(format!("bad uuid bytes: {e}")))
                })?)
            }
            t if t == TypeTag::Text as u8 => {
                let len = cursor.read_u32()? as usize;
                let bytes = cursor.read_bytes(len)?;
                Value::Text(String::from_utf8(bytes.to_vec()).map_err(|e| {
                    DbError::PageCorrupt(CorruptionDetail::new(format!("bad utf8 in row: {e}")))
                })?)
            }
            t if t == TypeTag::Bytes as u8 => {
                let len = cursor.read_u32()? as usize;
                Value::Bytes(cursor.read_bytes(len)?.to_vec())
            }
            t if t == TypeTag::Vector as u8 => {
                let len = cursor.read_u32()? as usize;
                let mut vec = Vec::with_capacity(len);
                for _ in 0..len {
                    vec.push(cursor.read_f32()?);
                }
                Value::Vector(vec)
            }
            other => {
                return Err(DbError::PageCorrupt(CorruptionDetail::new(format!(
                    "unknown row type tag {other}"
                ))))
            }
        };
        values.push(value);
    }
    Ok(values)
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn read_bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.buf.len() {
            return Err(DbError::PageCorrupt(CorruptionDetail::new("row truncated")));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read_bytes(1)?[0])
    }

    fn read_u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.read_bytes(2)?.try_into().unwrap()))
    }

    fn read_u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.read_bytes(4)?.try_into().unwrap()))
    }

    fn read_i32(&mut self) -> Result<i32> {
        Ok(i32::from_le_bytes(self.read_bytes(4)?.try_into().unwrap()))
    }

    fn read_i64(&mut self) -> Result<i64> {
        Ok(i64::from_le_bytes(self.read_bytes(8)?.try_into().unwrap()))
    }

    fn read_i128(&mut self) -> Result<i128> {
        Ok(i128::from_le_bytes(self.read_bytes(16)?.try_into().unwrap()))
    }

    fn read_f32(&mut self) -> Result<f32> {
        Ok(f32::from_le_bytes(self.read_bytes(4)?.try_into().unwrap()))
    }

    fn read_f64(&mut self) -> Result<f64> {
        Ok(f64::from_le_bytes(self.read_bytes(8)?.try_into().unwrap()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_mixed_columns() {
        let values = vec![
            Value::Integer(42),
            Value::Null,
            Value::Text("hello".into()),
            Value::Boolean(true),
            Value::Bytes(vec![1, 2, 3]),
            Value::Uuid(Uuid::nil()),
            Value::Decimal { unscaled: 12345, scale: 2 },
            Value::Vector(vec![1.0, 2.5, -3.0]),
        ];
        let encoded = encode_row(&values);
        let decoded = decode_row(&encoded).unwrap();
        assert_eq!(values, decoded);
    }

    #[test]
    fn truncated_row_errors_instead_of_panicking() {
        let values = vec![Value::Text("hello world".into())];
        let mut encoded = encode_row(&values);
        encoded.truncate(encoded.len() - 3);
        assert!(decode_row(&encoded).is_err());
    }

    #[test]
    fn empty_row_round_trips() {
        let encoded = encode_row(&[]);
        assert_eq!(decode_row(&encoded).unwrap(), vec![]);
    }
}
