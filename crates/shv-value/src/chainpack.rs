//! ChainPack, the compact binary codec.
//!
//! Every value is prefixed with a one byte type tag except for tiny integers
//! (0..=63) which live in the tag byte itself. Containers are terminated with
//! `TERM`. A meta map, when present, precedes the tag of the value it
//! belongs to.

use std::collections::BTreeMap;
use std::io::{self, Write};

use crate::datetime::{DateTime, SHV_EPOCH_MSEC};
use crate::decimal::Decimal;
use crate::error::ReadError;
use crate::value::{MetaKey, MetaMap, RpcValue, Value};

pub(crate) mod tag {
    pub const NULL: u8 = 128;
    pub const UINT: u8 = 129;
    pub const INT: u8 = 130;
    pub const DOUBLE: u8 = 131;
    pub const BOOL: u8 = 132;
    pub const BLOB: u8 = 133;
    pub const STRING: u8 = 134;
    pub const LIST: u8 = 136;
    pub const MAP: u8 = 137;
    pub const IMAP: u8 = 138;
    pub const META_MAP: u8 = 139;
    pub const DECIMAL: u8 = 140;
    pub const DATETIME: u8 = 141;
    pub const CSTRING: u8 = 142;
    pub const FALSE: u8 = 253;
    pub const TRUE: u8 = 254;
    pub const TERM: u8 = 255;
}

// Unsigned integers use a leading-ones length scheme:
//
//  0 ...  7 bits  1 byte   |0|x|x|x|x|x|x|x|
//  8 ... 14 bits  2 bytes  |1|0|x|x|x|x|x|x| |x|...
// 15 ... 21 bits  3 bytes  |1|1|0|x|x|x|x|x| |x|... |x|...
// 22 ... 28 bits  4 bytes  |1|1|1|0|x|x|x|x| |x|... |x|... |x|...
// 29+      bits  5+ bytes  |1|1|1|1|n|n|n|n| followed by n+4 payload bytes
//
// Signed integers reuse the scheme with the sign stored in the top bit of
// the expanded payload.

fn significant_bits(num: u128) -> u32 {
    (128 - num.leading_zeros()).max(1)
}

fn bytes_needed(bit_len: u32) -> u32 {
    if bit_len <= 28 {
        (bit_len - 1) / 7 + 1
    } else {
        (bit_len - 1) / 8 + 2
    }
}

/// Highest bit position representable by the byte count covering `bit_len`.
fn expand_bit_len(bit_len: u32) -> u32 {
    let cnt = bytes_needed(bit_len);
    if bit_len <= 28 {
        cnt * (8 - 1) - 1
    } else {
        (cnt - 1) * 8 - 1
    }
}

fn write_uint_raw<W: Write>(out: &mut W, num: u128, bit_len: u32) -> io::Result<()> {
    let byte_cnt = bytes_needed(bit_len) as usize;
    let mut data = vec![0u8; byte_cnt];
    let mut n = num;
    for i in (0..byte_cnt).rev() {
        data[i] = (n & 0xff) as u8;
        n >>= 8;
    }
    if bit_len <= 28 {
        let mask = (0xf0u32 << (4 - byte_cnt)) as u8;
        data[0] &= !mask;
        data[0] |= mask << 1;
    } else {
        data[0] = 0xf0 | (byte_cnt as u8 - 5);
    }
    out.write_all(&data)
}

/// Append the unsigned integer wire form of `value` to `out`.
///
/// This form is also used by the stream transport as its length prefix.
pub(crate) fn write_uint_data<W: Write>(out: &mut W, value: u64) -> io::Result<()> {
    write_uint_raw(out, value.into(), significant_bits(value.into()))
}

fn write_int_data<W: Write>(out: &mut W, value: i64) -> io::Result<()> {
    let num = u128::from(value.unsigned_abs());
    let bit_len = significant_bits(num) + 1;
    let num = if value < 0 {
        num | (1u128 << expand_bit_len(bit_len))
    } else {
        num
    };
    write_uint_raw(out, num, bit_len)
}

/// Encode `value` with the ChainPack unsigned integer scheme.
pub fn pack_uint(value: u64) -> Vec<u8> {
    let mut out = Vec::new();
    write_uint_data(&mut out, value).expect("write to Vec cannot fail");
    out
}

/// Try to decode an unsigned integer from the head of `data`.
///
/// Returns `Ok(None)` when more bytes are needed, `Ok(Some((value, len)))` on
/// success. Used by the stream transport to parse its length prefix
/// incrementally.
pub fn unpack_uint(data: &[u8]) -> Result<Option<(u64, usize)>, ReadError> {
    let Some(&head) = data.first() else {
        return Ok(None);
    };
    let extra_bytes = match head.leading_ones() {
        0 => 0,
        1 => 1,
        2 => 2,
        3 => 3,
        _ => usize::from(head & 0x0f) + 4,
    };
    if data.len() < 1 + extra_bytes {
        return Ok(None);
    }
    let mut num: u128 = match head.leading_ones() {
        0 => u128::from(head & 0x7f),
        1 => u128::from(head & 0x3f),
        2 => u128::from(head & 0x1f),
        3 => u128::from(head & 0x0f),
        _ => 0,
    };
    for &b in &data[1..=extra_bytes] {
        num = (num << 8) | u128::from(b);
    }
    u64::try_from(num)
        .map(|v| Some((v, 1 + extra_bytes)))
        .map_err(|_| ReadError::malformed(0, "unsigned integer overflows 64 bits"))
}

/// Streaming ChainPack decoder over a byte slice.
pub struct ChainPackReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ChainPackReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Decode a single value from `data`.
    pub fn unpack(data: &'a [u8]) -> Result<RpcValue, ReadError> {
        Self::new(data).read()
    }

    /// Number of bytes consumed so far.
    pub fn position(&self) -> usize {
        self.pos
    }

    fn get_byte(&mut self) -> Result<u8, ReadError> {
        let b = *self
            .data
            .get(self.pos)
            .ok_or_else(|| ReadError::eof(self.pos))?;
        self.pos += 1;
        Ok(b)
    }

    fn peek_byte(&self) -> Result<u8, ReadError> {
        self.data
            .get(self.pos)
            .copied()
            .ok_or_else(|| ReadError::eof(self.pos))
    }

    fn get_bytes(&mut self, len: usize) -> Result<&'a [u8], ReadError> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.data.len())
            .ok_or_else(|| ReadError::eof(self.data.len()))?;
        let res = &self.data[self.pos..end];
        self.pos = end;
        Ok(res)
    }

    /// Read the next value including its meta, if any.
    pub fn read(&mut self) -> Result<RpcValue, ReadError> {
        let meta = self.read_meta()?;
        let value = self.read_value()?;
        Ok(RpcValue::new(value, meta))
    }

    /// Read a meta map if one is next in the stream.
    pub fn read_meta(&mut self) -> Result<Option<MetaMap>, ReadError> {
        if self.peek_byte()? != tag::META_MAP {
            return Ok(None);
        }
        self.pos += 1;
        let mut meta = MetaMap::new();
        while self.peek_byte()? != tag::TERM {
            let key = self.read()?;
            let val = self.read()?;
            match key.into_value() {
                Value::Int(k) => meta.insert(k, val),
                Value::UInt(k) => meta.insert(k as i64, val),
                Value::String(k) => meta.insert(k, val),
                other => {
                    return Err(ReadError::malformed(
                        self.pos,
                        format!("invalid meta key type: {}", other.type_name()),
                    ));
                }
            }
        }
        self.pos += 1;
        Ok(Some(meta))
    }

    fn read_value(&mut self) -> Result<Value, ReadError> {
        let schema = self.get_byte()?;
        if schema < 128 {
            // Tiny integer packed into the tag byte; bit 6 selects Int.
            let v = u64::from(schema & 63);
            return Ok(if schema & 64 != 0 {
                Value::Int(v as i64)
            } else {
                Value::UInt(v)
            });
        }
        match schema {
            tag::NULL => Ok(Value::Null),
            tag::TRUE => Ok(Value::Bool(true)),
            tag::FALSE => Ok(Value::Bool(false)),
            tag::INT => Ok(Value::Int(self.read_int_data()?)),
            tag::UINT => Ok(Value::UInt(self.read_uint_data()?)),
            tag::DOUBLE => {
                let raw = self.get_bytes(8)?;
                Ok(Value::Double(f64::from_le_bytes(
                    raw.try_into().expect("8 byte slice"),
                )))
            }
            tag::DECIMAL => {
                let mantissa = self.read_int_data()?;
                let exponent = self.read_int_data()?;
                let exponent = i32::try_from(exponent)
                    .map_err(|_| ReadError::malformed(self.pos, "decimal exponent overflow"))?;
                Ok(Value::Decimal(Decimal::new(mantissa, exponent)))
            }
            tag::DATETIME => self.read_datetime(),
            tag::BLOB => {
                let len = self.read_uint_data()? as usize;
                Ok(Value::Blob(self.get_bytes(len)?.to_vec()))
            }
            tag::STRING => {
                let len = self.read_uint_data()? as usize;
                let raw = self.get_bytes(len)?;
                Ok(Value::String(
                    String::from_utf8(raw.to_vec()).map_err(|_| ReadError::utf8(self.pos))?,
                ))
            }
            tag::CSTRING => self.read_cstring(),
            tag::LIST => {
                let mut list = Vec::new();
                while self.peek_byte()? != tag::TERM {
                    list.push(self.read()?);
                }
                self.pos += 1;
                Ok(Value::List(list))
            }
            tag::MAP => {
                let mut map = BTreeMap::new();
                while self.peek_byte()? != tag::TERM {
                    let key = self.read()?;
                    let val = self.read()?;
                    match key.into_value() {
                        Value::String(k) => {
                            map.insert(k, val);
                        }
                        other => {
                            return Err(ReadError::malformed(
                                self.pos,
                                format!("invalid Map key type: {}", other.type_name()),
                            ));
                        }
                    }
                }
                self.pos += 1;
                Ok(Value::Map(map))
            }
            tag::IMAP => {
                let mut map = BTreeMap::new();
                while self.peek_byte()? != tag::TERM {
                    let key = self.read()?;
                    let val = self.read()?;
                    match key.into_value() {
                        Value::Int(k) => {
                            map.insert(k, val);
                        }
                        Value::UInt(k) => {
                            map.insert(k as i64, val);
                        }
                        other => {
                            return Err(ReadError::malformed(
                                self.pos,
                                format!("invalid IMap key type: {}", other.type_name()),
                            ));
                        }
                    }
                }
                self.pos += 1;
                Ok(Value::IMap(map))
            }
            other => Err(ReadError::tag(self.pos - 1, other)),
        }
    }

    fn read_uint_raw(&mut self) -> Result<(u128, u32), ReadError> {
        let head = self.get_byte()?;
        let (extra_bytes, mut num, bit_len) = match head.leading_ones() {
            0 => (0usize, u128::from(head & 0x7f), 7),
            1 => (1, u128::from(head & 0x3f), 6 + 8),
            2 => (2, u128::from(head & 0x1f), 5 + 2 * 8),
            3 => (3, u128::from(head & 0x0f), 4 + 3 * 8),
            _ => {
                let cnt = usize::from(head & 0x0f) + 4;
                (cnt, 0, cnt as u32 * 8)
            }
        };
        for _ in 0..extra_bytes {
            num = (num << 8) | u128::from(self.get_byte()?);
        }
        Ok((num, bit_len))
    }

    fn read_uint_data(&mut self) -> Result<u64, ReadError> {
        let (num, _) = self.read_uint_raw()?;
        u64::try_from(num)
            .map_err(|_| ReadError::malformed(self.pos, "unsigned integer overflows 64 bits"))
    }

    fn read_int_data(&mut self) -> Result<i64, ReadError> {
        let (num, bit_len) = self.read_uint_raw()?;
        let sign_mask = 1u128 << (bit_len - 1);
        let (magnitude, neg) = if num & sign_mask != 0 {
            (num & !sign_mask, true)
        } else {
            (num, false)
        };
        if neg {
            // i64::MIN magnitude is representable, anything beyond is not.
            if magnitude > 1u128 << 63 {
                return Err(ReadError::malformed(self.pos, "integer overflows 64 bits"));
            }
            Ok((magnitude as i128).wrapping_neg() as i64)
        } else {
            i64::try_from(magnitude)
                .map_err(|_| ReadError::malformed(self.pos, "integer overflows 64 bits"))
        }
    }

    fn read_datetime(&mut self) -> Result<Value, ReadError> {
        let mut d = self.read_int_data()?;
        let has_tz_offset = d & 1 != 0;
        let has_not_msec = d & 2 != 0;
        d >>= 2;
        let mut offset = 0i32;
        if has_tz_offset {
            offset = (d & 0x7f) as i32;
            if offset >= 64 {
                offset -= 128;
            }
            d >>= 7;
        }
        let msec = if has_not_msec {
            d.checked_mul(1000)
                .ok_or_else(|| ReadError::malformed(self.pos, "datetime out of range"))?
        } else {
            d
        };
        DateTime::from_epoch_msec_tz(msec + SHV_EPOCH_MSEC, offset * 900)
            .map(Value::DateTime)
            .ok_or_else(|| ReadError::malformed(self.pos, "invalid datetime offset"))
    }

    fn read_cstring(&mut self) -> Result<Value, ReadError> {
        let mut raw = Vec::new();
        loop {
            let b = self.get_byte()?;
            if b == b'\\' {
                let e = self.get_byte()?;
                raw.push(match e {
                    b'\\' => b'\\',
                    b'0' => 0,
                    other => other,
                });
            } else if b == 0 {
                break;
            } else {
                raw.push(b);
            }
        }
        String::from_utf8(raw)
            .map(Value::String)
            .map_err(|_| ReadError::utf8(self.pos))
    }
}

/// ChainPack encoder writing to any [`Write`] sink.
pub struct ChainPackWriter<W: Write> {
    out: W,
}

impl<W: Write> ChainPackWriter<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    /// Encode a single value into a fresh buffer.
    pub fn pack(value: &RpcValue) -> Vec<u8> {
        let mut buf = Vec::new();
        ChainPackWriter::new(&mut buf)
            .write(value)
            .expect("write to Vec cannot fail");
        buf
    }

    pub fn write(&mut self, value: &RpcValue) -> io::Result<()> {
        if let Some(meta) = value.meta() {
            self.write_meta(meta)?;
        }
        self.write_value(value.value())
    }

    pub fn write_meta(&mut self, meta: &MetaMap) -> io::Result<()> {
        self.out.write_all(&[tag::META_MAP])?;
        for (key, val) in meta.iter() {
            match key {
                MetaKey::Int(k) => self.write_value(&Value::Int(k))?,
                MetaKey::Str(k) => self.write_value(&Value::String(k))?,
            }
            self.write(val)?;
        }
        self.out.write_all(&[tag::TERM])
    }

    fn write_value(&mut self, value: &Value) -> io::Result<()> {
        match value {
            Value::Null => self.out.write_all(&[tag::NULL]),
            Value::Bool(true) => self.out.write_all(&[tag::TRUE]),
            Value::Bool(false) => self.out.write_all(&[tag::FALSE]),
            Value::UInt(v) => {
                if *v < 64 {
                    self.out.write_all(&[*v as u8])
                } else {
                    self.out.write_all(&[tag::UINT])?;
                    write_uint_data(&mut self.out, *v)
                }
            }
            Value::Int(v) => {
                if (0..64).contains(v) {
                    self.out.write_all(&[*v as u8 + 64])
                } else {
                    self.out.write_all(&[tag::INT])?;
                    write_int_data(&mut self.out, *v)
                }
            }
            Value::Double(v) => {
                self.out.write_all(&[tag::DOUBLE])?;
                self.out.write_all(&v.to_le_bytes())
            }
            Value::Decimal(v) => {
                self.out.write_all(&[tag::DECIMAL])?;
                write_int_data(&mut self.out, v.mantissa())?;
                write_int_data(&mut self.out, v.exponent().into())
            }
            Value::DateTime(v) => {
                self.out.write_all(&[tag::DATETIME])?;
                self.write_datetime(*v)
            }
            Value::Blob(v) => {
                self.out.write_all(&[tag::BLOB])?;
                write_uint_data(&mut self.out, v.len() as u64)?;
                self.out.write_all(v)
            }
            Value::String(v) => {
                self.out.write_all(&[tag::STRING])?;
                write_uint_data(&mut self.out, v.len() as u64)?;
                self.out.write_all(v.as_bytes())
            }
            Value::List(v) => {
                self.out.write_all(&[tag::LIST])?;
                for item in v {
                    self.write(item)?;
                }
                self.out.write_all(&[tag::TERM])
            }
            Value::Map(v) => {
                self.out.write_all(&[tag::MAP])?;
                for (key, val) in v {
                    self.write_value(&Value::String(key.clone()))?;
                    self.write(val)?;
                }
                self.out.write_all(&[tag::TERM])
            }
            Value::IMap(v) => {
                self.out.write_all(&[tag::IMAP])?;
                for (key, val) in v {
                    self.write_value(&Value::Int(*key))?;
                    self.write(val)?;
                }
                self.out.write_all(&[tag::TERM])
            }
        }
    }

    fn write_datetime(&mut self, dt: DateTime) -> io::Result<()> {
        let mut res = dt.epoch_msec() - SHV_EPOCH_MSEC;
        let tzoff = i64::from(dt.utc_offset() / 900);
        let no_msec = res % 1000 == 0;
        if no_msec {
            res /= 1000;
        }
        if tzoff != 0 {
            res <<= 7;
            res |= tzoff & 0x7f;
        }
        res <<= 2;
        if tzoff != 0 {
            res |= 1;
        }
        if no_msec {
            res |= 2;
        }
        write_int_data(&mut self.out, res)
    }
}

/// Transcode a single ChainPack value into Cpon.
pub fn chainpack_to_cpon(data: &[u8]) -> Result<Vec<u8>, ReadError> {
    let value = ChainPackReader::unpack(data)?;
    Ok(crate::CponWriter::<Vec<u8>>::pack(&value))
}
