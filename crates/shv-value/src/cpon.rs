//! Cpon, the textual codec.
//!
//! A JSON superset: `u` suffixed unsigned integers, `i{…}` integer maps,
//! `<…>` meta prefixes, `d"…"` date-times, `b"…"`/`x"…"` blobs, hex and
//! binary integer literals, `p` exponent doubles, comments, and `,`/`:`
//! treated as insignificant whitespace.

use std::collections::BTreeMap;
use std::io::{self, Write};

use crate::datetime::DateTime;
use crate::decimal::Decimal;
use crate::error::ReadError;
use crate::value::{MetaKey, MetaMap, RpcValue, Value};

/// Streaming Cpon decoder over a byte slice.
pub struct CponReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> CponReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Decode a single value from `data`.
    pub fn unpack(data: &'a [u8]) -> Result<RpcValue, ReadError> {
        Self::new(data).read()
    }

    fn peek(&self) -> Option<u8> {
        self.data.get(self.pos).copied()
    }

    fn get_byte(&mut self) -> Result<u8, ReadError> {
        let b = self.peek().ok_or_else(|| ReadError::eof(self.pos))?;
        self.pos += 1;
        Ok(b)
    }

    fn expect(&mut self, what: &str, b: u8) -> Result<(), ReadError> {
        let got = self.get_byte()?;
        if got != b {
            return Err(ReadError::malformed(self.pos - 1, format!("expected {what}")));
        }
        Ok(())
    }

    fn expect_keyword(&mut self, word: &[u8]) -> Result<(), ReadError> {
        for &b in word {
            self.expect("keyword", b)?;
        }
        Ok(())
    }

    /// Skip whitespace, comments and the insignificant `:` and `,` tokens.
    fn skip_insignificant(&mut self) -> Result<(), ReadError> {
        loop {
            match self.peek() {
                None => return Ok(()),
                Some(b) if b <= b' ' || b == b':' || b == b',' => self.pos += 1,
                Some(b'/') => {
                    self.pos += 1;
                    match self.get_byte()? {
                        b'*' => loop {
                            if self.get_byte()? == b'*' && self.peek() == Some(b'/') {
                                self.pos += 1;
                                break;
                            }
                        },
                        b'/' => while self.get_byte()? != b'\n' {},
                        _ => return Err(ReadError::malformed(self.pos, "malformed comment")),
                    }
                }
                Some(_) => return Ok(()),
            }
        }
    }

    /// Read the next value including its meta, if any.
    pub fn read(&mut self) -> Result<RpcValue, ReadError> {
        let meta = self.read_meta()?;
        self.skip_insignificant()?;
        let value = match self.peek().ok_or_else(|| ReadError::eof(self.pos))? {
            b'0'..=b'9' | b'+' | b'-' => self.read_number()?,
            b'"' => Value::String(self.read_string()?),
            b'[' => self.read_list()?,
            b'{' => self.read_map()?,
            b'i' => {
                self.pos += 1;
                if self.peek() != Some(b'{') {
                    return Err(ReadError::malformed(self.pos, "invalid IMap prefix"));
                }
                self.read_imap()?
            }
            b'd' => {
                self.pos += 1;
                if self.peek() != Some(b'"') {
                    return Err(ReadError::malformed(self.pos, "invalid DateTime prefix"));
                }
                self.read_datetime()?
            }
            b'b' => {
                self.pos += 1;
                if self.peek() != Some(b'"') {
                    return Err(ReadError::malformed(self.pos, "invalid Blob prefix"));
                }
                self.read_blob()?
            }
            b'x' => {
                self.pos += 1;
                if self.peek() != Some(b'"') {
                    return Err(ReadError::malformed(self.pos, "invalid HexBlob prefix"));
                }
                self.read_hexblob()?
            }
            b't' => {
                self.expect_keyword(b"true")?;
                Value::Bool(true)
            }
            b'f' => {
                self.expect_keyword(b"false")?;
                Value::Bool(false)
            }
            b'n' => {
                self.expect_keyword(b"null")?;
                Value::Null
            }
            other => return Err(ReadError::tag(self.pos, other)),
        };
        Ok(RpcValue::new(value, meta))
    }

    /// Read a `<…>` meta map if one is next in the stream.
    pub fn read_meta(&mut self) -> Result<Option<MetaMap>, ReadError> {
        self.skip_insignificant()?;
        if self.peek() != Some(b'<') {
            return Ok(None);
        }
        self.pos += 1;
        let mut meta = MetaMap::new();
        loop {
            self.skip_insignificant()?;
            if self.peek() == Some(b'>') {
                self.pos += 1;
                return Ok(Some(meta));
            }
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
    }

    fn read_list(&mut self) -> Result<Value, ReadError> {
        self.pos += 1;
        let mut list = Vec::new();
        loop {
            self.skip_insignificant()?;
            if self.peek() == Some(b']') {
                self.pos += 1;
                return Ok(Value::List(list));
            }
            list.push(self.read()?);
        }
    }

    fn read_map(&mut self) -> Result<Value, ReadError> {
        self.pos += 1;
        let mut map = BTreeMap::new();
        loop {
            self.skip_insignificant()?;
            if self.peek() == Some(b'}') {
                self.pos += 1;
                return Ok(Value::Map(map));
            }
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
    }

    fn read_imap(&mut self) -> Result<Value, ReadError> {
        self.pos += 1;
        let mut map = BTreeMap::new();
        loop {
            self.skip_insignificant()?;
            if self.peek() == Some(b'}') {
                self.pos += 1;
                return Ok(Value::IMap(map));
            }
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
    }

    fn read_string(&mut self) -> Result<String, ReadError> {
        self.pos += 1;
        let mut raw = Vec::new();
        loop {
            match self.get_byte()? {
                b'"' => break,
                b'\\' => raw.push(match self.get_byte()? {
                    b'\\' => b'\\',
                    b'b' => 0x08,
                    b'"' => b'"',
                    b'f' => 0x0c,
                    b'n' => b'\n',
                    b'r' => b'\r',
                    b't' => b'\t',
                    b'0' => 0,
                    other => other,
                }),
                other => raw.push(other),
            }
        }
        String::from_utf8(raw).map_err(|_| ReadError::utf8(self.pos))
    }

    fn read_blob(&mut self) -> Result<Value, ReadError> {
        self.pos += 1;
        let mut res = Vec::new();
        loop {
            match self.get_byte()? {
                b'"' => return Ok(Value::Blob(res)),
                b'\\' => match self.get_byte()? {
                    b'\\' => res.push(b'\\'),
                    b'"' => res.push(b'"'),
                    b'n' => res.push(b'\n'),
                    b'r' => res.push(b'\r'),
                    b't' => res.push(b'\t'),
                    hi => {
                        let lo = self.get_byte()?;
                        res.push(self.hex_pair(hi, lo)?);
                    }
                },
                other => res.push(other),
            }
        }
    }

    fn read_hexblob(&mut self) -> Result<Value, ReadError> {
        self.pos += 1;
        let mut res = Vec::new();
        loop {
            let hi = self.get_byte()?;
            if hi == b'"' {
                return Ok(Value::Blob(res));
            }
            let lo = self.get_byte()?;
            res.push(self.hex_pair(hi, lo)?);
        }
    }

    fn hex_pair(&self, hi: u8, lo: u8) -> Result<u8, ReadError> {
        let digit = |b: u8| -> Result<u8, ReadError> {
            match b {
                b'0'..=b'9' => Ok(b - b'0'),
                b'a'..=b'f' => Ok(b - b'a' + 10),
                b'A'..=b'F' => Ok(b - b'A' + 10),
                _ => Err(ReadError::malformed(self.pos, "invalid hex digit")),
            }
        };
        Ok(digit(hi)? * 16 + digit(lo)?)
    }

    fn read_datetime(&mut self) -> Result<Value, ReadError> {
        let text = self.read_string()?;
        parse_iso_datetime(&text)
            .map(Value::DateTime)
            .ok_or_else(|| ReadError::malformed(self.pos, "invalid date-time"))
    }

    fn read_number(&mut self) -> Result<Value, ReadError> {
        let start = self.pos;
        let mut digits = String::new();
        let negative = match self.peek() {
            Some(b'-') => {
                self.pos += 1;
                true
            }
            Some(b'+') => {
                self.pos += 1;
                false
            }
            _ => false,
        };

        let mut take_while = |this: &mut Self, pred: fn(u8) -> bool, buf: &mut String| {
            while let Some(b) = this.peek() {
                if pred(b) {
                    buf.push(b as char);
                    this.pos += 1;
                } else {
                    break;
                }
            }
        };

        if self.peek() == Some(b'0') {
            match self.data.get(self.pos + 1) {
                Some(b'x' | b'X') => {
                    self.pos += 2;
                    return self.read_hex_number(start, negative);
                }
                Some(b'b' | b'B') => {
                    self.pos += 2;
                    take_while(self, |b| matches!(b, b'0' | b'1'), &mut digits);
                    if digits.is_empty() {
                        return Err(ReadError::malformed(start, "empty binary literal"));
                    }
                    let v = i64::from_str_radix(&digits, 2)
                        .map_err(|_| ReadError::malformed(start, "integer overflow"))?;
                    return Ok(Value::Int(if negative { -v } else { v }));
                }
                _ => {}
            }
        }

        take_while(self, |b| b.is_ascii_digit(), &mut digits);
        match self.peek() {
            Some(b'u') => {
                self.pos += 1;
                let v: u64 = digits
                    .parse()
                    .map_err(|_| ReadError::malformed(start, "integer overflow"))?;
                if negative {
                    return Err(ReadError::malformed(start, "negative unsigned integer"));
                }
                Ok(Value::UInt(v))
            }
            Some(b'.') | Some(b'e') | Some(b'E') => self.read_fraction(start, negative, digits),
            Some(b'p') | Some(b'P') => {
                self.pos += 1;
                let exp = self.read_signed_exponent(start)?;
                let mantissa: f64 = digits
                    .parse()
                    .map_err(|_| ReadError::malformed(start, "invalid double mantissa"))?;
                let v = mantissa * 2f64.powi(exp);
                Ok(Value::Double(if negative { -v } else { v }))
            }
            _ => {
                if digits.is_empty() {
                    return Err(ReadError::malformed(start, "empty number literal"));
                }
                let v: i64 = digits
                    .parse()
                    .map_err(|_| ReadError::malformed(start, "integer overflow"))?;
                Ok(Value::Int(if negative { -v } else { v }))
            }
        }
    }

    /// Continuation of a decimal literal after the integer digits: fraction
    /// and/or decimal exponent make a `Decimal`, a `p` exponent after the
    /// fraction makes a `Double`.
    fn read_fraction(
        &mut self,
        start: usize,
        negative: bool,
        mut digits: String,
    ) -> Result<Value, ReadError> {
        let mut frac_len = 0i32;
        if self.peek() == Some(b'.') {
            self.pos += 1;
            while let Some(b @ b'0'..=b'9') = self.peek() {
                digits.push(b as char);
                frac_len += 1;
                self.pos += 1;
            }
            if let Some(b'p' | b'P') = self.peek() {
                self.pos += 1;
                let exp = self.read_signed_exponent(start)?;
                let mantissa: f64 = format!(
                    "{}.{}",
                    &digits[..digits.len() - frac_len as usize],
                    &digits[digits.len() - frac_len as usize..]
                )
                .parse()
                .map_err(|_| ReadError::malformed(start, "invalid double mantissa"))?;
                let v = mantissa * 2f64.powi(exp);
                return Ok(Value::Double(if negative { -v } else { v }));
            }
        }
        let mut exp = 0i32;
        if let Some(b'e' | b'E') = self.peek() {
            self.pos += 1;
            exp = self.read_signed_exponent(start)?;
        }
        if digits.is_empty() {
            return Err(ReadError::malformed(start, "empty number literal"));
        }
        let mantissa: i64 = digits
            .parse()
            .map_err(|_| ReadError::malformed(start, "decimal mantissa overflow"))?;
        Ok(Value::Decimal(Decimal::new(
            if negative { -mantissa } else { mantissa },
            exp - frac_len,
        )))
    }

    fn read_hex_number(&mut self, start: usize, negative: bool) -> Result<Value, ReadError> {
        let mut digits = String::new();
        while let Some(b) = self.peek() {
            if b.is_ascii_hexdigit() {
                digits.push(b as char);
                self.pos += 1;
            } else {
                break;
            }
        }
        let mut frac = String::new();
        if self.peek() == Some(b'.') {
            self.pos += 1;
            while let Some(b) = self.peek() {
                if b.is_ascii_hexdigit() {
                    frac.push(b as char);
                    self.pos += 1;
                } else {
                    break;
                }
            }
        }
        if let Some(b'p' | b'P') = self.peek() {
            self.pos += 1;
            let exp = self.read_signed_exponent(start)?;
            // Assemble an exact integer mantissa so no precision is lost.
            let int_part =
                u64::from_str_radix(if digits.is_empty() { "0" } else { &digits }, 16)
                    .map_err(|_| ReadError::malformed(start, "invalid double mantissa"))?;
            let frac_part = if frac.is_empty() {
                0
            } else {
                u64::from_str_radix(&frac, 16)
                    .map_err(|_| ReadError::malformed(start, "invalid double mantissa"))?
            };
            let mantissa = (int_part as f64) * 16f64.powi(frac.len() as i32) + frac_part as f64;
            let v = mantissa * 2f64.powi(exp - 4 * frac.len() as i32);
            return Ok(Value::Double(if negative { -v } else { v }));
        }
        if !frac.is_empty() {
            return Err(ReadError::malformed(start, "hex fraction needs p exponent"));
        }
        if digits.is_empty() {
            return Err(ReadError::malformed(start, "empty hex literal"));
        }
        let v = i64::from_str_radix(&digits, 16)
            .map_err(|_| ReadError::malformed(start, "integer overflow"))?;
        Ok(Value::Int(if negative { -v } else { v }))
    }

    fn read_signed_exponent(&mut self, start: usize) -> Result<i32, ReadError> {
        let neg = match self.peek() {
            Some(b'-') => {
                self.pos += 1;
                true
            }
            Some(b'+') => {
                self.pos += 1;
                false
            }
            _ => false,
        };
        let mut digits = String::new();
        while let Some(b @ b'0'..=b'9') = self.peek() {
            digits.push(b as char);
            self.pos += 1;
        }
        if digits.is_empty() {
            return Err(ReadError::malformed(start, "empty exponent"));
        }
        let v: i32 = digits
            .parse()
            .map_err(|_| ReadError::malformed(start, "exponent overflow"))?;
        Ok(if neg { -v } else { v })
    }
}

/// Parse the ISO-8601 subset used by Cpon date-times.
///
/// `YYYY-MM-DDTHH:MM:SS` with optional `.fff` fraction and an offset of `Z`,
/// `±HH`, `±HHMM` or `±HH:MM`. A missing offset means UTC.
fn parse_iso_datetime(text: &str) -> Option<DateTime> {
    let b = text.as_bytes();
    let digits = |range: std::ops::Range<usize>| -> Option<u32> {
        let s = b.get(range.clone())?;
        if !s.iter().all(u8::is_ascii_digit) {
            return None;
        }
        text[range].parse().ok()
    };
    let year = digits(0..4)? as i32;
    if b.get(4) != Some(&b'-') || b.get(7) != Some(&b'-') {
        return None;
    }
    let month = digits(5..7)?;
    let day = digits(8..10)?;
    if !matches!(b.get(10), Some(&b'T') | Some(&b' ')) {
        return None;
    }
    let hour = digits(11..13)?;
    if b.get(13) != Some(&b':') || b.get(16) != Some(&b':') {
        return None;
    }
    let min = digits(14..16)?;
    let sec = digits(17..19)?;
    let mut pos = 19;
    let mut msec = 0;
    if b.get(pos) == Some(&b'.') {
        pos += 1;
        let fstart = pos;
        while b.get(pos).is_some_and(u8::is_ascii_digit) {
            pos += 1;
        }
        if pos == fstart {
            return None;
        }
        let frac = &text[fstart..pos];
        let scaled = format!("{frac:0<3}");
        msec = scaled.get(..3)?.parse().ok()?;
    }
    let offset = match b.get(pos) {
        None => 0,
        Some(b'Z') if pos + 1 == b.len() => 0,
        Some(sign @ (b'+' | b'-')) => {
            pos += 1;
            let hours = digits(pos..pos + 2)?;
            pos += 2;
            if b.get(pos) == Some(&b':') {
                pos += 1;
            }
            let mins = if pos < b.len() {
                let m = digits(pos..pos + 2)?;
                pos += 2;
                m
            } else {
                0
            };
            if pos != b.len() {
                return None;
            }
            let total = (hours * 3600 + mins * 60) as i32;
            if *sign == b'-' { -total } else { total }
        }
        Some(_) => return None,
    };
    DateTime::from_calendar(year, month, day, hour, min, sec, msec, offset)
}

/// Options for [`CponWriter`].
#[derive(Clone, Debug, Default)]
pub struct CponWriterOptions {
    /// String used to indent nested containers; empty keeps everything on a
    /// single line.
    pub indent: String,
}

/// Cpon encoder writing to any [`Write`] sink.
pub struct CponWriter<W: Write> {
    out: W,
    options: CponWriterOptions,
    nest_level: usize,
}

impl<W: Write> CponWriter<W> {
    pub fn new(out: W) -> Self {
        Self::with_options(out, CponWriterOptions::default())
    }

    pub fn with_options(out: W, options: CponWriterOptions) -> Self {
        Self {
            out,
            options,
            nest_level: 0,
        }
    }

    /// Encode a single value into a fresh buffer.
    pub fn pack(value: &RpcValue) -> Vec<u8> {
        let mut buf = Vec::new();
        CponWriter::new(&mut buf)
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
        self.out.write_all(b"<")?;
        let online = meta.len() <= 10
            && meta
                .iter()
                .all(|(_, v)| !matches!(v.value(), Value::List(_) | Value::Map(_) | Value::IMap(_)));
        self.nest_level += 1;
        let mut first = true;
        for (key, val) in meta.iter() {
            if !first {
                self.out.write_all(b",")?;
            }
            self.indent_item(online, !first)?;
            first = false;
            match key {
                MetaKey::Int(k) => write!(self.out, "{k}")?,
                MetaKey::Str(k) => self.write_string(&k)?,
            }
            self.out.write_all(b":")?;
            self.write(val)?;
        }
        self.nest_level -= 1;
        self.indent_item(online, false)?;
        self.out.write_all(b">")
    }

    fn indent_item(&mut self, online: bool, follow_up: bool) -> io::Result<()> {
        if self.options.indent.is_empty() {
            return Ok(());
        }
        if online {
            if follow_up {
                self.out.write_all(b" ")?;
            }
        } else {
            self.out.write_all(b"\n")?;
            for _ in 0..self.nest_level {
                self.out.write_all(self.options.indent.as_bytes())?;
            }
        }
        Ok(())
    }

    fn write_value(&mut self, value: &Value) -> io::Result<()> {
        match value {
            Value::Null => self.out.write_all(b"null"),
            Value::Bool(true) => self.out.write_all(b"true"),
            Value::Bool(false) => self.out.write_all(b"false"),
            Value::Int(v) => write!(self.out, "{v}"),
            Value::UInt(v) => write!(self.out, "{v}u"),
            Value::Double(v) => write!(self.out, "{}", format_hex_float(*v)),
            Value::Decimal(v) => {
                let s = v.to_string();
                if s.contains(['.', 'e', 'E']) {
                    self.out.write_all(s.as_bytes())
                } else {
                    write!(self.out, "{s}.0")
                }
            }
            Value::DateTime(v) => write!(self.out, "d\"{v}\""),
            Value::String(v) => self.write_string(v),
            Value::Blob(v) => self.write_blob(v),
            Value::List(v) => {
                let online = v.len() <= 10
                    && v.iter().all(|e| {
                        !matches!(e.value(), Value::List(_) | Value::Map(_) | Value::IMap(_))
                    });
                self.nest_level += 1;
                self.out.write_all(b"[")?;
                for (i, item) in v.iter().enumerate() {
                    if i > 0 {
                        self.out.write_all(b",")?;
                    }
                    self.indent_item(online, i > 0)?;
                    self.write(item)?;
                }
                self.nest_level -= 1;
                self.indent_item(online, false)?;
                self.out.write_all(b"]")
            }
            Value::Map(v) => {
                self.out.write_all(b"{")?;
                self.write_map_content(
                    v.iter().map(|(k, v)| (MetaKey::Str(k.clone()), v)),
                    v.len(),
                )?;
                self.out.write_all(b"}")
            }
            Value::IMap(v) => {
                self.out.write_all(b"i{")?;
                self.write_map_content(v.iter().map(|(k, v)| (MetaKey::Int(*k), v)), v.len())?;
                self.out.write_all(b"}")
            }
        }
    }

    fn write_map_content<'v>(
        &mut self,
        entries: impl Iterator<Item = (MetaKey, &'v RpcValue)> + Clone,
        len: usize,
    ) -> io::Result<()> {
        let online = len <= 10
            && entries.clone().all(|(_, v)| {
                !matches!(v.value(), Value::List(_) | Value::Map(_) | Value::IMap(_))
            });
        self.nest_level += 1;
        let mut first = true;
        for (key, val) in entries {
            if !first {
                self.out.write_all(b",")?;
            }
            self.indent_item(online, !first)?;
            first = false;
            match key {
                MetaKey::Int(k) => write!(self.out, "{k}")?,
                MetaKey::Str(k) => self.write_string(&k)?,
            }
            self.out.write_all(b":")?;
            self.write(val)?;
        }
        self.nest_level -= 1;
        self.indent_item(online, false)
    }

    fn write_string(&mut self, value: &str) -> io::Result<()> {
        self.out.write_all(b"\"")?;
        for c in value.chars() {
            match c {
                '\0' => self.out.write_all(b"\\0")?,
                '\\' => self.out.write_all(b"\\\\")?,
                '\t' => self.out.write_all(b"\\t")?,
                '\u{8}' => self.out.write_all(b"\\b")?,
                '\r' => self.out.write_all(b"\\r")?,
                '\n' => self.out.write_all(b"\\n")?,
                '"' => self.out.write_all(b"\\\"")?,
                c => write!(self.out, "{c}")?,
            }
        }
        self.out.write_all(b"\"")
    }

    fn write_blob(&mut self, value: &[u8]) -> io::Result<()> {
        self.out.write_all(b"b\"")?;
        for &d in value {
            match d {
                0 => self.out.write_all(b"\\0")?,
                b'\\' => self.out.write_all(b"\\\\")?,
                b'\t' => self.out.write_all(b"\\t")?,
                0x08 => self.out.write_all(b"\\b")?,
                b'\r' => self.out.write_all(b"\\r")?,
                b'\n' => self.out.write_all(b"\\n")?,
                b'"' => self.out.write_all(b"\\\"")?,
                d if d >= 0x7f => write!(self.out, "\\{d:02x}")?,
                d => self.out.write_all(&[d])?,
            }
        }
        self.out.write_all(b"\"")
    }
}

/// Format a double in the lossless hexadecimal significand form,
/// e.g. `0x1.be00000000000p+7`.
fn format_hex_float(v: f64) -> String {
    if v == 0.0 {
        return if v.is_sign_negative() {
            "-0x0.0p+0".into()
        } else {
            "0x0.0p+0".into()
        };
    }
    if !v.is_finite() {
        return format!("{v}");
    }
    let bits = v.to_bits();
    let sign = if bits >> 63 != 0 { "-" } else { "" };
    let exp_bits = ((bits >> 52) & 0x7ff) as i32;
    let frac = bits & ((1u64 << 52) - 1);
    if exp_bits == 0 {
        format!("{sign}0x0.{frac:013x}p-1022")
    } else {
        format!("{sign}0x1.{frac:013x}p{:+}", exp_bits - 1023)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ChainPackReader, ChainPackWriter, shv_imap, shv_list, shv_map};

    fn read(cpon: &str) -> RpcValue {
        CponReader::unpack(cpon.as_bytes()).unwrap()
    }

    fn write(value: &RpcValue) -> String {
        String::from_utf8(CponWriter::<Vec<u8>>::pack(value)).unwrap()
    }

    #[test]
    fn scalars_both_ways() {
        for (cpon, value) in [
            ("null", RpcValue::null()),
            ("true", RpcValue::from(true)),
            ("false", RpcValue::from(false)),
            ("0", RpcValue::from(0i64)),
            ("-1", RpcValue::from(-1i64)),
            ("42", RpcValue::from(42i64)),
            ("1u", RpcValue::from(1u64)),
            ("4294967295u", RpcValue::from(u64::from(u32::MAX))),
            ("9007199254740991", RpcValue::from((1i64 << 53) - 1)),
            ("-9007199254740991", RpcValue::from(-((1i64 << 53) - 1))),
            ("2.3", RpcValue::from(Decimal::new(23, -1))),
            ("-0.00012", RpcValue::from(Decimal::new(-12, -5))),
            ("3E+2", RpcValue::from(Decimal::new(3, 2))),
            ("\"\"", RpcValue::from("")),
            ("\"foo\"", RpcValue::from("foo")),
            ("\"dvaačtyřicet\"", RpcValue::from("dvaačtyřicet")),
            (
                "\"some\\t\\\"tab\\\"\"",
                RpcValue::from("some\t\"tab\""),
            ),
        ] {
            assert_eq!(read(cpon), value, "reading {cpon}");
            assert_eq!(write(&value), cpon, "writing {cpon}");
        }
    }

    #[test]
    fn containers_both_ways() {
        for (cpon, value) in [
            ("[]", shv_list![]),
            ("[1]", shv_list![1]),
            ("[1,2,3]", shv_list![1, 2, 3]),
            ("[[]]", shv_list![shv_list![]]),
            ("{\"foo\":\"bar\"}", shv_map! {"foo" => "bar"}),
            ("i{1:2}", shv_imap! {1 => 2}),
            (
                "[1u,{\"a\":1},2.3]",
                shv_list![RpcValue::from(1u64), shv_map! {"a" => 1}, Decimal::new(23, -1)],
            ),
        ] {
            assert_eq!(read(cpon), value, "reading {cpon}");
            assert_eq!(write(&value), cpon, "writing {cpon}");
        }
    }

    #[test]
    fn meta_both_ways() {
        let mut m12 = MetaMap::new();
        m12.insert(1, 2);
        let mut m78 = MetaMap::new();
        m78.insert(7, 8);
        let mut m45 = MetaMap::new();
        m45.insert(4, 5);

        let cases = [
            ("<1:2>3", RpcValue::from(3).with_meta(m12.clone())),
            (
                "[1,<7:8>9]",
                shv_list![RpcValue::from(1), RpcValue::from(9).with_meta(m78)],
            ),
            (
                "<1:2>[3,<4:5>6]",
                shv_list![RpcValue::from(3), RpcValue::from(6).with_meta(m45)]
                    .with_meta(m12.clone()),
            ),
        ];
        for (cpon, value) in cases {
            assert_eq!(read(cpon), value, "reading {cpon}");
            assert_eq!(write(&value), cpon, "writing {cpon}");
        }
    }

    #[test]
    fn datetime_reading() {
        assert_eq!(
            read("d\"2018-02-02T00:00:00Z\"").as_datetime().unwrap(),
            DateTime::from_calendar(2018, 2, 2, 0, 0, 0, 0, 0).unwrap()
        );
        assert_eq!(
            read("d\"2027-05-03T11:30:12.345+01\"").as_datetime().unwrap(),
            DateTime::from_calendar(2027, 5, 3, 11, 30, 12, 345, 3600).unwrap()
        );
        assert_eq!(
            read("d\"2017-05-03T22:30:00+04\"").as_datetime().unwrap(),
            DateTime::from_calendar(2017, 5, 3, 22, 30, 0, 0, 4 * 3600).unwrap()
        );
        assert_eq!(
            read("d\"2017-05-03T11:30:00-0700\"").as_datetime().unwrap(),
            DateTime::from_calendar(2017, 5, 3, 11, 30, 0, 0, -7 * 3600).unwrap()
        );
        assert_eq!(
            read("d\"2017-05-03T15:00:00-0330\"").as_datetime().unwrap(),
            DateTime::from_calendar(2017, 5, 3, 15, 0, 0, 0, -12600).unwrap()
        );
    }

    #[test]
    fn doubles() {
        assert_eq!(read("0x1.bep+7").as_double(), Some(223.0));
        assert_eq!(read("-0x1.cp+0").as_double(), Some(-1.75));
        assert_eq!(read("2.0p+0").as_double(), Some(2.0));
        assert_eq!(read("2p0").as_double(), Some(2.0));
        assert_eq!(read("2.5P+1").as_double(), Some(5.0));
        assert_eq!(read("-2.0p-1").as_double(), Some(-1.0));
        assert_eq!(read("1.5p-2").as_double(), Some(0.375));
        // The writer's form round-trips exactly.
        for v in [223.0, -1.75, 0.1, f64::MIN_POSITIVE, 1e300] {
            let text = write(&RpcValue::from(v));
            assert_eq!(read(&text).as_double(), Some(v), "via {text}");
        }
    }

    #[test]
    fn style_normalization() {
        for (input, normalized) in [
            ("0xab", "171"),
            ("-0xCD", "-205"),
            ("0x1a2b3c4d", "439041101"),
            ("12.3e-10", "1.23E-9"),
            ("-0.00012", "-0.00012"),
            ("-1234567890.", "-1234567890.0"),
            ("[1,]", "[1]"),
            ("[1, 2, 3]", "[1,2,3]"),
            ("i{\n\t1: \"bar\",\n\t345u : \"foo\",\n}", "i{1:\"bar\",345:\"foo\"}"),
            ("<\"foo\":\"bar\",1:2>i{1:<7:8>9}", "<1:2,\"foo\":\"bar\">i{1:<7:8>9}"),
            ("i{1:2 // comment to end of line\n}", "i{1:2}"),
            ("d\"2019-05-03T11:30:00-0700\"", "d\"2019-05-03T11:30:00-07\""),
            ("x\"abcd\"", "b\"\\ab\\cd\""),
            ("223.", "223.0"),
            ("2.30", "2.30"),
        ] {
            assert_eq!(write(&read(input)), normalized, "normalizing {input}");
        }
    }

    #[test]
    fn comments() {
        let text = "/*comment 1*/{ /*comment 2*/\n\
                    \t\"foo\"/*comment \"3\"*/: \"bar\", //comment to end of line\n\
                    \t\"baz\" : 1,\n\
                    /*\n\tmultiline comment\n\t\"baz\" : 1,\n\t\"baz\" : 1, // single inside multi\n*/\n\
                    }";
        assert_eq!(write(&read(text)), "{\"baz\":1,\"foo\":\"bar\"}");
    }

    #[test]
    fn blob_escapes() {
        assert_eq!(
            read("b\"ab\\cd\\t\\r\\n\"").as_blob().unwrap(),
            b"ab\xcd\t\r\n"
        );
        let all: Vec<u8> = (0u8..=255).collect();
        let text = write(&RpcValue::from(all.clone()));
        assert_eq!(read(&text).as_blob().unwrap(), &all[..]);
    }

    #[test]
    fn chainpack_cpon_equivalence() {
        // Both codecs decode to the same value: <1:2>[3,<4:5>6].
        let cp = [
            0x8b, 0x41, 0x42, 0xff, 0x88, 0x43, 0x8b, 0x44, 0x45, 0xff, 0x46, 0xff,
        ];
        assert_eq!(ChainPackReader::unpack(&cp).unwrap(), read("<1:2>[3,<4:5>6]"));
    }

    #[test]
    fn cross_codec_round_trip() {
        let mut meta = MetaMap::new();
        meta.insert(8, RpcValue::from(3u64));
        let value = shv_imap! {
            2 => shv_list![shv_list![RpcValue::from(".broker"), RpcValue::from(true)]]
        }
        .with_meta(meta);
        let cp = ChainPackWriter::<Vec<u8>>::pack(&value);
        let via_cpon = crate::chainpack_to_cpon(&cp).unwrap();
        assert_eq!(CponReader::unpack(&via_cpon).unwrap(), value);
        assert_eq!(ChainPackReader::unpack(&cp).unwrap(), value);
    }

    #[test]
    fn indented_output() {
        let value = shv_list![1, 2, 3];
        let mut buf = Vec::new();
        CponWriter::with_options(
            &mut buf,
            CponWriterOptions {
                indent: "  ".into(),
            },
        )
        .write(&value)
        .unwrap();
        assert_eq!(String::from_utf8(buf).unwrap(), "[1, 2, 3]");

        let nested = shv_list![shv_list![1], 2];
        let mut buf = Vec::new();
        CponWriter::with_options(
            &mut buf,
            CponWriterOptions {
                indent: "\t".into(),
            },
        )
        .write(&nested)
        .unwrap();
        assert_eq!(String::from_utf8(buf).unwrap(), "[\n\t[1],\n\t2\n]");
    }
}
