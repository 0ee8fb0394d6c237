//! The value model: primitive wire types, bit packing, field tables/arrays.
//!
//! Every primitive is read and written big-endian, per the wire format. All
//! reads are bounds-checked against the buffer's `remaining()` rather than
//! relying on `bytes::Buf`'s panicking getters, so a short read surfaces as
//! [`ProtocolError::Truncated`] instead of a panic.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::ProtocolError;

fn ensure(buf: &Bytes, n: usize) -> Result<(), ProtocolError> {
    if buf.remaining() < n {
        Err(ProtocolError::Truncated)
    } else {
        Ok(())
    }
}

pub fn read_u8(buf: &mut Bytes) -> Result<u8, ProtocolError> {
    ensure(buf, 1)?;
    Ok(buf.get_u8())
}

pub fn write_u8(out: &mut BytesMut, v: u8) {
    out.put_u8(v);
}

pub fn read_i8(buf: &mut Bytes) -> Result<i8, ProtocolError> {
    ensure(buf, 1)?;
    Ok(buf.get_i8())
}

pub fn write_i8(out: &mut BytesMut, v: i8) {
    out.put_i8(v);
}

pub fn read_u16(buf: &mut Bytes) -> Result<u16, ProtocolError> {
    ensure(buf, 2)?;
    Ok(buf.get_u16())
}

pub fn write_u16(out: &mut BytesMut, v: u16) {
    out.put_u16(v);
}

pub fn read_i16(buf: &mut Bytes) -> Result<i16, ProtocolError> {
    ensure(buf, 2)?;
    Ok(buf.get_i16())
}

pub fn write_i16(out: &mut BytesMut, v: i16) {
    out.put_i16(v);
}

pub fn read_u32(buf: &mut Bytes) -> Result<u32, ProtocolError> {
    ensure(buf, 4)?;
    Ok(buf.get_u32())
}

pub fn write_u32(out: &mut BytesMut, v: u32) {
    out.put_u32(v);
}

pub fn read_i32(buf: &mut Bytes) -> Result<i32, ProtocolError> {
    ensure(buf, 4)?;
    Ok(buf.get_i32())
}

pub fn write_i32(out: &mut BytesMut, v: i32) {
    out.put_i32(v);
}

pub fn read_u64(buf: &mut Bytes) -> Result<u64, ProtocolError> {
    ensure(buf, 8)?;
    Ok(buf.get_u64())
}

pub fn write_u64(out: &mut BytesMut, v: u64) {
    out.put_u64(v);
}

pub fn read_i64(buf: &mut Bytes) -> Result<i64, ProtocolError> {
    ensure(buf, 8)?;
    Ok(buf.get_i64())
}

pub fn write_i64(out: &mut BytesMut, v: i64) {
    out.put_i64(v);
}

pub fn read_f32(buf: &mut Bytes) -> Result<f32, ProtocolError> {
    ensure(buf, 4)?;
    Ok(buf.get_f32())
}

pub fn write_f32(out: &mut BytesMut, v: f32) {
    out.put_f32(v);
}

pub fn read_f64(buf: &mut Bytes) -> Result<f64, ProtocolError> {
    ensure(buf, 8)?;
    Ok(buf.get_f64())
}

pub fn write_f64(out: &mut BytesMut, v: f64) {
    out.put_f64(v);
}

/// Short string: one-octet length prefix, up to 255 bytes of UTF-8 text.
pub fn read_short_str(buf: &mut Bytes) -> Result<String, ProtocolError> {
    let len = read_u8(buf)? as usize;
    ensure(buf, len)?;
    let bytes = buf.copy_to_bytes(len);
    String::from_utf8(bytes.to_vec()).map_err(|_| ProtocolError::Truncated)
}

pub fn write_short_str(out: &mut BytesMut, s: &str) -> Result<(), ProtocolError> {
    if s.len() > 255 {
        return Err(ProtocolError::ShortStrTooLong(s.len()));
    }
    write_u8(out, s.len() as u8);
    out.extend_from_slice(s.as_bytes());
    Ok(())
}

/// Long string: four-octet byte length prefix, raw bytes (not assumed UTF-8 —
/// used both for textual fields like `mechanisms` and for opaque blobs like a
/// SASL response).
pub fn read_long_str(buf: &mut Bytes) -> Result<Bytes, ProtocolError> {
    let len = read_u32(buf)? as usize;
    ensure(buf, len)?;
    Ok(buf.copy_to_bytes(len))
}

pub fn write_long_str(out: &mut BytesMut, bytes: &[u8]) {
    write_u32(out, bytes.len() as u32);
    out.extend_from_slice(bytes);
}

/// A fixed-point decimal: a scale octet and an unscaled `u32` value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decimal {
    pub scale: u8,
    pub value: u32,
}

pub fn read_decimal(buf: &mut Bytes) -> Result<Decimal, ProtocolError> {
    let scale = read_u8(buf)?;
    let value = read_u32(buf)?;
    Ok(Decimal { scale, value })
}

pub fn write_decimal(out: &mut BytesMut, d: Decimal) {
    write_u8(out, d.scale);
    write_u32(out, d.value);
}

/// Bit-field writer: packs consecutive boolean arguments into octets,
/// least-significant bit first, per §4.1.
#[derive(Debug, Default)]
pub struct BitWriter {
    pos: u8,
    octet: u8,
}

impl BitWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push one bit. Flushes automatically once 8 bits have accumulated.
    pub fn push(&mut self, out: &mut BytesMut, bit: bool) {
        if bit {
            self.octet |= 1 << self.pos;
        }
        self.pos += 1;
        if self.pos == 8 {
            self.flush(out);
        }
    }

    /// Emit the staging octet if any bits are pending, and reset.
    pub fn flush(&mut self, out: &mut BytesMut) {
        if self.pos > 0 {
            out.put_u8(self.octet);
            self.pos = 0;
            self.octet = 0;
        }
    }
}

/// Bit-field reader, the mirror of [`BitWriter`].
///
/// The source this protocol is modeled after has a known bug here: its bit
/// position is never reset to zero after the 8th bit is read, because an
/// assignment was apparently intended where a comparison was written. This
/// implementation resets to zero on the 8th bit, which is the correct and
/// only sane behavior — see `DESIGN.md`.
#[derive(Debug, Default)]
pub struct BitReader {
    pos: u8,
    octet: u8,
}

impl BitReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pull(&mut self, buf: &mut Bytes) -> Result<bool, ProtocolError> {
        if self.pos == 0 {
            self.octet = read_u8(buf)?;
        }
        let bit = (self.octet >> self.pos) & 1 == 1;
        self.pos += 1;
        if self.pos == 8 {
            self.pos = 0;
        }
        Ok(bit)
    }

    /// Called when a non-bit argument follows a run of bits: discards any
    /// partially-read octet so the next bit run starts fresh.
    pub fn reset(&mut self) {
        self.pos = 0;
        self.octet = 0;
    }
}

/// A tagged value as carried inside a [`FieldTable`] or [`FieldArray`].
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Boolean(bool),
    I8(i8),
    U8(u8),
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    F32(f32),
    F64(f64),
    Decimal(Decimal),
    /// Tag `s`: a distinct `u16` carrier from the `U`/`u` pair above — the
    /// type-tag alphabet assigns it its own byte, so it round-trips as its
    /// own variant rather than collapsing into `U16`.
    Short(u16),
    LongString(Bytes),
    ByteArray(Bytes),
    Array(FieldArray),
    Timestamp(u64),
    Table(FieldTable),
    Absent,
}

impl FieldValue {
    fn tag(&self) -> u8 {
        match self {
            FieldValue::Boolean(_) => b't',
            FieldValue::I8(_) => b'b',
            FieldValue::U8(_) => b'B',
            FieldValue::I16(_) => b'U',
            FieldValue::U16(_) => b'u',
            FieldValue::I32(_) => b'I',
            FieldValue::U32(_) => b'i',
            FieldValue::I64(_) => b'L',
            FieldValue::U64(_) => b'l',
            FieldValue::F32(_) => b'f',
            FieldValue::F64(_) => b'd',
            FieldValue::Decimal(_) => b'D',
            FieldValue::Short(_) => b's',
            FieldValue::LongString(_) => b'S',
            FieldValue::ByteArray(_) => b'x',
            FieldValue::Array(_) => b'A',
            FieldValue::Timestamp(_) => b'T',
            FieldValue::Table(_) => b'F',
            FieldValue::Absent => b'V',
        }
    }

    fn write(&self, out: &mut BytesMut) {
        match self {
            FieldValue::Boolean(v) => write_u8(out, if *v { 1 } else { 0 }),
            FieldValue::I8(v) => write_i8(out, *v),
            FieldValue::U8(v) => write_u8(out, *v),
            FieldValue::I16(v) => write_i16(out, *v),
            FieldValue::U16(v) => write_u16(out, *v),
            FieldValue::I32(v) => write_i32(out, *v),
            FieldValue::U32(v) => write_u32(out, *v),
            FieldValue::I64(v) => write_i64(out, *v),
            FieldValue::U64(v) => write_u64(out, *v),
            FieldValue::F32(v) => write_f32(out, *v),
            FieldValue::F64(v) => write_f64(out, *v),
            FieldValue::Decimal(d) => write_decimal(out, *d),
            FieldValue::Short(v) => write_u16(out, *v),
            FieldValue::LongString(b) => write_long_str(out, b),
            FieldValue::ByteArray(b) => write_long_str(out, b),
            FieldValue::Array(a) => a.write(out),
            FieldValue::Timestamp(v) => write_u64(out, *v),
            FieldValue::Table(t) => t.write(out),
            FieldValue::Absent => {}
        }
    }

    fn read(tag: u8, buf: &mut Bytes) -> Result<Self, ProtocolError> {
        Ok(match tag {
            b't' => FieldValue::Boolean(read_u8(buf)? != 0),
            b'b' => FieldValue::I8(read_i8(buf)?),
            b'B' => FieldValue::U8(read_u8(buf)?),
            b'U' => FieldValue::I16(read_i16(buf)?),
            b'u' => FieldValue::U16(read_u16(buf)?),
            b'I' => FieldValue::I32(read_i32(buf)?),
            b'i' => FieldValue::U32(read_u32(buf)?),
            b'L' => FieldValue::I64(read_i64(buf)?),
            b'l' => FieldValue::U64(read_u64(buf)?),
            b'f' => FieldValue::F32(read_f32(buf)?),
            b'd' => FieldValue::F64(read_f64(buf)?),
            b'D' => FieldValue::Decimal(read_decimal(buf)?),
            b's' => FieldValue::Short(read_u16(buf)?),
            b'S' => FieldValue::LongString(read_long_str(buf)?),
            b'x' => FieldValue::ByteArray(read_long_str(buf)?),
            b'A' => FieldValue::Array(FieldArray::read(buf)?),
            b'T' => FieldValue::Timestamp(read_u64(buf)?),
            b'F' => FieldValue::Table(FieldTable::read(buf)?),
            b'V' => FieldValue::Absent,
            other => return Err(ProtocolError::UnknownTypeTag(other)),
        })
    }

    fn write_tagged(&self, out: &mut BytesMut) {
        write_u8(out, self.tag());
        self.write(out);
    }

    fn read_tagged(buf: &mut Bytes) -> Result<Self, ProtocolError> {
        let tag = read_u8(buf)?;
        Self::read(tag, buf)
    }
}

/// An ordered sequence of `(name, value)` pairs, four-octet byte length
/// prefixed. Order is preserved rather than collapsed into a `HashMap`, both
/// because the wire format is a sequence and because it keeps encode/decode
/// round-trips byte-identical for the scenario tests in §8.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldTable(Vec<(String, FieldValue)>);

impl FieldTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: FieldValue) {
        let name = name.into();
        if let Some(slot) = self.0.iter_mut().find(|(k, _)| *k == name) {
            slot.1 = value;
        } else {
            self.0.push((name, value));
        }
    }

    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.0.iter().find(|(k, _)| k == name).map(|(_, v)| v)
    }

    pub fn contains_key(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(String, FieldValue)> {
        self.0.iter()
    }

    fn write(&self, out: &mut BytesMut) {
        let mut staging = BytesMut::new();
        for (name, value) in &self.0 {
            // Infallible here: catalog-built tables never exceed 255-byte
            // names; a caller constructing one by hand gets a panic, same as
            // handing `bytes::BufMut` an oversized write would.
            write_short_str(&mut staging, name).expect("field table key must fit in a short string");
            value.write_tagged(&mut staging);
        }
        write_u32(out, staging.len() as u32);
        out.extend_from_slice(&staging);
    }

    fn read(buf: &mut Bytes) -> Result<Self, ProtocolError> {
        let len = read_u32(buf)? as usize;
        ensure(buf, len)?;
        let mut body = buf.copy_to_bytes(len);
        let mut pairs = Vec::new();
        while body.has_remaining() {
            let name = read_short_str(&mut body)?;
            let value = FieldValue::read_tagged(&mut body)?;
            pairs.push((name, value));
        }
        Ok(FieldTable(pairs))
    }
}

impl FromIterator<(String, FieldValue)> for FieldTable {
    fn from_iter<I: IntoIterator<Item = (String, FieldValue)>>(iter: I) -> Self {
        let mut table = FieldTable::new();
        for (k, v) in iter {
            table.insert(k, v);
        }
        table
    }
}

/// An ordered sequence of values, four-octet byte length prefixed, no names.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldArray(Vec<FieldValue>);

impl FieldArray {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, value: FieldValue) {
        self.0.push(value);
    }

    pub fn iter(&self) -> impl Iterator<Item = &FieldValue> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn write(&self, out: &mut BytesMut) {
        let mut staging = BytesMut::new();
        for value in &self.0 {
            value.write_tagged(&mut staging);
        }
        write_u32(out, staging.len() as u32);
        out.extend_from_slice(&staging);
    }

    fn read(buf: &mut Bytes) -> Result<Self, ProtocolError> {
        let len = read_u32(buf)? as usize;
        ensure(buf, len)?;
        let mut body = buf.copy_to_bytes(len);
        let mut values = Vec::new();
        while body.has_remaining() {
            values.push(FieldValue::read_tagged(&mut body)?);
        }
        Ok(FieldArray(values))
    }
}

/// Public entry points for encoding/decoding a top-level [`FieldTable`], used
/// both by the method argument codec and directly by callers building
/// client/server property bags.
pub fn encode_field_table(table: &FieldTable) -> BytesMut {
    let mut out = BytesMut::new();
    table.write(&mut out);
    out
}

pub fn decode_field_table(buf: &mut Bytes) -> Result<FieldTable, ProtocolError> {
    FieldTable::read(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_str_round_trip() {
        let mut out = BytesMut::new();
        write_short_str(&mut out, "hello").unwrap();
        assert_eq!(&out[..], &[0x05, b'h', b'e', b'l', b'l', b'o']);

        let mut buf = out.freeze();
        assert_eq!(read_short_str(&mut buf).unwrap(), "hello");
    }

    #[test]
    fn short_str_rejects_oversized() {
        let s = "x".repeat(256);
        let mut out = BytesMut::new();
        assert_eq!(write_short_str(&mut out, &s), Err(ProtocolError::ShortStrTooLong(256)));
    }

    #[test]
    fn long_str_round_trip() {
        let mut out = BytesMut::new();
        write_long_str(&mut out, b"hello world");
        let mut buf = out.freeze();
        assert_eq!(&read_long_str(&mut buf).unwrap()[..], b"hello world");
    }

    #[test]
    fn field_table_single_bool_matches_scenario() {
        let mut table = FieldTable::new();
        table.insert("ok", FieldValue::Boolean(true));
        let encoded = encode_field_table(&table);
        assert_eq!(&encoded[..], &[0x00, 0x00, 0x00, 0x05, 0x02, b'o', b'k', b't', 0x01]);

        let mut buf = encoded.freeze();
        let decoded = decode_field_table(&mut buf).unwrap();
        assert_eq!(decoded, table);
    }

    #[test]
    fn field_table_round_trip_many_types() {
        let mut table = FieldTable::new();
        table.insert("a", FieldValue::U32(42));
        table.insert("b", FieldValue::LongString(Bytes::from_static(b"text")));
        table.insert("c", FieldValue::Boolean(false));
        let mut nested = FieldTable::new();
        nested.insert("inner", FieldValue::I64(-7));
        table.insert("d", FieldValue::Table(nested));

        let encoded = encode_field_table(&table);
        let declared_len = u32::from_be_bytes(encoded[0..4].try_into().unwrap()) as usize;
        assert_eq!(declared_len, encoded.len() - 4);

        let mut buf = encoded.freeze();
        let decoded = decode_field_table(&mut buf).unwrap();
        assert_eq!(decoded, table);
    }

    #[test]
    fn field_array_round_trip() {
        let mut arr = FieldArray::new();
        arr.push(FieldValue::U8(1));
        arr.push(FieldValue::Boolean(true));
        arr.push(FieldValue::LongString(Bytes::from_static(b"x")));

        let mut out = BytesMut::new();
        arr.write(&mut out);
        let mut buf = out.freeze();
        let decoded = FieldArray::read(&mut buf).unwrap();
        assert_eq!(decoded, arr);
    }

    #[test]
    fn bit_writer_packs_single_bit_into_one_octet() {
        let mut out = BytesMut::new();
        let mut w = BitWriter::new();
        w.push(&mut out, true);
        w.flush(&mut out);
        assert_eq!(&out[..], &[0b0000_0001]);
    }

    #[test]
    fn bit_writer_packs_nine_bits_into_two_octets() {
        let mut out = BytesMut::new();
        let mut w = BitWriter::new();
        let bits = [true, false, true, false, true, false, true, false, true];
        for b in bits {
            w.push(&mut out, b);
        }
        w.flush(&mut out);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0], 0b0101_0101);
        assert_eq!(out[1], 0b0000_0001);
    }

    #[test]
    fn bit_reader_round_trips_bit_writer() {
        let bits = [true, false, false, true, true, true, false, false, true, false, true];
        let mut out = BytesMut::new();
        let mut w = BitWriter::new();
        for &b in &bits {
            w.push(&mut out, b);
        }
        w.flush(&mut out);

        let mut buf = out.freeze();
        let mut r = BitReader::new();
        let mut read_back = Vec::new();
        for _ in 0..bits.len() {
            read_back.push(r.pull(&mut buf).unwrap());
        }
        assert_eq!(read_back, bits);
    }

    #[test]
    fn truncated_read_is_an_error_not_a_panic() {
        let mut buf = Bytes::from_static(&[0x00]);
        assert_eq!(read_u16(&mut buf), Err(ProtocolError::Truncated));
    }

    #[test]
    fn unknown_type_tag_is_an_error() {
        let mut buf = Bytes::from_static(&[b'?']);
        assert_eq!(FieldValue::read_tagged(&mut buf), Err(ProtocolError::UnknownTypeTag(b'?')));
    }
}
