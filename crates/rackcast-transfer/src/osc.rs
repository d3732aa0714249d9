//! OSC 1.0 wire format: messages framed in bundles, carried over UDP.
//!
//! ```text
//! bundle:   "#bundle\0" | timetag (u64 BE) | { size (i32 BE) | element }*
//! message:  address (padded) | ",tags" (padded) | args
//! int32:    4 bytes BE          int64 / double: 8 bytes BE
//! string:   utf-8, NUL, padded to 4
//! blob:     size (i32 BE) | bytes | padding to 4
//! ```
//!
//! An empty immediate bundle is exactly 16 bytes (`EMPTY_BUNDLE_SIZE`). A
//! bundle that is still that size after building means nothing fit.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::OscError;

/// Bytes written by `begin_bundle` before any element.
pub const EMPTY_BUNDLE_SIZE: usize = 16;

/// Size prefix written before each bundle element.
pub const BUNDLE_ELEMENT_PREFIX: usize = 4;

/// Timetag meaning "process immediately".
pub const TIMETAG_IMMEDIATE: u64 = 1;

const BUNDLE_TAG: &[u8; 8] = b"#bundle\0";

/// Round up to the next multiple of 4.
#[inline]
pub fn pad4(n: usize) -> usize {
    (n + 3) & !3
}

/// Encoded size of an OSC string (NUL terminator included).
#[inline]
pub fn string_size(s: &str) -> usize {
    pad4(s.len() + 1)
}

/// A single typed OSC argument.
#[derive(Debug, Clone, PartialEq)]
pub enum OscArg {
    Int32(i32),
    Int64(i64),
    Float(f32),
    Double(f64),
    Str(String),
    Blob(Bytes),
    Bool(bool),
}

impl OscArg {
    pub fn tag(&self) -> char {
        match self {
            Self::Int32(_) => 'i',
            Self::Int64(_) => 'h',
            Self::Float(_) => 'f',
            Self::Double(_) => 'd',
            Self::Str(_) => 's',
            Self::Blob(_) => 'b',
            Self::Bool(true) => 'T',
            Self::Bool(false) => 'F',
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Int32(_) => "int32",
            Self::Int64(_) => "int64",
            Self::Float(_) => "float",
            Self::Double(_) => "double",
            Self::Str(_) => "string",
            Self::Blob(_) => "blob",
            Self::Bool(_) => "bool",
        }
    }

    /// Bytes this argument occupies in the argument section.
    pub fn data_size(&self) -> usize {
        match self {
            Self::Int32(_) | Self::Float(_) => 4,
            Self::Int64(_) | Self::Double(_) => 8,
            Self::Str(s) => string_size(s),
            Self::Blob(b) => 4 + pad4(b.len()),
            Self::Bool(_) => 0,
        }
    }

    fn put(&self, buf: &mut BytesMut) {
        match self {
            Self::Int32(v) => buf.put_i32(*v),
            Self::Int64(v) => buf.put_i64(*v),
            Self::Float(v) => buf.put_f32(*v),
            Self::Double(v) => buf.put_f64(*v),
            Self::Str(s) => put_string(buf, s),
            Self::Blob(b) => {
                buf.put_i32(b.len() as i32);
                buf.put_slice(b);
                buf.put_bytes(0, pad4(b.len()) - b.len());
            }
            Self::Bool(_) => {}
        }
    }
}

impl From<i32> for OscArg {
    fn from(v: i32) -> Self {
        Self::Int32(v)
    }
}

impl From<i64> for OscArg {
    fn from(v: i64) -> Self {
        Self::Int64(v)
    }
}

impl From<f32> for OscArg {
    fn from(v: f32) -> Self {
        Self::Float(v)
    }
}

impl From<f64> for OscArg {
    fn from(v: f64) -> Self {
        Self::Double(v)
    }
}

impl From<bool> for OscArg {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<&str> for OscArg {
    fn from(v: &str) -> Self {
        Self::Str(v.to_owned())
    }
}

impl From<String> for OscArg {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

impl From<Bytes> for OscArg {
    fn from(v: Bytes) -> Self {
        Self::Blob(v)
    }
}

/// An address pattern plus its arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct OscMessage {
    pub address: String,
    pub args: Vec<OscArg>,
}

impl OscMessage {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            args: Vec::new(),
        }
    }

    /// Append an argument, builder style.
    pub fn arg(mut self, arg: impl Into<OscArg>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn push(&mut self, arg: impl Into<OscArg>) {
        self.args.push(arg.into());
    }

    pub fn type_tags(&self) -> String {
        let mut tags = String::with_capacity(self.args.len() + 1);
        tags.push(',');
        tags.extend(self.args.iter().map(OscArg::tag));
        tags
    }

    /// Encoded size of this message outside of any bundle.
    pub fn encoded_size(&self) -> usize {
        string_size(&self.address)
            + pad4(self.args.len() + 2)
            + self.args.iter().map(OscArg::data_size).sum::<usize>()
    }

    /// Encode as a standalone packet (no bundle framing).
    pub fn encode(&self) -> Result<Bytes, OscError> {
        let mut stream = OscStream::new(self.encoded_size());
        stream.write_message(self)?;
        Ok(stream.into_bytes())
    }

    pub fn cursor(&self) -> ArgCursor<'_> {
        ArgCursor::new(&self.args)
    }

    fn put(&self, buf: &mut BytesMut) {
        put_string(buf, &self.address);
        put_string(buf, &self.type_tags());
        for arg in &self.args {
            arg.put(buf);
        }
    }
}

fn put_string(buf: &mut BytesMut, s: &str) {
    buf.put_slice(s.as_bytes());
    buf.put_bytes(0, string_size(s) - s.len());
}

/// A decoded packet: a message or a (possibly nested) bundle.
#[derive(Debug, Clone, PartialEq)]
pub enum OscPacket {
    Message(OscMessage),
    Bundle { timetag: u64, packets: Vec<OscPacket> },
}

impl OscPacket {
    /// Flatten bundles into their messages, depth first.
    pub fn into_messages(self) -> Vec<OscMessage> {
        let mut out = Vec::new();
        self.collect_into(&mut out);
        out
    }

    fn collect_into(self, out: &mut Vec<OscMessage>) {
        match self {
            Self::Message(msg) => out.push(msg),
            Self::Bundle { packets, .. } => {
                for packet in packets {
                    packet.collect_into(out);
                }
            }
        }
    }
}

/// Fixed-capacity scratch buffer that messages are built into.
///
/// Writes are all-or-nothing: a message that does not fit returns
/// `OscError::OutOfBuffer` and leaves the stream exactly as it was, so the
/// caller can send what is already there and retry in a fresh stream.
pub struct OscStream {
    buf: BytesMut,
    capacity: usize,
    in_bundle: bool,
}

impl OscStream {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
            capacity,
            in_bundle: false,
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.capacity - self.buf.len()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
        self.in_bundle = false;
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> Bytes {
        self.buf.freeze()
    }

    /// Open an immediate bundle. Only top-level bundles are written.
    pub fn begin_bundle(&mut self) -> Result<(), OscError> {
        if self.in_bundle {
            return Err(OscError::MalformedBundle("nested bundles are not written"));
        }
        self.reserve(EMPTY_BUNDLE_SIZE)?;
        self.buf.put_slice(BUNDLE_TAG);
        self.buf.put_u64(TIMETAG_IMMEDIATE);
        self.in_bundle = true;
        Ok(())
    }

    pub fn end_bundle(&mut self) -> Result<(), OscError> {
        if !self.in_bundle {
            return Err(OscError::MalformedBundle("end_bundle without begin_bundle"));
        }
        self.in_bundle = false;
        Ok(())
    }

    pub fn write_message(&mut self, msg: &OscMessage) -> Result<(), OscError> {
        if !msg.address.starts_with('/') {
            return Err(OscError::InvalidAddress(msg.address.clone()));
        }
        let size = msg.encoded_size();
        let prefix = if self.in_bundle { BUNDLE_ELEMENT_PREFIX } else { 0 };
        self.reserve(prefix + size)?;

        if self.in_bundle {
            self.buf.put_i32(size as i32);
        }
        let start = self.buf.len();
        msg.put(&mut self.buf);
        debug_assert_eq!(self.buf.len() - start, size);
        Ok(())
    }

    fn reserve(&self, needed: usize) -> Result<(), OscError> {
        let remaining = self.remaining();
        if needed > remaining {
            return Err(OscError::OutOfBuffer { needed, remaining });
        }
        Ok(())
    }
}

/// Bundles nested deeper than this are rejected.
pub const MAX_BUNDLE_DEPTH: usize = 8;

/// Decode one UDP payload into a packet.
pub fn decode_packet(data: &[u8]) -> Result<OscPacket, OscError> {
    decode_element(data, 0)
}

fn decode_element(data: &[u8], depth: usize) -> Result<OscPacket, OscError> {
    let mut reader = Reader { data, pos: 0 };
    if data.starts_with(BUNDLE_TAG) {
        if depth >= MAX_BUNDLE_DEPTH {
            return Err(OscError::MalformedBundle("bundle nesting too deep"));
        }
        decode_bundle(&mut reader, depth)
    } else {
        decode_message(&mut reader).map(OscPacket::Message)
    }
}

fn decode_bundle(reader: &mut Reader<'_>, depth: usize) -> Result<OscPacket, OscError> {
    reader.skip(BUNDLE_TAG.len())?;
    let timetag = u64::from_be_bytes(reader.array()?);
    let mut packets = Vec::new();

    while !reader.at_end() {
        let size = i32::from_be_bytes(reader.array()?);
        if size < 0 || size % 4 != 0 {
            return Err(OscError::MalformedBundle("element size not a positive multiple of 4"));
        }
        let element = reader.take(size as usize)?;
        packets.push(decode_element(element, depth + 1)?);
    }

    Ok(OscPacket::Bundle { timetag, packets })
}

fn decode_message(reader: &mut Reader<'_>) -> Result<OscMessage, OscError> {
    let address = reader.string()?;
    if !address.starts_with('/') {
        return Err(OscError::InvalidAddress(address));
    }

    // Type tags may be omitted entirely by very old senders.
    if reader.at_end() {
        return Ok(OscMessage::new(address));
    }

    let tags_offset = reader.pos;
    let tags = reader.string()?;
    let mut chars = tags.chars();
    if chars.next() != Some(',') {
        return Err(OscError::InvalidString(tags_offset));
    }

    let mut args = Vec::with_capacity(tags.len() - 1);
    for tag in chars {
        let arg = match tag {
            'i' => OscArg::Int32(i32::from_be_bytes(reader.array()?)),
            'h' => OscArg::Int64(i64::from_be_bytes(reader.array()?)),
            'f' => OscArg::Float(f32::from_be_bytes(reader.array()?)),
            'd' => OscArg::Double(f64::from_be_bytes(reader.array()?)),
            's' => OscArg::Str(reader.string()?),
            'b' => {
                let len = i32::from_be_bytes(reader.array()?);
                if len < 0 {
                    return Err(OscError::Truncated(reader.pos));
                }
                let len = len as usize;
                let blob = Bytes::copy_from_slice(reader.take(len)?);
                reader.skip(pad4(len) - len)?;
                OscArg::Blob(blob)
            }
            'T' => OscArg::Bool(true),
            'F' => OscArg::Bool(false),
            other => return Err(OscError::UnsupportedTag(other)),
        };
        args.push(arg);
    }

    Ok(OscMessage { address, args })
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn at_end(&self) -> bool {
        self.pos >= self.data.len()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], OscError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.data.len())
            .ok_or(OscError::Truncated(self.pos))?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn skip(&mut self, n: usize) -> Result<(), OscError> {
        self.take(n).map(|_| ())
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], OscError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn string(&mut self) -> Result<String, OscError> {
        let start = self.pos;
        let rest = &self.data[start.min(self.data.len())..];
        let nul = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or(OscError::Truncated(start))?;
        let s = std::str::from_utf8(&rest[..nul])
            .map_err(|_| OscError::InvalidString(start))?
            .to_owned();
        self.skip(pad4(nul + 1))?;
        Ok(s)
    }
}

/// A number the companion may send either as a scale factor or a pixel height.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FloatOrInt {
    Float(f32),
    Int(i32),
}

/// Positional, typed access to a message's arguments.
pub struct ArgCursor<'a> {
    args: &'a [OscArg],
    pos: usize,
}

impl<'a> ArgCursor<'a> {
    pub fn new(args: &'a [OscArg]) -> Self {
        Self { args, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.args.len().saturating_sub(self.pos)
    }

    fn next(&mut self) -> Result<(usize, &'a OscArg), OscError> {
        let position = self.pos;
        let arg = self
            .args
            .get(position)
            .ok_or(OscError::MissingArgument(position))?;
        self.pos += 1;
        Ok((position, arg))
    }

    fn mismatch(position: usize, expected: &'static str, found: &OscArg) -> OscError {
        OscError::WrongArgumentType {
            position,
            expected,
            found: found.type_name(),
        }
    }

    pub fn int32(&mut self) -> Result<i32, OscError> {
        match self.next()? {
            (_, OscArg::Int32(v)) => Ok(*v),
            (p, other) => Err(Self::mismatch(p, "int32", other)),
        }
    }

    pub fn int64(&mut self) -> Result<i64, OscError> {
        match self.next()? {
            (_, OscArg::Int64(v)) => Ok(*v),
            (p, other) => Err(Self::mismatch(p, "int64", other)),
        }
    }

    pub fn float(&mut self) -> Result<f32, OscError> {
        match self.next()? {
            (_, OscArg::Float(v)) => Ok(*v),
            (p, other) => Err(Self::mismatch(p, "float", other)),
        }
    }

    pub fn string(&mut self) -> Result<&'a str, OscError> {
        match self.next()? {
            (_, OscArg::Str(v)) => Ok(v.as_str()),
            (p, other) => Err(Self::mismatch(p, "string", other)),
        }
    }

    pub fn bool(&mut self) -> Result<bool, OscError> {
        match self.next()? {
            (_, OscArg::Bool(v)) => Ok(*v),
            (p, other) => Err(Self::mismatch(p, "bool", other)),
        }
    }

    pub fn blob(&mut self) -> Result<&'a Bytes, OscError> {
        match self.next()? {
            (_, OscArg::Blob(v)) => Ok(v),
            (p, other) => Err(Self::mismatch(p, "blob", other)),
        }
    }

    pub fn float_or_int32(&mut self) -> Result<FloatOrInt, OscError> {
        match self.next()? {
            (_, OscArg::Float(v)) => Ok(FloatOrInt::Float(*v)),
            (_, OscArg::Int32(v)) => Ok(FloatOrInt::Int(*v)),
            (p, other) => Err(Self::mismatch(p, "float or int32", other)),
        }
    }

    /// Error if any arguments were left unread.
    pub fn finish(&self) -> Result<(), OscError> {
        match self.remaining() {
            0 => Ok(()),
            n => Err(OscError::ExcessArguments(n)),
        }
    }
}
