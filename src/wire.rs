//! Binary transfer format
//!
//! Everything this crate persists or transmits goes through the codec in
//! this module: arithmetic types are little-endian fixed width, strings are
//! 16 bit length prefixed, byte vectors 32 bit length prefixed, fixed size
//! arrays are emitted verbatim, and compound types read their fields in
//! declaration order. Decoding is strict; a short buffer or stray trailing
//! bytes are an error, never silently ignored.
//!
//! Every [`TransferFormat`] type also names itself through
//! [`TransferFormat::TYPE_NAME`]. The RPC layer assembles its method
//! signature strings out of these names, so they must be stable and agreed
//! upon by both peers.

/// Error produced while decoding a byte stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamError {
    /// The stream ended before the value was complete.
    UnexpectedEnd,
    /// The value was complete but bytes were left over.
    TrailingBytes,
    /// A field held a value that does not decode (bad bool, bad enum tag, invalid UTF-8).
    Invalid,
}

impl core::fmt::Display for StreamError {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        match self {
            StreamError::UnexpectedEnd => write!(f, "unexpected end of stream"),
            StreamError::TrailingBytes => write!(f, "trailing bytes after value"),
            StreamError::Invalid => write!(f, "invalid field value"),
        }
    }
}

/// A cursor over a byte slice being decoded.
#[derive(Debug, Clone)]
pub struct Stream<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Stream<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Stream { data, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn is_eof(&self) -> bool {
        self.remaining() == 0
    }

    /// Take the next `n` bytes off the stream.
    pub fn take(&mut self, n: usize) -> Result<&'a [u8], StreamError> {
        if self.remaining() < n {
            return Err(StreamError::UnexpectedEnd);
        }
        let out = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn byte(&mut self) -> Result<u8, StreamError> {
        Ok(self.take(1)?[0])
    }

    /// The not yet consumed tail of the stream.
    pub fn rest(&mut self) -> &'a [u8] {
        let out = &self.data[self.pos..];
        self.pos = self.data.len();
        out
    }
}

/// Types with a wire representation.
pub trait TransferFormat: Sized {
    /// Stable type label used in RPC signature strings.
    const TYPE_NAME: &'static str;

    /// Decode one value off the stream, leaving the cursor after it.
    fn read_from(s: &mut Stream<'_>) -> Result<Self, StreamError>;

    /// Append the wire form of the value.
    fn write_to(&self, out: &mut Vec<u8>);
}

/// Encode a single value into a fresh buffer.
pub fn encode<T: TransferFormat>(value: &T) -> Vec<u8> {
    let mut out = Vec::new();
    value.write_to(&mut out);
    out
}

/// Strictly decode a single value: the buffer must hold exactly one.
pub fn decode<T: TransferFormat>(data: &[u8]) -> Result<T, StreamError> {
    let mut s = Stream::new(data);
    let value = T::read_from(&mut s)?;
    if !s.is_eof() {
        return Err(StreamError::TrailingBytes);
    }
    Ok(value)
}

macro_rules! impl_transfer_format_for_number {
    ($num:ty, $name:literal) => {
        impl TransferFormat for $num {
            const TYPE_NAME: &'static str = $name;

            fn read_from(s: &mut Stream<'_>) -> Result<Self, StreamError> {
                let raw = s.take(core::mem::size_of::<$num>())?;
                let mut bytes = <[u8; core::mem::size_of::<$num>()]>::default();
                bytes.copy_from_slice(raw);
                Ok(Self::from_le_bytes(bytes))
            }

            fn write_to(&self, out: &mut Vec<u8>) {
                out.extend_from_slice(&self.to_le_bytes());
            }
        }
    };
}

impl_transfer_format_for_number! {u8, "u8"}
impl_transfer_format_for_number! {i8, "i8"}
impl_transfer_format_for_number! {u16, "u16"}
impl_transfer_format_for_number! {i16, "i16"}
impl_transfer_format_for_number! {u32, "u32"}
impl_transfer_format_for_number! {i32, "i32"}
impl_transfer_format_for_number! {u64, "u64"}
impl_transfer_format_for_number! {i64, "i64"}

impl TransferFormat for bool {
    const TYPE_NAME: &'static str = "bool";

    fn read_from(s: &mut Stream<'_>) -> Result<Self, StreamError> {
        match s.byte()? {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(StreamError::Invalid),
        }
    }

    fn write_to(&self, out: &mut Vec<u8>) {
        out.push(u8::from(*self));
    }
}

impl TransferFormat for () {
    const TYPE_NAME: &'static str = "()";

    fn read_from(_: &mut Stream<'_>) -> Result<Self, StreamError> {
        Ok(())
    }

    fn write_to(&self, _: &mut Vec<u8>) {}
}

impl TransferFormat for String {
    const TYPE_NAME: &'static str = "str";

    fn read_from(s: &mut Stream<'_>) -> Result<Self, StreamError> {
        let len = u16::read_from(s)? as usize;
        let raw = s.take(len)?;
        String::from_utf8(raw.to_vec()).map_err(|_| StreamError::Invalid)
    }

    fn write_to(&self, out: &mut Vec<u8>) {
        debug_assert!(self.len() <= u16::MAX as usize);
        (self.len() as u16).write_to(out);
        out.extend_from_slice(self.as_bytes());
    }
}

impl TransferFormat for Vec<u8> {
    const TYPE_NAME: &'static str = "bytes";

    fn read_from(s: &mut Stream<'_>) -> Result<Self, StreamError> {
        let len = u32::read_from(s)? as usize;
        Ok(s.take(len)?.to_vec())
    }

    fn write_to(&self, out: &mut Vec<u8>) {
        (self.len() as u32).write_to(out);
        out.extend_from_slice(self);
    }
}

impl<const N: usize> TransferFormat for [u8; N] {
    const TYPE_NAME: &'static str = "blob";

    fn read_from(s: &mut Stream<'_>) -> Result<Self, StreamError> {
        let mut raw = [0u8; N];
        raw.copy_from_slice(s.take(N)?);
        Ok(raw)
    }

    fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self);
    }
}

impl<T: TransferFormat> TransferFormat for Option<T> {
    const TYPE_NAME: &'static str = "option";

    fn read_from(s: &mut Stream<'_>) -> Result<Self, StreamError> {
        if bool::read_from(s)? {
            Ok(Some(T::read_from(s)?))
        } else {
            Ok(None)
        }
    }

    fn write_to(&self, out: &mut Vec<u8>) {
        self.is_some().write_to(out);
        if let Some(inner) = self {
            inner.write_to(out);
        }
    }
}

impl TransferFormat for crate::GateId {
    const TYPE_NAME: &'static str = "gate_id";

    fn read_from(s: &mut Stream<'_>) -> Result<Self, StreamError> {
        Ok(crate::GateId::new(u32::read_from(s)?))
    }

    fn write_to(&self, out: &mut Vec<u8>) {
        self.value().write_to(out);
    }
}

/// An argument pack for RPC calls; extracted in declaration order.
pub trait ArgList: Sized {
    const TYPE_NAMES: &'static [&'static str];

    fn read_all(s: &mut Stream<'_>) -> Result<Self, StreamError>;

    fn write_all(&self, out: &mut Vec<u8>);
}

impl ArgList for () {
    const TYPE_NAMES: &'static [&'static str] = &[];

    fn read_all(_: &mut Stream<'_>) -> Result<Self, StreamError> {
        Ok(())
    }

    fn write_all(&self, _: &mut Vec<u8>) {}
}

impl<A: TransferFormat> ArgList for (A,) {
    const TYPE_NAMES: &'static [&'static str] = &[A::TYPE_NAME];

    fn read_all(s: &mut Stream<'_>) -> Result<Self, StreamError> {
        Ok((A::read_from(s)?,))
    }

    fn write_all(&self, out: &mut Vec<u8>) {
        self.0.write_to(out);
    }
}

impl<A: TransferFormat, B: TransferFormat> ArgList for (A, B) {
    const TYPE_NAMES: &'static [&'static str] = &[A::TYPE_NAME, B::TYPE_NAME];

    fn read_all(s: &mut Stream<'_>) -> Result<Self, StreamError> {
        Ok((A::read_from(s)?, B::read_from(s)?))
    }

    fn write_all(&self, out: &mut Vec<u8>) {
        self.0.write_to(out);
        self.1.write_to(out);
    }
}

impl<A: TransferFormat, B: TransferFormat, C: TransferFormat> ArgList for (A, B, C) {
    const TYPE_NAMES: &'static [&'static str] = &[A::TYPE_NAME, B::TYPE_NAME, C::TYPE_NAME];

    fn read_all(s: &mut Stream<'_>) -> Result<Self, StreamError> {
        Ok((A::read_from(s)?, B::read_from(s)?, C::read_from(s)?))
    }

    fn write_all(&self, out: &mut Vec<u8>) {
        self.0.write_to(out);
        self.1.write_to(out);
        self.2.write_to(out);
    }
}
