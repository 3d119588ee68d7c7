//! Outbound message bodies.

use std::io::{self, Read, Write};

use bytes::Bytes;
use serde::Serialize;

use crate::error::Result;

/// Something that can be written as a message body.
///
/// The declared length goes into the header before the body is written, so
/// `write_body` must produce exactly `body_length` bytes.
pub trait BodyWriter {
    fn body_length(&self) -> u64;
    fn write_body(&self, out: &mut dyn Write) -> io::Result<()>;
}

impl BodyWriter for [u8] {
    fn body_length(&self) -> u64 {
        self.len() as u64
    }

    fn write_body(&self, out: &mut dyn Write) -> io::Result<()> {
        out.write_all(self)
    }
}

impl<const N: usize> BodyWriter for [u8; N] {
    fn body_length(&self) -> u64 {
        N as u64
    }

    fn write_body(&self, out: &mut dyn Write) -> io::Result<()> {
        out.write_all(self)
    }
}

/// Lets `&&str` and `&&[u8]` stand in where a `&dyn BodyWriter` is wanted.
impl<T: BodyWriter + ?Sized> BodyWriter for &T {
    fn body_length(&self) -> u64 {
        (**self).body_length()
    }

    fn write_body(&self, out: &mut dyn Write) -> io::Result<()> {
        (**self).write_body(out)
    }
}

impl BodyWriter for Vec<u8> {
    fn body_length(&self) -> u64 {
        self.len() as u64
    }

    fn write_body(&self, out: &mut dyn Write) -> io::Result<()> {
        out.write_all(self)
    }
}

impl BodyWriter for Bytes {
    fn body_length(&self) -> u64 {
        self.len() as u64
    }

    fn write_body(&self, out: &mut dyn Write) -> io::Result<()> {
        out.write_all(self)
    }
}

impl BodyWriter for str {
    fn body_length(&self) -> u64 {
        self.len() as u64
    }

    fn write_body(&self, out: &mut dyn Write) -> io::Result<()> {
        out.write_all(self.as_bytes())
    }
}

impl BodyWriter for String {
    fn body_length(&self) -> u64 {
        self.len() as u64
    }

    fn write_body(&self, out: &mut dyn Write) -> io::Result<()> {
        out.write_all(self.as_bytes())
    }
}

/// A value with its own binary form, written and read through plain byte
/// streams.
pub trait Streamable {
    fn write_to(&self, out: &mut dyn Write) -> io::Result<()>;
    fn read_from(&mut self, input: &mut dyn Read) -> io::Result<()>;
}

/// A serializable value sent as a JSON body.
#[derive(Debug, Clone)]
pub struct JsonBody(Bytes);

impl JsonBody {
    pub fn new<T: Serialize + ?Sized>(value: &T) -> Result<Self> {
        Ok(Self(Bytes::from(serde_json::to_vec(value)?)))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl BodyWriter for JsonBody {
    fn body_length(&self) -> u64 {
        self.0.len() as u64
    }

    fn write_body(&self, out: &mut dyn Write) -> io::Result<()> {
        out.write_all(&self.0)
    }
}

/// A [`Streamable`] value serialized ahead of the send so that its length
/// is known for the header.
#[derive(Debug, Clone)]
pub struct StreamableBody(Bytes);

impl StreamableBody {
    pub fn new(value: &dyn Streamable) -> io::Result<Self> {
        let mut buf = Vec::new();
        value.write_to(&mut buf)?;
        Ok(Self(Bytes::from(buf)))
    }
}

impl BodyWriter for StreamableBody {
    fn body_length(&self) -> u64 {
        self.0.len() as u64
    }

    fn write_body(&self, out: &mut dyn Write) -> io::Result<()> {
        out.write_all(&self.0)
    }
}

/// Counts the bytes a [`BodyWriter`] produces.
pub(crate) struct CountingWriter<'a> {
    inner: &'a mut dyn Write,
    written: u64,
}

impl<'a> CountingWriter<'a> {
    pub(crate) fn new(inner: &'a mut dyn Write) -> Self {
        Self { inner, written: 0 }
    }

    pub(crate) fn written(&self) -> u64 {
        self.written
    }
}

impl Write for CountingWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;

    #[derive(Debug, Default, PartialEq)]
    struct Point {
        x: u32,
        y: u32,
    }

    impl Streamable for Point {
        fn write_to(&self, out: &mut dyn Write) -> io::Result<()> {
            out.write_all(&self.x.to_be_bytes())?;
            out.write_all(&self.y.to_be_bytes())
        }

        fn read_from(&mut self, input: &mut dyn Read) -> io::Result<()> {
            let mut word = [0u8; 4];
            input.read_exact(&mut word)?;
            self.x = u32::from_be_bytes(word);
            input.read_exact(&mut word)?;
            self.y = u32::from_be_bytes(word);
            Ok(())
        }
    }

    #[test]
    fn byte_bodies_report_their_length() {
        let mut out = Vec::new();
        let body: &dyn BodyWriter = &"hello";
        assert_eq!(body.body_length(), 5);
        body.write_body(&mut out).unwrap();
        assert_eq!(out, b"hello");

        let mut out = Vec::new();
        let array: &dyn BodyWriter = b"abc";
        assert_eq!(array.body_length(), 3);
        array.write_body(&mut out).unwrap();
        assert_eq!(out, b"abc");
    }

    #[test]
    fn json_body_is_serialized_up_front() {
        #[derive(Serialize, Deserialize)]
        struct Order {
            id: u32,
        }
        let body = JsonBody::new(&Order { id: 7 }).unwrap();
        assert_eq!(body.as_bytes(), br#"{"id":7}"#);
        assert_eq!(body.body_length(), 8);
    }

    #[test]
    fn streamable_body_uses_value_encoding() {
        let body = StreamableBody::new(&Point { x: 1, y: 2 }).unwrap();
        assert_eq!(body.body_length(), 8);

        let mut out = Vec::new();
        body.write_body(&mut out).unwrap();
        let mut decoded = Point::default();
        decoded.read_from(&mut out.as_slice()).unwrap();
        assert_eq!(decoded, Point { x: 1, y: 2 });
    }

    #[test]
    fn counting_writer_counts() {
        let mut sink = Vec::new();
        let mut counting = CountingWriter::new(&mut sink);
        counting.write_all(b"abc").unwrap();
        counting.write_all(b"de").unwrap();
        assert_eq!(counting.written(), 5);
    }
}
