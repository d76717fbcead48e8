//! Wire codec
//!
//! Fixed little-endian layout for the primitive fields carried by messages.
//! Every variable-length field is preceded by a 32-bit element count.
//! Pointer-sized values always travel as 8 bytes so that a 64-bit controller
//! can talk to agents of any width.

use crate::error::{Error, Result};
use std::io::{Read, Write};

/// Serializes primitive fields into a byte sink.
pub struct WireWriter<W> {
    inner: W,
}

impl<W: Write> WireWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }

    pub fn write_bool(&mut self, value: bool) -> Result<()> {
        self.inner.write_all(&[value as u8])?;
        Ok(())
    }

    pub fn write_u32(&mut self, value: u32) -> Result<()> {
        self.inner.write_all(&value.to_le_bytes())?;
        Ok(())
    }

    pub fn write_i32(&mut self, value: i32) -> Result<()> {
        self.inner.write_all(&value.to_le_bytes())?;
        Ok(())
    }

    pub fn write_u64(&mut self, value: u64) -> Result<()> {
        self.inner.write_all(&value.to_le_bytes())?;
        Ok(())
    }

    /// Pointer-sized value (address, argument, return value).
    pub fn write_pointer(&mut self, value: u64) -> Result<()> {
        self.write_u64(value)
    }

    pub fn write_len(&mut self, len: usize) -> Result<()> {
        let len = u32::try_from(len)
            .map_err(|_| Error::Protocol(format!("Length {} does not fit in 32 bits", len)))?;
        self.write_u32(len)
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.write_len(bytes.len())?;
        self.inner.write_all(bytes)?;
        Ok(())
    }

    pub fn write_string(&mut self, value: &str) -> Result<()> {
        self.write_bytes(value.as_bytes())
    }

    pub fn write_pointers(&mut self, values: &[u64]) -> Result<()> {
        self.write_len(values.len())?;
        for value in values {
            self.write_pointer(*value)?;
        }
        Ok(())
    }
}

/// Deserializes primitive fields from a byte source.
///
/// Truncated input surfaces as the underlying `UnexpectedEof` I/O error.
pub struct WireReader<R> {
    inner: R,
}

impl<R: Read> WireReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut buf = [0u8; N];
        self.inner.read_exact(&mut buf)?;
        Ok(buf)
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        let [b] = self.read_array::<1>()?;
        Ok(b != 0)
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.read_array()?))
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        Ok(i32::from_le_bytes(self.read_array()?))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.read_array()?))
    }

    pub fn read_pointer(&mut self) -> Result<u64> {
        self.read_u64()
    }

    pub fn read_len(&mut self) -> Result<usize> {
        Ok(self.read_u32()? as usize)
    }

    pub fn read_bytes(&mut self) -> Result<Vec<u8>> {
        let len = self.read_len()?;
        // Read through `take` so a bogus length cannot force a huge allocation
        // before the stream runs dry.
        let mut bytes = Vec::new();
        let read = (&mut self.inner).take(len as u64).read_to_end(&mut bytes)?;
        if read != len {
            return Err(Error::ChannelIo(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("expected {} bytes, stream ended after {}", len, read),
            )));
        }
        Ok(bytes)
    }

    pub fn read_string(&mut self) -> Result<String> {
        let bytes = self.read_bytes()?;
        String::from_utf8(bytes).map_err(|e| Error::Protocol(format!("Invalid UTF-8 string: {}", e)))
    }

    pub fn read_pointers(&mut self) -> Result<Vec<u64>> {
        let count = self.read_len()?;
        let mut values = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            values.push(self.read_pointer()?);
        }
        Ok(values)
    }
}
