//! Length-delimited unit framing.
//!
//! Every value on the wire after the handshake line is one *unit*:
//!
//! ```text
//! +-----------+------------------+
//! | length    | payload          |
//! | 4 bytes BE| length bytes     |
//! +-----------+------------------+
//! ```
//!
//! A request or response frame is two consecutive units, header then body.
//! Because every value is length-delimited, a reader can always skip exactly
//! one value without understanding its encoding, which is what makes
//! discarding a body for an unknown sequence safe under any codec.

use crate::error::ProtocolError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Size of the length prefix in front of every unit.
pub const UNIT_PREFIX_SIZE: usize = 4;

/// Maximum unit payload size (16 MiB).
pub const MAX_UNIT_SIZE: usize = 16 * 1024 * 1024;

/// Read buffer size for socket reads.
const READ_BUFFER_SIZE: usize = 8 * 1024;

/// Incremental decoder over an internal byte buffer.
#[derive(Default)]
pub struct Decoder {
    buffer: BytesMut,
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(READ_BUFFER_SIZE),
        }
    }

    /// Appends data to the internal buffer.
    pub fn push(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Attempts to decode the next complete unit.
    ///
    /// Returns `Ok(None)` if more data is needed.
    pub fn next_unit(&mut self) -> Result<Option<Bytes>, ProtocolError> {
        if self.buffer.len() < UNIT_PREFIX_SIZE {
            return Ok(None);
        }

        let len = u32::from_be_bytes([
            self.buffer[0],
            self.buffer[1],
            self.buffer[2],
            self.buffer[3],
        ]) as usize;

        if len > MAX_UNIT_SIZE {
            return Err(ProtocolError::UnitTooLarge {
                size: len,
                max: MAX_UNIT_SIZE,
            });
        }

        if self.buffer.len() < UNIT_PREFIX_SIZE + len {
            return Ok(None);
        }

        self.buffer.advance(UNIT_PREFIX_SIZE);
        Ok(Some(self.buffer.split_to(len).freeze()))
    }

    /// Attempts to take the next newline-terminated line off the buffer.
    ///
    /// Used once per connection, for the handshake; everything after the
    /// first `\n` stays buffered for [`Decoder::next_unit`].
    pub fn next_line(&mut self) -> Result<Option<String>, ProtocolError> {
        match self.buffer.iter().position(|&b| b == b'\n') {
            Some(pos) => {
                let line = self.buffer.split_to(pos + 1);
                let text = std::str::from_utf8(&line[..pos])
                    .map_err(|_| ProtocolError::InvalidUtf8)?;
                Ok(Some(text.to_string()))
            }
            None => {
                if self.buffer.len() > MAX_UNIT_SIZE {
                    return Err(ProtocolError::UnitTooLarge {
                        size: self.buffer.len(),
                        max: MAX_UNIT_SIZE,
                    });
                }
                Ok(None)
            }
        }
    }

    /// Returns whether the buffer holds no partial input.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Returns the number of bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

/// Buffered unit reader over one read half.
pub struct FrameReader<R> {
    reader: R,
    decoder: Decoder,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            decoder: Decoder::new(),
        }
    }

    /// Reads the next unit.
    ///
    /// Returns `Ok(None)` on a clean end of stream at a unit boundary;
    /// end of stream inside a unit is an error.
    pub async fn read_unit(&mut self) -> Result<Option<Bytes>, ProtocolError> {
        loop {
            if let Some(unit) = self.decoder.next_unit()? {
                return Ok(Some(unit));
            }
            if !self.fill().await? {
                if self.decoder.is_empty() {
                    return Ok(None);
                }
                return Err(ProtocolError::ConnectionClosed);
            }
        }
    }

    /// Reads one newline-terminated handshake line.
    pub async fn read_line(&mut self) -> Result<Option<String>, ProtocolError> {
        loop {
            if let Some(line) = self.decoder.next_line()? {
                return Ok(Some(line));
            }
            if !self.fill().await? {
                if self.decoder.is_empty() {
                    return Ok(None);
                }
                return Err(ProtocolError::ConnectionClosed);
            }
        }
    }

    async fn fill(&mut self) -> Result<bool, ProtocolError> {
        let mut buf = [0u8; READ_BUFFER_SIZE];
        let n = self.reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(false);
        }
        self.decoder.push(&buf[..n]);
        Ok(true)
    }
}

/// Writer producing handshake lines and unit frames on one write half.
pub struct FrameWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Writes a newline-terminated handshake line.
    pub async fn write_line(&mut self, line: &[u8]) -> Result<(), ProtocolError> {
        let mut buf = BytesMut::with_capacity(line.len() + 1);
        buf.put_slice(line);
        buf.put_u8(b'\n');
        self.writer.write_all(&buf).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Writes a header unit and a body unit as one buffered frame.
    ///
    /// Both units are assembled into a single buffer and written with one
    /// `write_all`, so a frame is never interleaved with another writer's
    /// output at this layer.
    pub async fn write_frame(&mut self, header: &[u8], body: &[u8]) -> Result<(), ProtocolError> {
        for unit in [header, body] {
            if unit.len() > MAX_UNIT_SIZE {
                return Err(ProtocolError::UnitTooLarge {
                    size: unit.len(),
                    max: MAX_UNIT_SIZE,
                });
            }
        }

        let mut buf =
            BytesMut::with_capacity(2 * UNIT_PREFIX_SIZE + header.len() + body.len());
        buf.put_u32(header.len() as u32);
        buf.put_slice(header);
        buf.put_u32(body.len() as u32);
        buf.put_slice(body);

        self.writer.write_all(&buf).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Shuts down the write half. Safe to call more than once.
    pub async fn shutdown(&mut self) -> Result<(), ProtocolError> {
        // A second shutdown on an already-closed half reports NotConnected;
        // close must stay idempotent.
        match self.writer.shutdown().await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn framed(payload: &[u8]) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(payload);
        buf
    }

    #[test]
    fn test_unit_roundtrip() {
        let mut decoder = Decoder::new();
        decoder.push(&framed(b"hello"));

        let unit = decoder.next_unit().unwrap().unwrap();
        assert_eq!(&unit[..], b"hello");
        assert!(decoder.is_empty());
    }

    #[test]
    fn test_partial_unit() {
        let data = framed(b"partial payload");
        let mut decoder = Decoder::new();

        decoder.push(&data[..7]);
        assert!(decoder.next_unit().unwrap().is_none());

        decoder.push(&data[7..]);
        let unit = decoder.next_unit().unwrap().unwrap();
        assert_eq!(&unit[..], b"partial payload");
    }

    #[test]
    fn test_multiple_units_in_buffer() {
        let mut decoder = Decoder::new();
        decoder.push(&framed(b"one"));
        decoder.push(&framed(b"two"));

        assert_eq!(&decoder.next_unit().unwrap().unwrap()[..], b"one");
        assert_eq!(&decoder.next_unit().unwrap().unwrap()[..], b"two");
        assert!(decoder.next_unit().unwrap().is_none());
    }

    #[test]
    fn test_unit_too_large() {
        let mut decoder = Decoder::new();
        decoder.push(&((MAX_UNIT_SIZE as u32 + 1).to_be_bytes()));
        assert!(matches!(
            decoder.next_unit(),
            Err(ProtocolError::UnitTooLarge { .. })
        ));
    }

    #[test]
    fn test_line_then_units() {
        let mut decoder = Decoder::new();
        let mut data = b"{\"magic\":123}\n".to_vec();
        data.extend_from_slice(&framed(b"body"));
        decoder.push(&data);

        let line = decoder.next_line().unwrap().unwrap();
        assert_eq!(line, "{\"magic\":123}");

        let unit = decoder.next_unit().unwrap().unwrap();
        assert_eq!(&unit[..], b"body");
    }

    #[test]
    fn test_partial_line() {
        let mut decoder = Decoder::new();
        decoder.push(b"{\"magic\":");
        assert!(decoder.next_line().unwrap().is_none());

        decoder.push(b"123}\n");
        assert_eq!(decoder.next_line().unwrap().unwrap(), "{\"magic\":123}");
    }

    #[tokio::test]
    async fn test_frame_reader_writer() {
        let (client, server) = tokio::io::duplex(1024);
        let (read_half, _) = tokio::io::split(server);
        let (_, write_half) = tokio::io::split(client);

        let mut writer = FrameWriter::new(write_half);
        let mut reader = FrameReader::new(read_half);

        writer.write_line(b"hello").await.unwrap();
        writer.write_frame(b"header", b"body").await.unwrap();

        assert_eq!(reader.read_line().await.unwrap().unwrap(), "hello");
        assert_eq!(&reader.read_unit().await.unwrap().unwrap()[..], b"header");
        assert_eq!(&reader.read_unit().await.unwrap().unwrap()[..], b"body");
    }

    #[tokio::test]
    async fn test_clean_eof_at_boundary() {
        let (client, server) = tokio::io::duplex(1024);
        let (read_half, _) = tokio::io::split(server);
        let (_, write_half) = tokio::io::split(client);

        let mut writer = FrameWriter::new(write_half);
        writer.write_frame(b"h", b"b").await.unwrap();
        writer.shutdown().await.unwrap();
        drop(writer);

        let mut reader = FrameReader::new(read_half);
        assert!(reader.read_unit().await.unwrap().is_some());
        assert!(reader.read_unit().await.unwrap().is_some());
        assert!(reader.read_unit().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_eof_mid_unit() {
        let (mut client, server) = tokio::io::duplex(1024);
        let (read_half, _) = tokio::io::split(server);

        let data = framed(b"truncated");
        client.write_all(&data[..6]).await.unwrap();
        client.shutdown().await.unwrap();
        drop(client);

        let mut reader = FrameReader::new(read_half);
        assert!(matches!(
            reader.read_unit().await,
            Err(ProtocolError::ConnectionClosed)
        ));
    }
}
