//! Message channel
//!
//! Frames whole messages over a byte stream: `[u32 LE length][payload]`.
//! One message is one `write_all` of the complete frame, so concurrent
//! writers behind a lock can never interleave partial messages.

use crate::error::{Error, Result};
use crate::message::{Message, MessageType};
use tracing::{debug, error, trace};
use std::io::{Read, Write};

/// Default upper bound on a single frame payload.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

/// Connection lifecycle of a listening channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    WaitingToConnect,
    Connected,
    Disconnected,
    Broken,
    Closed,
}

impl ChannelState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ChannelState::Closed)
    }
}

/// Sends and receives complete messages over a stream.
pub struct MessageChannel<S> {
    stream: S,
    max_message_size: usize,
}

impl<S: Read + Write> MessageChannel<S> {
    pub fn new(stream: S) -> Self {
        Self::with_max_message_size(stream, DEFAULT_MAX_MESSAGE_SIZE)
    }

    pub fn with_max_message_size(stream: S, max_message_size: usize) -> Self {
        Self {
            stream,
            max_message_size,
        }
    }

    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    pub fn into_inner(self) -> S {
        self.stream
    }

    /// Send one message as a single frame.
    pub fn send(&mut self, message: &Message) -> Result<()> {
        let payload = message.encode()?;
        if payload.len() > self.max_message_size {
            error!(target: "hands_common::channel", size = payload.len(), max = self.max_message_size, "Outgoing message too large");
            return Err(Error::FrameTooLarge {
                size: payload.len(),
                max: self.max_message_size,
            });
        }

        let mut frame = Vec::with_capacity(4 + payload.len());
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        frame.extend_from_slice(&payload);

        self.stream.write_all(&frame)?;
        self.stream.flush()?;

        trace!(target: "hands_common::channel", message_type = ?message.message_type(), size = payload.len(), "Sent message");
        Ok(())
    }

    /// Block until one complete message arrives.
    pub fn receive(&mut self) -> Result<Message> {
        let mut len_buf = [0u8; 4];
        self.stream.read_exact(&mut len_buf)?;

        let len = u32::from_le_bytes(len_buf) as usize;
        if len > self.max_message_size {
            error!(target: "hands_common::channel", size = len, max = self.max_message_size, "Incoming message too large");
            return Err(Error::FrameTooLarge {
                size: len,
                max: self.max_message_size,
            });
        }

        let mut payload = vec![0u8; len];
        self.stream.read_exact(&mut payload)?;

        let message = Message::decode(&payload)?;
        trace!(target: "hands_common::channel", message_type = ?message.message_type(), size = len, "Received message");
        Ok(message)
    }

    /// Receive and require a specific message type.
    pub fn receive_expect(&mut self, expected: MessageType) -> Result<Message> {
        let message = self.receive()?;
        let actual = message.message_type();
        if actual != expected {
            debug!(target: "hands_common::channel", ?expected, ?actual, "Unexpected message type");
            return Err(Error::UnexpectedMessage { expected, actual });
        }
        Ok(message)
    }

    /// Send a request and wait for a reply of the given type.
    pub fn round_trip(&mut self, request: &Message, expected: MessageType) -> Result<Message> {
        self.send(request)?;
        self.receive_expect(expected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{ReadMemoryRequest, RemoteCallRequest, RemoteCallResponse};
    use std::io::Cursor;

    /// In-memory duplex: reads from `input`, appends writes to `output`.
    struct Loopback {
        input: Cursor<Vec<u8>>,
        output: Vec<u8>,
        writes: usize,
    }

    impl Loopback {
        fn new(input: Vec<u8>) -> Self {
            Self {
                input: Cursor::new(input),
                output: Vec::new(),
                writes: 0,
            }
        }
    }

    impl Read for Loopback {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            self.input.read(buf)
        }
    }

    impl Write for Loopback {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.writes += 1;
            self.output.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn framed(message: &Message) -> Vec<u8> {
        let mut channel = MessageChannel::new(Loopback::new(Vec::new()));
        channel.send(message).unwrap();
        channel.into_inner().output
    }

    #[test]
    fn test_send_writes_one_frame() {
        let message = Message::ReadMemory(ReadMemoryRequest {
            address: 0x1000,
            size: 16,
        });
        let mut channel = MessageChannel::new(Loopback::new(Vec::new()));
        channel.send(&message).unwrap();

        let stream = channel.into_inner();
        assert_eq!(stream.writes, 1);
        assert_eq!(&stream.output[..4], &16u32.to_le_bytes());
        assert_eq!(stream.output.len(), 4 + 16);
    }

    #[test]
    fn test_receive_reads_back_sent_frame() {
        let message = Message::RemoteCall(RemoteCallRequest {
            name: "add".into(),
            arguments: vec![3, 4],
        });
        let mut channel = MessageChannel::new(Loopback::new(framed(&message)));
        assert_eq!(channel.receive().unwrap(), message);
    }

    #[test]
    fn test_receive_consecutive_frames() {
        let mut input = framed(&Message::status(true));
        input.extend(framed(&Message::status(false)));

        let mut channel = MessageChannel::new(Loopback::new(input));
        assert_eq!(channel.receive().unwrap(), Message::status(true));
        assert_eq!(channel.receive().unwrap(), Message::status(false));
        assert!(matches!(channel.receive(), Err(Error::ChannelIo(_))));
    }

    #[test]
    fn test_oversized_incoming_frame_rejected() {
        let mut input = 1024u32.to_le_bytes().to_vec();
        input.extend(vec![0u8; 1024]);
        let mut channel = MessageChannel::with_max_message_size(Loopback::new(input), 512);
        assert!(matches!(
            channel.receive(),
            Err(Error::FrameTooLarge { size: 1024, max: 512 })
        ));
    }

    #[test]
    fn test_oversized_outgoing_frame_rejected() {
        let mut channel = MessageChannel::with_max_message_size(Loopback::new(Vec::new()), 8);
        let err = channel
            .send(&Message::status_with_value(true, vec![0; 64]))
            .unwrap_err();
        assert!(matches!(err, Error::FrameTooLarge { .. }));
        assert!(channel.into_inner().output.is_empty());
    }

    #[test]
    fn test_truncated_frame_is_channel_error() {
        let full = framed(&Message::status(true));
        let mut channel = MessageChannel::new(Loopback::new(full[..full.len() - 1].to_vec()));
        assert!(matches!(channel.receive(), Err(Error::ChannelIo(_))));
    }

    #[test]
    fn test_receive_expect_mismatch() {
        let mut channel = MessageChannel::new(Loopback::new(framed(&Message::status(true))));
        let err = channel
            .receive_expect(MessageType::RemoteCallResponse)
            .unwrap_err();
        assert!(matches!(
            err,
            Error::UnexpectedMessage {
                expected: MessageType::RemoteCallResponse,
                actual: MessageType::Status
            }
        ));
    }

    #[test]
    fn test_round_trip() {
        let reply = Message::RemoteCallResponse(RemoteCallResponse {
            return_value: 7,
            flags: 0,
        });
        let mut channel = MessageChannel::new(Loopback::new(framed(&reply)));
        let request = Message::RemoteCall(RemoteCallRequest {
            name: "add".into(),
            arguments: vec![3, 4],
        });

        let received = channel
            .round_trip(&request, MessageType::RemoteCallResponse)
            .unwrap();
        assert_eq!(received, reply);
        assert_eq!(channel.into_inner().output, framed(&request));
    }

    #[cfg(unix)]
    #[test]
    fn test_over_socket_pair() {
        use std::os::unix::net::UnixStream;

        let (a, b) = UnixStream::pair().unwrap();
        let mut left = MessageChannel::new(a);
        let mut right = MessageChannel::new(b);

        let message = Message::status_with_value(false, b"Access violation".to_vec());
        left.send(&message).unwrap();
        assert_eq!(right.receive().unwrap(), message);
    }
}
