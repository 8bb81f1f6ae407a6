//! Encoder and decoder for BRP frames and messages.

use crate::error::ProtocolError;
use crate::frame::{Frame, FrameFlags};
use crate::message::{Request, Response, StreamItem};
use bytes::BytesMut;
use serde_json::Value;

/// Any message that can appear on a connection.
#[derive(Debug, Clone)]
pub enum Message {
    Request(Request),
    Response(Response),
    Item(StreamItem),
}

/// Encodes requests, responses and stream items into frames.
pub struct Encoder;

impl Encoder {
    /// Encodes a request into a frame.
    pub fn encode_request(request: &Request) -> Result<BytesMut, ProtocolError> {
        Frame::from_json(request)?.encode()
    }

    /// Encodes a unary response into a frame.
    pub fn encode_response(response: &Response) -> Result<BytesMut, ProtocolError> {
        Frame::from_json(response)?.encode()
    }

    /// Encodes one element of a server stream.
    pub fn encode_stream_item(item: &StreamItem) -> Result<BytesMut, ProtocolError> {
        Frame::from_json(item)?
            .with_flags(FrameFlags::new().with_stream())
            .encode()
    }

    /// Encodes the response that closes a server stream.
    pub fn encode_stream_end(response: &Response) -> Result<BytesMut, ProtocolError> {
        Frame::from_json(response)?
            .with_flags(FrameFlags::new().with_stream().with_end_stream())
            .encode()
    }
}

/// Decodes frames into messages.
pub struct Decoder {
    buffer: BytesMut,
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(8192),
        }
    }

    /// Appends data to the internal buffer.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Attempts to decode the next frame from the buffer.
    pub fn decode_frame(&mut self) -> Result<Option<Frame>, ProtocolError> {
        Frame::decode(&mut self.buffer)
    }

    /// Attempts to decode the next request from the buffer.
    pub fn decode_request(&mut self) -> Result<Option<Request>, ProtocolError> {
        match self.decode_frame()? {
            Some(frame) => Ok(Some(serde_json::from_str(payload_str(&frame)?)?)),
            None => Ok(None),
        }
    }

    /// Attempts to decode the next response from the buffer.
    pub fn decode_response(&mut self) -> Result<Option<Response>, ProtocolError> {
        match self.decode_frame()? {
            Some(frame) => Ok(Some(serde_json::from_str(payload_str(&frame)?)?)),
            None => Ok(None),
        }
    }

    /// Attempts to decode the next message of any type, dispatching on the
    /// `type` field, together with the flags of the frame it arrived in.
    pub fn decode_message(&mut self) -> Result<Option<(FrameFlags, Message)>, ProtocolError> {
        let frame = match self.decode_frame()? {
            Some(frame) => frame,
            None => return Ok(None),
        };

        let value: Value = serde_json::from_str(payload_str(&frame)?)?;
        let msg_type = value["type"].as_str().unwrap_or_default().to_string();
        let message = match msg_type.as_str() {
            "request" => Message::Request(serde_json::from_value(value)?),
            "response" => Message::Response(serde_json::from_value(value)?),
            "item" => Message::Item(serde_json::from_value(value)?),
            _ => return Err(ProtocolError::UnknownMessageType(msg_type)),
        };

        Ok(Some((frame.flags, message)))
    }

    /// Returns the number of bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Clears the internal buffer.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

fn payload_str(frame: &Frame) -> Result<&str, ProtocolError> {
    std::str::from_utf8(&frame.payload).map_err(|_| ProtocolError::InvalidUtf8)
}
