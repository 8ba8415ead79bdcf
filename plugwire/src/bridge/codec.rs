//! Framed codec for the message stream.
//!
//! Two framings are supported, both carrying one JSON-encoded [`Message`] per
//! frame: a 4-byte length prefix (default) or newline-delimited JSON.
//! Works over any AsyncRead/AsyncWrite (pipes, sockets, in-memory duplex).
//!
//! Both peers must agree on the frame limit. Payload bytes are base64 inside
//! JSON, so a value costs roughly a third more on the wire than its encoded
//! size, and a byte vector under the JSON value codec several times more.

use std::fmt;
use std::io;
use std::str::FromStr;

use tokio_util::bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec, LinesCodec, LinesCodecError};

use super::protocol::Message;

/// Environment variable the master uses to tell its plugin which framing to speak.
pub const FRAME_FORMAT_ENV: &str = "PLUGWIRE_FRAME_FORMAT";

/// Environment variable carrying the master's frame limit to its plugin.
pub const MAX_FRAME_LENGTH_ENV: &str = "PLUGWIRE_MAX_FRAME_LENGTH";

/// Largest JSON body accepted or produced, in bytes (64 MiB).
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 64 * 1024 * 1024;

/// Read the frame limit from [`MAX_FRAME_LENGTH_ENV`], if set.
pub fn max_frame_length_from_env() -> Result<Option<usize>, io::Error> {
    match std::env::var(MAX_FRAME_LENGTH_ENV) {
        Ok(value) => value.trim().parse().map(Some).map_err(|e| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid {MAX_FRAME_LENGTH_ENV} {value:?}: {e}"),
            )
        }),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(io::Error::new(io::ErrorKind::InvalidInput, e)),
    }
}

/// Length of the JSON body `message` encodes to, without keeping the bytes.
pub fn body_len(message: &Message) -> Result<usize, io::Error> {
    struct Count(usize);

    impl io::Write for Count {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0 += buf.len();
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    let mut count = Count(0);
    serde_json::to_writer(&mut count, message)?;
    Ok(count.0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FrameFormat {
    #[default]
    LengthDelimited,
    Lines,
}

impl FrameFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LengthDelimited => "length-delimited",
            Self::Lines => "lines",
        }
    }

    /// Read the format from [`FRAME_FORMAT_ENV`], if set.
    pub fn from_env() -> Result<Option<Self>, io::Error> {
        match std::env::var(FRAME_FORMAT_ENV) {
            Ok(value) => value
                .parse()
                .map(Some)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e)),
            Err(std::env::VarError::NotPresent) => Ok(None),
            Err(e) => Err(io::Error::new(io::ErrorKind::InvalidInput, e)),
        }
    }
}

impl fmt::Display for FrameFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FrameFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "length-delimited" => Ok(Self::LengthDelimited),
            "lines" => Ok(Self::Lines),
            other => Err(format!("unknown frame format: {other}")),
        }
    }
}

enum Framing {
    Length(LengthDelimitedCodec),
    Lines(LinesCodec),
}

/// Codec that frames [`Message`]s and serializes them with JSON.
pub struct MessageCodec {
    framing: Framing,
    max_frame_length: usize,
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self::new(FrameFormat::default())
    }
}

impl MessageCodec {
    pub fn new(format: FrameFormat) -> Self {
        Self::with_max_frame_length(format, DEFAULT_MAX_FRAME_LENGTH)
    }

    /// Frames whose JSON body exceeds `max_frame_length` are refused in both
    /// directions.
    pub fn with_max_frame_length(format: FrameFormat, max_frame_length: usize) -> Self {
        let framing = match format {
            FrameFormat::LengthDelimited => Framing::Length(
                LengthDelimitedCodec::builder()
                    .length_field_length(4)
                    .max_frame_length(max_frame_length)
                    .new_codec(),
            ),
            FrameFormat::Lines => Framing::Lines(LinesCodec::new_with_max_length(max_frame_length)),
        };
        Self {
            framing,
            max_frame_length,
        }
    }

    pub fn max_frame_length(&self) -> usize {
        self.max_frame_length
    }
}

fn lines_error(e: LinesCodecError) -> io::Error {
    match e {
        LinesCodecError::Io(e) => e,
        other => io::Error::new(io::ErrorKind::InvalidData, other),
    }
}

fn parse(bytes: &[u8]) -> Result<Message, io::Error> {
    serde_json::from_slice(bytes).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match &mut self.framing {
            Framing::Length(inner) => match inner.decode(src)? {
                Some(bytes) => parse(&bytes).map(Some),
                None => Ok(None),
            },
            Framing::Lines(inner) => loop {
                match inner.decode(src).map_err(lines_error)? {
                    // Blank lines carry nothing.
                    Some(line) if line.trim().is_empty() => continue,
                    Some(line) => return parse(line.as_bytes()).map(Some),
                    None => return Ok(None),
                }
            },
        }
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json =
            serde_json::to_vec(&item).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let json_len = json.len();
        tracing::trace!(json_size_bytes = json_len, id = item.id, "Encoding frame");
        if json_len > self.max_frame_length {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "frame of {json_len} bytes exceeds the {} byte limit",
                    self.max_frame_length
                ),
            ));
        }
        if json_len > 100_000 {
            tracing::info!(
                json_size_bytes = json_len,
                json_size_kb = json_len / 1024,
                func_id = %item.func_id,
                "Large frame being encoded"
            );
        }
        match &mut self.framing {
            Framing::Length(inner) => inner.encode(Bytes::from(json), dst),
            Framing::Lines(inner) => {
                let line = String::from_utf8(json)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                inner.encode(line, dst).map_err(lines_error)
            }
        }
    }
}
