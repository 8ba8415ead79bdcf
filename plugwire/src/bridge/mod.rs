//! Wire layer between master and plugin.
//!
//! - **protocol**: `Message` frames and the type-tagged `Value` payloads they carry
//! - **codec**: framing (length-delimited or newline-delimited JSON) over AsyncRead/AsyncWrite

pub mod codec;
pub mod protocol;
