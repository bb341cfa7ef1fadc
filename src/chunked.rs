//! Chunked transfer-coding, RFC 7230 section 4.1.

mod decoder;
mod encoder;

pub use decoder::ChunkedDecoder;
pub use encoder::ChunkedEncoder;
