//! # Formats Module
//!
//! Byte-level encodings of stored blocks.

pub mod persistence;

pub use persistence::{
    BlockContent, BlockHeader, RootRecord, block_version, decode_block, decode_record,
    encode_block, encode_page, unsupported_format,
};
