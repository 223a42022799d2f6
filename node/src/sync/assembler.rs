//! Pairs stored headers with received bodies.

use crate::types::{Block, BlockBody, BlockHeader, BlocksWrapper, HeadersWrapper};
use tracing::debug;

/// Combines headers and bodies index by index. Any mismatch yields no blocks.
pub fn assemble_blocks(headers: &[BlockHeader], bodies: Vec<BlockBody>) -> Vec<Block> {
    if headers.len() != bodies.len() {
        return Vec::new();
    }
    let mut blocks = Vec::with_capacity(headers.len());
    for (header, body) in headers.iter().zip(bodies) {
        match Block::assemble(header.clone(), body) {
            Some(block) => blocks.push(block),
            None => return Vec::new(),
        }
    }
    blocks
}

/// Builds the block batch answering `headers`, or `None` when the bodies do
/// not fit.
pub fn assemble_batch(headers: HeadersWrapper, bodies: Vec<BlockBody>) -> Option<BlocksWrapper> {
    let body_count = bodies.len();
    let blocks = assemble_blocks(&headers.headers, bodies);
    if blocks.is_empty() {
        debug!(
            peer = %headers.display_name,
            headers = headers.len(),
            bodies = body_count,
            "dropping batch: bodies do not match headers"
        );
        return None;
    }
    Some(BlocksWrapper::new(headers.peer_id, headers.display_name, blocks))
}
