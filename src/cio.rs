use error_chain::error_chain;

use crate::alloc::PeerKey;
use crate::buffers::Buffer;

error_chain! {
    foreign_links {
        Io(::std::io::Error);
    }

    errors {
        Protocol(reason: &'static str) {
            description("protocol violation")
                display("protocol violation: {}", reason)
        }

        Full {
            description("resource limit reached")
                display("resource limit reached")
        }
    }
}

/// Coordinates of one block on the wire and in the cache.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct BlockSpan {
    pub piece: u32,
    pub offset: u32,
    pub length: u32,
}

/// Block cache collaborator. The engine never touches the disk
/// directly; reads and writes go through here and may fail without
/// taking down anything but the requesting connection.
pub trait BlockCache {
    fn read_block(&mut self, span: BlockSpan) -> Result<Buffer>;
    fn write_block(&mut self, span: BlockSpan, data: &[u8]) -> Result<()>;
    /// Advisory, fire and forget.
    fn prefetch_block(&mut self, span: BlockSpan);
}

/// Peer-mgr collaborator: authoritative bookkeeping of in-flight
/// requests and the source of the next blocks worth requesting.
pub trait PeerMgr {
    fn count_active_requests(&self, peer: PeerKey) -> usize;
    fn next_request_spans(&mut self, peer: PeerKey, wanted: usize) -> Vec<BlockSpan>;
    fn mark_sent(&mut self, peer: PeerKey, span: BlockSpan);
    /// A sent request finished, either with data or a reject.
    fn mark_complete(&mut self, peer: PeerKey, span: BlockSpan);
    /// Guards against unsolicited blocks.
    fn did_peer_request(&self, peer: PeerKey, span: BlockSpan) -> bool;
}
