//! Event-stream wire framing.
//!
//! Every outbound message becomes exactly one frame: `data: <message>\n\n`.
//! The message is written verbatim; no line splitting, no `event:` or `id:`
//! fields.

use bytes::{BufMut, Bytes, BytesMut};

const DATA_PREFIX: &[u8] = b"data: ";
const FRAME_TERMINATOR: &[u8] = b"\n\n";

/// Encodes outbound messages into event-stream frames.
#[derive(Clone, Copy, Debug, Default)]
pub struct StreamFormatter;

impl StreamFormatter {
    /// Frame a message. The result is reference-counted, so one formatted
    /// frame can be handed to every subscriber without copying.
    pub fn format(message: &str) -> Bytes {
        let mut buf =
            BytesMut::with_capacity(DATA_PREFIX.len() + message.len() + FRAME_TERMINATOR.len());
        buf.put_slice(DATA_PREFIX);
        buf.put_slice(message.as_bytes());
        buf.put_slice(FRAME_TERMINATOR);
        buf.freeze()
    }
}
