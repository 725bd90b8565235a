/// Frame boundary codecs for length-prefixed transports
///
/// A [`FrameCodec`] describes how one message is delimited in a byte stream:
/// a fixed-size header, a content length derived from that header, an
/// identity tag used to correlate the reply, and a legality check. The TCP
/// listener is generic over the codec, so the same session loop can carry any
/// header-prefixed protocol.

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{ServerError, ServerResult};
use crate::MBAP_HEADER_SIZE;

/// Strategy describing one protocol's framing
pub trait FrameCodec: Send + Sync {
    /// Bytes needed before anything else can be determined
    fn header_len(&self) -> usize;

    /// Number of content bytes following the header
    fn content_len(&self, header: &[u8]) -> usize;

    /// Whether the header is well-formed for this protocol
    fn is_header_legal(&self, header: &[u8]) -> bool;

    /// Identity/sequence tag echoed in the reply
    fn identity(&self, header: &[u8]) -> u32;

    /// Upper bound on the content length, checked before allocating
    fn max_content_len(&self) -> usize {
        u16::MAX as usize
    }
}

/// One complete message as delimited by a codec
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: Vec<u8>,
    pub body: Vec<u8>,
    pub identity: u32,
}

impl Frame {
    /// Header followed by body, as received
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.header.len() + self.body.len());
        bytes.extend_from_slice(&self.header);
        bytes.extend_from_slice(&self.body);
        bytes
    }

    pub fn len(&self) -> usize {
        self.header.len() + self.body.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Modbus TCP application protocol header
///
/// ```text
/// | transaction id (2) | protocol id (2) = 0 | length (2) | unit id | pdu ... |
/// ```
///
/// `length` counts the unit id and PDU, so the frame body is exactly the
/// dispatcher core.
#[derive(Debug, Clone, Copy, Default)]
pub struct MbapCodec;

impl FrameCodec for MbapCodec {
    fn header_len(&self) -> usize {
        MBAP_HEADER_SIZE
    }

    fn content_len(&self, header: &[u8]) -> usize {
        u16::from_be_bytes([header[4], header[5]]) as usize
    }

    fn is_header_legal(&self, header: &[u8]) -> bool {
        let protocol_id = u16::from_be_bytes([header[2], header[3]]);
        let length = self.content_len(header);
        protocol_id == 0 && (2..=self.max_content_len()).contains(&length)
    }

    fn identity(&self, header: &[u8]) -> u32 {
        u16::from_be_bytes([header[0], header[1]]) as u32
    }

    fn max_content_len(&self) -> usize {
        crate::MAX_TCP_FRAME_SIZE - MBAP_HEADER_SIZE
    }
}

/// LS Industrial FEnet header (20 bytes)
///
/// Company id "LSIS-XGT" and reserved fields precede a little-endian
/// invoke id at offset 14 and a little-endian body length at offset 16.
/// Frames sent by a client start with `'L'` (0x4C).
#[derive(Debug, Clone, Copy, Default)]
pub struct LsisFastEnetCodec;

impl LsisFastEnetCodec {
    pub const HEADER_LEN: usize = 20;
    pub const MAGIC: u8 = 0x4C;
}

impl FrameCodec for LsisFastEnetCodec {
    fn header_len(&self) -> usize {
        Self::HEADER_LEN
    }

    fn content_len(&self, header: &[u8]) -> usize {
        u16::from_le_bytes([header[16], header[17]]) as usize
    }

    fn is_header_legal(&self, header: &[u8]) -> bool {
        header[0] == Self::MAGIC
    }

    fn identity(&self, header: &[u8]) -> u32 {
        u16::from_le_bytes([header[14], header[15]]) as u32
    }
}

/// Read one frame from `reader`
///
/// Returns `Ok(None)` when the stream ends cleanly before a new header
/// starts. A header failing the legality check, or a stream ending mid-frame,
/// is an error.
pub async fn read_frame<C, R>(reader: &mut R, codec: &C) -> ServerResult<Option<Frame>>
where
    C: FrameCodec + ?Sized,
    R: AsyncRead + Unpin,
{
    let mut header = vec![0u8; codec.header_len()];

    let first = reader.read(&mut header[..1]).await?;
    if first == 0 {
        return Ok(None);
    }
    if header.len() > 1 {
        reader.read_exact(&mut header[1..]).await?;
    }

    if !codec.is_header_legal(&header) {
        return Err(ServerError::frame(format!(
            "Illegal header: {}",
            crate::utils::format::bytes_to_hex(&header)
        )));
    }

    let length = codec.content_len(&header);
    if length > codec.max_content_len() {
        return Err(ServerError::frame(format!(
            "Content length {} exceeds {}",
            length,
            codec.max_content_len()
        )));
    }

    let mut body = vec![0u8; length];
    reader.read_exact(&mut body).await?;

    let identity = codec.identity(&header);
    Ok(Some(Frame { header, body, identity }))
}

/// Wrap a reply core in an MBAP header carrying `transaction_id`
pub fn pack_tcp(core: &[u8], transaction_id: u16) -> Vec<u8> {
    let mut frame = Vec::with_capacity(MBAP_HEADER_SIZE + core.len());
    frame.extend_from_slice(&transaction_id.to_be_bytes());
    frame.extend_from_slice(&0u16.to_be_bytes());
    frame.extend_from_slice(&(core.len() as u16).to_be_bytes());
    frame.extend_from_slice(core);
    frame
}
