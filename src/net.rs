pub mod channel;
pub mod client;
pub mod server;

use crate::message::Message;
use async_bincode::{tokio::AsyncBincodeStream, AsyncDestination};
use bincode::Options;
use std::io;
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    net::TcpStream,
};

/// Frames claiming more bytes than this are refused unless configured otherwise.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// A TCP stream carrying length-prefixed bincode [`Message`] frames in both directions.
///
/// [`Channel`](channel::Channel) uses the same framing on split halves; this whole-stream
/// form is handy for talking to a peer frame by frame.
pub type Framed = AsyncBincodeStream<TcpStream, Message, Message, AsyncDestination>;

pub fn framed(stream: TcpStream) -> Framed {
    AsyncBincodeStream::from(stream).for_async()
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame of {size} bytes exceeds the {max} byte limit")]
    TooLarge { size: usize, max: usize },
    #[error("undecodable frame: {0}")]
    Decode(#[source] bincode::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl FrameError {
    /// The peer sent bytes that are not a valid frame, as opposed to the socket failing.
    pub fn is_malformed(&self) -> bool {
        !matches!(self, FrameError::Io(_))
    }
}

/// Reads one frame. `Ok(None)` means the peer closed the stream between frames.
///
/// The length prefix is checked against `max_frame_size` before anything is buffered.
pub(crate) async fn read_frame<R>(
    reader: &mut R,
    max_frame_size: usize,
) -> Result<Option<Message>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let size = match reader.read_u32().await {
        Ok(size) => size as usize,
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if size > max_frame_size {
        return Err(FrameError::TooLarge {
            size,
            max: max_frame_size,
        });
    }

    let mut body = vec![0; size];
    reader.read_exact(&mut body).await?;
    bincode::options()
        .with_limit(size as u64)
        .allow_trailing_bytes()
        .deserialize(&body)
        .map(Some)
        .map_err(FrameError::Decode)
}
