use tokio::io::{AsyncRead, AsyncWrite};

/// Byte stream carrying a control or console channel.
pub type ChannelStream = Box<dyn ChannelIo + Send>;

pub trait ChannelIo: AsyncRead + AsyncWrite + Unpin {}
impl<T: AsyncRead + AsyncWrite + Unpin> ChannelIo for T {}
