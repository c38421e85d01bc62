//! Pulling bytes out of a [`BodyProvider`].
//!
//! The provider moves in here at write time; whichever framing branch the
//! engine takes, it pulls chunks through [`BodyReader`], and the range
//! branches use [`SeekableBody`] for absolute-offset reads.

use std::io::{self, SeekFrom};
use std::ops::Range;

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::protocol::{BodyProvider, ByteStream, ChunkProducer};

/// Read granularity for file-backed bodies
const FILE_CHUNK_SIZE: usize = 64 * 1024;

/// Sequential chunk access over any body provider.
pub(crate) enum BodyReader {
    Empty,
    Full(Option<Bytes>),
    File(tokio::fs::File),
    Stream(ByteStream),
    Producer(Box<dyn ChunkProducer>),
}

impl BodyReader {
    pub(crate) fn new(provider: BodyProvider) -> Self {
        match provider {
            BodyProvider::Empty => Self::Empty,
            BodyProvider::Full(bytes) => Self::Full(Some(bytes)),
            BodyProvider::File { file, .. } => Self::File(tokio::fs::File::from_std(file)),
            BodyProvider::Stream(stream) => Self::Stream(stream),
            BodyProvider::Producer(producer) => Self::Producer(producer),
        }
    }

    /// The next chunk of the body, or `None` at the end.
    pub(crate) async fn next_chunk(&mut self) -> io::Result<Option<Bytes>> {
        match self {
            Self::Empty => Ok(None),
            Self::Full(bytes) => Ok(bytes.take().filter(|b| !b.is_empty())),
            Self::File(file) => {
                let mut buf = BytesMut::with_capacity(FILE_CHUNK_SIZE);
                let n = file.read_buf(&mut buf).await?;
                if n == 0 { Ok(None) } else { Ok(Some(buf.freeze())) }
            }
            Self::Stream(stream) => stream.next().await.transpose(),
            Self::Producer(producer) => producer.produce(),
        }
    }

    /// Reads the whole remaining body into one buffer.
    pub(crate) async fn read_to_end(&mut self) -> io::Result<Bytes> {
        let mut out = BytesMut::new();
        while let Some(chunk) = self.next_chunk().await? {
            out.extend_from_slice(&chunk);
        }
        Ok(out.freeze())
    }

    /// Releases producer resources; other variants have nothing to close.
    pub(crate) fn close(&mut self) {
        if let Self::Producer(producer) = self {
            producer.close();
        }
    }
}

/// Absolute-offset access over a seekable body provider.
pub(crate) enum SeekableBody {
    Full(Bytes),
    File(tokio::fs::File),
}

impl SeekableBody {
    /// `None` when the provider is not seekable.
    pub(crate) fn new(provider: BodyProvider) -> Option<Self> {
        match provider {
            BodyProvider::Full(bytes) => Some(Self::Full(bytes)),
            BodyProvider::File { file, .. } => Some(Self::File(tokio::fs::File::from_std(file))),
            _ => None,
        }
    }

    /// Reads `range` completely.
    pub(crate) async fn read_range(&mut self, range: Range<u64>) -> io::Result<Bytes> {
        let len = (range.end - range.start) as usize;
        match self {
            Self::Full(bytes) => Ok(bytes.slice(range.start as usize..range.end as usize)),
            Self::File(file) => {
                file.seek(SeekFrom::Start(range.start)).await?;
                let mut buf = vec![0u8; len];
                file.read_exact(&mut buf).await?;
                Ok(Bytes::from(buf))
            }
        }
    }

    /// Reads the next chunk of `range`, advancing its start.
    ///
    /// Returns `None` once the range is exhausted; callers loop until then.
    pub(crate) async fn next_range_chunk(&mut self, range: &mut Range<u64>) -> io::Result<Option<Bytes>> {
        if range.start >= range.end {
            return Ok(None);
        }
        match self {
            Self::Full(bytes) => {
                let chunk = bytes.slice(range.start as usize..range.end as usize);
                range.start = range.end;
                Ok(Some(chunk))
            }
            Self::File(file) => {
                file.seek(SeekFrom::Start(range.start)).await?;
                let take = (range.end - range.start).min(FILE_CHUNK_SIZE as u64) as usize;
                let mut buf = vec![0u8; take];
                file.read_exact(&mut buf).await?;
                range.start += take as u64;
                Ok(Some(Bytes::from(buf)))
            }
        }
    }

}
