use bytes::{Buf, Bytes};

/// A unit of an HTTP message stream: either the parsed head or a piece of payload.
///
/// The request decoder and response encoder both speak this vocabulary, with
/// `T` being the head type plus framing information for the side in question.
pub enum Message<T, Data: Buf = Bytes> {
    /// The parsed head of a message
    Head(T),
    /// A chunk of payload data or the EOF marker
    Payload(PayloadItem<Data>),
}

/// An item in a message payload stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayloadItem<Data: Buf = Bytes> {
    /// A chunk of payload data
    Chunk(Data),
    /// End of the payload
    Eof,
}

/// How a message body is framed on the wire.
///
/// Besides the classic three cases (known length, chunked, none) the write
/// side supports close-delimited bodies: the payload is written raw and the
/// end of the response is signalled by closing the connection. That mode is
/// what lets us stream a body of unknown length to a client that cannot be
/// served chunked encoding.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PayloadSize {
    /// Payload with known length in bytes
    Length(u64),
    /// Payload using chunked transfer encoding
    Chunked,
    /// Payload written raw, terminated by connection close
    CloseDelimited,
    /// No payload
    Empty,
}

impl PayloadSize {
    #[inline]
    pub fn is_chunked(&self) -> bool {
        matches!(self, PayloadSize::Chunked)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        matches!(self, PayloadSize::Empty)
    }

    #[inline]
    pub fn is_close_delimited(&self) -> bool {
        matches!(self, PayloadSize::CloseDelimited)
    }

    /// The exact number of payload bytes, when known up front.
    pub fn length(&self) -> Option<u64> {
        match self {
            PayloadSize::Length(n) => Some(*n),
            PayloadSize::Empty => Some(0),
            PayloadSize::Chunked | PayloadSize::CloseDelimited => None,
        }
    }
}

impl<T> Message<T> {
    #[inline]
    pub fn is_payload(&self) -> bool {
        matches!(self, Message::Payload(_))
    }

    #[inline]
    pub fn is_head(&self) -> bool {
        matches!(self, Message::Head(_))
    }

    /// Converts the message into its payload item, if it is one.
    pub fn into_payload_item(self) -> Option<PayloadItem> {
        match self {
            Message::Head(_) => None,
            Message::Payload(payload_item) => Some(payload_item),
        }
    }
}

impl<D: Buf> PayloadItem<D> {
    #[inline]
    pub fn is_eof(&self) -> bool {
        matches!(self, PayloadItem::Eof)
    }

    #[inline]
    pub fn is_chunk(&self) -> bool {
        matches!(self, PayloadItem::Chunk(_))
    }
}

impl PayloadItem {
    /// Returns the contained bytes if this is a chunk.
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            PayloadItem::Chunk(bytes) => Some(bytes),
            PayloadItem::Eof => None,
        }
    }

    /// Consumes the item and returns the contained bytes if this is a chunk.
    pub fn into_bytes(self) -> Option<Bytes> {
        match self {
            PayloadItem::Chunk(bytes) => Some(bytes),
            PayloadItem::Eof => None,
        }
    }
}
