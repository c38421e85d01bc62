//! Streaming request decoder.
//!
//! Alternates between two phases, tracked by the presence of a payload
//! decoder: head parsing first, then payload chunks until EOF, then back to
//! head parsing for the next request on the connection. Bytes read past a
//! head or past a body stay in the buffer and feed the next phase, which is
//! how pipelined bytes and keep-alive turns work without re-buffering.

use bytes::BytesMut;
use tokio_util::codec::Decoder;

use crate::codec::body::PayloadDecoder;
use crate::codec::header::HeaderDecoder;
use crate::protocol::{Message, ParseError, PayloadItem, PayloadSize, RequestHead};

/// Decoder producing request heads and their payload chunks in order.
pub struct RequestDecoder {
    header_decoder: HeaderDecoder,
    payload_decoder: Option<PayloadDecoder>,
}

impl RequestDecoder {
    pub fn new(max_header_bytes: usize) -> Self {
        Self { header_decoder: HeaderDecoder::new(max_header_bytes), payload_decoder: None }
    }
}

impl Decoder for RequestDecoder {
    type Item = Message<(RequestHead, PayloadSize)>;
    type Error = ParseError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(payload_decoder) = &mut self.payload_decoder {
            let message = match payload_decoder.decode(src)? {
                Some(item @ PayloadItem::Chunk(_)) => Some(Message::Payload(item)),
                Some(item @ PayloadItem::Eof) => {
                    // this request's body is done; next decode parses a head again
                    self.payload_decoder.take();
                    Some(Message::Payload(item))
                }
                None => None,
            };
            return Ok(message);
        }

        let message = match self.header_decoder.decode(src)? {
            Some((head, payload_size)) => {
                // bodyless requests go straight back to head parsing
                if !payload_size.is_empty() {
                    self.payload_decoder = Some(payload_size.into());
                }
                Some(Message::Head((head, payload_size)))
            }
            None => None,
        };
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Method;

    #[test]
    fn head_then_body_then_next_head() {
        let mut decoder = RequestDecoder::new(64 * 1024);
        let mut buf = BytesMut::from(
            &b"POST /a HTTP/1.1\r\nHost: x\r\nContent-Length: 4\r\n\r\nwxyzGET /b HTTP/1.1\r\nHost: x\r\n\r\n"[..],
        );

        let head = match decoder.decode(&mut buf).unwrap().unwrap() {
            Message::Head((head, size)) => {
                assert_eq!(size, PayloadSize::Length(4));
                head
            }
            Message::Payload(_) => panic!("expected head"),
        };
        assert_eq!(head.method(), &Method::POST);

        match decoder.decode(&mut buf).unwrap().unwrap() {
            Message::Payload(PayloadItem::Chunk(bytes)) => assert_eq!(&bytes[..], b"wxyz"),
            _ => panic!("expected body chunk"),
        }
        match decoder.decode(&mut buf).unwrap().unwrap() {
            Message::Payload(PayloadItem::Eof) => {}
            _ => panic!("expected body eof"),
        }

        // pipelined second request parses from the leftover bytes
        match decoder.decode(&mut buf).unwrap().unwrap() {
            Message::Head((head, size)) => {
                assert_eq!(head.method(), &Method::GET);
                assert_eq!(head.uri().path(), "/b");
                assert!(size.is_empty());
            }
            Message::Payload(_) => panic!("expected second head"),
        }
    }
}
