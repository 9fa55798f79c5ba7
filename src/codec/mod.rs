//! Wire codec: stream header/close, element serialization and inbound unit decoding.

pub mod element;
pub mod framing;

use quick_xml::events::Event;
use quick_xml::Reader;
use thiserror::Error;

pub use element::{Element, Node, NS_CLIENT, NS_STREAMS};
use framing::{extract_unit, RawUnit};

/// Attributes of a `<stream:stream>` header, in either direction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamHeader {
    pub to: Option<String>,
    pub from: Option<String>,
    pub id: Option<String>,
    pub version: Option<String>,
    pub lang: Option<String>,
}

/// A decoded inbound unit.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    StreamOpen(StreamHeader),
    Element(Element),
    Close,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// A single unit could not be parsed. It has been consumed; the stream can continue.
    #[error("unparseable unit ({reason}): {raw}")]
    Malformed { raw: String, reason: String },

    /// The byte stream is no longer well-formed.
    #[error("stream is not well-formed: {0}")]
    Syntax(String),
}

/// Converts between wire bytes and frames.
pub trait Codec: Send + Sync + 'static {
    fn stream_open(&self, header: &StreamHeader) -> String;

    fn stream_close(&self) -> String;

    fn encode(&self, element: &Element) -> String;

    /// Decode the next frame from the front of `buffer`, draining what was consumed.
    /// `Ok(None)` means more bytes are needed.
    fn decode(&self, buffer: &mut Vec<u8>) -> Result<Option<Frame>, DecodeError>;
}

/// Default codec for `jabber:client` streams.
#[derive(Debug, Clone)]
pub struct XmlCodec {
    default_ns: String,
}

impl Default for XmlCodec {
    fn default() -> Self {
        Self {
            default_ns: NS_CLIENT.to_string(),
        }
    }
}

impl Codec for XmlCodec {
    fn stream_open(&self, header: &StreamHeader) -> String {
        let mut out = String::from("<?xml version='1.0'?><stream:stream");
        let attrs = [
            ("to", &header.to),
            ("from", &header.from),
            ("id", &header.id),
            ("xml:lang", &header.lang),
        ];
        for (key, value) in attrs {
            if let Some(value) = value {
                out.push_str(&format!(" {key}='{}'", quick_xml::escape::escape(value.as_str())));
            }
        }
        out.push_str(&format!(
            " version='{}' xmlns='{}' xmlns:stream='{}'>",
            header.version.as_deref().unwrap_or("1.0"),
            self.default_ns,
            NS_STREAMS
        ));
        out
    }

    fn stream_close(&self) -> String {
        "</stream:stream>".to_string()
    }

    fn encode(&self, element: &Element) -> String {
        element.to_xml(Some(&self.default_ns))
    }

    fn decode(&self, buffer: &mut Vec<u8>) -> Result<Option<Frame>, DecodeError> {
        let Some((unit, consumed)) = extract_unit(buffer)? else {
            return Ok(None);
        };
        buffer.drain(..consumed);

        match unit {
            RawUnit::Close => Ok(Some(Frame::Close)),
            RawUnit::StreamOpen(raw) => parse_stream_header(&raw)
                .map(|h| Some(Frame::StreamOpen(h)))
                .map_err(|reason| DecodeError::Malformed { raw, reason }),
            RawUnit::Element(raw) => Element::parse(&raw, &self.default_ns)
                .map(|e| Some(Frame::Element(e)))
                .map_err(|reason| DecodeError::Malformed { raw, reason }),
        }
    }
}

/// Read the attributes of a stream header start tag.
pub fn parse_stream_header(raw: &str) -> Result<StreamHeader, String> {
    let mut reader = Reader::from_str(raw);
    loop {
        match reader.read_event().map_err(|e| e.to_string())? {
            Event::Start(e) | Event::Empty(e) => {
                let mut header = StreamHeader::default();
                for attr in e.attributes() {
                    let attr = attr.map_err(|e| e.to_string())?;
                    let value = attr.unescape_value().map_err(|e| e.to_string())?.into_owned();
                    match attr.key.as_ref() {
                        b"to" => header.to = Some(value),
                        b"from" => header.from = Some(value),
                        b"id" => header.id = Some(value),
                        b"version" => header.version = Some(value),
                        b"xml:lang" => header.lang = Some(value),
                        _ => {}
                    }
                }
                return Ok(header);
            }
            Event::Eof => return Err("no stream header".to_string()),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_open_format() {
        let codec = XmlCodec::default();
        let header = StreamHeader {
            to: Some("example.com".into()),
            lang: Some("en".into()),
            ..Default::default()
        };
        assert_eq!(
            codec.stream_open(&header),
            "<?xml version='1.0'?><stream:stream to='example.com' xml:lang='en' version='1.0' xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams'>"
        );
    }

    #[test]
    fn test_decode_sequence_and_partial_input() {
        let codec = XmlCodec::default();
        let mut buf = b"<?xml version='1.0'?><stream:stream from='example.com' id='abc' version='1.0' xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams'><iq id='q1' type='res".to_vec();

        match codec.decode(&mut buf).unwrap() {
            Some(Frame::StreamOpen(h)) => {
                assert_eq!(h.id.as_deref(), Some("abc"));
                assert_eq!(h.from.as_deref(), Some("example.com"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(b"ult'/></stream:stream>");
        match codec.decode(&mut buf).unwrap() {
            Some(Frame::Element(e)) => {
                assert!(e.is("iq", NS_CLIENT));
                assert_eq!(e.get_attr("type"), Some("result"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Frame::Close));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_malformed_unit_is_consumed() {
        let codec = XmlCodec::default();
        let mut buf = b"<message><body>&nope;</body></message><presence/>".to_vec();
        assert!(matches!(
            codec.decode(&mut buf),
            Err(DecodeError::Malformed { .. })
        ));
        match codec.decode(&mut buf).unwrap() {
            Some(Frame::Element(e)) => assert_eq!(e.name(), "presence"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_encode_uses_stream_namespace_context() {
        let codec = XmlCodec::default();
        let el = Element::new("presence", NS_CLIENT);
        assert_eq!(codec.encode(&el), "<presence/>");
    }
}
