//! Unit boundary detection on the raw inbound byte stream.
//!
//! XMPP over TCP is one endless XML document. Units are delimited by tracking element
//! depth: the stream header is returned as soon as its start tag is complete, each
//! top-level child of the stream is returned once its depth returns to zero, and the
//! closing `</stream:stream>` is returned on its own.

use quick_xml::errors::SyntaxError;
use quick_xml::events::Event;
use quick_xml::Reader;

use super::DecodeError;

const STREAM_CLOSE: &[u8] = b"</stream:stream>";

/// One complete unit cut from the front of the buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawUnit {
    /// The stream header start tag, including any XML declaration before it.
    StreamOpen(String),
    /// A complete top-level element.
    Element(String),
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum ParserState {
    Idle,
    InUnit,
}

fn bytes_to_string(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(s) => s.to_string(),
        Err(_) => String::from_utf8_lossy(bytes).into_owned(),
    }
}

fn is_stream_tag(qname: &[u8], local: &[u8]) -> bool {
    qname == b"stream:stream" || local == b"stream"
}

/// Cut the first complete unit from `buffer`.
///
/// Returns `Ok(Some((unit, bytes_consumed)))` when a unit is complete and `Ok(None)` when
/// more bytes are needed. A syntax error means the stream is no longer well-formed and
/// cannot be resynchronised.
pub fn extract_unit(buffer: &[u8]) -> Result<Option<(RawUnit, usize)>, DecodeError> {
    let first = buffer
        .iter()
        .position(|&b| !matches!(b, b' ' | b'\t' | b'\n' | b'\r'));
    if let Some(start) = first {
        if buffer[start..].starts_with(STREAM_CLOSE) {
            return Ok(Some((RawUnit::Close, start + STREAM_CLOSE.len())));
        }
    }

    let mut reader = Reader::from_reader(buffer);
    reader.config_mut().trim_text(false);
    reader.config_mut().check_end_names = false;

    let mut depth: u32 = 0;
    let mut state = ParserState::Idle;
    let mut unit_start: usize = 0;

    loop {
        let pos = reader.buffer_position() as usize;

        match reader.read_event() {
            Ok(Event::Decl(_)) | Ok(Event::PI(_)) | Ok(Event::Comment(_)) | Ok(Event::DocType(_)) => {}
            Ok(Event::Start(e)) => {
                if state == ParserState::Idle
                    && is_stream_tag(e.name().as_ref(), e.local_name().as_ref())
                {
                    let end = reader.buffer_position() as usize;
                    return Ok(Some((RawUnit::StreamOpen(bytes_to_string(&buffer[..end])), end)));
                }

                depth += 1;
                if state == ParserState::Idle && depth == 1 {
                    state = ParserState::InUnit;
                    unit_start = pos;
                }
            }
            Ok(Event::Empty(e)) => {
                if state == ParserState::Idle && depth == 0 {
                    let end = reader.buffer_position() as usize;
                    if is_stream_tag(e.name().as_ref(), e.local_name().as_ref()) {
                        return Ok(Some((RawUnit::StreamOpen(bytes_to_string(&buffer[..end])), end)));
                    }
                    return Ok(Some((RawUnit::Element(bytes_to_string(&buffer[pos..end])), end)));
                }
            }
            Ok(Event::Text(t)) => {
                if state == ParserState::Idle && t.iter().any(|b| !b.is_ascii_whitespace()) {
                    return Err(DecodeError::Syntax(
                        "character data between top-level elements".to_string(),
                    ));
                }
            }
            Ok(Event::CData(_)) => {}
            Ok(Event::End(e)) => {
                if depth == 0 {
                    if is_stream_tag(e.name().as_ref(), e.local_name().as_ref()) {
                        let end = reader.buffer_position() as usize;
                        return Ok(Some((RawUnit::Close, end)));
                    }
                    return Err(DecodeError::Syntax(format!(
                        "unexpected closing tag </{}>",
                        bytes_to_string(e.name().as_ref())
                    )));
                }

                depth -= 1;
                if state == ParserState::InUnit && depth == 0 {
                    let end = reader.buffer_position() as usize;
                    return Ok(Some((
                        RawUnit::Element(bytes_to_string(&buffer[unit_start..end])),
                        end,
                    )));
                }
            }
            Ok(Event::Eof) => return Ok(None),
            Err(quick_xml::Error::Syntax(
                SyntaxError::UnclosedTag
                | SyntaxError::UnclosedCData
                | SyntaxError::UnclosedComment
                | SyntaxError::UnclosedDoctype
                | SyntaxError::UnclosedPIOrXmlDecl,
            )) => {
                // Partial unit; the next read completes it.
                return Ok(None);
            }
            Err(e) => return Err(DecodeError::Syntax(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn element(buf: &[u8]) -> (String, usize) {
        match extract_unit(buf).unwrap().unwrap() {
            (RawUnit::Element(s), n) => (s, n),
            other => panic!("expected element, got {:?}", other),
        }
    }

    #[test]
    fn test_extract_stream_opening() {
        let buf = b"<?xml version='1.0'?><stream:stream xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams' version='1.0'>";
        let (unit, consumed) = extract_unit(buf).unwrap().unwrap();
        match unit {
            RawUnit::StreamOpen(s) => {
                assert!(s.starts_with("<?xml"));
                assert!(s.contains("<stream:stream"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(consumed, buf.len());
    }

    #[test]
    fn test_extract_header_then_features() {
        let buf = b"<stream:stream xmlns:stream='http://etherx.jabber.org/streams' id='s1'><stream:features><bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'/></stream:features>";
        let (_, consumed) = extract_unit(buf).unwrap().unwrap();
        let (features, rest) = element(&buf[consumed..]);
        assert!(features.starts_with("<stream:features>"));
        assert!(features.ends_with("</stream:features>"));
        assert_eq!(consumed + rest, buf.len());
    }

    #[test]
    fn test_extract_self_closing_unit() {
        let (unit, consumed) = element(b"<presence/>");
        assert_eq!(unit, "<presence/>");
        assert_eq!(consumed, 11);
    }

    #[test]
    fn test_extract_consecutive_units() {
        let buf = b"<r xmlns='urn:xmpp:sm:3'/><message to='a@b'><body>Hi</body></message> <iq id='1'/>";
        let (s1, c1) = element(buf);
        assert!(s1.starts_with("<r "));
        let (s2, c2) = element(&buf[c1..]);
        assert!(s2.starts_with("<message") && s2.ends_with("</message>"));
        let (s3, c3) = element(&buf[c1 + c2..]);
        assert_eq!(s3, "<iq id='1'/>");
        assert_eq!(c1 + c2 + c3, buf.len());
    }

    #[test]
    fn test_incomplete_unit_needs_more_bytes() {
        assert!(extract_unit(b"<iq type='get'><query xmlns='jabber:iq:roster'>")
            .unwrap()
            .is_none());
        assert!(extract_unit(b"<iq type='get' id='ab").unwrap().is_none());
        assert!(extract_unit(b"<message><body><![CDATA[half").unwrap().is_none());
    }

    #[test]
    fn test_empty_and_whitespace_buffers() {
        assert!(extract_unit(b"").unwrap().is_none());
        assert!(extract_unit(b"  \n ").unwrap().is_none());
    }

    #[test]
    fn test_stream_close_with_leading_whitespace() {
        let (unit, consumed) = extract_unit(b"  </stream:stream>").unwrap().unwrap();
        assert_eq!(unit, RawUnit::Close);
        assert_eq!(consumed, 18);
    }

    #[test]
    fn test_entities_and_cdata_are_kept_verbatim() {
        let (unit, _) = element(b"<message><body>a &amp; b <![CDATA[<raw>]]></body></message>");
        assert!(unit.contains("&amp;"));
        assert!(unit.contains("CDATA"));
    }

    #[test]
    fn test_stray_closing_tag_is_a_syntax_error() {
        assert!(matches!(
            extract_unit(b"</message>"),
            Err(DecodeError::Syntax(_))
        ));
    }

    #[test]
    fn test_top_level_text_is_a_syntax_error() {
        assert!(matches!(
            extract_unit(b"garbage<presence/>"),
            Err(DecodeError::Syntax(_))
        ));
    }
}
