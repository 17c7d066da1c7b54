//! Incremental `text/event-stream` parser.
//!
//! Bytes are buffered until a full line is available, so multi-byte UTF-8
//! sequences split across network chunks decode correctly.

/// One dispatched server-sent event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

impl SseEvent {
    /// Events without a type, or typed `message`, carry JSON-RPC payloads.
    pub fn is_message(&self) -> bool {
        matches!(self.event.as_deref(), None | Some("message"))
    }
}

#[derive(Debug, Default)]
pub(crate) struct SseParser {
    buffer: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
}

impl SseParser {
    /// Feed one chunk and return every event it completed.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();

        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(['\n', '\r']);
            if let Some(event) = self.line(line) {
                events.push(event);
            }
        }
        events
    }

    /// Flush a trailing event that was not terminated by a blank line.
    pub fn finish(&mut self) -> Option<SseEvent> {
        if !self.buffer.is_empty() {
            let raw = std::mem::take(&mut self.buffer);
            let line = String::from_utf8_lossy(&raw).trim_end_matches('\r').to_string();
            if let Some(event) = self.line(&line) {
                return Some(event);
            }
        }
        self.dispatch()
    }

    fn line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "data" => self.data.push(value.to_string()),
            "event" => self.event = Some(value.to_string()),
            // id and retry are not used for JSON-RPC delivery
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        let event = self.event.take();
        if self.data.is_empty() {
            return None;
        }
        let data = std::mem::take(&mut self.data).join("\n");
        Some(SseEvent { event, data })
    }
}

/// Parse a complete SSE body in one go.
pub(crate) fn parse_body(body: &str) -> Vec<SseEvent> {
    let mut parser = SseParser::default();
    let mut events = parser.feed(body.as_bytes());
    events.extend(parser.finish());
    events
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_events_split_across_chunks() {
        let mut parser = SseParser::default();
        assert!(parser.feed(b"data: {\"a\":").is_empty());
        assert!(parser.feed(b"1}\n").is_empty());
        let events = parser.feed(b"\ndata: second\n\n");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].data, "{\"a\":1}");
        assert_eq!(events[1].data, "second");
    }

    #[test]
    fn test_comments_and_crlf() {
        let events = parse_body(": keep-alive\r\n\r\nevent: message\r\ndata: x\r\n\r\n");
        assert_eq!(events.len(), 1);
        assert!(events[0].is_message());
        assert_eq!(events[0].data, "x");
    }

    #[test]
    fn test_multiline_data_and_typed_events() {
        let events = parse_body("event: endpoint\ndata: /messages\n\ndata: a\ndata: b\n\n");
        assert_eq!(events.len(), 2);
        assert!(!events[0].is_message());
        assert_eq!(events[1].data, "a\nb");
    }

    #[test]
    fn test_utf8_split_mid_character() {
        let text = "data: héllo\n\n".as_bytes();
        let split = text.iter().position(|&b| b == 0xC3).unwrap() + 1;
        let mut parser = SseParser::default();
        assert!(parser.feed(&text[..split]).is_empty());
        let events = parser.feed(&text[split..]);
        assert_eq!(events[0].data, "héllo");
    }

    #[test]
    fn test_unterminated_trailing_event() {
        let events = parse_body("data: tail");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "tail");
    }
}
