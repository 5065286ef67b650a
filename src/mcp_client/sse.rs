//! Server-sent events decoding for the MCP event stream.
//!
//! Reads a `reqwest::Response` as a byte stream, splits it on blank-line
//! event boundaries, and yields one [`SseEvent`] per complete event. Bytes
//! are buffered raw so multi-byte characters split across chunks survive.

use futures::stream::{self, Stream, StreamExt};

/// A single decoded event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    /// Event type; `message` when the server did not name one.
    pub event: String,
    /// Data lines joined with `\n`.
    pub data: String,
    pub id: Option<String>,
}

// ─── Decoder ─────────────────────────────────────────────────────────────────

/// Incremental decoder. Feed it chunks, collect complete events.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and drain every complete event it finishes.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();
        while let Some((end, sep_len)) = find_boundary(&self.buffer) {
            let raw: Vec<u8> = self.buffer.drain(..end + sep_len).take(end).collect();
            if let Some(event) = parse_event(&String::from_utf8_lossy(&raw)) {
                events.push(event);
            }
        }
        events
    }

    /// Flush whatever is left once the stream has ended.
    pub fn finish(&mut self) -> Option<SseEvent> {
        let rest = std::mem::take(&mut self.buffer);
        let text = String::from_utf8_lossy(&rest);
        if text.trim().is_empty() {
            return None;
        }
        parse_event(&text)
    }
}

/// Locate the first blank line. Returns (event end, separator length).
fn find_boundary(buf: &[u8]) -> Option<(usize, usize)> {
    let mut i = 0;
    while i < buf.len() {
        match buf[i] {
            b'\n' if buf.get(i + 1) == Some(&b'\n') => return Some((i, 2)),
            b'\r' if buf[i + 1..].starts_with(b"\n\r\n") => return Some((i, 4)),
            b'\r' if buf.get(i + 1) == Some(&b'\r') => return Some((i, 2)),
            _ => {}
        }
        i += 1;
    }
    None
}

fn parse_event(raw: &str) -> Option<SseEvent> {
    let mut event = None;
    let mut data: Vec<&str> = Vec::new();
    let mut id = None;

    for line in raw.split(['\n', '\r']) {
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        let (field, value) = match line.split_once(':') {
            Some((f, v)) => (f, v.strip_prefix(' ').unwrap_or(v)),
            None => (line, ""),
        };
        match field {
            "event" => event = Some(value.to_string()),
            "data" => data.push(value),
            "id" => id = Some(value.to_string()),
            _ => {}
        }
    }

    if event.is_none() && data.is_empty() {
        return None; // comment or keep-alive
    }
    Some(SseEvent {
        event: event.unwrap_or_else(|| "message".to_string()),
        data: data.join("\n"),
        id,
    })
}

// ─── Stream adapter ──────────────────────────────────────────────────────────

/// Turn an open event-stream response into a stream of events.
///
/// The stream ends when the body ends. A transport error is yielded once,
/// then the stream ends.
pub fn event_stream(
    response: reqwest::Response,
) -> impl Stream<Item = Result<SseEvent, reqwest::Error>> {
    let bytes = response.bytes_stream();
    let pending: std::collections::VecDeque<SseEvent> = Default::default();

    stream::unfold(
        (bytes, SseDecoder::new(), pending, false),
        |(mut bytes, mut decoder, mut pending, mut done)| async move {
            loop {
                if let Some(event) = pending.pop_front() {
                    return Some((Ok(event), (bytes, decoder, pending, done)));
                }
                if done {
                    return None;
                }
                match bytes.next().await {
                    Some(Ok(chunk)) => pending.extend(decoder.push(&chunk)),
                    Some(Err(e)) => {
                        done = true;
                        return Some((Err(e), (bytes, decoder, pending, done)));
                    }
                    None => {
                        done = true;
                        pending.extend(decoder.finish());
                    }
                }
            }
        },
    )
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_event() {
        let mut dec = SseDecoder::new();
        let events = dec.push(b"event: endpoint\ndata: /messages?session_id=abc\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, "endpoint");
        assert_eq!(events[0].data, "/messages?session_id=abc");
    }

    #[test]
    fn test_event_split_across_chunks() {
        let mut dec = SseDecoder::new();
        assert!(dec.push(b"event: mess").is_empty());
        assert!(dec.push(b"age\ndata: {\"id\":1}\n").is_empty());
        let events = dec.push(b"\nevent: message\ndata: {\"id\":2}\n\n");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].data, "{\"id\":1}");
        assert_eq!(events[1].data, "{\"id\":2}");
    }

    #[test]
    fn test_multibyte_char_split_across_chunks() {
        let payload = "data: héllo\n\n".as_bytes();
        let split = payload.iter().position(|b| *b == 0xC3).unwrap() + 1;
        let mut dec = SseDecoder::new();
        assert!(dec.push(&payload[..split]).is_empty());
        let events = dec.push(&payload[split..]);
        assert_eq!(events[0].data, "héllo");
    }

    #[test]
    fn test_default_event_type_and_multiline_data() {
        let mut dec = SseDecoder::new();
        let events = dec.push(b"data: line one\ndata: line two\nid: 7\n\n");
        assert_eq!(events[0].event, "message");
        assert_eq!(events[0].data, "line one\nline two");
        assert_eq!(events[0].id.as_deref(), Some("7"));
    }

    #[test]
    fn test_comments_and_crlf() {
        let mut dec = SseDecoder::new();
        let events = dec.push(b": ping\r\n\r\nevent: endpoint\r\ndata: /m\r\n\r\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, "endpoint");
        assert_eq!(events[0].data, "/m");
    }

    #[test]
    fn test_finish_flushes_unterminated_event() {
        let mut dec = SseDecoder::new();
        assert!(dec.push(b"data: tail").is_empty());
        let last = dec.finish().unwrap();
        assert_eq!(last.data, "tail");
        assert!(dec.finish().is_none());
    }
}
