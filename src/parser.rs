//! C3: incremental HTTP/1.1 response parser, grounded on the byte-scanning
//! style of `examples/warpy-ai-script/src/runtime/http/mod.rs`'s
//! `ResponseParser`, generalized into the explicit resumable state machine
//! spec section 4.3 calls for.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParserPhase {
    Init,
    Status,
    Headers,
    Body,
    Done,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyMode {
    Unknown,
    ContentLength,
    Chunked,
    None,
}

/// Incremental response parser. Feed it successive byte slices; it consumes
/// exactly a prefix of each call and reports how much it consumed so the
/// caller can shift any unconsumed suffix to the front of its buffer before
/// the next read (spec section 4.3 invariant).
#[derive(Debug)]
pub struct ResponseParser {
    phase: ParserPhase,
    body_mode: BodyMode,

    pub major: u8,
    pub minor: u8,
    pub status_code: u16,
    pub content_length: i64,
    pub chunked: bool,
    pub should_close: bool,
    pub body_length: u64,
    pub read_done: bool,

    line_buf: Vec<u8>,
    chunk_remaining: u64,
    chunk_crlf_pending: bool,
    connection_header_seen: bool,
    error_detail: Option<String>,
}

impl Default for ResponseParser {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseParser {
    pub fn new() -> Self {
        ResponseParser {
            phase: ParserPhase::Init,
            body_mode: BodyMode::Unknown,
            major: 1,
            minor: 1,
            status_code: 0,
            content_length: -1,
            chunked: false,
            should_close: false,
            body_length: 0,
            read_done: false,
            line_buf: Vec::with_capacity(256),
            chunk_remaining: 0,
            chunk_crlf_pending: false,
            connection_header_seen: false,
            error_detail: None,
        }
    }

    pub fn phase(&self) -> ParserPhase {
        self.phase
    }

    pub fn is_done(&self) -> bool {
        self.phase == ParserPhase::Done
    }

    pub fn is_error(&self) -> bool {
        self.phase == ParserPhase::Error
    }

    pub fn status_code(&self) -> u16 {
        self.status_code
    }

    pub fn should_close(&self) -> bool {
        self.should_close
    }

    pub fn error_detail(&self) -> Option<&str> {
        self.error_detail.as_deref()
    }

    fn fail(&mut self, detail: impl Into<String>) {
        self.phase = ParserPhase::Error;
        self.error_detail = Some(detail.into());
    }

    /// Feed `data` to the parser. Returns the number of bytes consumed; the
    /// remainder (if `phase()` is not `Done`/`Error`, there usually is none)
    /// belongs to the next message.
    pub fn feed(&mut self, data: &[u8]) -> usize {
        let mut pos = 0;
        while pos < data.len() && self.phase != ParserPhase::Done && self.phase != ParserPhase::Error {
            match self.phase {
                ParserPhase::Init => {
                    self.phase = ParserPhase::Status;
                }
                ParserPhase::Status => {
                    match self.take_line(data, pos) {
                        Some(line_end_excl) => {
                            pos = line_end_excl;
                            if let Err(e) = self.parse_status_line() {
                                self.fail(e);
                                break;
                            }
                            self.phase = ParserPhase::Headers;
                        }
                        None => break,
                    }
                }
                ParserPhase::Headers => {
                    match self.take_line(data, pos) {
                        Some(line_end_excl) => {
                            pos = line_end_excl;
                            if self.line_buf.is_empty() {
                                self.start_body();
                            } else if let Err(e) = self.parse_header_line() {
                                self.fail(e);
                                break;
                            }
                        }
                        None => break,
                    }
                }
                ParserPhase::Body => {
                    pos += self.consume_body(&data[pos..]);
                }
                ParserPhase::Done | ParserPhase::Error => unreachable!(),
            }
        }
        pos
    }

    /// Scans from `start` for a CRLF-terminated line, buffering it into
    /// `line_buf` and returning the index just past the terminator. `None`
    /// means the line is incomplete; the caller (connection.rs) is
    /// responsible for keeping the unconsumed suffix and re-feeding it
    /// together with newly arrived bytes on the next read.
    fn take_line(&mut self, data: &[u8], start: usize) -> Option<usize> {
        let mut i = start;
        while i < data.len() {
            if data[i] == b'\n' {
                let mut end = i;
                if end > start && data[end - 1] == b'\r' {
                    end -= 1;
                }
                self.line_buf.clear();
                self.line_buf.extend_from_slice(&data[start..end]);
                return Some(i + 1);
            }
            i += 1;
        }
        None
    }

    fn parse_status_line(&mut self) -> Result<(), String> {
        let line = std::str::from_utf8(&self.line_buf)
            .map_err(|_| "status line is not valid UTF-8".to_string())?;
        let mut parts = line.splitn(3, ' ');
        let version = parts.next().ok_or("missing HTTP version")?;
        let status = parts.next().ok_or("missing status code")?;

        if let Some(rest) = version.strip_prefix("HTTP/") {
            let (maj, min) = rest.split_once('.').ok_or("malformed HTTP version")?;
            self.major = maj.parse().map_err(|_| "malformed major version")?;
            self.minor = min.parse().map_err(|_| "malformed minor version")?;
        } else {
            return Err("missing HTTP/ prefix".to_string());
        }

        self.status_code = status.parse().map_err(|_| "malformed status code")?;
        Ok(())
    }

    fn parse_header_line(&mut self) -> Result<(), String> {
        let line = std::str::from_utf8(&self.line_buf)
            .map_err(|_| "header line is not valid UTF-8".to_string())?;
        let (name, value) = line.split_once(':').ok_or("malformed header line")?;
        let name = name.trim();
        let value = value.trim();

        if name.eq_ignore_ascii_case("Content-Length") {
            self.content_length = value.parse().map_err(|_| "malformed Content-Length")?;
        } else if name.eq_ignore_ascii_case("Transfer-Encoding") {
            if value.to_ascii_lowercase().contains("chunked") {
                self.chunked = true;
            }
        } else if name.eq_ignore_ascii_case("Connection") {
            self.connection_header_seen = true;
            if value.to_ascii_lowercase().contains("close") {
                self.should_close = true;
            } else if value.to_ascii_lowercase().contains("keep-alive") {
                self.should_close = false;
            }
        }
        Ok(())
    }

    fn start_body(&mut self) {
        // HTTP/1.0 without an explicit `Connection: keep-alive` closes
        // (spec section 9, open question b).
        if self.major == 1 && self.minor == 0 && !self.connection_header_seen {
            self.should_close = true;
        }

        if self.chunked {
            self.body_mode = BodyMode::Chunked;
            self.phase = ParserPhase::Body;
        } else if self.content_length >= 0 {
            self.body_mode = BodyMode::ContentLength;
            if self.content_length == 0 {
                self.read_done = true;
                self.phase = ParserPhase::Done;
            } else {
                self.phase = ParserPhase::Body;
            }
        } else {
            // Neither Content-Length nor chunked: body is declared empty.
            self.body_mode = BodyMode::None;
            self.read_done = true;
            self.phase = ParserPhase::Done;
        }
    }

    fn consume_body(&mut self, data: &[u8]) -> usize {
        match self.body_mode {
            BodyMode::ContentLength => {
                let remaining = self.content_length as u64 - self.body_length;
                let take = remaining.min(data.len() as u64) as usize;
                self.body_length += take as u64;
                if self.body_length as i64 >= self.content_length {
                    self.read_done = true;
                    self.phase = ParserPhase::Done;
                }
                take
            }
            BodyMode::Chunked => self.consume_chunked(data),
            BodyMode::None | BodyMode::Unknown => 0,
        }
    }

    fn consume_chunked(&mut self, data: &[u8]) -> usize {
        let mut pos = 0;
        loop {
            if self.chunk_crlf_pending {
                if data.len() - pos < 2 {
                    return pos;
                }
                pos += 2;
                self.chunk_crlf_pending = false;
                continue;
            }

            if self.chunk_remaining > 0 {
                let take = self.chunk_remaining.min((data.len() - pos) as u64);
                pos += take as usize;
                self.body_length += take;
                self.chunk_remaining -= take;
                if self.chunk_remaining == 0 {
                    self.chunk_crlf_pending = true;
                    continue;
                }
                return pos;
            }

            // Read a chunk-size line (ignoring any chunk extensions after ';').
            match self.find_line_end(&data[pos..]) {
                Some((end, consumed)) => {
                    let line = &data[pos..pos + end];
                    let line = match line.iter().position(|&b| b == b';') {
                        Some(semi) => &line[..semi],
                        None => line,
                    };
                    let size_str = std::str::from_utf8(line).unwrap_or("").trim();
                    let size = match u64::from_str_radix(size_str, 16) {
                        Ok(s) => s,
                        Err(_) => {
                            self.fail("malformed chunk size");
                            return pos;
                        }
                    };
                    pos += consumed;
                    if size == 0 {
                        // Terminating chunk: consume trailers up to the final
                        // blank line, then we're done.
                        return pos + self.consume_trailers(&data[pos..]);
                    }
                    self.chunk_remaining = size;
                }
                None => return pos,
            }
        }
    }

    fn consume_trailers(&mut self, data: &[u8]) -> usize {
        let mut pos = 0;
        loop {
            match self.find_line_end(&data[pos..]) {
                Some((end, consumed)) => {
                    pos += consumed;
                    if end == 0 {
                        self.read_done = true;
                        self.phase = ParserPhase::Done;
                        return pos;
                    }
                    // Trailer field: semantically ignored (spec section 9, open question c).
                }
                None => return pos,
            }
        }
    }

    /// Returns (line length excluding CRLF, total bytes consumed including CRLF).
    fn find_line_end(&self, data: &[u8]) -> Option<(usize, usize)> {
        let i = data.iter().position(|&b| b == b'\n')?;
        let mut end = i;
        if end > 0 && data[end - 1] == b'\r' {
            end -= 1;
        }
        Some((end, i + 1))
    }

    /// Reset for the next response on the same connection.
    pub fn reset(&mut self) {
        *self = ResponseParser::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_all(bytes: &[u8]) -> ResponseParser {
        let mut p = ResponseParser::new();
        let mut pos = 0;
        while pos < bytes.len() && p.phase() != ParserPhase::Done && p.phase() != ParserPhase::Error {
            pos += p.feed(&bytes[pos..]);
        }
        p
    }

    #[test]
    fn content_length_body_done_without_consuming_trailing_bytes() {
        let resp = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhelloEXTRA";
        let mut p = ResponseParser::new();
        let consumed = p.feed(resp);
        assert_eq!(p.phase(), ParserPhase::Done);
        assert_eq!(p.status_code, 200);
        assert_eq!(p.body_length, 5);
        assert_eq!(&resp[consumed..], b"EXTRA");
    }

    #[test]
    fn chunked_response_with_trailers_consumes_trailing_crlf() {
        let resp = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n0\r\nX-Trailer: 1\r\n\r\nNEXT";
        let mut p = ResponseParser::new();
        let consumed = p.feed(resp);
        assert_eq!(p.phase(), ParserPhase::Done);
        assert!(p.chunked);
        assert_eq!(p.body_length, 5);
        assert_eq!(&resp[consumed..], b"NEXT");
    }

    #[test]
    fn no_length_no_chunked_means_empty_body() {
        let resp = b"HTTP/1.1 204 No Content\r\n\r\n";
        let p = parse_all(resp);
        assert_eq!(p.phase(), ParserPhase::Done);
        assert_eq!(p.content_length, -1);
        assert_eq!(p.body_length, 0);
    }

    #[test]
    fn connection_close_header_detected_case_insensitively() {
        let resp = b"HTTP/1.1 200 OK\r\nCONNECTION: Close\r\nContent-Length: 0\r\n\r\n";
        let p = parse_all(resp);
        assert!(p.should_close);
    }

    #[test]
    fn http_10_without_connection_header_closes() {
        let resp = b"HTTP/1.0 200 OK\r\nContent-Length: 0\r\n\r\n";
        let p = parse_all(resp);
        assert!(p.should_close);
    }

    #[test]
    fn http_10_with_keep_alive_does_not_close() {
        let resp = b"HTTP/1.0 200 OK\r\nConnection: keep-alive\r\nContent-Length: 0\r\n\r\n";
        let p = parse_all(resp);
        assert!(!p.should_close);
    }

    #[test]
    fn malformed_status_line_errors() {
        let resp = b"NOT A RESPONSE\r\n\r\n";
        let p = parse_all(resp);
        assert_eq!(p.phase(), ParserPhase::Error);
    }

    #[test]
    fn idempotent_across_arbitrary_chunk_boundaries() {
        let resp: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 13\r\n\r\nHello, World!";
        let whole = parse_all(resp);

        for split in 1..resp.len() {
            let mut p = ResponseParser::new();
            let (first, second) = resp.split_at(split);

            // Mimic the connection driver: keep whatever the parser didn't
            // consume, append newly arrived bytes, and re-feed the whole span.
            let mut buf = first.to_vec();
            let consumed = p.feed(&buf);
            buf.drain(..consumed);

            if p.phase() != ParserPhase::Done && p.phase() != ParserPhase::Error {
                buf.extend_from_slice(second);
                let consumed = p.feed(&buf);
                buf.drain(..consumed);
            }

            assert_eq!(p.phase(), whole.phase(), "split at {split}");
            assert_eq!(p.status_code, whole.status_code);
            assert_eq!(p.body_length, whole.body_length);
        }
    }
}
