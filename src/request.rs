use std::collections::HashMap;

const MAX_HEADERS: usize = 64;

/// Bounds on what a single request may buffer before it is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub max_header_bytes: usize,
    pub max_body_bytes: usize,
}

impl Limits {
    /// Most bytes a connection buffers before the parser must have framed or rejected a request.
    pub fn max_buffered_bytes(&self) -> usize {
        self.max_header_bytes.saturating_add(self.max_body_bytes)
    }
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_header_bytes: 64 * 1024,
            max_body_bytes: 8 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: String,
    pub target: String,
    pub version: String,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl Request {
    /// ASCII case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        header_value(&self.headers, name)
    }

    // Intent: decide connection persistence from the version and the Connection header.
    // Result: HTTP/1.1 stays open unless told to close, HTTP/1.0 only with keep-alive.
    pub fn keep_alive(&self) -> bool {
        let connection = self
            .header("Connection")
            .unwrap_or_default()
            .to_ascii_lowercase();
        if self.version == "HTTP/1.0" {
            connection.contains("keep-alive")
        } else {
            !connection.contains("close")
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseOutcome {
    /// No complete request yet; the buffer is left untouched.
    Incomplete,
    /// A request was framed and its bytes removed from the front of the buffer.
    Complete(Request),
    /// The buffered bytes can never form a valid request.
    Malformed(String),
}

fn header_value<'a>(headers: &'a HashMap<String, String>, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(header_name, _)| header_name.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}

fn requires_body(method: &str) -> bool {
    matches!(method, "POST" | "PUT" | "PATCH")
}

struct Head {
    request: Request,
    header_len: usize,
}

fn parse_head(buffer: &[u8]) -> Result<httparse::Status<Head>, String> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parsed = httparse::Request::new(&mut headers);
    let header_len = match parsed.parse(buffer) {
        Ok(httparse::Status::Complete(size)) => size,
        Ok(httparse::Status::Partial) => return Ok(httparse::Status::Partial),
        Err(err) => return Err(format!("invalid request head: {err}")),
    };

    let method = parsed.method.ok_or("request line missing method")?;
    let target = parsed.path.ok_or("request line missing target")?;
    let version = parsed.version.ok_or("request line missing version")?;

    // Names differing only in case are the same header: the later line replaces the earlier one.
    let mut header_map: HashMap<String, String> = HashMap::with_capacity(parsed.headers.len());
    for header in parsed.headers.iter() {
        let name = header.name.trim();
        header_map.retain(|existing, _| !existing.eq_ignore_ascii_case(name));
        header_map.insert(
            name.to_string(),
            String::from_utf8_lossy(header.value).trim().to_string(),
        );
    }

    Ok(httparse::Status::Complete(Head {
        request: Request {
            method: method.to_string(),
            target: target.to_string(),
            version: format!("HTTP/1.{version}"),
            headers: header_map,
            body: Vec::new(),
        },
        header_len,
    }))
}

// Intent: frame the next request out of a connection's accumulated read buffer.
// Result: the same request comes out however the bytes were split across reads, and any pipelined
// remainder stays in the buffer for the next pass.
pub fn parse_request(buffer: &mut Vec<u8>, limits: &Limits) -> ParseOutcome {
    let Head {
        mut request,
        header_len,
    } = match parse_head(buffer) {
        Ok(httparse::Status::Complete(head)) => head,
        Ok(httparse::Status::Partial) if buffer.len() > limits.max_header_bytes => {
            return ParseOutcome::Malformed("request head too large".to_string())
        }
        Ok(httparse::Status::Partial) => return ParseOutcome::Incomplete,
        Err(reason) => return ParseOutcome::Malformed(reason),
    };
    if header_len > limits.max_header_bytes {
        return ParseOutcome::Malformed("request head too large".to_string());
    }

    let content_length = match request.header("Content-Length") {
        Some(value) => match value.parse::<usize>() {
            Ok(length) => length,
            Err(_) => return ParseOutcome::Malformed(format!("invalid Content-Length: {value}")),
        },
        None if requires_body(&request.method) => {
            return ParseOutcome::Malformed(format!("{} without Content-Length", request.method))
        }
        None => 0,
    };
    if content_length > limits.max_body_bytes {
        return ParseOutcome::Malformed("request body too large".to_string());
    }

    let total_len = header_len + content_length;
    if buffer.len() < total_len {
        return ParseOutcome::Incomplete;
    }

    request.body = buffer[header_len..total_len].to_vec();
    buffer.drain(..total_len);
    ParseOutcome::Complete(request)
}
