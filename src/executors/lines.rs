use serde_json::Value;

/// Longest record line accepted from a skill. Anything longer is counted as
/// malformed and its bytes are discarded as they arrive.
pub const MAX_LINE_BYTES: usize = 1 << 20;

#[derive(Debug, PartialEq)]
pub enum Line {
    Complete(String),
    /// A line that outgrew the limit; carries its length in bytes.
    Overlong(usize),
}

impl Line {
    pub fn parse(&self) -> ParsedLine {
        match self {
            Line::Complete(text) => classify(text),
            Line::Overlong(len) => {
                ParsedLine::Malformed(format!("<{} byte line over the {} byte limit>", len, MAX_LINE_BYTES))
            }
        }
    }
}

/// Splits a byte stream into lines, holding a trailing partial line until the
/// next newline or [`LineSplitter::finish`].
#[derive(Debug)]
pub struct LineSplitter {
    pending: Vec<u8>,
    max_line: usize,
    overflow: usize,
}

impl Default for LineSplitter {
    fn default() -> Self {
        Self::with_limit(MAX_LINE_BYTES)
    }
}

impl LineSplitter {
    pub fn with_limit(max_line: usize) -> Self {
        Self {
            pending: Vec::new(),
            max_line,
            overflow: 0,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<Line> {
        let mut lines = Vec::new();
        let mut rest = chunk;
        while let Some(pos) = rest.iter().position(|&b| b == b'\n') {
            self.extend(&rest[..pos]);
            lines.push(self.take());
            rest = &rest[pos + 1..];
        }
        self.extend(rest);
        lines
    }

    /// Flush whatever is left once the stream has ended.
    pub fn finish(&mut self) -> Option<Line> {
        if self.pending.is_empty() && self.overflow == 0 {
            None
        } else {
            Some(self.take())
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    fn extend(&mut self, bytes: &[u8]) {
        if self.overflow > 0 {
            self.overflow += bytes.len();
        } else if self.pending.len() + bytes.len() > self.max_line {
            self.overflow = self.pending.len() + bytes.len();
            self.pending = Vec::new();
        } else {
            self.pending.extend_from_slice(bytes);
        }
    }

    fn take(&mut self) -> Line {
        if self.overflow > 0 {
            return Line::Overlong(std::mem::take(&mut self.overflow));
        }
        let buf = &mut self.pending;
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
        let line = String::from_utf8_lossy(buf).into_owned();
        buf.clear();
        Line::Complete(line)
    }
}

#[derive(Debug, PartialEq)]
pub enum ParsedLine {
    Blank,
    Record(Value),
    Malformed(String),
}

/// A record line must be exactly one JSON object.
pub fn classify(line: &str) -> ParsedLine {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return ParsedLine::Blank;
    }
    match serde_json::from_str::<Value>(trimmed) {
        Ok(value @ Value::Object(_)) => ParsedLine::Record(value),
        _ => ParsedLine::Malformed(trimmed.to_string()),
    }
}
