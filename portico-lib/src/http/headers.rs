use std::ops::Range;

use crate::matcher::Matcher;

/// Canonical classification of a header line. Two headers with the same
/// tag are semantically equivalent regardless of the case they were sent
/// with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderTag {
    Connection,
    ContentLength,
    TransferEncoding,
    Host,
    Upgrade,
    Expect,
    Location,
    ContentLocation,
    Destination,
    Authorization,
    Referer,
    UserAgent,
    Other,
    Illegal,
}

fn classify(name: &str) -> HeaderTag {
    const TAGS: &[(&str, HeaderTag)] = &[
        ("transfer-encoding", HeaderTag::TransferEncoding),
        ("content-length", HeaderTag::ContentLength),
        ("connection", HeaderTag::Connection),
        ("location", HeaderTag::Location),
        ("content-location", HeaderTag::ContentLocation),
        ("host", HeaderTag::Host),
        ("referer", HeaderTag::Referer),
        ("user-agent", HeaderTag::UserAgent),
        ("destination", HeaderTag::Destination),
        ("expect", HeaderTag::Expect),
        ("upgrade", HeaderTag::Upgrade),
        ("authorization", HeaderTag::Authorization),
    ];
    for (n, tag) in TAGS {
        if name.eq_ignore_ascii_case(n) {
            return *tag;
        }
    }
    HeaderTag::Other
}

fn is_token_char(c: u8) -> bool {
    c.is_ascii_alphanumeric() || b"!#$%&'*+.^_`|~-".contains(&c)
}

/// One header line, kept as received. Name and value are spans into the
/// raw text so the original bytes can be forwarded unchanged.
#[derive(Debug, Clone)]
pub struct Header {
    raw: String,
    name: Range<usize>,
    value: Range<usize>,
    pub tag: HeaderTag,
}

impl Header {
    pub fn parse(line: &str) -> Header {
        let raw = line.to_string();
        let Some(colon) = raw.find(':') else {
            return Header { raw, name: 0..0, value: 0..0, tag: HeaderTag::Illegal };
        };
        let name_txt = &raw[..colon];
        if name_txt.is_empty() || !name_txt.bytes().all(is_token_char) {
            return Header { raw, name: 0..0, value: 0..0, tag: HeaderTag::Illegal };
        }
        let val_start = colon + 1 + raw[colon + 1..].len() - raw[colon + 1..].trim_start().len();
        let val_end = raw.trim_end().len().max(val_start);
        let tag = classify(name_txt);
        Header { raw, name: 0..colon, value: val_start..val_end, tag }
    }

    /// Build a header from parts; the caller vouches the parts are clean.
    pub fn from_parts(name: &str, value: &str) -> Header {
        Header::parse(&format!("{name}: {value}"))
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn name(&self) -> &str {
        &self.raw[self.name.clone()]
    }

    pub fn value(&self) -> &str {
        &self.raw[self.value.clone()]
    }

    pub fn has_name(&self, name: &str) -> bool {
        self.name().eq_ignore_ascii_case(name)
    }

    /// Replace the whole line, re-classifying.
    pub fn set_raw(&mut self, line: String) {
        *self = Header::parse(&line);
    }
}

/// Insertion-ordered header list with lookup by tag or name. Duplicates
/// are allowed; `first` semantics are used wherever one value is needed.
#[derive(Debug, Clone, Default)]
pub struct HeaderList {
    items: Vec<Header>,
}

impl HeaderList {
    pub fn new() -> HeaderList {
        HeaderList::default()
    }

    pub fn push(&mut self, hdr: Header) {
        self.items.push(hdr);
    }

    /// Parse and append one raw line. Illegal lines are dropped, matching
    /// how the wire reader discards them.
    pub fn append_line(&mut self, line: &str) -> bool {
        let hdr = Header::parse(line);
        if hdr.tag == HeaderTag::Illegal {
            return false;
        }
        self.items.push(hdr);
        true
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Header> {
        self.items.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Header> {
        self.items.iter_mut()
    }

    pub fn first(&self, tag: HeaderTag) -> Option<&Header> {
        self.items.iter().find(|h| h.tag == tag)
    }

    pub fn first_mut(&mut self, tag: HeaderTag) -> Option<&mut Header> {
        self.items.iter_mut().find(|h| h.tag == tag)
    }

    pub fn value_of(&self, tag: HeaderTag) -> Option<&str> {
        self.first(tag).map(|h| h.value())
    }

    /// First header with the given (case-insensitive) name.
    pub fn named_value(&self, name: &str) -> Option<&str> {
        self.items.iter().find(|h| h.has_name(name)).map(|h| h.value())
    }

    pub fn remove(&mut self, tag: HeaderTag) {
        self.items.retain(|h| h.tag != tag);
    }

    pub fn retain<F: FnMut(&Header) -> bool>(&mut self, f: F) {
        self.items.retain(f);
    }

    /// Drop every header whose full text matches the pattern.
    pub fn filter_out(&mut self, m: &Matcher) {
        self.items.retain(|h| !m.is_match(h.raw()));
    }

    /// The whole block as one multiline text, for header-block matching.
    pub fn joined(&self) -> String {
        let mut out = String::new();
        for h in &self.items {
            out.push_str(h.raw());
            out.push('\n');
        }
        out
    }

    /// Serialize all lines with CRLF terminators (no trailing blank line).
    pub fn write_to(&self, out: &mut Vec<u8>) {
        for h in &self.items {
            out.extend_from_slice(h.raw().as_bytes());
            out.extend_from_slice(b"\r\n");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matcher::PatternFlavor;

    #[test]
    fn classification_is_case_insensitive() {
        assert_eq!(Header::parse("HOST: x").tag, HeaderTag::Host);
        assert_eq!(Header::parse("content-LENGTH: 3").tag, HeaderTag::ContentLength);
        assert_eq!(Header::parse("X-Custom: y").tag, HeaderTag::Other);
    }

    #[test]
    fn spans_trim_whitespace() {
        let h = Header::parse("Host:   example.org  ");
        assert_eq!(h.name(), "Host");
        assert_eq!(h.value(), "example.org");
        assert_eq!(h.raw(), "Host:   example.org  ");
    }

    #[test]
    fn empty_value_is_legal() {
        let h = Header::parse("X-Empty:");
        assert_eq!(h.tag, HeaderTag::Other);
        assert_eq!(h.value(), "");
    }

    #[test]
    fn illegal_lines() {
        assert_eq!(Header::parse("no colon here").tag, HeaderTag::Illegal);
        assert_eq!(Header::parse(": empty name").tag, HeaderTag::Illegal);
        assert_eq!(Header::parse("bad name: x").tag, HeaderTag::Illegal);
    }

    #[test]
    fn list_preserves_order_and_duplicates() {
        let mut l = HeaderList::new();
        l.append_line("Host: a");
        l.append_line("X-Dup: 1");
        l.append_line("X-Dup: 2");
        let vals: Vec<_> = l.iter().map(|h| h.raw().to_string()).collect();
        assert_eq!(vals, vec!["Host: a", "X-Dup: 1", "X-Dup: 2"]);
        assert_eq!(l.named_value("x-dup"), Some("1"));
    }

    #[test]
    fn filter_out_removes_matching_lines() {
        let mut l = HeaderList::new();
        l.append_line("X-Secret: 1");
        l.append_line("Host: a");
        let m = Matcher::compile("^X-Secret:", PatternFlavor::Posix, true).unwrap();
        l.filter_out(&m);
        assert_eq!(l.len(), 1);
        assert_eq!(l.value_of(HeaderTag::Host), Some("a"));
    }

    #[test]
    fn serialize_round_trips() {
        let mut l = HeaderList::new();
        l.append_line("Host: a");
        l.append_line("X-Y: z");
        let mut buf = Vec::new();
        l.write_to(&mut buf);
        let text = String::from_utf8(buf).unwrap();
        let mut back = HeaderList::new();
        for line in text.split("\r\n").filter(|s| !s.is_empty()) {
            back.append_line(line);
        }
        assert_eq!(back.len(), l.len());
        for (a, b) in back.iter().zip(l.iter()) {
            assert_eq!(a.name(), b.name());
            assert_eq!(a.value(), b.value());
        }
    }
}
