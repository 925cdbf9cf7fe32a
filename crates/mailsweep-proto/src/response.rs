//! Response-side wire decoding: the IMAP4rev1 quoted/parenthesised
//! grammar used by SEARCH, LIST, FETCH, STORE and CAPABILITY responses,
//! plus the frame reassembler needed for multi-literal FETCH batches.

use std::collections::{BTreeMap, VecDeque};

#[derive(Debug, thiserror::Error, PartialEq, Eq, Clone)]
pub enum ParseError {
    #[error("unexpected quote inside an unquoted atom")]
    UnexpectedQuote,
    #[error("unexpected '(' inside an unquoted atom")]
    UnexpectedParen,
    #[error("unexpected '{{' inside an unquoted atom")]
    UnexpectedCurly,
    #[error("unfinished escape sequence at end of input")]
    UnfinishedEscape,
    #[error("missing closing '}}' for literal length marker")]
    MissingBrace,
    #[error("literal length marker is not a valid number")]
    InvalidLiteralLength,
    #[error("not enough literals were supplied for this response")]
    MissingLiteral,
    #[error("unfinished quoted string or parenthesised group")]
    Unfinished,
    #[error("expected a space or ')' after a nested group or literal")]
    ExpectedSpaceOrParen,
    #[error("trailing bytes after the top-level response")]
    TrailingBytes(Vec<u8>),
    #[error("attribute list has an odd number of elements")]
    OddAttributeLength,
    #[error("expected an atom, found a parenthesised group")]
    ExpectedAtom,
}

/// A parsed node: either a bare/quoted atom or a parenthesised sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Atom(Vec<u8>),
    List(Vec<Node>),
}

impl Node {
    pub fn as_atom(&self) -> Option<&[u8]> {
        match self {
            Node::Atom(bytes) => Some(bytes),
            Node::List(_) => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Node]> {
        match self {
            Node::List(nodes) => Some(nodes),
            Node::Atom(_) => None,
        }
    }
}

/// Parses one complete top-level IMAP response line into a sequence of
/// nodes. `literals` supplies, in encounter order, the octet-counted
/// blobs that back each `{N}` marker in `line`.
pub fn parse(line: &[u8], literals: &[Vec<u8>]) -> Result<Vec<Node>, ParseError> {
    let mut parser = Parser {
        data: line,
        pos: 0,
        literals: literals.iter().cloned().collect(),
    };
    let nodes = parser.parse_sequence(true)?;
    if parser.pos != parser.data.len() {
        return Err(ParseError::TrailingBytes(parser.data[parser.pos..].to_vec()));
    }
    Ok(nodes)
}

struct Parser<'a> {
    data: &'a [u8],
    pos: usize,
    literals: VecDeque<Vec<u8>>,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<u8> {
        self.data.get(self.pos).copied()
    }

    /// Parses a sequence of space-separated atoms/groups. When `top_level`
    /// is false this is the body of a `(...)` group and reaching the end
    /// of input without a closing `)` is an error; when true, reaching
    /// the end of input ends the sequence successfully (an unterminated
    /// quote is still an error either way).
    fn parse_sequence(&mut self, top_level: bool) -> Result<Vec<Node>, ParseError> {
        let mut acc: Vec<Node> = Vec::new();
        let mut res: Vec<u8> = Vec::new();
        let mut quoted = false;

        while let Some(c) = self.peek() {
            if !quoted {
                match c {
                    b'"' => {
                        if !res.is_empty() {
                            return Err(ParseError::UnexpectedQuote);
                        }
                        quoted = true;
                        self.pos += 1;
                    }
                    b' ' => {
                        acc.push(Node::Atom(std::mem::take(&mut res)));
                        self.pos += 1;
                    }
                    b'(' => {
                        if !res.is_empty() {
                            return Err(ParseError::UnexpectedParen);
                        }
                        self.pos += 1;
                        let sub = self.parse_sequence(false)?;
                        acc.push(Node::List(sub));
                        self.expect_delimiter_or_end()?;
                    }
                    b')' => {
                        acc.push(Node::Atom(std::mem::take(&mut res)));
                        self.pos += 1;
                        return Ok(acc);
                    }
                    b'{' => {
                        if !res.is_empty() {
                            return Err(ParseError::UnexpectedCurly);
                        }
                        self.pos += 1;
                        let start = self.pos;
                        let end = self.data[start..]
                            .iter()
                            .position(|&b| b == b'}')
                            .ok_or(ParseError::MissingBrace)?
                            + start;
                        let len_str = std::str::from_utf8(&self.data[start..end])
                            .map_err(|_| ParseError::InvalidLiteralLength)?;
                        let trimmed = len_str.trim_end_matches('+');
                        let _n: usize =
                            trimmed.parse().map_err(|_| ParseError::InvalidLiteralLength)?;
                        let literal =
                            self.literals.pop_front().ok_or(ParseError::MissingLiteral)?;
                        acc.push(Node::Atom(literal));
                        self.pos = end + 1;
                        self.expect_delimiter_or_end()?;
                    }
                    _ => {
                        res.push(c);
                        self.pos += 1;
                    }
                }
            } else {
                match c {
                    b'"' => {
                        quoted = false;
                        self.pos += 1;
                    }
                    b'\\' => {
                        self.pos += 1;
                        let next = self.peek().ok_or(ParseError::UnfinishedEscape)?;
                        res.push(next);
                        self.pos += 1;
                    }
                    _ => {
                        res.push(c);
                        self.pos += 1;
                    }
                }
            }
        }

        if !top_level {
            return Err(ParseError::Unfinished);
        }
        if quoted {
            return Err(ParseError::Unfinished);
        }
        if !res.is_empty() {
            acc.push(Node::Atom(res));
        }
        Ok(acc)
    }

    fn expect_delimiter_or_end(&self) -> Result<(), ParseError> {
        match self.peek() {
            None => Ok(()),
            Some(b' ') | Some(b')') => Ok(()),
            Some(_) => Err(ParseError::ExpectedSpaceOrParen),
        }
    }
}

/// Derives a name -> value mapping from a flat, even-length FETCH
/// attribute sequence. Names are upper-cased (the IMAP grammar is
/// case-insensitive for attribute names; values are left untouched).
pub fn parse_attrs(nodes: Vec<Node>) -> Result<BTreeMap<Vec<u8>, Node>, ParseError> {
    if nodes.len() % 2 != 0 {
        return Err(ParseError::OddAttributeLength);
    }

    let mut map = BTreeMap::new();
    let mut iter = nodes.into_iter();
    while let (Some(name), Some(value)) = (iter.next(), iter.next()) {
        let key = match name {
            Node::Atom(bytes) => bytes.to_ascii_uppercase(),
            Node::List(_) => return Err(ParseError::ExpectedAtom),
        };
        map.insert(key, value);
    }
    Ok(map)
}

/// One piece of a raw response stream as read off the wire: a text chunk
/// (one CRLF-terminated line, CRLF already stripped) or an octet-counted
/// literal blob that followed a `{N}` marker.
#[derive(Debug, Clone)]
pub enum Chunk {
    Text(Vec<u8>),
    Literal(Vec<u8>),
}

/// Reassembles an interleaved sequence of text/literal chunks into
/// logical response lines. A logical line is complete once the
/// concatenation of its text chunks ends with `)`; every literal seen
/// since the previous completed line is attached to it, in order, so
/// that `parse(line, &literals)` reproduces exactly what parsing the
/// fully concatenated form would have produced.
pub fn reassemble(chunks: impl IntoIterator<Item = Chunk>) -> Vec<(Vec<u8>, Vec<Vec<u8>>)> {
    let mut lines = Vec::new();
    let mut current = Vec::new();
    let mut literals = Vec::new();

    for chunk in chunks {
        match chunk {
            Chunk::Text(bytes) => current.extend_from_slice(&bytes),
            Chunk::Literal(bytes) => literals.push(bytes),
        }
        if current.ends_with(b")") {
            lines.push((std::mem::take(&mut current), std::mem::take(&mut literals)));
        }
    }

    if !current.is_empty() || !literals.is_empty() {
        lines.push((current, literals));
    }

    lines
}

#[cfg(test)]
mod tests {
    use super::*;

    fn atom(s: &str) -> Node {
        Node::Atom(s.as_bytes().to_vec())
    }

    fn list(nodes: Vec<Node>) -> Node {
        Node::List(nodes)
    }

    #[test]
    fn parses_nested_parens() {
        assert_eq!(parse(b"(1 2 3)", &[]).unwrap(), vec![list(vec![atom("1"), atom("2"), atom("3")])]);
        assert_eq!(
            parse(b"(0 1) (1 2 3)", &[]).unwrap(),
            vec![list(vec![atom("0"), atom("1")]), list(vec![atom("1"), atom("2"), atom("3")])]
        );
        assert_eq!(
            parse(b"(0 1) ((1 2 3))", &[]).unwrap(),
            vec![list(vec![atom("0"), atom("1")]), list(vec![list(vec![atom("1"), atom("2"), atom("3")])])]
        );
    }

    #[test]
    fn parses_quoted_strings_with_escapes() {
        assert_eq!(
            parse(b"(\\Trash \\Nya) \".\" \"All Mail\"", &[]).unwrap(),
            vec![list(vec![atom("\\Trash"), atom("\\Nya")]), atom("."), atom("All Mail")]
        );
        assert_eq!(
            parse(b"(\\Trash \\Nya) \".\" \"All\\\"Mail\"", &[]).unwrap(),
            vec![list(vec![atom("\\Trash"), atom("\\Nya")]), atom("."), atom("All\"Mail")]
        );
        assert_eq!(
            parse(b"1 2 3 4 \"\\\\Nya\" 5 6 7", &[]).unwrap(),
            vec![atom("1"), atom("2"), atom("3"), atom("4"), atom("\\Nya"), atom("5"), atom("6"), atom("7")]
        );
    }

    #[test]
    fn parses_literal_markers() {
        let val = parse(b"UID 123 BODY[HEADER] {128}", &[b"128bytesofdata".to_vec()]).unwrap();
        assert_eq!(val, vec![atom("UID"), atom("123"), atom("BODY[HEADER]"), atom("128bytesofdata")]);

        let outer =
            parse(b"1 (UID 123 BODY[HEADER] {128})", &[b"128bytesofdata".to_vec()]).unwrap();
        assert_eq!(outer, vec![atom("1"), list(val)]);
    }

    #[test]
    fn attrs_upper_cases_names_and_rejects_odd_length() {
        let nodes = parse(b"UID 123 RFC822.SIZE 128", &[]).unwrap();
        let attrs = parse_attrs(nodes).unwrap();
        assert_eq!(attrs.get(b"UID".as_slice()).and_then(Node::as_atom), Some(b"123".as_slice()));
        assert_eq!(
            attrs.get(b"RFC822.SIZE".as_slice()).and_then(Node::as_atom),
            Some(b"128".as_slice())
        );

        let odd = vec![atom("UID")];
        assert_eq!(parse_attrs(odd), Err(ParseError::OddAttributeLength));
    }

    #[test]
    fn rejects_structural_violations() {
        assert_eq!(parse(b"(1 2", &[]), Err(ParseError::Unfinished));
        assert_eq!(parse(b"\"unterminated", &[]), Err(ParseError::Unfinished));
        assert_eq!(parse(b"{5", &[b"abcde".to_vec()]), Err(ParseError::MissingBrace));
        assert_eq!(parse(b"{5}abcde", &[b"abcde".to_vec()]), Err(ParseError::ExpectedSpaceOrParen));
        assert_eq!(parse(b"1) 2", &[]), Err(ParseError::TrailingBytes(b" 2".to_vec())));
    }

    #[test]
    fn quote_then_parse_round_trips() {
        for raw in ["plain", "has space", "back\\slash", "quo\"te", "mix\\\"ed"] {
            let quoted = crate::command::quote(raw);
            let parsed = parse(quoted.as_bytes(), &[]).unwrap();
            assert_eq!(parsed, vec![atom(raw)]);
        }
    }

    #[test]
    fn frame_reassembly_matches_parsing_concatenated_form() {
        let chunks = vec![
            Chunk::Text(b"1 (UID 1 BODY[HEADER] {5}".to_vec()),
            Chunk::Literal(b"abcde".to_vec()),
            Chunk::Text(b" BODY[TEXT] {3}".to_vec()),
            Chunk::Literal(b"xyz".to_vec()),
            Chunk::Text(b")".to_vec()),
        ];
        let lines = reassemble(chunks);
        assert_eq!(lines.len(), 1);
        let (line, literals) = &lines[0];
        assert_eq!(line, b"1 (UID 1 BODY[HEADER] {5} BODY[TEXT] {3})");

        let concatenated = parse(line, literals).unwrap();

        let whole = b"1 (UID 1 BODY[HEADER] {5} BODY[TEXT] {3})";
        let direct = parse(whole, &[b"abcde".to_vec(), b"xyz".to_vec()]).unwrap();
        assert_eq!(concatenated, direct);
    }

    #[test]
    fn frame_reassembly_splits_multiple_logical_lines() {
        let chunks = vec![
            Chunk::Text(b"1 (UID 1 RFC822.SIZE 10)".to_vec()),
            Chunk::Text(b"2 (UID 2 RFC822.SIZE 20)".to_vec()),
        ];
        let lines = reassemble(chunks);
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].0, b"1 (UID 1 RFC822.SIZE 10)");
        assert_eq!(lines[1].0, b"2 (UID 2 RFC822.SIZE 20)");
    }
}
