use std::fmt::{self, Write};

use crate::{error::WireError, time::Timestamp, value::RcType};

/// Longest line accepted from a peer
pub const MAX_LINE_LENGTH: usize = 64 * 1024;

/// Introspection query served by the remote host
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InfoQuery {
    Resource { verbosity: u8, lid: String },
    Subscribers { verbosity: u8 },
}

/// One line of the host-to-host protocol.
///
/// Fields are separated by single spaces. Identifiers (host ids, LIDs,
/// subscriber and request ids) never contain whitespace; the trailing
/// free-text field of `request`, `value` and `info-line` is escaped.
/// Value fields carry the `ValueState` (or `Value`) encoding as text, since
/// decoding them needs the resource type known to the receiver.
///
/// Info answers repeat the query id of their request, so a late answer to
/// an abandoned query is never mistaken for the answer to a newer one.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WireMessage {
    Hello {
        host: String,
    },
    ListRequest,
    ResourceInfo {
        lid: String,
        rc_type: RcType,
    },
    ListEnd,
    Subscribe {
        subscriber: String,
        lid: String,
    },
    Unsubscribe {
        subscriber: String,
        lid: String,
    },
    SetRequest {
        lid: String,
        id: String,
        priority: u8,
        t1: Option<Timestamp>,
        value: String,
    },
    DelRequest {
        lid: String,
        id: String,
        t1: Option<Timestamp>,
    },
    Event {
        subscriber: String,
        lid: String,
        value: String,
    },
    Alive,
    InfoRequest {
        query_id: u64,
        query: InfoQuery,
    },
    InfoLine {
        query_id: u64,
        text: String,
    },
    InfoEnd {
        query_id: u64,
        ok: bool,
    },
}

impl WireMessage {
    /// The line including its terminator
    pub fn encode(&self) -> String {
        let mut line = String::new();
        self.write_to(&mut line);
        line
    }

    /// Appends the line including its terminator
    pub fn write_to(&self, out: &mut String) {
        // Writing into a String cannot fail
        let _ = writeln!(out, "{}", self);
    }

    /// Decodes one line, with or without terminator.
    pub fn decode(line: &str) -> Result<Self, WireError> {
        let line = line.strip_suffix('\n').unwrap_or(line);
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.is_empty() {
            return Err(WireError::Empty);
        }
        let (command, rest) = match line.split_once(' ') {
            Some((command, rest)) => (command, Some(rest)),
            None => (line, None),
        };

        match command {
            "hello" => {
                let mut f = Fields::new("hello", rest);
                let host = f.word("host")?.to_string();
                f.finish()?;
                Ok(WireMessage::Hello { host })
            }
            "list" => {
                Fields::new("list", rest).finish()?;
                Ok(WireMessage::ListRequest)
            }
            "resource" => {
                let mut f = Fields::new("resource", rest);
                let lid = f.word("lid")?.to_string();
                let rc_type = f.word("type")?.parse()?;
                f.finish()?;
                Ok(WireMessage::ResourceInfo { lid, rc_type })
            }
            "list-end" => {
                Fields::new("list-end", rest).finish()?;
                Ok(WireMessage::ListEnd)
            }
            "subscribe" | "unsubscribe" => {
                let name = if command == "subscribe" {
                    "subscribe"
                } else {
                    "unsubscribe"
                };
                let mut f = Fields::new(name, rest);
                let subscriber = f.word("subscriber")?.to_string();
                let lid = f.word("lid")?.to_string();
                f.finish()?;
                if name == "subscribe" {
                    Ok(WireMessage::Subscribe { subscriber, lid })
                } else {
                    Ok(WireMessage::Unsubscribe { subscriber, lid })
                }
            }
            "request" => {
                let mut f = Fields::new("request", rest);
                let lid = f.word("lid")?.to_string();
                let id = f.word("id")?.to_string();
                let priority = f.parsed("priority")?;
                let t1 = f.expiry()?;
                let value = f.text("value")?;
                Ok(WireMessage::SetRequest {
                    lid,
                    id,
                    priority,
                    t1,
                    value,
                })
            }
            "delrequest" => {
                let mut f = Fields::new("delrequest", rest);
                let lid = f.word("lid")?.to_string();
                let id = f.word("id")?.to_string();
                let t1 = f.expiry()?;
                f.finish()?;
                Ok(WireMessage::DelRequest { lid, id, t1 })
            }
            "value" => {
                let mut f = Fields::new("value", rest);
                let subscriber = f.word("subscriber")?.to_string();
                let lid = f.word("lid")?.to_string();
                let value = f.text("value")?;
                Ok(WireMessage::Event {
                    subscriber,
                    lid,
                    value,
                })
            }
            "alive" => {
                Fields::new("alive", rest).finish()?;
                Ok(WireMessage::Alive)
            }
            "info" => {
                let mut f = Fields::new("info", rest);
                let query_id = f.parsed("query-id")?;
                let query = match f.word("query")? {
                    "resource" => {
                        let verbosity = f.parsed("verbosity")?;
                        let lid = f.word("lid")?.to_string();
                        InfoQuery::Resource { verbosity, lid }
                    }
                    "subscribers" => InfoQuery::Subscribers {
                        verbosity: f.parsed("verbosity")?,
                    },
                    other => {
                        return Err(WireError::InvalidField {
                            command: "info",
                            field: "query",
                            text: other.to_string(),
                        })
                    }
                };
                f.finish()?;
                Ok(WireMessage::InfoRequest { query_id, query })
            }
            "info-line" => {
                let mut f = Fields::new("info-line", rest);
                let query_id = f.parsed("query-id")?;
                // The text may be empty
                let text = f.rest.take().map(unescape).unwrap_or_default();
                Ok(WireMessage::InfoLine { query_id, text })
            }
            "info-end" => {
                let mut f = Fields::new("info-end", rest);
                let query_id = f.parsed("query-id")?;
                let ok = match f.word("result")? {
                    "ok" => true,
                    "fail" => false,
                    other => {
                        return Err(WireError::InvalidField {
                            command: "info-end",
                            field: "result",
                            text: other.to_string(),
                        })
                    }
                };
                f.finish()?;
                Ok(WireMessage::InfoEnd { query_id, ok })
            }
            _ => Err(WireError::UnknownCommand {
                command: command.to_string(),
            }),
        }
    }
}

impl fmt::Display for WireMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WireMessage::Hello { host } => write!(f, "hello {}", host),
            WireMessage::ListRequest => f.write_str("list"),
            WireMessage::ResourceInfo { lid, rc_type } => write!(f, "resource {} {}", lid, rc_type),
            WireMessage::ListEnd => f.write_str("list-end"),
            WireMessage::Subscribe { subscriber, lid } => {
                write!(f, "subscribe {} {}", subscriber, lid)
            }
            WireMessage::Unsubscribe { subscriber, lid } => {
                write!(f, "unsubscribe {} {}", subscriber, lid)
            }
            WireMessage::SetRequest {
                lid,
                id,
                priority,
                t1,
                value,
            } => write!(
                f,
                "request {} {} {} {} {}",
                lid,
                id,
                priority,
                Expiry(t1),
                escape(value)
            ),
            WireMessage::DelRequest { lid, id, t1 } => {
                write!(f, "delrequest {} {} {}", lid, id, Expiry(t1))
            }
            WireMessage::Event {
                subscriber,
                lid,
                value,
            } => write!(f, "value {} {} {}", subscriber, lid, escape(value)),
            WireMessage::Alive => f.write_str("alive"),
            WireMessage::InfoRequest { query_id, query } => match query {
                InfoQuery::Resource { verbosity, lid } => {
                    write!(f, "info {} resource {} {}", query_id, verbosity, lid)
                }
                InfoQuery::Subscribers { verbosity } => {
                    write!(f, "info {} subscribers {}", query_id, verbosity)
                }
            },
            WireMessage::InfoLine { query_id, text } => {
                write!(f, "info-line {} {}", query_id, escape(text))
            }
            WireMessage::InfoEnd { query_id, ok } => {
                write!(f, "info-end {} {}", query_id, if *ok { "ok" } else { "fail" })
            }
        }
    }
}

struct Expiry<'a>(&'a Option<Timestamp>);

impl fmt::Display for Expiry<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(t1) => write!(f, "{}", t1),
            None => f.write_str("-"),
        }
    }
}

struct Fields<'a> {
    command: &'static str,
    rest: Option<&'a str>,
}

impl<'a> Fields<'a> {
    fn new(command: &'static str, rest: Option<&'a str>) -> Self {
        Self { command, rest }
    }

    fn word(&mut self, field: &'static str) -> Result<&'a str, WireError> {
        let missing = WireError::MissingField {
            command: self.command,
            field,
        };
        let rest = self.rest.take().ok_or(missing.clone())?;
        let (word, rest) = match rest.split_once(' ') {
            Some((word, rest)) => (word, Some(rest)),
            None => (rest, None),
        };
        if word.is_empty() {
            return Err(missing);
        }
        self.rest = rest;
        Ok(word)
    }

    fn parsed<T: std::str::FromStr>(&mut self, field: &'static str) -> Result<T, WireError> {
        let word = self.word(field)?;
        word.parse().map_err(|_| WireError::InvalidField {
            command: self.command,
            field,
            text: word.to_string(),
        })
    }

    fn expiry(&mut self) -> Result<Option<Timestamp>, WireError> {
        if self.rest.is_some_and(|rest| rest == "-" || rest.starts_with("- ")) {
            self.word("t1")?;
            return Ok(None);
        }
        self.parsed("t1").map(Some)
    }

    /// Rest of the line, unescaped
    fn text(&mut self, field: &'static str) -> Result<String, WireError> {
        match self.rest.take() {
            Some(rest) if !rest.is_empty() => Ok(unescape(rest)),
            _ => Err(WireError::MissingField {
                command: self.command,
                field,
            }),
        }
    }

    fn finish(self) -> Result<(), WireError> {
        match self.rest {
            Some(text) if !text.is_empty() => Err(WireError::TrailingData {
                command: self.command,
                text: text.to_string(),
            }),
            _ => Ok(()),
        }
    }
}

fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            c => out.push(c),
        }
    }
    out
}

fn unescape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

/// Receive buffer that cuts a byte stream into lines.
///
/// Partial lines stay buffered until their terminator arrives.
#[derive(Default)]
pub struct LineBuffer {
    data: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Next complete line without its terminator
    pub fn next_line(&mut self) -> Option<Result<String, WireError>> {
        match self.data.iter().position(|b| *b == b'\n') {
            Some(pos) => {
                let mut line: Vec<u8> = self.data.drain(..=pos).collect();
                line.pop();
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                Some(String::from_utf8(line).map_err(|e| WireError::InvalidUtf8 {
                    length: e.as_bytes().len(),
                }))
            }
            None if self.data.len() > MAX_LINE_LENGTH => {
                self.data.clear();
                Some(Err(WireError::LineTooLong {
                    limit: MAX_LINE_LENGTH,
                }))
            }
            None => None,
        }
    }

    /// Decodes every complete line currently buffered.
    pub fn drain_messages(&mut self) -> Vec<Result<WireMessage, WireError>> {
        let mut messages = Vec::new();
        while let Some(line) = self.next_line() {
            messages.push(line.and_then(|line| WireMessage::decode(&line)));
        }
        messages
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }
}
