//! Trace-output pattern matching.
//!
//! A readiness trace pattern is a plain marker string, optionally embedding
//! `${address}` and `${port}` placeholders:
//!
//! ```text
//! Debug server listening at: ${address}:${port}
//! ```
//!
//! matched against `Debug server listening at: 127.0.0.1:61537` yields
//! address `127.0.0.1` and port `61537`. A pattern without placeholders
//! matches any output chunk that starts with it.

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Static(String),
    Address,
    Port,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TraceMatch {
    pub address: Option<String>,
    pub port: Option<u16>,
}

#[derive(Debug, Clone)]
pub struct TracePattern {
    segments: Vec<Segment>,
}

impl TracePattern {
    pub fn new(pattern: &str) -> Self {
        let mut segments = Vec::new();
        let mut rest = pattern;

        while let Some(start) = rest.find("${") {
            let after = &rest[start + 2..];
            let Some(end) = after.find('}') else {
                break;
            };
            let placeholder = match &after[..end] {
                "address" => Some(Segment::Address),
                "port" => Some(Segment::Port),
                _ => None,
            };
            match placeholder {
                Some(segment) => {
                    if start > 0 {
                        segments.push(Segment::Static(rest[..start].to_string()));
                    }
                    segments.push(segment);
                    rest = &after[end + 1..];
                }
                None => {
                    // Not a recognized placeholder; keep it as literal text.
                    let literal_end = start + 2 + end + 1;
                    segments.push(Segment::Static(rest[..literal_end].to_string()));
                    rest = &rest[literal_end..];
                }
            }
        }
        if !rest.is_empty() {
            segments.push(Segment::Static(rest.to_string()));
        }

        Self { segments }
    }

    /// Match one output chunk against the pattern, anchored at the start of
    /// the chunk. Returns `None` when the chunk does not match.
    pub fn matches(&self, input: &str) -> Option<TraceMatch> {
        let mut rest = input;
        let mut result = TraceMatch::default();

        for (index, segment) in self.segments.iter().enumerate() {
            match segment {
                Segment::Static(text) => {
                    rest = rest.strip_prefix(text.as_str())?;
                }
                Segment::Address | Segment::Port => {
                    // A dynamic segment consumes up to the next static
                    // segment, or a maximal run of value characters at the
                    // end of the pattern.
                    let value = match self.segments.get(index + 1) {
                        Some(Segment::Static(next)) => {
                            let end = rest.find(next.as_str())?;
                            let (value, remaining) = rest.split_at(end);
                            rest = remaining;
                            value
                        }
                        _ => {
                            let end = rest
                                .find(|c: char| c.is_whitespace())
                                .unwrap_or(rest.len());
                            let (value, remaining) = rest.split_at(end);
                            rest = remaining;
                            value
                        }
                    };
                    if value.is_empty() {
                        return None;
                    }
                    match segment {
                        Segment::Address => result.address = Some(value.to_string()),
                        Segment::Port => result.port = Some(value.parse().ok()?),
                        Segment::Static(_) => unreachable!(),
                    }
                }
            }
        }

        Some(result)
    }
}
