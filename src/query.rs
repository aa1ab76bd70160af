//! Textual query language used by the shell and the `/query` endpoint.
//!
//! ```text
//! SET <key> <value>
//! GET <key>
//! DELETE <key>
//! INFO
//! ```
//!
//! Keywords are case-insensitive and tokens are separated by runs of whitespace. There is no
//! quoting, so a value containing whitespace cannot be expressed.

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Query {
    Set { key: String, value: String },
    Get { key: String },
    Delete { key: String },
    Info,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError {
    reason: String,
}

impl ParseError {
    fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.reason)
    }
}

impl std::error::Error for ParseError {}

pub fn parse(line: &str) -> Result<Query, ParseError> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    let Some(keyword) = tokens.first() else {
        return Err(ParseError::new("empty query"));
    };

    match keyword.to_ascii_uppercase().as_str() {
        "SET" => match tokens[..] {
            [_, key, value] => Ok(Query::Set {
                key: key.to_string(),
                value: value.to_string(),
            }),
            _ => Err(ParseError::new("SET requires key and value")),
        },
        "GET" => match tokens[..] {
            [_, key] => Ok(Query::Get {
                key: key.to_string(),
            }),
            _ => Err(ParseError::new(format!("{keyword} requires a key"))),
        },
        "DELETE" => match tokens[..] {
            [_, key] => Ok(Query::Delete {
                key: key.to_string(),
            }),
            _ => Err(ParseError::new(format!("{keyword} requires a key"))),
        },
        "INFO" => match tokens[..] {
            [_] => Ok(Query::Info),
            _ => Err(ParseError::new("INFO takes no arguments")),
        },
        _ => Err(ParseError::new(format!("unknown operation: {keyword}"))),
    }
}
