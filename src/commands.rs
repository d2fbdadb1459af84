//! Command line parsing and reply formatting.

use colored::Colorize;
use muxis_client::{ClientError, Command, PublishedMessage, ServerError, TxOutcome, Value};

/// How replies are printed.
#[derive(Debug, Clone, Copy, Default)]
pub struct Output {
    pub json: bool,
}

impl Output {
    /// Formats a single reply.
    pub fn reply(&self, reply: &Result<Value, ServerError>) -> String {
        match (reply, self.json) {
            (Ok(value), true) => format_json(value),
            (Err(err), true) => serde_json::json!({ "error": err.message }).to_string(),
            (Ok(value), false) => format_value(value, 0),
            (Err(err), false) => format_error(err),
        }
    }

    /// Formats the outcome of a client call, folding command errors into the reply.
    pub fn result(&self, result: Result<Value, ClientError>) -> Result<String, ClientError> {
        match result {
            Ok(value) => Ok(self.reply(&Ok(value))),
            Err(ClientError::Command(err)) => Ok(self.reply(&Err(err))),
            Err(e) => Err(e),
        }
    }

    /// Formats the replies of a pipeline, one per line.
    pub fn replies(&self, replies: &[Result<Value, ServerError>]) -> String {
        if self.json {
            let items: Vec<serde_json::Value> = replies
                .iter()
                .map(|r| match r {
                    Ok(v) => serde_json::to_value(v).unwrap_or(serde_json::Value::Null),
                    Err(e) => serde_json::json!({ "error": e.message }),
                })
                .collect();
            return serde_json::Value::Array(items).to_string();
        }

        replies
            .iter()
            .map(|r| self.reply(r))
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Formats an EXEC outcome.
    pub fn transaction(&self, outcome: &TxOutcome) -> String {
        match outcome {
            TxOutcome::Committed(results) => {
                if self.json {
                    return self.replies(results);
                }
                if results.is_empty() {
                    return "(empty array)".to_string();
                }
                let width = results.len().to_string().len();
                results
                    .iter()
                    .enumerate()
                    .map(|(i, r)| {
                        let body = match r {
                            Ok(v) => format_value(v, width + 2),
                            Err(e) => format_error(e),
                        };
                        format!("{:>width$}) {}", i + 1, body, width = width)
                    })
                    .collect::<Vec<_>>()
                    .join("\n")
            }
            TxOutcome::Aborted if self.json => "null".to_string(),
            TxOutcome::Aborted => "(nil)".yellow().to_string(),
        }
    }

    /// Formats a message received on a subscription.
    pub fn message(&self, message: &PublishedMessage) -> String {
        let payload = String::from_utf8_lossy(&message.payload);
        if self.json {
            return serde_json::json!({
                "channel": message.channel,
                "pattern": message.pattern,
                "payload": payload,
            })
            .to_string();
        }
        match &message.pattern {
            Some(pattern) => format!(
                "{} {} {}",
                format!("[{}]", pattern).dimmed(),
                message.channel.cyan(),
                quote(payload.as_bytes())
            ),
            None => format!("{} {}", message.channel.cyan(), quote(payload.as_bytes())),
        }
    }
}

/// Splits a command line into words. Double quotes support `\n`, `\t`,
/// `\"`, `\\` and `\xHH` escapes; single quotes are literal.
pub fn split_line(line: &str) -> Result<Vec<String>, String> {
    let mut words = Vec::new();
    let mut chars = line.chars().peekable();

    loop {
        while chars.peek().is_some_and(|c| c.is_whitespace()) {
            chars.next();
        }
        let Some(&first) = chars.peek() else {
            break;
        };

        let mut word = String::new();
        match first {
            '"' => {
                chars.next();
                let mut closed = false;
                while let Some(c) = chars.next() {
                    match c {
                        '"' => {
                            closed = true;
                            break;
                        }
                        '\\' => match chars.next() {
                            Some('n') => word.push('\n'),
                            Some('r') => word.push('\r'),
                            Some('t') => word.push('\t'),
                            Some('x') => {
                                let hex: String = chars.by_ref().take(2).collect();
                                let byte = u8::from_str_radix(&hex, 16)
                                    .map_err(|_| format!("invalid escape \\x{}", hex))?;
                                word.push(byte as char);
                            }
                            Some(other) => word.push(other),
                            None => return Err("unterminated escape".to_string()),
                        },
                        _ => word.push(c),
                    }
                }
                if !closed {
                    return Err("unbalanced quotes".to_string());
                }
            }
            '\'' => {
                chars.next();
                let mut closed = false;
                for c in chars.by_ref() {
                    if c == '\'' {
                        closed = true;
                        break;
                    }
                    word.push(c);
                }
                if !closed {
                    return Err("unbalanced quotes".to_string());
                }
            }
            _ => {
                while let Some(&c) = chars.peek() {
                    if c.is_whitespace() {
                        break;
                    }
                    word.push(c);
                    chars.next();
                }
            }
        }

        if chars.peek().is_some_and(|c| !c.is_whitespace()) {
            return Err("closing quote must be followed by a space".to_string());
        }
        words.push(word);
    }

    Ok(words)
}

/// Builds a command from its words. Returns `None` for an empty line.
pub fn to_command(words: &[String]) -> Option<Command> {
    let (name, args) = words.split_first()?;
    Some(Command::new(name.as_str()).args(args.iter()))
}

/// Formats a value the way `redis-cli` prints replies.
pub fn format_value(value: &Value, indent: usize) -> String {
    match value {
        Value::Nil => "(nil)".yellow().to_string(),
        Value::Int(i) => format!("(integer) {}", i),
        Value::Double(d) => format!("(double) {}", d),
        Value::Status(s) => s.green().to_string(),
        Value::Bulk(b) => quote(b),
        Value::Array(items) if items.is_empty() => "(empty array)".to_string(),
        Value::Array(items) => {
            let width = items.len().to_string().len();
            let pad = " ".repeat(indent);
            items
                .iter()
                .enumerate()
                .map(|(i, item)| {
                    let prefix = if i == 0 { String::new() } else { pad.clone() };
                    format!(
                        "{}{:>width$}) {}",
                        prefix,
                        i + 1,
                        format_value(item, indent + width + 2),
                        width = width
                    )
                })
                .collect::<Vec<_>>()
                .join("\n")
        }
        Value::Map(map) if map.is_empty() => "(empty hash)".to_string(),
        Value::Map(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            let width = entries.len().to_string().len();
            let pad = " ".repeat(indent);
            entries
                .iter()
                .enumerate()
                .map(|(i, (key, item))| {
                    let prefix = if i == 0 { String::new() } else { pad.clone() };
                    format!(
                        "{}{:>width$}# {} => {}",
                        prefix,
                        i + 1,
                        quote(key.as_bytes()),
                        format_value(item, indent + width + 2),
                        width = width
                    )
                })
                .collect::<Vec<_>>()
                .join("\n")
        }
    }
}

fn format_error(err: &ServerError) -> String {
    format!("(error) {}", err.message).red().to_string()
}

/// Formats a value as JSON.
pub fn format_json(value: &Value) -> String {
    serde_json::to_string(value).unwrap_or_else(|e| format!("<unserializable: {}>", e))
}

/// Quotes a bulk string, escaping non-printable bytes.
fn quote(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() + 2);
    out.push('"');
    for &b in bytes {
        match b {
            b'"' => out.push_str("\\\""),
            b'\\' => out.push_str("\\\\"),
            b'\n' => out.push_str("\\n"),
            b'\r' => out.push_str("\\r"),
            b'\t' => out.push_str("\\t"),
            0x20..=0x7e => out.push(b as char),
            _ => out.push_str(&format!("\\x{:02x}", b)),
        }
    }
    out.push('"');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bulk(s: &str) -> Value {
        Value::from(s)
    }

    fn plain() {
        colored::control::set_override(false);
    }

    #[test]
    fn test_split_plain_words() {
        assert_eq!(
            split_line("  SET  key   value ").unwrap(),
            vec!["SET", "key", "value"]
        );
        assert!(split_line("   ").unwrap().is_empty());
    }

    #[test]
    fn test_split_quoted_words() {
        assert_eq!(
            split_line(r#"SET "my key" 'it''s'"#).unwrap_err(),
            "closing quote must be followed by a space"
        );
        assert_eq!(
            split_line(r#"SET "my key" 'raw \n'"#).unwrap(),
            vec!["SET", "my key", "raw \\n"]
        );
        assert_eq!(
            split_line(r#"ECHO "line\nbreak \x41""#).unwrap(),
            vec!["ECHO", "line\nbreak A"]
        );
        assert_eq!(split_line(r#"ECHO """#).unwrap(), vec!["ECHO", ""]);
    }

    #[test]
    fn test_split_unbalanced() {
        assert!(split_line(r#"ECHO "oops"#).is_err());
        assert!(split_line("ECHO 'oops").is_err());
    }

    #[test]
    fn test_to_command() {
        let words = split_line("set counter 10").unwrap();
        let cmd = to_command(&words).unwrap();
        assert!(cmd.is("SET"));
        assert_eq!(cmd.arguments().len(), 2);
        assert!(to_command(&[]).is_none());
    }

    #[test]
    fn test_format_scalars() {
        plain();
        assert_eq!(format_value(&Value::Nil, 0), "(nil)");
        assert_eq!(format_value(&Value::Int(7), 0), "(integer) 7");
        assert_eq!(format_value(&Value::Status("OK".into()), 0), "OK");
        assert_eq!(format_value(&bulk("say \"hi\""), 0), r#""say \"hi\"""#);
        assert_eq!(
            format_value(&Value::Bulk(vec![0u8, b'a'].into()), 0),
            r#""\x00a""#
        );
    }

    #[test]
    fn test_format_nested_array() {
        plain();
        let value = Value::Array(vec![
            bulk("a"),
            Value::Array(vec![Value::Int(1), Value::Int(2)]),
            Value::Array(vec![]),
        ]);
        assert_eq!(
            format_value(&value, 0),
            "1) \"a\"\n2) 1) (integer) 1\n   2) (integer) 2\n3) (empty array)"
        );
    }

    #[test]
    fn test_output_folds_command_errors() {
        plain();
        let output = Output::default();
        let err = ServerError::parse("ERR unknown command 'FOO'");
        let text = output.result(Err(ClientError::Command(err))).unwrap();
        assert_eq!(text, "(error) ERR unknown command 'FOO'");
        assert!(output.result(Err(ClientError::Timeout)).is_err());
    }

    #[test]
    fn test_json_output() {
        let output = Output { json: true };
        assert_eq!(output.reply(&Ok(Value::Int(3))), "3");
        let replies = vec![Ok(bulk("x")), Err(ServerError::parse("ERR boom"))];
        assert_eq!(output.replies(&replies), r#"["x",{"error":"ERR boom"}]"#);
        assert_eq!(output.transaction(&TxOutcome::Aborted), "null");
    }

    #[test]
    fn test_transaction_output() {
        plain();
        let output = Output::default();
        let outcome = TxOutcome::Committed(vec![
            Ok(Value::Status("OK".into())),
            Err(ServerError::parse("WRONGTYPE nope")),
        ]);
        assert_eq!(
            output.transaction(&outcome),
            "1) OK\n2) (error) WRONGTYPE nope"
        );
        assert_eq!(output.transaction(&TxOutcome::Aborted), "(nil)");
    }
}
