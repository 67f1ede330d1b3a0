//! Tokenizer for job files and interactive client input.
//!
//! One command per line. Keys and values are printable ASCII, at most
//! 40 bytes, and never contain `(` `)` `,` `[` `]` or a newline; the
//! tokenizer enforces this so nothing downstream has to.

use crate::protocol::MAX_STRING_LEN;
use crate::{KvsError, Result};

/// A command parsed from one line of a job file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `WRITE [(k1,v1)(k2,v2)...]` — insert or overwrite pairs.
    Write(Vec<(String, String)>),
    /// `READ [k1,k2,...]` — look keys up.
    Read(Vec<String>),
    /// `DELETE [k1,k2,...]` — remove keys.
    Delete(Vec<String>),
    /// `SHOW` — dump every entry.
    Show,
    /// `WAIT <delay_ms>` — pause the worker.
    Wait(u64),
    /// `BACKUP` — snapshot the store to disk.
    Backup,
    /// `HELP` — print the usage block.
    Help,
}

/// A command parsed from one line of interactive client input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientCommand {
    /// `SUBSCRIBE [k]` — ask for change notifications on a key.
    Subscribe(String),
    /// `UNSUBSCRIBE [k]` — stop notifications on a key.
    Unsubscribe(String),
    /// `DELAY <ms>` — pause before the next command.
    Delay(u64),
    /// `DISCONNECT` — end the session.
    Disconnect,
}

/// Parses one job-file line. Blank lines and `#` comments yield `None`.
pub fn parse_command(line: &str) -> Result<Option<Command>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }
    let (keyword, rest) = split_keyword(line);
    let command = match keyword {
        "WRITE" => Command::Write(parse_pair_list(rest)?),
        "READ" => Command::Read(parse_key_list(rest)?),
        "DELETE" => Command::Delete(parse_key_list(rest)?),
        "SHOW" => bare(rest, Command::Show)?,
        "BACKUP" => bare(rest, Command::Backup)?,
        "HELP" => bare(rest, Command::Help)?,
        "WAIT" => Command::Wait(parse_delay(rest)?),
        _ => return Err(KvsError::InvalidCommand(line.to_owned())),
    };
    Ok(Some(command))
}

/// Parses one client stdin line. Blank lines and `#` comments yield `None`.
pub fn parse_client_command(line: &str) -> Result<Option<ClientCommand>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }
    let (keyword, rest) = split_keyword(line);
    let command = match keyword {
        "SUBSCRIBE" => ClientCommand::Subscribe(parse_single_key(rest)?),
        "UNSUBSCRIBE" => ClientCommand::Unsubscribe(parse_single_key(rest)?),
        "DELAY" => ClientCommand::Delay(parse_delay(rest)?),
        "DISCONNECT" => bare(rest, ClientCommand::Disconnect)?,
        _ => return Err(KvsError::InvalidCommand(line.to_owned())),
    };
    Ok(Some(command))
}

fn split_keyword(line: &str) -> (&str, &str) {
    let boundary = line
        .find(|c: char| c.is_whitespace() || c == '[')
        .unwrap_or(line.len());
    (&line[..boundary], line[boundary..].trim_start())
}

fn bare<T>(rest: &str, command: T) -> Result<T> {
    if rest.is_empty() {
        Ok(command)
    } else {
        Err(KvsError::InvalidCommand(format!(
            "unexpected trailing input: {rest}"
        )))
    }
}

fn parse_delay(rest: &str) -> Result<u64> {
    rest.parse()
        .map_err(|_| KvsError::InvalidCommand(format!("bad delay: {rest}")))
}

/// Parses `[(k1,v1)(k2,v2)...]`; pairs may be separated by whitespace
/// or commas. At least one pair is required.
fn parse_pair_list(rest: &str) -> Result<Vec<(String, String)>> {
    let mut body = bracket_body(rest)?;
    let mut pairs = Vec::new();
    loop {
        body = body.trim_start_matches(|c: char| c.is_whitespace() || c == ',');
        if body.is_empty() {
            break;
        }
        let Some(after_open) = body.strip_prefix('(') else {
            return Err(KvsError::InvalidCommand(format!("expected '(' at: {body}")));
        };
        let comma = after_open
            .find(',')
            .ok_or_else(|| KvsError::InvalidCommand(format!("pair missing ',': {after_open}")))?;
        let close = after_open
            .find(')')
            .ok_or_else(|| KvsError::InvalidCommand(format!("pair missing ')': {after_open}")))?;
        if close < comma {
            return Err(KvsError::InvalidCommand(format!("malformed pair: {body}")));
        }
        let key = validate_token(&after_open[..comma])?;
        let value = validate_token(&after_open[comma + 1..close])?;
        pairs.push((key, value));
        body = &after_open[close + 1..];
    }
    if pairs.is_empty() {
        return Err(KvsError::InvalidCommand("empty pair list".to_owned()));
    }
    Ok(pairs)
}

/// Parses `[k1,k2,...]`. At least one key is required.
fn parse_key_list(rest: &str) -> Result<Vec<String>> {
    let body = bracket_body(rest)?;
    body.split(',').map(validate_token).collect()
}

fn parse_single_key(rest: &str) -> Result<String> {
    let mut keys = parse_key_list(rest)?;
    match keys.pop() {
        Some(key) if keys.is_empty() => Ok(key),
        _ => Err(KvsError::InvalidCommand(
            "expected exactly one key".to_owned(),
        )),
    }
}

fn bracket_body(rest: &str) -> Result<&str> {
    let body = rest
        .strip_prefix('[')
        .and_then(|r| r.strip_suffix(']'))
        .ok_or_else(|| KvsError::InvalidCommand(format!("expected bracketed list: {rest}")))?;
    Ok(body)
}

fn validate_token(token: &str) -> Result<String> {
    if token.is_empty() {
        return Err(KvsError::InvalidCommand("empty key or value".to_owned()));
    }
    if token.len() > MAX_STRING_LEN {
        return Err(KvsError::InvalidCommand(format!(
            "token longer than {MAX_STRING_LEN} bytes: {token}"
        )));
    }
    if !token.bytes().all(|b| (0x20..0x7f).contains(&b)) {
        return Err(KvsError::InvalidCommand(format!(
            "non-printable bytes in token: {token}"
        )));
    }
    Ok(token.to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(line: &str) -> Command {
        parse_command(line).unwrap().unwrap()
    }

    #[test]
    fn write_with_multiple_pairs() {
        assert_eq!(
            parse("WRITE [(a,1)(b,2)]"),
            Command::Write(vec![
                ("a".to_string(), "1".to_string()),
                ("b".to_string(), "2".to_string()),
            ])
        );
    }

    #[test]
    fn write_allows_separators_between_pairs() {
        assert_eq!(
            parse("WRITE [(a,1), (b,2)]"),
            Command::Write(vec![
                ("a".to_string(), "1".to_string()),
                ("b".to_string(), "2".to_string()),
            ])
        );
    }

    #[test]
    fn value_may_contain_spaces() {
        assert_eq!(
            parse("WRITE [(motd,hello there)]"),
            Command::Write(vec![("motd".to_string(), "hello there".to_string())])
        );
    }

    #[test]
    fn read_and_delete_key_lists() {
        assert_eq!(
            parse("READ [b,a]"),
            Command::Read(vec!["b".to_string(), "a".to_string()])
        );
        assert_eq!(parse("DELETE [x]"), Command::Delete(vec!["x".to_string()]));
    }

    #[test]
    fn bare_commands() {
        assert_eq!(parse("SHOW"), Command::Show);
        assert_eq!(parse("BACKUP"), Command::Backup);
        assert_eq!(parse("HELP"), Command::Help);
    }

    #[test]
    fn wait_takes_milliseconds() {
        assert_eq!(parse("WAIT 250"), Command::Wait(250));
        assert!(parse_command("WAIT -1").is_err());
        assert!(parse_command("WAIT soon").is_err());
    }

    #[test]
    fn comments_and_blanks_are_skipped() {
        assert_eq!(parse_command("").unwrap(), None);
        assert_eq!(parse_command("   ").unwrap(), None);
        assert_eq!(parse_command("# WRITE [(a,1)]").unwrap(), None);
    }

    #[test]
    fn malformed_lines_are_rejected() {
        assert!(parse_command("WRITE").is_err());
        assert!(parse_command("WRITE []").is_err());
        assert!(parse_command("WRITE [(a)]").is_err());
        assert!(parse_command("READ a,b").is_err());
        assert!(parse_command("READ [a,b").is_err());
        assert!(parse_command("SHOW ME").is_err());
        assert!(parse_command("FROB [a]").is_err());
    }

    #[test]
    fn oversized_token_is_rejected() {
        let long = "k".repeat(MAX_STRING_LEN + 1);
        assert!(parse_command(&format!("READ [{long}]")).is_err());
    }

    #[test]
    fn client_grammar() {
        assert_eq!(
            parse_client_command("SUBSCRIBE [k]").unwrap(),
            Some(ClientCommand::Subscribe("k".to_string()))
        );
        assert_eq!(
            parse_client_command("UNSUBSCRIBE [k]").unwrap(),
            Some(ClientCommand::Unsubscribe("k".to_string()))
        );
        assert_eq!(
            parse_client_command("DELAY 100").unwrap(),
            Some(ClientCommand::Delay(100))
        );
        assert_eq!(
            parse_client_command("DISCONNECT").unwrap(),
            Some(ClientCommand::Disconnect)
        );
        assert!(parse_client_command("SUBSCRIBE [a,b]").is_err());
        assert!(parse_client_command("WRITE [(a,1)]").is_err());
    }
}
