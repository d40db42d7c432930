//! Startup parameters received from the spawning client.
//!
//! The client hands the helper four newline-delimited fields on stdin:
//! session id, echo flag, comma-separated consumer names, and the command
//! line to run. Everything else the helper needs is derived from the
//! session directory.

use anyhow::{Context, Result, bail};
use std::io::BufRead;

/// Parsed helper bootstrap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bootstrap {
    pub session_id: String,
    pub echo: bool,
    pub consumers: Vec<String>,
    pub command: String,
}

/// Read the four bootstrap lines from `reader`.
pub fn read_bootstrap(reader: &mut impl BufRead) -> Result<Bootstrap> {
    let session_id = read_line(reader, "session id")?;
    if session_id.is_empty() || !is_safe_name(&session_id) {
        bail!("invalid session id: {session_id:?}");
    }

    let echo_line = read_line(reader, "echo flag")?;
    let echo = matches!(echo_line.to_ascii_lowercase().as_str(), "true" | "1");

    let consumers: Vec<String> = read_line(reader, "consumer list")?
        .split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect();
    for name in &consumers {
        if !is_safe_name(name) {
            bail!("invalid consumer name: {name:?}");
        }
    }

    let command = read_line(reader, "command")?;
    if command.is_empty() {
        bail!("no command supplied");
    }

    Ok(Bootstrap {
        session_id,
        echo,
        consumers,
        command,
    })
}

fn read_line(reader: &mut impl BufRead, what: &str) -> Result<String> {
    let mut line = String::new();
    let n = reader
        .read_line(&mut line)
        .with_context(|| format!("failed reading {what} from stdin"))?;
    if n == 0 {
        bail!("stdin closed before {what} was received");
    }
    Ok(line.trim_end_matches(['\n', '\r']).to_string())
}

/// Names end up as path components inside the session directory, so only a
/// conservative character set is accepted.
fn is_safe_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::BufReader;

    fn parse(input: &str) -> Result<Bootstrap> {
        read_bootstrap(&mut BufReader::new(input.as_bytes()))
    }

    #[test]
    fn test_parse_full_bootstrap() {
        let bootstrap = parse("ab12cd34\ntrue\ntail,expect\nsh\n").expect("parse should succeed");
        assert_eq!(
            bootstrap,
            Bootstrap {
                session_id: "ab12cd34".into(),
                echo: true,
                consumers: vec!["tail".into(), "expect".into()],
                command: "sh".into(),
            }
        );
    }

    #[test]
    fn test_empty_consumer_list() {
        let bootstrap = parse("id1\nfalse\n\nsleep 10\n").expect("parse should succeed");
        assert!(bootstrap.consumers.is_empty());
        assert!(!bootstrap.echo);
    }

    #[test]
    fn test_echo_flag_variants() {
        assert!(parse("id1\nTrue\n\nsh\n").unwrap().echo);
        assert!(parse("id1\n1\n\nsh\n").unwrap().echo);
        assert!(!parse("id1\nFalse\n\nsh\n").unwrap().echo);
        assert!(!parse("id1\nanything\n\nsh\n").unwrap().echo);
    }

    #[test]
    fn test_command_keeps_inner_whitespace() {
        let bootstrap = parse("id1\nfalse\n\necho 'a  b'; exit 3\n").expect("parse");
        assert_eq!(bootstrap.command, "echo 'a  b'; exit 3");
    }

    #[test]
    fn test_rejects_path_traversal_session_id() {
        assert!(parse("../../etc\nfalse\n\nsh\n").is_err());
        assert!(parse("a b\nfalse\n\nsh\n").is_err());
        assert!(parse("\nfalse\n\nsh\n").is_err());
    }

    #[test]
    fn test_rejects_bad_consumer_name() {
        assert!(parse("id1\nfalse\n../x\nsh\n").is_err());
    }

    #[test]
    fn test_rejects_missing_command() {
        assert!(parse("id1\nfalse\ntail\n\n").is_err());
        assert!(parse("id1\nfalse\ntail\n").is_err());
    }
}
