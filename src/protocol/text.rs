use anyhow::{anyhow, bail};

use crate::protocol::Dialect;
use crate::task::{Operation, Task};

pub const TEXT_UDP_HANDSHAKE: &str = "TEXT UDP 1.1";

pub const TEXT_TCP_DIALECT: &str = "TEXT TCP 1.1";
pub const BINARY_TCP_DIALECT: &str = "BINARY TCP 1.1";

pub const ACK_OK_LINE: &str = "OK\n";
pub const ACK_NOT_OK_LINE: &str = "NOT OK\n";
pub const ERROR_LINE: &str = "ERROR\n";
pub const ERROR_TIMEOUT_LINE: &str = "ERROR TO\n";

/// Maximum deviation from an integer at which a decimal answer in the TCP text
///  dialect is still accepted as that integer.
pub const FLOAT_ANSWER_TOLERANCE: f64 = 1e-4;

pub fn strip_crlf(line: &str) -> &str {
    line.trim_matches(|c| c == '\r' || c == '\n')
}

pub fn is_udp_handshake(line: &str) -> bool {
    strip_crlf(line) == TEXT_UDP_HANDSHAKE
}

/// UDP text task line: `"<id> <op-name> <v1> <v2>\n"`
pub fn format_task_line(task: &Task) -> String {
    format!("{} {} {} {}\n", task.id, task.op.name(), task.v1, task.v2)
}

/// UDP text answer: `"<id> <result>"`, interior whitespace tolerated, trailing
///  whitespace ignored. The id is mandatory.
pub fn parse_answer_line(line: &str) -> anyhow::Result<(u32, i64)> {
    let mut tokens = line.split_whitespace();

    let id = tokens
        .next()
        .ok_or_else(|| anyhow!("empty answer line"))?
        .parse::<u32>()?;
    let result = tokens
        .next()
        .ok_or_else(|| anyhow!("answer line is missing the result"))?
        .parse::<i64>()?;

    if tokens.next().is_some() {
        bail!("trailing tokens after the result");
    }
    Ok((id, result))
}

/// The TCP protocol offer: one line per supported dialect, then a blank line.
pub fn format_offer() -> String {
    format!("{}\n{}\n\n", TEXT_TCP_DIALECT, BINARY_TCP_DIALECT)
}

/// Parses a client's dialect selection, e.g. `"BINARY TCP 1.1 OK"`. Matching is
///  case-insensitive; anything else is an unsupported selection.
pub fn parse_selection(line: &str) -> Option<Dialect> {
    let normalized = line.trim().to_ascii_uppercase();
    if normalized == format!("{} OK", TEXT_TCP_DIALECT) {
        Some(Dialect::Text)
    } else if normalized == format!("{} OK", BINARY_TCP_DIALECT) {
        Some(Dialect::Binary)
    } else {
        None
    }
}

/// TCP text assignment line: `"ASSIGNMENT: <op-name> <v1> <v2>\n"`
pub fn format_assignment_line(task: &Task) -> String {
    format!("ASSIGNMENT: {} {} {}\n", task.op.name(), task.v1, task.v2)
}

pub fn parse_assignment_line(line: &str) -> anyhow::Result<(Operation, i32, i32)> {
    let rest = strip_crlf(line)
        .strip_prefix("ASSIGNMENT:")
        .ok_or_else(|| anyhow!("not an assignment line: {:?}", line))?;

    let mut tokens = rest.split_whitespace();
    let op = tokens
        .next()
        .and_then(Operation::from_name)
        .ok_or_else(|| anyhow!("missing or unknown operation in {:?}", line))?;
    let v1 = tokens
        .next()
        .ok_or_else(|| anyhow!("missing first operand"))?
        .parse::<i32>()?;
    let v2 = tokens
        .next()
        .ok_or_else(|| anyhow!("missing second operand"))?
        .parse::<i32>()?;

    Ok((op, v1, v2))
}

/// A TCP text answer is a decimal integer; a floating point literal within
///  [FLOAT_ANSWER_TOLERANCE] of an integer is accepted as that integer.
pub fn parse_tcp_answer(line: &str) -> anyhow::Result<i64> {
    let trimmed = line.trim();
    if let Ok(n) = trimmed.parse::<i64>() {
        return Ok(n);
    }

    let f = trimmed
        .parse::<f64>()
        .map_err(|_| anyhow!("answer is not a decimal number: {:?}", line))?;
    if !f.is_finite() || (f - f.round()).abs() > FLOAT_ANSWER_TOLERANCE {
        bail!("answer {:?} is not within tolerance of an integer", line);
    }
    Ok(f.round() as i64)
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use tokio::time::Instant;

    use super::*;

    fn task(id: u32, op: Operation, v1: i32, v2: i32) -> Task {
        Task {
            id,
            op,
            v1,
            v2,
            created_at: Instant::now(),
        }
    }

    #[test]
    fn test_format_task_line() {
        assert_eq!(format_task_line(&task(7, Operation::Mul, 6, 5)), "7 mul 6 5\n");
        assert_eq!(format_task_line(&task(1, Operation::Sub, -3, 4)), "1 sub -3 4\n");
    }

    #[rstest]
    #[case::plain("7 30", Some((7, 30)))]
    #[case::trailing_newline("7 30\n", Some((7, 30)))]
    #[case::crlf("7 30\r\n", Some((7, 30)))]
    #[case::negative_result("12 -5", Some((12, -5)))]
    #[case::extra_interior_whitespace("7   30", Some((7, 30)))]
    #[case::bare_result("30", None)]
    #[case::negative_id("-7 30", None)]
    #[case::trailing_garbage("7 30 x", None)]
    #[case::not_numbers("seven thirty", None)]
    #[case::empty("", None)]
    fn test_parse_answer_line(#[case] line: &str, #[case] expected: Option<(u32, i64)>) {
        assert_eq!(parse_answer_line(line).ok(), expected);
    }

    #[rstest]
    #[case::exact("TEXT UDP 1.1", true)]
    #[case::trailing_newline("TEXT UDP 1.1\n", true)]
    #[case::crlf("TEXT UDP 1.1\r\n", true)]
    #[case::wrong_version("TEXT UDP 1.2", false)]
    #[case::lowercase("text udp 1.1", false)]
    #[case::tcp("TEXT TCP 1.1", false)]
    fn test_is_udp_handshake(#[case] line: &str, #[case] expected: bool) {
        assert_eq!(is_udp_handshake(line), expected);
    }

    #[test]
    fn test_format_offer() {
        assert_eq!(format_offer(), "TEXT TCP 1.1\nBINARY TCP 1.1\n\n");
    }

    #[rstest]
    #[case::text("TEXT TCP 1.1 OK\n", Some(Dialect::Text))]
    #[case::binary("BINARY TCP 1.1 OK\n", Some(Dialect::Binary))]
    #[case::case_insensitive("binary tcp 1.1 ok\n", Some(Dialect::Binary))]
    #[case::mixed_case("Text TCP 1.1 Ok", Some(Dialect::Text))]
    #[case::missing_ok("TEXT TCP 1.1\n", None)]
    #[case::wrong_version("TEXT TCP 2.0 OK\n", None)]
    #[case::garbage("GIMME\n", None)]
    fn test_parse_selection(#[case] line: &str, #[case] expected: Option<Dialect>) {
        assert_eq!(parse_selection(line), expected);
    }

    #[test]
    fn test_assignment_line_round_trip() {
        let t = task(9, Operation::Div, 17, 5);
        let line = format_assignment_line(&t);
        assert_eq!(line, "ASSIGNMENT: div 17 5\n");
        assert_eq!(parse_assignment_line(&line).unwrap(), (Operation::Div, 17, 5));
    }

    #[rstest]
    #[case::integer("42\n", Some(42))]
    #[case::negative("-42", Some(-42))]
    #[case::float_exact("42.0\n", Some(42))]
    #[case::float_within_tolerance("41.99995", Some(42))]
    #[case::float_outside_tolerance("42.1", None)]
    #[case::nan("NaN", None)]
    #[case::garbage("forty-two", None)]
    fn test_parse_tcp_answer(#[case] line: &str, #[case] expected: Option<i64>) {
        assert_eq!(parse_tcp_answer(line).ok(), expected);
    }
}
