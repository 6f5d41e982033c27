//! Parser of user supplied source locations.
//!
//! Accepted forms:
//! - `file.go:42` - line in a file;
//! - `main.main` or `pkg.(*Recv).Method:3` - function, with an optional line offset;
//! - `/regex/` - functions matching a regular expression;
//! - `+5` / `-5` - line relative to the current one;
//! - `42` - line in the current file;
//! - `*0x468c20` - literal instruction address.

use crate::debugger::error::Error;
use chumsky::error::Rich;
use chumsky::prelude::{choice, end, just, one_of};
use chumsky::{extra, text, IterParser, Parser};

type Err<'a> = extra::Err<Rich<'a, char>>;

/// Parsed location expression.
#[derive(Debug, Clone, PartialEq)]
pub enum LocationExpr {
    FileLine { file: String, line: u64 },
    Function { name: String, line: Option<u64> },
    Regex(String),
    RelativeLine(i64),
    Line(u64),
    Address(usize),
}

fn address<'a>() -> impl Parser<'a, &'a str, LocationExpr, Err<'a>> {
    let hex = just("0x")
        .or(just("0X"))
        .ignore_then(
            text::digits(16)
                .at_least(1)
                .to_slice()
                .map(|s: &str| usize::from_str_radix(s, 16).unwrap_or_default()),
        );
    let dec = text::digits(10)
        .at_least(1)
        .to_slice()
        .map(|s: &str| s.parse::<usize>().unwrap_or_default());

    just('*')
        .ignore_then(hex.or(dec))
        .map(LocationExpr::Address)
}

fn relative_line<'a>() -> impl Parser<'a, &'a str, LocationExpr, Err<'a>> {
    one_of("+-")
        .then(
            text::digits(10)
                .at_least(1)
                .to_slice()
                .map(|s: &str| s.parse::<i64>().unwrap_or_default()),
        )
        .map(|(sign, value)| {
            let value = if sign == '-' { -value } else { value };
            LocationExpr::RelativeLine(value)
        })
}

fn plain_line<'a>() -> impl Parser<'a, &'a str, LocationExpr, Err<'a>> {
    text::digits(10)
        .at_least(1)
        .to_slice()
        .map(|s: &str| LocationExpr::Line(s.parse().unwrap_or_default()))
}

fn regex<'a>() -> impl Parser<'a, &'a str, LocationExpr, Err<'a>> {
    just('/')
        .ignore_then(
            chumsky::prelude::none_of('/')
                .repeated()
                .at_least(1)
                .collect::<String>(),
        )
        .then_ignore(just('/'))
        .map(LocationExpr::Regex)
}

/// True if a location base looks like a source file rather than a function name.
fn looks_like_file(base: &str) -> bool {
    base.contains('/') && base.ends_with(".go")
        || base.ends_with(".go")
        || base.ends_with(".s")
        || base.ends_with(".c")
}

/// Parse a location expression.
pub fn parse_location(input: &str) -> Result<LocationExpr, Error> {
    let input = input.trim();

    // structured prefixed forms first
    let structured = choice((address(), relative_line(), regex(), plain_line())).then_ignore(end());
    if let Some(loc) = structured.parse(input).into_result().ok() {
        return Ok(loc);
    }

    if input.is_empty() {
        return Err(Error::LocationParsing("empty location".to_string()));
    }

    // <file>:<line>, <function>:<line> or <function>
    let (base, line) = match input.rsplit_once(':') {
        Some((base, line_str)) if line_str.chars().all(|c| c.is_ascii_digit()) => {
            let line: u64 = line_str
                .parse()
                .map_err(|_| Error::LocationParsing(format!("invalid line number: {line_str}")))?;
            (base, Some(line))
        }
        _ => (input, None),
    };

    if looks_like_file(base) {
        let line = line.ok_or_else(|| {
            Error::LocationParsing(format!("file location requires a line number: {base}"))
        })?;
        return Ok(LocationExpr::FileLine {
            file: base.to_string(),
            line,
        });
    }

    Ok(LocationExpr::Function {
        name: base.to_string(),
        line,
    })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_location() {
        struct TestCase {
            string: &'static str,
            expect: LocationExpr,
        }
        let test_cases = [
            TestCase {
                string: "main.go:42",
                expect: LocationExpr::FileLine {
                    file: "main.go".to_string(),
                    line: 42,
                },
            },
            TestCase {
                string: "pkg/sub/file.go:7",
                expect: LocationExpr::FileLine {
                    file: "pkg/sub/file.go".to_string(),
                    line: 7,
                },
            },
            TestCase {
                string: "main.main",
                expect: LocationExpr::Function {
                    name: "main.main".to_string(),
                    line: None,
                },
            },
            TestCase {
                string: "bytes.(*Buffer).Write:2",
                expect: LocationExpr::Function {
                    name: "bytes.(*Buffer).Write".to_string(),
                    line: Some(2),
                },
            },
            TestCase {
                string: "/^main\\..*/",
                expect: LocationExpr::Regex("^main\\..*".to_string()),
            },
            TestCase {
                string: "+5",
                expect: LocationExpr::RelativeLine(5),
            },
            TestCase {
                string: "-3",
                expect: LocationExpr::RelativeLine(-3),
            },
            TestCase {
                string: "42",
                expect: LocationExpr::Line(42),
            },
            TestCase {
                string: "*0x468c20",
                expect: LocationExpr::Address(0x468c20),
            },
            TestCase {
                string: "*123456",
                expect: LocationExpr::Address(123456),
            },
        ];

        for tc in test_cases {
            assert_eq!(parse_location(tc.string).unwrap(), tc.expect, "{}", tc.string);
        }
    }

    #[test]
    fn test_parse_location_errors() {
        assert!(parse_location("").is_err());
        assert!(parse_location("main.go:").is_err());
    }
}
