//! Expression language parser.
//!
//! Grammar (by precedence, loosest first): logical or, logical and, comparison,
//! additive, multiplicative, unary (`*` dereference, `&` address-of), postfix
//! (field access, indexing, slicing), primary (literals, casts `T(x)`, calls,
//! identifiers, parentheses).

use crate::debugger::error::Error;
use crate::debugger::variable::dqe::{BinaryOp, Dqe, Literal, Selector};
use chumsky::error::Rich;
use chumsky::prelude::{choice, end, just, recursive};
use chumsky::{extra, text, IterParser, Parser};
use itertools::Itertools;

type Err<'a> = extra::Err<Rich<'a, char>>;

/// Scalar type names accepted by the cast form.
const CAST_TYPES: &[&str] = &[
    "int", "int8", "int16", "int32", "int64", "uint", "uint8", "uint16", "uint32", "uint64",
    "uintptr", "float32", "float64", "bool", "byte", "rune",
];

fn go_identifier<'a>() -> impl Parser<'a, &'a str, &'a str, Err<'a>> + Clone {
    text::ascii::ident().padded().labelled("identifier")
}

/// Identifier with an optional package qualifier ("fmt.Println", "main.counter").
fn qualified_identifier<'a>() -> impl Parser<'a, &'a str, String, Err<'a>> + Clone {
    text::ascii::ident()
        .separated_by(just('.'))
        .at_least(1)
        .to_slice()
        .map(|s: &str| s.to_string())
        .padded()
        .labelled("qualified identifier")
}

fn hex<'a>() -> impl Parser<'a, &'a str, usize, Err<'a>> + Clone {
    let prefix = just("0x").or(just("0X"));
    prefix
        .ignore_then(
            text::digits(16)
                .at_least(1)
                .to_slice()
                .map(|s: &str| usize::from_str_radix(s, 16).unwrap_or_default()),
        )
        .padded()
        .labelled("hexadecimal number")
}

fn number<'a>() -> impl Parser<'a, &'a str, Literal, Err<'a>> + Clone {
    let float = text::digits(10)
        .at_least(1)
        .then(just('.'))
        .then(text::digits(10).at_least(1))
        .to_slice()
        .map(|s: &str| Literal::Float(s.parse().unwrap_or_default()));
    let int = text::digits(10)
        .at_least(1)
        .to_slice()
        .map(|s: &str| Literal::Int(s.parse().unwrap_or_default()));
    choice((hex().map(Literal::Address), float, int))
        .padded()
        .labelled("number")
}

fn string_literal<'a>() -> impl Parser<'a, &'a str, Literal, Err<'a>> + Clone {
    just('"')
        .ignore_then(
            chumsky::prelude::none_of('"')
                .repeated()
                .collect::<String>(),
        )
        .then_ignore(just('"'))
        .map(Literal::String)
        .padded()
        .labelled("string literal")
}

fn literal<'a>() -> impl Parser<'a, &'a str, Literal, Err<'a>> + Clone {
    choice((
        just("true").to(Literal::Bool(true)).padded(),
        just("false").to(Literal::Bool(false)).padded(),
        string_literal(),
        number(),
    ))
}

/// Postfix operations over a primary expression.
#[derive(Clone)]
enum Postfix {
    Field(String),
    Index(Dqe),
    Slice(Option<usize>, Option<usize>),
}

pub fn parser<'a>() -> impl Parser<'a, &'a str, Dqe, Err<'a>> {
    recursive(|expr| {
        let usize_num = text::digits(10)
            .at_least(1)
            .to_slice()
            .map(|s: &str| s.parse::<usize>().unwrap_or_default())
            .padded();

        // T(x) where T is a scalar type name, pkg.fn(a, b) otherwise
        let call_args = expr
            .clone()
            .separated_by(just(',').padded())
            .collect::<Vec<Dqe>>()
            .delimited_by(just('(').padded(), just(')').padded());

        let cast_or_call = qualified_identifier().then(call_args).map(
            |(callee, mut args): (String, Vec<Dqe>)| {
                if CAST_TYPES.contains(&callee.as_str()) && args.len() == 1 {
                    return Dqe::Cast(callee, args.remove(0).boxed());
                }
                Dqe::Call(callee, args)
            },
        );

        let variable = go_identifier().map(|name| Dqe::Variable(Selector::by_name(name, false)));

        let parens = expr
            .clone()
            .delimited_by(just('(').padded(), just(')').padded());

        let primary = choice((
            literal().map(Dqe::Literal),
            cast_or_call,
            variable,
            parens,
        ));

        // postfix chain: .field, [index], [from:to]
        let field_op = just('.')
            .ignore_then(go_identifier())
            .map(|f| Postfix::Field(f.to_string()));
        let slice_op = usize_num
            .or_not()
            .then_ignore(just(':').padded())
            .then(usize_num.or_not())
            .delimited_by(just('[').padded(), just(']').padded())
            .map(|(from, to)| Postfix::Slice(from, to));
        let index_op = expr
            .clone()
            .delimited_by(just('[').padded(), just(']').padded())
            .map(Postfix::Index);

        let postfix = primary
            .then(
                choice((field_op, slice_op, index_op))
                    .repeated()
                    .collect::<Vec<_>>(),
            )
            .map(|(initial, ops)| {
                ops.into_iter().fold(initial, |acc, op| match op {
                    Postfix::Field(name) => Dqe::Field(acc.boxed(), name),
                    Postfix::Index(idx) => Dqe::Index(acc.boxed(), idx.boxed()),
                    Postfix::Slice(from, to) => Dqe::Slice(acc.boxed(), from, to),
                })
            });

        // unary operators, right associative
        let unary = recursive(|unary| {
            choice((
                just('*')
                    .padded()
                    .ignore_then(unary.clone())
                    .map(|e: Dqe| Dqe::Deref(e.boxed())),
                just('&')
                    .padded()
                    .ignore_then(unary)
                    .map(|e: Dqe| Dqe::Address(e.boxed())),
                postfix,
            ))
        });

        let mul_op = choice((
            just('*').padded().to(BinaryOp::Mul),
            just('/').padded().to(BinaryOp::Div),
            just('%').padded().to(BinaryOp::Rem),
        ));
        let product = unary
            .clone()
            .then(mul_op.then(unary).repeated().collect::<Vec<_>>())
            .map(|(first, rest)| fold_binary(first, rest));

        let add_op = choice((
            just('+').padded().to(BinaryOp::Add),
            just('-').padded().to(BinaryOp::Sub),
        ));
        let sum = product
            .clone()
            .then(add_op.then(product).repeated().collect::<Vec<_>>())
            .map(|(first, rest)| fold_binary(first, rest));

        let cmp_op = choice((
            just("==").padded().to(BinaryOp::Eq),
            just("!=").padded().to(BinaryOp::NotEq),
            just("<=").padded().to(BinaryOp::LessEq),
            just(">=").padded().to(BinaryOp::GreaterEq),
            just('<').padded().to(BinaryOp::Less),
            just('>').padded().to(BinaryOp::Greater),
        ));
        let comparison = sum
            .clone()
            .then(cmp_op.then(sum).or_not())
            .map(|(lhs, rest)| match rest {
                Some((op, rhs)) => Dqe::Binary(op, lhs.boxed(), rhs.boxed()),
                None => lhs,
            });

        let and = comparison
            .clone()
            .then(
                just("&&")
                    .padded()
                    .to(BinaryOp::And)
                    .then(comparison)
                    .repeated()
                    .collect::<Vec<_>>(),
            )
            .map(|(first, rest)| fold_binary(first, rest));

        and.clone()
            .then(
                just("||")
                    .padded()
                    .to(BinaryOp::Or)
                    .then(and)
                    .repeated()
                    .collect::<Vec<_>>(),
            )
            .map(|(first, rest)| fold_binary(first, rest))
    })
}

fn fold_binary(first: Dqe, rest: Vec<(BinaryOp, Dqe)>) -> Dqe {
    rest.into_iter()
        .fold(first, |acc, (op, rhs)| Dqe::Binary(op, acc.boxed(), rhs.boxed()))
}

/// Parse an expression string into a [`Dqe`].
pub fn parse_expression(input: &str) -> Result<Dqe, Error> {
    parser()
        .then_ignore(end())
        .parse(input)
        .into_result()
        .map_err(|errors| {
            let rendered = errors.iter().map(|e| e.to_string()).join("; ");
            Error::ExpressionParsing(rendered)
        })
}

#[cfg(test)]
mod test {
    use super::*;

    fn var(name: &str) -> Dqe {
        Dqe::Variable(Selector::by_name(name, false))
    }

    #[test]
    fn test_parse_simple() {
        struct TestCase {
            string: &'static str,
            expr: Dqe,
        }
        let test_cases = vec![
            TestCase {
                string: "var1",
                expr: var("var1"),
            },
            TestCase {
                string: "*var1",
                expr: Dqe::Deref(var("var1").boxed()),
            },
            TestCase {
                string: "**var1",
                expr: Dqe::Deref(Dqe::Deref(var("var1").boxed()).boxed()),
            },
            TestCase {
                string: "&var1",
                expr: Dqe::Address(var("var1").boxed()),
            },
            TestCase {
                string: "var1.field1.field2",
                expr: Dqe::Field(
                    Dqe::Field(var("var1").boxed(), "field1".to_string()).boxed(),
                    "field2".to_string(),
                ),
            },
            TestCase {
                string: "var1[3]",
                expr: Dqe::Index(var("var1").boxed(), Dqe::Literal(Literal::Int(3)).boxed()),
            },
            TestCase {
                string: "var1[1:4]",
                expr: Dqe::Slice(var("var1").boxed(), Some(1), Some(4)),
            },
            TestCase {
                string: "var1[:4]",
                expr: Dqe::Slice(var("var1").boxed(), None, Some(4)),
            },
        ];

        for tc in test_cases {
            let parsed = parse_expression(tc.string).unwrap();
            assert_eq!(parsed, tc.expr, "input: {}", tc.string);
        }
    }

    #[test]
    fn test_parse_binary() {
        let parsed = parse_expression("i == 7").unwrap();
        assert_eq!(
            parsed,
            Dqe::Binary(
                BinaryOp::Eq,
                var("i").boxed(),
                Dqe::Literal(Literal::Int(7)).boxed()
            )
        );

        let parsed = parse_expression("a + b * 2").unwrap();
        assert_eq!(
            parsed,
            Dqe::Binary(
                BinaryOp::Add,
                var("a").boxed(),
                Dqe::Binary(
                    BinaryOp::Mul,
                    var("b").boxed(),
                    Dqe::Literal(Literal::Int(2)).boxed()
                )
                .boxed()
            )
        );

        let parsed = parse_expression("a > 1 && b < 2").unwrap();
        let Dqe::Binary(BinaryOp::And, _, _) = parsed else {
            panic!("expect logical and at the root");
        };
    }

    #[test]
    fn test_parse_deref_field_priority() {
        // dereference applies to the whole postfix chain
        let parsed = parse_expression("*var1.field1").unwrap();
        assert_eq!(
            parsed,
            Dqe::Deref(Dqe::Field(var("var1").boxed(), "field1".to_string()).boxed())
        );
    }

    #[test]
    fn test_parse_cast_and_call() {
        let parsed = parse_expression("int64(x)").unwrap();
        assert_eq!(parsed, Dqe::Cast("int64".to_string(), var("x").boxed()));

        let parsed = parse_expression("main.getValue(1, true)").unwrap();
        assert_eq!(
            parsed,
            Dqe::Call(
                "main.getValue".to_string(),
                vec![
                    Dqe::Literal(Literal::Int(1)),
                    Dqe::Literal(Literal::Bool(true))
                ]
            )
        );
    }

    #[test]
    fn test_parse_hex_literal() {
        let parsed = parse_expression("0x1F").unwrap();
        assert_eq!(parsed, Dqe::Literal(Literal::Address(0x1F)));
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse_expression("var1.").is_err());
        assert!(parse_expression("var1[").is_err());
        assert!(parse_expression("").is_err());
    }
}
