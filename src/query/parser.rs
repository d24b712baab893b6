//! Predicate Parser for boxdb
//!
//! A small textual grammar for predicates, used by the CLI and by tests:
//!
//! ```text
//! query   := [or_expr] ["order" "by" key ("," key)*] ["limit" n] ["offset" n]
//! or_expr := and_expr ("or" and_expr)*
//! and_expr:= unary ("and" unary)*
//! unary   := "not" unary | "(" or_expr ")" | leaf
//! leaf    := prop op literal
//!          | prop "between" literal "and" literal
//!          | prop "in" "(" literal ("," literal)* ")"
//!          | prop ("contains" | "startswith" | "endswith") ["nocase"] string
//!          | prop "is" ["not"] "null"
//! key     := prop ["asc" | "desc"]
//! ```
//!
//! Keywords are case-insensitive. Strings take single or double quotes with
//! backslash escapes. Literals are typed later, when the predicate is bound
//! to an entity type.

use std::str::FromStr;

use nom::{
    branch::alt,
    bytes::complete::{escaped_transform, is_not, tag, tag_no_case, take_while},
    character::complete::{char, digit1, multispace0, one_of, satisfy},
    combinator::{all_consuming, map, map_res, not, opt, recognize, value},
    multi::separated_list1,
    sequence::{delimited, pair, preceded, terminated, tuple},
    IResult,
};

use crate::error::{Error, Result};
use crate::storage::value::Value;

use super::predicate::{CompareOp, OrderKey, Predicate, TextOp};

/// A parsed `find` clause: predicate plus ordering and paging
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedQuery {
    pub predicate: Option<Predicate>,
    pub order: Vec<OrderKey>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl Predicate {
    /// Parse a predicate such as `age >= 10 and name startswith "a"`
    pub fn parse(text: &str) -> Result<Predicate> {
        run(or_expr, text)
    }
}

impl FromStr for Predicate {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Predicate::parse(s)
    }
}

/// Parse a predicate followed by optional `order by`, `limit` and `offset`
pub fn parse_query(text: &str) -> Result<ParsedQuery> {
    run(query, text)
}

fn run<'a, O>(parser: impl FnMut(&'a str) -> IResult<&'a str, O>, text: &'a str) -> Result<O> {
    match all_consuming(delimited(multispace0, parser, multispace0))(text) {
        Ok((_, out)) => Ok(out),
        Err(nom::Err::Error(e)) | Err(nom::Err::Failure(e)) => {
            let near: String = e.input.chars().take(24).collect();
            Err(Error::InvalidPredicate(if near.is_empty() {
                "unexpected end of predicate".to_string()
            } else {
                format!("cannot parse predicate near '{}'", near)
            }))
        }
        Err(nom::Err::Incomplete(_)) => Err(Error::InvalidPredicate(
            "unexpected end of predicate".to_string(),
        )),
    }
}

// ========== Tokens ==========

fn ws<'a, O>(
    inner: impl FnMut(&'a str) -> IResult<&'a str, O>,
) -> impl FnMut(&'a str) -> IResult<&'a str, O> {
    delimited(multispace0, inner, multispace0)
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

fn keyword<'a>(word: &'static str) -> impl FnMut(&'a str) -> IResult<&'a str, &'a str> {
    ws(terminated(tag_no_case(word), not(satisfy(is_ident_char))))
}

fn identifier(input: &str) -> IResult<&str, &str> {
    ws(recognize(pair(
        satisfy(|c: char| c.is_alphabetic() || c == '_'),
        take_while(is_ident_char),
    )))(input)
}

fn escape(input: &str) -> IResult<&str, &str> {
    alt((
        value("\\", char('\\')),
        value("\"", char('"')),
        value("'", char('\'')),
        value("\n", char('n')),
        value("\t", char('t')),
    ))(input)
}

fn quoted<'a>(quote: char, stop: &'static str) -> impl FnMut(&'a str) -> IResult<&'a str, String> {
    delimited(
        char(quote),
        map(opt(escaped_transform(is_not(stop), '\\', escape)), Option::unwrap_or_default),
        char(quote),
    )
}

fn string_literal(input: &str) -> IResult<&str, String> {
    ws(alt((quoted('"', "\\\""), quoted('\'', "\\'"))))(input)
}

fn number(input: &str) -> IResult<&str, Value> {
    let text = recognize(tuple((
        opt(char('-')),
        digit1,
        opt(pair(char('.'), digit1)),
        opt(tuple((one_of("eE"), opt(one_of("+-")), digit1))),
    )));
    ws(map_res(text, |text: &str| {
        if text.contains(['.', 'e', 'E']) {
            text.parse::<f64>().map(Value::Double).map_err(|e| e.to_string())
        } else {
            text.parse::<i64>().map(Value::Long).map_err(|e| e.to_string())
        }
    }))(input)
}

fn literal(input: &str) -> IResult<&str, Value> {
    alt((
        map(string_literal, Value::String),
        value(Value::Bool(true), keyword("true")),
        value(Value::Bool(false), keyword("false")),
        value(Value::Null, keyword("null")),
        number,
    ))(input)
}

fn compare_op(input: &str) -> IResult<&str, CompareOp> {
    ws(alt((
        value(CompareOp::Eq, tag("==")),
        value(CompareOp::NotEq, tag("!=")),
        value(CompareOp::NotEq, tag("<>")),
        value(CompareOp::Le, tag("<=")),
        value(CompareOp::Ge, tag(">=")),
        value(CompareOp::Eq, tag("=")),
        value(CompareOp::Lt, tag("<")),
        value(CompareOp::Gt, tag(">")),
    )))(input)
}

fn text_op(input: &str) -> IResult<&str, TextOp> {
    alt((
        value(TextOp::Contains, keyword("contains")),
        value(TextOp::StartsWith, keyword("startswith")),
        value(TextOp::EndsWith, keyword("endswith")),
    ))(input)
}

fn count(input: &str) -> IResult<&str, usize> {
    ws(map_res(digit1, |digits: &str| digits.parse::<usize>()))(input)
}

// ========== Predicates ==========

fn leaf(input: &str) -> IResult<&str, Predicate> {
    let (input, property) = identifier(input)?;
    let property = property.to_string();
    let result = alt((
        map(
            preceded(keyword("is"), pair(opt(keyword("not")), keyword("null"))),
            |(negated, _)| match negated {
                Some(_) => Predicate::IsNotNull(property.clone()),
                None => Predicate::IsNull(property.clone()),
            },
        ),
        map(
            tuple((keyword("between"), literal, keyword("and"), literal)),
            |(_, lower, _, upper)| Predicate::Between {
                property: property.clone(),
                lower,
                upper,
            },
        ),
        map(
            preceded(
                keyword("in"),
                delimited(
                    ws(char('(')),
                    separated_list1(ws(char(',')), literal),
                    ws(char(')')),
                ),
            ),
            |values| Predicate::In {
                property: property.clone(),
                values,
            },
        ),
        map(
            tuple((text_op, opt(keyword("nocase")), string_literal)),
            |(op, nocase, pattern)| Predicate::Text {
                property: property.clone(),
                op,
                pattern,
                case_insensitive: nocase.is_some(),
            },
        ),
        map(pair(compare_op, literal), |(op, value)| Predicate::Compare {
            property: property.clone(),
            op,
            value,
        }),
    ))(input);
    result
}

fn unary(input: &str) -> IResult<&str, Predicate> {
    alt((
        map(preceded(keyword("not"), unary), |inner| {
            Predicate::Not(Box::new(inner))
        }),
        delimited(ws(char('(')), or_expr, ws(char(')'))),
        leaf,
    ))(input)
}

fn and_expr(input: &str) -> IResult<&str, Predicate> {
    map(separated_list1(keyword("and"), unary), |mut items| {
        match items.len() {
            1 => items.remove(0),
            _ => Predicate::And(items),
        }
    })(input)
}

fn or_expr(input: &str) -> IResult<&str, Predicate> {
    map(separated_list1(keyword("or"), and_expr), |mut items| {
        match items.len() {
            1 => items.remove(0),
            _ => Predicate::Or(items),
        }
    })(input)
}

// ========== Query clauses ==========

fn order_key(input: &str) -> IResult<&str, OrderKey> {
    map(
        pair(
            identifier,
            opt(alt((
                value(true, keyword("desc")),
                value(false, keyword("asc")),
            ))),
        ),
        |(property, descending)| OrderKey {
            property: property.to_string(),
            descending: descending.unwrap_or(false),
        },
    )(input)
}

fn order_clause(input: &str) -> IResult<&str, Vec<OrderKey>> {
    preceded(
        pair(keyword("order"), keyword("by")),
        separated_list1(ws(char(',')), order_key),
    )(input)
}

fn query(input: &str) -> IResult<&str, ParsedQuery> {
    map(
        tuple((
            opt(or_expr),
            opt(order_clause),
            opt(preceded(keyword("limit"), count)),
            opt(preceded(keyword("offset"), count)),
        )),
        |(predicate, order, limit, offset)| ParsedQuery {
            predicate,
            order: order.unwrap_or_default(),
            limit,
            offset,
        },
    )(input)
}
