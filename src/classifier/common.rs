use super::Operand;
use crate::core::{ParamRef, Value};
use rust_decimal::Decimal;
use std::str::FromStr;
use nom::{
    branch::alt,
    bytes::complete::{tag, tag_no_case, take_while, take_while1},
    character::complete::{alpha1, char, digit1, multispace0, satisfy},
    combinator::{map, map_res, not, opt, peek, recognize},
    error::{Error, ErrorKind},
    multi::separated_list1,
    sequence::{delimited, pair, preceded, terminated, tuple},
    IResult,
};

pub fn ws<'a, F, O>(inner: F) -> impl FnMut(&'a str) -> IResult<&'a str, O>
where
    F: FnMut(&'a str) -> IResult<&'a str, O>,
{
    delimited(multispace0, inner, multispace0)
}

pub const fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// Case-insensitive keyword that must end at a word boundary.
pub fn keyword<'a>(kw: &'static str) -> impl FnMut(&'a str) -> IResult<&'a str, &'a str> {
    terminated(tag_no_case(kw), not(peek(satisfy(is_ident_char))))
}

fn bare_identifier(input: &str) -> IResult<&str, String> {
    map(
        recognize(pair(
            alt((alpha1, tag("_"))),
            take_while(is_ident_char),
        )),
        |s: &str| s.to_string(),
    )(input)
}

// `Name` or "Name"
fn quoted_identifier(input: &str) -> IResult<&str, String> {
    map(
        alt((
            delimited(char('`'), take_while1(|c| c != '`'), char('`')),
            delimited(char('"'), take_while1(|c| c != '"'), char('"')),
        )),
        |s: &str| s.to_string(),
    )(input)
}

pub fn identifier(input: &str) -> IResult<&str, String> {
    alt((quoted_identifier, bare_identifier))(input)
}

/// `schema.table`, quotes stripped, segments joined with `.`
pub fn qualified_identifier(input: &str) -> IResult<&str, String> {
    map(separated_list1(char('.'), identifier), |parts| parts.join("."))(input)
}

/// Last segment of a possibly qualified name.
pub fn unqualified(name: &str) -> &str {
    name.rsplit('.').next().unwrap_or(name)
}

pub fn parameter(input: &str) -> IResult<&str, ParamRef> {
    alt((
        map(preceded(char('@'), bare_identifier), ParamRef::Named),
        map(
            preceded(char('$'), map_res(digit1, |s: &str| s.parse::<usize>())),
            ParamRef::Positional,
        ),
    ))(input)
}

// '...' with '' as the escaped quote
fn string_literal(input: &str) -> IResult<&str, String> {
    let (mut rest, _) = char('\'')(input)?;
    let mut out = String::new();
    loop {
        let Some(pos) = rest.find('\'') else {
            return Err(nom::Err::Error(Error::new(rest, ErrorKind::Char)));
        };
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];
        if let Some(stripped) = after.strip_prefix('\'') {
            out.push('\'');
            rest = stripped;
        } else {
            return Ok((after, out));
        }
    }
}

fn number_literal(input: &str) -> IResult<&str, Value> {
    map_res(
        recognize(tuple((
            opt(char('-')),
            digit1,
            opt(pair(char('.'), digit1)),
        ))),
        |s: &str| -> Result<Value, String> {
            if s.contains('.') {
                Decimal::from_str(s)
                    .map(Value::Numeric)
                    .map_err(|e| e.to_string())
            } else {
                s.parse::<i64>().map(Value::Integer).map_err(|e| e.to_string())
            }
        },
    )(input)
}

pub fn literal(input: &str) -> IResult<&str, Value> {
    alt((
        map(keyword("NULL"), |_| Value::Null),
        map(keyword("TRUE"), |_| Value::Boolean(true)),
        map(keyword("FALSE"), |_| Value::Boolean(false)),
        number_literal,
        map(string_literal, Value::Text),
    ))(input)
}

pub fn operand(input: &str) -> IResult<&str, Operand> {
    alt((map(parameter, Operand::Param), map(literal, Operand::Literal)))(input)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identifier_forms() {
        assert_eq!(identifier("Accounts rest").unwrap(), (" rest", "Accounts".to_string()));
        assert_eq!(identifier("`Order Items`").unwrap().1, "Order Items");
        assert_eq!(identifier("\"Users\"").unwrap().1, "Users");
        assert_eq!(qualified_identifier("app.`Accounts`").unwrap().1, "app.Accounts");
        assert_eq!(unqualified("app.Accounts"), "Accounts");
    }

    #[test]
    fn test_parameter_forms() {
        assert_eq!(parameter("@p1").unwrap().1, ParamRef::Named("p1".to_string()));
        assert_eq!(parameter("$12").unwrap().1, ParamRef::Positional(12));
        assert!(parameter("p1").is_err());
    }

    #[test]
    fn test_literals() {
        assert_eq!(literal("42").unwrap().1, Value::Integer(42));
        assert_eq!(literal("-7").unwrap().1, Value::Integer(-7));
        assert_eq!(literal("1.50").unwrap().1, Value::Numeric(Decimal::from_str("1.50").unwrap()));
        assert_eq!(literal("'O''Brien'").unwrap().1, Value::Text("O'Brien".to_string()));
        assert_eq!(literal("''").unwrap().1, Value::Text(String::new()));
        assert_eq!(literal("null").unwrap().1, Value::Null);
        assert_eq!(literal("TRUE").unwrap().1, Value::Boolean(true));
        assert!(literal("'unterminated").is_err());
    }

    #[test]
    fn test_keyword_requires_boundary() {
        assert!(keyword("NULL")("NULLABLE").is_err());
        assert!(keyword("NULL")("null ").is_ok());
    }
}
