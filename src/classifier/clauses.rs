//! Clause-level scanning: comment/hint skipping, top-level splitting on
//! commas and keywords, SET assignments and WHERE conjunctions.

use super::common::{identifier, is_ident_char, operand, qualified_identifier, unqualified, ws};
use super::{ArithOp, Assignment, Filter, Predicate, VersionPredicate};
use nom::{
    branch::alt,
    character::complete::char,
    combinator::{all_consuming, map},
    sequence::tuple,
    IResult,
};

/// Skips whitespace, `--` and `/* */` comments and `@{...}` statement hints.
pub fn skip_preamble(sql: &str) -> &str {
    let mut rest = sql;
    loop {
        rest = rest.trim_start();
        if let Some(after) = rest.strip_prefix("--") {
            rest = after.find('\n').map_or("", |i| &after[i + 1..]);
        } else if let Some(after) = rest.strip_prefix("/*") {
            rest = after.find("*/").map_or("", |i| &after[i + 2..]);
        } else if let Some(after) = rest.strip_prefix("@{") {
            rest = after.find('}').map_or("", |i| &after[i + 1..]);
        } else {
            return rest;
        }
    }
}

/// Byte offsets and chars that sit outside quotes and parentheses.
fn top_level_chars(input: &str) -> Vec<(usize, char)> {
    let mut out = Vec::new();
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    for (i, c) in input.char_indices() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => {}
            None => match c {
                '\'' | '"' | '`' => quote = Some(c),
                '(' => depth += 1,
                ')' => depth = depth.saturating_sub(1),
                _ if depth == 0 => out.push((i, c)),
                _ => {}
            },
        }
    }
    out
}

fn keyword_at(input: &str, at: usize, kw: &str) -> bool {
    let before_ok = input[..at].chars().next_back().is_none_or(|c| !is_ident_char(c));
    let matches = input
        .get(at..at + kw.len())
        .is_some_and(|s| s.eq_ignore_ascii_case(kw));
    let after_ok = input
        .get(at + kw.len()..)
        .and_then(|s| s.chars().next())
        .is_none_or(|c| !is_ident_char(c));
    before_ok && matches && after_ok
}

/// Offset of the first top-level occurrence of `kw`.
pub fn find_top_level_keyword(input: &str, kw: &str) -> Option<usize> {
    top_level_chars(input)
        .into_iter()
        .map(|(i, _)| i)
        .find(|&i| keyword_at(input, i, kw))
}

pub fn split_top_level_keyword<'a>(input: &'a str, kw: &str) -> Vec<&'a str> {
    let mut parts = Vec::new();
    let mut start = 0;
    for (i, _) in top_level_chars(input) {
        if i >= start && keyword_at(input, i, kw) {
            parts.push(&input[start..i]);
            start = i + kw.len();
        }
    }
    parts.push(&input[start..]);
    parts
}

pub fn split_top_level_commas(input: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    for (i, c) in top_level_chars(input) {
        if c == ',' {
            parts.push(&input[start..i]);
            start = i + 1;
        }
    }
    parts.push(&input[start..]);
    parts
}

fn assignment_target(input: &str) -> IResult<&str, String> {
    map(
        tuple((ws(qualified_identifier), char('='))),
        |(column, _)| unqualified(&column).to_string(),
    )(input)
}

/// Parses one `col = ...` item of a SET list. `None` when there is no
/// recognizable target column.
pub fn parse_assignment(text: &str) -> Option<Assignment> {
    let (rest, column) = assignment_target(text).ok()?;

    if let Ok((_, operand)) = all_consuming(ws(operand))(rest) {
        return Some(Assignment::Set { column, operand });
    }

    let arithmetic = all_consuming(tuple((
        ws(identifier),
        ws(alt((
            map(char('+'), |_| ArithOp::Add),
            map(char('-'), |_| ArithOp::Subtract),
        ))),
        ws(operand),
    )))(rest);
    if let Ok((_, (source, op, operand))) = arithmetic {
        return Some(Assignment::Arithmetic {
            column,
            source,
            op,
            operand,
        });
    }

    Some(Assignment::Expression {
        column,
        text: rest.trim().to_string(),
    })
}

fn parse_predicate(text: &str) -> Predicate {
    let equality = all_consuming(tuple((ws(qualified_identifier), char('='), ws(operand))))(text);
    match equality {
        Ok((_, (column, _, operand))) => Predicate::Equals {
            column: unqualified(&column).to_string(),
            operand,
        },
        Err(_) => Predicate::Other(text.trim().to_string()),
    }
}

pub fn parse_filter(text: &str) -> Filter {
    if text.trim().is_empty() {
        return Filter::Absent;
    }
    if find_top_level_keyword(text, "OR").is_some() {
        return Filter::Complex(text.trim().to_string());
    }
    Filter::Conjunction(
        split_top_level_keyword(text, "AND")
            .into_iter()
            .map(parse_predicate)
            .collect(),
    )
}

/// The single equality term on `version_column`, if exactly one exists.
pub fn find_version_predicate(filter: &Filter, version_column: &str) -> Option<VersionPredicate> {
    let Filter::Conjunction(predicates) = filter else {
        return None;
    };
    let mut found = predicates.iter().filter_map(|p| match p {
        Predicate::Equals { column, operand } if column.eq_ignore_ascii_case(version_column) => {
            Some(VersionPredicate {
                column: column.clone(),
                operand: operand.clone(),
            })
        }
        _ => None,
    });
    let first = found.next()?;
    found.next().is_none().then_some(first)
}
