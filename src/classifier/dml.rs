use super::clauses::{
    find_top_level_keyword, find_version_predicate, parse_assignment, parse_filter,
    split_top_level_commas,
};
use super::common::{identifier, keyword, operand, qualified_identifier, ws};
use super::{ClassifiedStatement, DmlShape, Filter, InsertVariant, Operand, StatementKind};
use crate::core::{DriverError, Result};
use nom::{
    branch::alt,
    character::complete::char,
    combinator::{all_consuming, map, opt},
    multi::separated_list1,
    sequence::{delimited, preceded},
    IResult,
};

const RESERVED_AFTER_TABLE: &[&str] = &["SET", "VALUES", "SELECT", "WHERE", "FROM", "INTO"];

fn table_name<'a>(sql: &str, input: &'a str) -> Result<(&'a str, String)> {
    let parsed: IResult<&str, String> = ws(qualified_identifier)(input);
    match parsed {
        Ok((rest, table))
            if !RESERVED_AFTER_TABLE
                .iter()
                .any(|kw| table.eq_ignore_ascii_case(kw)) =>
        {
            Ok((rest, table))
        }
        _ => Err(DriverError::malformed(sql, "missing table name")),
    }
}

fn insert_variant(input: &str) -> IResult<&str, InsertVariant> {
    let (input, _) = ws(keyword("INSERT"))(input)?;
    let (input, variant) = opt(preceded(
        ws(keyword("OR")),
        alt((
            map(ws(keyword("UPDATE")), |_| InsertVariant::InsertOrUpdate),
            map(ws(keyword("IGNORE")), |_| InsertVariant::InsertOrIgnore),
        )),
    ))(input)?;
    let (input, _) = opt(ws(keyword("INTO")))(input)?;
    Ok((input, variant.unwrap_or(InsertVariant::Insert)))
}

fn column_list(input: &str) -> IResult<&str, Vec<String>> {
    delimited(
        ws(char('(')),
        separated_list1(ws(char(',')), ws(identifier)),
        ws(char(')')),
    )(input)
}

fn values_rows(input: &str) -> IResult<&str, Vec<Vec<Operand>>> {
    preceded(
        ws(keyword("VALUES")),
        separated_list1(
            ws(char(',')),
            delimited(
                ws(char('(')),
                separated_list1(ws(char(',')), ws(operand)),
                ws(char(')')),
            ),
        ),
    )(input)
}

pub fn classify_insert(sql: &str, body: &str) -> Result<ClassifiedStatement> {
    let (rest, variant) = insert_variant(body)
        .map_err(|_| DriverError::malformed(sql, "expected INSERT"))?;
    let (rest, table) = table_name(sql, rest)?;

    let (rest, columns) = opt(column_list)(rest)
        .map_err(|_| DriverError::malformed(sql, "unparseable column list"))?;
    let columns = columns.unwrap_or_default();

    // INSERT ... SELECT and anything trailing the VALUES list leave rows unknown
    let rows = all_consuming(values_rows)(rest).ok().map(|(_, rows)| rows);
    if let Some(rows) = &rows {
        if !columns.is_empty() {
            if let Some(bad) = rows.iter().find(|row| row.len() != columns.len()) {
                return Err(DriverError::malformed(
                    sql,
                    format!(
                        "VALUES row has {} values for {} columns",
                        bad.len(),
                        columns.len()
                    ),
                ));
            }
        }
    }

    Ok(ClassifiedStatement {
        kind: StatementKind::InsertLikeDml,
        table: Some(table),
        columns,
        version_predicate: None,
        shape: DmlShape::Insert { variant, rows },
    })
}

// Optional alias between the table name and the next clause
fn skip_alias<'a>(input: &'a str, next_clause: &'static str) -> &'a str {
    let parsed: IResult<&str, Option<String>> = opt(preceded(
        opt(ws(keyword("AS"))),
        ws(identifier),
    ))(input);
    match parsed {
        Ok((rest, Some(alias))) if !alias.eq_ignore_ascii_case(next_clause) => rest,
        _ => input,
    }
}

pub fn classify_update(sql: &str, body: &str, version_column: &str) -> Result<ClassifiedStatement> {
    let (rest, _) = ws(keyword("UPDATE"))(body)
        .map_err(|_| DriverError::malformed(sql, "expected UPDATE"))?;
    let (rest, table) = table_name(sql, rest)?;
    let rest = skip_alias(rest, "SET");

    let (rest, _) = ws(keyword("SET"))(rest)
        .map_err(|_| DriverError::malformed(sql, "UPDATE without SET"))?;

    let (set_part, filter) = match find_top_level_keyword(rest, "WHERE") {
        Some(at) => (&rest[..at], parse_filter(&rest[at + "WHERE".len()..])),
        None => (rest, Filter::Absent),
    };

    let assignments = split_top_level_commas(set_part)
        .into_iter()
        .map(|item| {
            parse_assignment(item)
                .ok_or_else(|| DriverError::malformed(sql, format!("unparseable SET item '{}'", item.trim())))
        })
        .collect::<Result<Vec<_>>>()?;
    let columns = assignments.iter().map(|a| a.column().to_string()).collect();
    let version_predicate = find_version_predicate(&filter, version_column);

    Ok(ClassifiedStatement {
        kind: StatementKind::UpdateDml,
        table: Some(table),
        columns,
        version_predicate,
        shape: DmlShape::Update {
            assignments,
            filter,
        },
    })
}

pub fn classify_delete(sql: &str, body: &str, version_column: &str) -> Result<ClassifiedStatement> {
    let (rest, _) = ws(keyword("DELETE"))(body)
        .map_err(|_| DriverError::malformed(sql, "expected DELETE"))?;
    let (rest, _) = opt(ws(keyword("FROM")))(rest)
        .map_err(|_| DriverError::malformed(sql, "expected DELETE FROM"))?;
    let (rest, table) = table_name(sql, rest)?;
    let rest = skip_alias(rest, "WHERE");

    let filter = match find_top_level_keyword(rest, "WHERE") {
        Some(at) if rest[..at].trim().is_empty() => parse_filter(&rest[at + "WHERE".len()..]),
        _ if rest.trim().is_empty() => Filter::Absent,
        _ => Filter::Complex(rest.trim().to_string()),
    };
    let version_predicate = find_version_predicate(&filter, version_column);

    Ok(ClassifiedStatement {
        kind: StatementKind::DeleteDml,
        table: Some(table),
        columns: Vec::new(),
        version_predicate,
        shape: DmlShape::Delete { filter },
    })
}
