use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor,
    TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertBooking {
        booking: NewBooking,
    },
    UpdateBooking {
        id: Ulid,
        patch: BookingPatch,
    },
    DeleteBooking {
        id: Ulid,
    },
    /// `SELECT * FROM bookings [WHERE date = ...]`, scoped to the connection's tenant.
    SelectBookings {
        date: Option<String>,
    },
    SelectBookingsByMaster {
        master: String,
    },
    SelectBookingsByPhone {
        phone: String,
    },
    SelectAvailability {
        query: AvailabilityQuery,
    },
}

/// Booking columns a client may write, in positional INSERT order.
const BOOKING_COLUMNS: [&str; 8] = [
    "name",
    "phone",
    "service",
    "master",
    "date",
    "start_time",
    "end_time",
    "comment",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Column {
    Name,
    Phone,
    Service,
    Master,
    Date,
    StartTime,
    EndTime,
    Comment,
}

fn booking_column(name: &str) -> Result<Column, SqlError> {
    match name {
        "name" | "client_name" => Ok(Column::Name),
        "phone" | "client_phone" => Ok(Column::Phone),
        "service" | "service_name" => Ok(Column::Service),
        "master" => Ok(Column::Master),
        "date" => Ok(Column::Date),
        "start_time" | "time" => Ok(Column::StartTime),
        "end_time" => Ok(Column::EndTime),
        "comment" => Ok(Column::Comment),
        other => Err(SqlError::UnknownColumn(other.to_string())),
    }
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }

    match &stmts[0] {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(&table.relation, assignments, selection),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    if table != "bookings" {
        return Err(SqlError::UnknownTable(table));
    }

    let rows = extract_insert_rows(insert)?;
    if rows.len() != 1 {
        return Err(SqlError::Unsupported("multi-row INSERT into bookings".into()));
    }
    let values = &rows[0];

    let columns: Vec<String> = if insert.columns.is_empty() {
        BOOKING_COLUMNS.iter().map(|c| c.to_string()).collect()
    } else {
        insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
    };
    if values.len() != columns.len() {
        return Err(SqlError::WrongArity("bookings", columns.len(), values.len()));
    }

    let mut booking = NewBooking::default();
    for (column, expr) in columns.iter().zip(values) {
        let value = text_value(expr)?;
        match booking_column(column)? {
            Column::Name => booking.client_name = value.unwrap_or_default(),
            Column::Phone => booking.client_phone = value.unwrap_or_default(),
            Column::Service => booking.service_name = value.unwrap_or_default(),
            Column::Master => booking.master = value,
            Column::Date => booking.date = value.unwrap_or_default(),
            Column::StartTime => booking.start_time = value.unwrap_or_default(),
            Column::EndTime => booking.end_time = value,
            Column::Comment => booking.comment = value,
        }
    }
    Ok(Command::InsertBooking { booking })
}

fn parse_update(
    relation: &TableFactor,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(relation)?;
    if table != "bookings" {
        return Err(SqlError::UnknownTable(table));
    }
    let id = extract_where_id(selection)?;

    let mut patch = BookingPatch::default();
    for assignment in assignments {
        let column = match &assignment.target {
            AssignmentTarget::ColumnName(name) => object_name_last(name)
                .ok_or_else(|| SqlError::Parse("empty column name".into()))?,
            AssignmentTarget::Tuple(_) => {
                return Err(SqlError::Unsupported("tuple assignment".into()));
            }
        };
        let value = text_value(&assignment.value)?;
        let target = booking_column(&column)?;
        // NULL clears optional fields; required ones cannot be nulled.
        let value = match (target, value) {
            (_, Some(v)) => v,
            (Column::Master | Column::Comment, None) => String::new(),
            (_, None) => return Err(SqlError::NullNotAllowed(column)),
        };
        match target {
            Column::Name => patch.client_name = Some(value),
            Column::Phone => patch.client_phone = Some(value),
            Column::Service => patch.service_name = Some(value),
            Column::Master => patch.master = Some(value),
            Column::Date => patch.date = Some(value),
            Column::StartTime => patch.start_time = Some(value),
            Column::EndTime => patch.end_time = Some(value),
            Column::Comment => patch.comment = Some(value),
        }
    }
    Ok(Command::UpdateBooking { id, patch })
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    if table != "bookings" {
        return Err(SqlError::UnknownTable(table));
    }
    let id = extract_where_id(&delete.selection)?;
    Ok(Command::DeleteBooking { id })
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    let table = table_factor_name(&select.from[0].relation)?;

    let mut filters = Filters::default();
    if let Some(selection) = &select.selection {
        collect_filters(selection, &mut filters)?;
    }

    match table.as_str() {
        "bookings" => {
            let date = filters.take("date")?;
            filters.finish()?;
            Ok(Command::SelectBookings { date })
        }
        "master_bookings" => {
            let master = filters.take("master")?.ok_or(SqlError::MissingFilter("master"))?;
            filters.finish()?;
            Ok(Command::SelectBookingsByMaster { master })
        }
        "client_bookings" => {
            let phone = filters.take("phone")?.ok_or(SqlError::MissingFilter("phone"))?;
            filters.finish()?;
            Ok(Command::SelectBookingsByPhone { phone })
        }
        "availability" => {
            let date = filters.take("date")?.ok_or(SqlError::MissingFilter("date"))?;
            let start_time = filters
                .take("start_time")?
                .ok_or(SqlError::MissingFilter("start_time"))?;
            let end_time = filters.take("end_time")?;
            let master = filters.take("master")?;
            let exclude_id = filters
                .take("exclude_id")?
                .map(|s| parse_ulid_str(&s))
                .transpose()?;
            filters.finish()?;
            Ok(Command::SelectAvailability {
                query: AvailabilityQuery {
                    date,
                    start_time,
                    end_time,
                    master,
                    exclude_id,
                },
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// `column = value` pairs from a WHERE clause joined with AND.
#[derive(Default)]
struct Filters {
    pairs: Vec<(String, Option<String>)>,
}

impl Filters {
    /// Remove and return the value for `column`. NULL reads as absent.
    fn take(&mut self, column: &'static str) -> Result<Option<String>, SqlError> {
        let mut found = self
            .pairs
            .iter()
            .enumerate()
            .filter(|(_, (c, _))| c == column)
            .map(|(i, _)| i);
        let Some(pos) = found.next() else {
            return Ok(None);
        };
        if found.next().is_some() {
            return Err(SqlError::Parse(format!("duplicate filter: {column}")));
        }
        Ok(self.pairs.remove(pos).1)
    }

    /// Any filter left over is one the table does not support.
    fn finish(self) -> Result<(), SqlError> {
        match self.pairs.into_iter().next() {
            Some((column, _)) => Err(SqlError::Unsupported(format!("filter on {column}"))),
            None => Ok(()),
        }
    }
}

fn collect_filters(expr: &Expr, filters: &mut Filters) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_filters(inner, filters),
        Expr::BinaryOp { left, op, right } => match op {
            ast::BinaryOperator::And => {
                collect_filters(left, filters)?;
                collect_filters(right, filters)
            }
            ast::BinaryOperator::Eq => {
                let column = expr_column_name(left)
                    .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
                filters.pairs.push((column, text_value(right)?));
                Ok(())
            }
            _ => Err(SqlError::Unsupported(format!("operator {op}"))),
        },
        other => Err(SqlError::Unsupported(format!("filter {other}"))),
    }
}

// ── Helpers ───────────────────────────────────────────────────

fn object_name_last(name: &ast::ObjectName) -> Option<String> {
    name.0.last().and_then(|part| match part {
        ObjectNamePart::Identifier(ident) => Some(ident.value.to_lowercase()),
        _ => None,
    })
}

fn insert_table_name(insert: &ast::Insert) -> Result<String, SqlError> {
    match &insert.table {
        TableObject::TableName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("unsupported table object in INSERT".into())),
    }
}

fn delete_table_name(delete: &ast::Delete) -> Result<String, SqlError> {
    let tables_with_joins = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    if let Some(first) = tables_with_joins.first() {
        table_factor_name(&first.relation)
    } else {
        Err(SqlError::Parse("DELETE without table".into()))
    }
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn extract_insert_rows(insert: &ast::Insert) -> Result<&[Vec<Expr>], SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => {
            if values.rows.is_empty() {
                return Err(SqlError::Parse("empty VALUES".into()));
            }
            Ok(&values.rows)
        }
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;
    match sel {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } if expr_column_name(left).as_deref() == Some("id") => {
            let text = text_value(right)?.ok_or(SqlError::MissingFilter("id"))?;
            parse_ulid_str(&text)
        }
        _ => Err(SqlError::MissingFilter("id")),
    }
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

fn extract_value(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        _ => None,
    }
}

/// Literal as text; `None` for NULL. Numbers keep their source spelling.
fn text_value(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) | Some(Value::Number(s, _)) => Ok(Some(s.clone())),
        Some(Value::Boolean(b)) => Ok(Some(b.to_string())),
        Some(Value::Null) => Ok(None),
        Some(other) => Err(SqlError::Parse(format!("expected string, got {other}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_ulid_str(s: &str) -> Result<Ulid, SqlError> {
    Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    UnknownColumn(String),
    NullNotAllowed(String),
    WrongArity(&'static str, usize, usize),
    MissingFilter(&'static str),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::UnknownColumn(c) => write!(f, "unknown column: {c}"),
            SqlError::NullNotAllowed(c) => write!(f, "column {c} cannot be NULL"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
