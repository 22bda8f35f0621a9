use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor,
    TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;

use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    RegisterVehicle {
        id: VehicleId,
        make: String,
        model: String,
        registration: String,
        /// Present when the statement carries location, charge level and
        /// cleanliness.
        condition: Option<VehicleCondition>,
    },
    CreateBooking {
        vehicle_id: VehicleId,
        user_id: UserId,
        start: Ms,
        end: Ms,
    },
    ModifyBooking {
        id: BookingId,
        start: Ms,
        end: Ms,
    },
    CancelBooking {
        id: BookingId,
    },
    SelectVehicles {
        available: Option<bool>,
    },
    SelectBookings {
        owner: BookingOwner,
        filter: StatusFilter,
    },
    SelectRentalHistory {
        user_id: UserId,
    },
    SelectVehicleStatus {
        vehicle_id: VehicleId,
    },
}

/// Which side of a booking a SELECT is keyed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BookingOwner {
    Vehicle(VehicleId),
    User(UserId),
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.len() > 1 {
        return Err(SqlError::Unsupported("multiple statements per line".into()));
    }
    let Some(stmt) = stmts.first() else {
        return Err(SqlError::Empty);
    };

    match stmt {
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
    let values = extract_insert_values(insert)?;

    match table.as_str() {
        "vehicles" => {
            let condition = match values.len() {
                4 => None,
                7 => Some(VehicleCondition {
                    location: parse_string(&values[4])?,
                    charge_level: parse_charge_level(&values[5])?,
                    cleanliness: parse_string(&values[6])?
                        .parse()
                        .map_err(SqlError::Parse)?,
                }),
                n => return Err(SqlError::WrongArity("vehicles", 4, n)),
            };
            Ok(Command::RegisterVehicle {
                id: parse_u64(&values[0])?,
                make: parse_string(&values[1])?,
                model: parse_string(&values[2])?,
                registration: parse_string(&values[3])?,
                condition,
            })
        }
        "bookings" => {
            if values.len() != 4 {
                return Err(SqlError::WrongArity("bookings", 4, values.len()));
            }
            Ok(Command::CreateBooking {
                vehicle_id: parse_u64(&values[0])?,
                user_id: parse_u64(&values[1])?,
                start: parse_i64_expr(&values[2])?,
                end: parse_i64_expr(&values[3])?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
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

    let (mut start, mut end) = (None, None);
    for assignment in assignments {
        let column = match &assignment.target {
            AssignmentTarget::ColumnName(name) => object_name_last(name),
            AssignmentTarget::Tuple(_) => None,
        };
        match column.as_deref() {
            Some("start_time") => start = Some(parse_i64_expr(&assignment.value)?),
            Some("end_time") => end = Some(parse_i64_expr(&assignment.value)?),
            Some(other) => return Err(SqlError::Unsupported(format!("SET {other}"))),
            None => return Err(SqlError::Parse("bad SET target".into())),
        }
    }

    Ok(Command::ModifyBooking {
        id: extract_where_id(selection)?,
        start: start.ok_or(SqlError::MissingColumn("start_time"))?,
        end: end.ok_or(SqlError::MissingColumn("end_time"))?,
    })
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "bookings" => Ok(Command::CancelBooking { id }),
        _ => Err(SqlError::UnknownTable(table)),
    }
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

    let mut filters = Vec::new();
    if let Some(selection) = &select.selection {
        collect_eq_filters(selection, &mut filters)?;
    }
    let find = |col: &str| filters.iter().find(|(c, _)| c == col).map(|(_, e)| *e);

    match table.as_str() {
        "vehicles" => {
            let available = find("is_available").map(parse_bool).transpose()?;
            Ok(Command::SelectVehicles { available })
        }
        "bookings" => {
            let owner = match (find("vehicle_id"), find("user_id")) {
                (Some(v), None) => BookingOwner::Vehicle(parse_u64(v)?),
                (None, Some(u)) => BookingOwner::User(parse_u64(u)?),
                (Some(_), Some(_)) => {
                    return Err(SqlError::Unsupported(
                        "filter on both vehicle_id and user_id".into(),
                    ));
                }
                (None, None) => return Err(SqlError::MissingFilter("vehicle_id or user_id")),
            };
            let filter = match find("status") {
                Some(expr) => parse_status_filter(expr)?,
                None => StatusFilter::Any,
            };
            Ok(Command::SelectBookings { owner, filter })
        }
        "vehicle_status" => {
            let vehicle_id = find("vehicle_id").ok_or(SqlError::MissingFilter("vehicle_id"))?;
            Ok(Command::SelectVehicleStatus {
                vehicle_id: parse_u64(vehicle_id)?,
            })
        }
        "rental_history" => {
            let user_id = find("user_id").ok_or(SqlError::MissingFilter("user_id"))?;
            Ok(Command::SelectRentalHistory {
                user_id: parse_u64(user_id)?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Flatten `a = x AND b = y ...` into `(column, value)` pairs. Any other
/// predicate shape is rejected rather than silently ignored.
fn collect_eq_filters<'a>(expr: &'a Expr, out: &mut Vec<(String, &'a Expr)>) -> Result<(), SqlError> {
    match expr {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::And,
            right,
        } => {
            collect_eq_filters(left, out)?;
            collect_eq_filters(right, out)
        }
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => {
            let col = expr_column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("WHERE {expr}")))?;
            out.push((col, right.as_ref()));
            Ok(())
        }
        Expr::Nested(inner) => collect_eq_filters(inner, out),
        _ => Err(SqlError::Unsupported(format!("WHERE {expr}"))),
    }
}

fn parse_status_filter(expr: &Expr) -> Result<StatusFilter, SqlError> {
    let s = parse_string(expr)?;
    match s.to_ascii_lowercase().as_str() {
        "active" => Ok(StatusFilter::Active),
        "any" | "all" => Ok(StatusFilter::Any),
        other => other
            .parse::<BookingStatus>()
            .map(StatusFilter::Only)
            .map_err(SqlError::Parse),
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
    match tables_with_joins.first() {
        Some(first) => table_factor_name(&first.relation),
        None => Err(SqlError::Parse("DELETE without table".into())),
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

fn extract_insert_values(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [] => Err(SqlError::Parse("empty VALUES".into())),
            [row] => Ok(row.clone()),
            _ => Err(SqlError::Unsupported("multi-row INSERT".into())),
        },
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn extract_where_id(selection: &Option<Expr>) -> Result<u64, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;
    match sel {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } if expr_column_name(left).as_deref() == Some("id") => parse_u64(right),
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

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad integer {s}: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64_expr(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr}")))
    }
}

fn parse_u64(expr: &Expr) -> Result<u64, SqlError> {
    let v = parse_i64_expr(expr)?;
    u64::try_from(v).map_err(|_| SqlError::Parse(format!("{v} is not a valid id")))
}

fn parse_charge_level(expr: &Expr) -> Result<u8, SqlError> {
    let v = parse_i64_expr(expr)?;
    u8::try_from(v).map_err(|_| SqlError::Parse(format!("{v} is not a valid charge level")))
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    match extract_value(expr) {
        Some(Value::Boolean(b)) => Ok(*b),
        Some(Value::SingleQuotedString(s)) => match s.to_lowercase().as_str() {
            "true" | "t" | "1" => Ok(true),
            "false" | "f" | "0" => Ok(false),
            _ => Err(SqlError::Parse(format!("bad bool: {s}"))),
        },
        Some(Value::Number(n, _)) => Ok(n != "0"),
        Some(value) => Err(SqlError::Parse(format!("expected bool, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, PartialEq)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    WrongArity(&'static str, usize, usize),
    MissingFilter(&'static str),
    MissingColumn(&'static str),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
            SqlError::MissingColumn(col) => write!(f, "missing SET column: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
