use std::collections::HashMap;
use std::str::FromStr;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use sqlparser::ast::{self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    UpsertProperty {
        id: Ulid,
        name: String,
        max_guests: u32,
        status: PropertyStatus,
    },
    SelectProperties,
    SetPricingPolicy {
        property_id: Ulid,
        policy: PricingPolicy,
    },
    SelectPricingPolicy {
        property_id: Ulid,
    },
    UpsertSeason {
        id: Ulid,
        property_id: Ulid,
        draft: SeasonDraft,
    },
    DeleteSeason {
        property_id: Ulid,
        id: Ulid,
    },
    SelectSeasons {
        property_id: Ulid,
    },
    /// Inclusive `[start, end]`.
    InsertBlock {
        property_id: Ulid,
        start: NaiveDate,
        end: NaiveDate,
        reason: BlockReason,
        note: Option<String>,
    },
    DeleteBlock {
        property_id: Ulid,
        start: NaiveDate,
        end: NaiveDate,
    },
    InsertDayOverride {
        property_id: Ulid,
        start: NaiveDate,
        end: NaiveDate,
        price: Option<Decimal>,
        minimum_stay: Option<u32>,
        note: Option<String>,
    },
    SelectCalendar {
        property_id: Ulid,
        start: NaiveDate,
        end: NaiveDate,
    },
    SelectQuote {
        property_id: Ulid,
        check_in: NaiveDate,
        check_out: NaiveDate,
        guests: u32,
    },
    SelectAvailability {
        property_id: Ulid,
        check_in: NaiveDate,
        check_out: NaiveDate,
        guests: u32,
    },
    InsertReservation {
        request: ReservationRequest,
    },
    SetReservationStatus {
        id: Ulid,
        status: ReservationStatus,
    },
    CancelReservation {
        id: Ulid,
    },
    SelectReservations {
        property_id: Ulid,
    },
    SelectLedgerReport {
        property_id: Ulid,
    },
    Listen {
        channel: String,
    },
    Unlisten {
        channel: String,
    },
    UnlistenAll,
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let trimmed = sql.trim().trim_end_matches(';').trim();
    let upper = trimmed.to_uppercase();
    if upper.starts_with("LISTEN ") {
        let channel = trimmed[7..].trim().trim_matches('"').to_string();
        return Ok(Command::Listen { channel });
    }
    if upper == "UNLISTEN *" || upper == "UNLISTEN" {
        return Ok(Command::UnlistenAll);
    }
    if upper.starts_with("UNLISTEN ") {
        let channel = trimmed[9..].trim().trim_matches('"').to_string();
        return Ok(Command::Unlisten { channel });
    }

    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }

    match &stmts[0] {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

// ── INSERT ────────────────────────────────────────────────────

const PROPERTY_COLUMNS: &[&str] = &["id", "name", "max_guests", "status"];
const POLICY_COLUMNS: &[&str] = &[
    "property_id",
    "base_price",
    "cleaning_fee",
    "security_deposit",
    "minimum_stay",
    "maximum_stay",
    "weekly_discount",
    "monthly_discount",
    "last_minute_discount",
    "early_bird_discount",
    "tax_per_person_per_night",
    "currency",
];
const SEASON_COLUMNS: &[&str] = &["id", "property_id", "name", "start", "end", "price", "minimum_stay", "color"];
const BLOCK_COLUMNS: &[&str] = &["property_id", "start", "end", "reason", "note"];
const OVERRIDE_COLUMNS: &[&str] = &["property_id", "start", "end", "price", "minimum_stay", "note"];
const RESERVATION_COLUMNS: &[&str] = &[
    "property_id",
    "check_in",
    "check_out",
    "guests",
    "name",
    "email",
    "phone",
    "special_requests",
];
const STATUS_COLUMNS: &[&str] = &["id", "status"];

/// One VALUES row keyed by column name. Without a column list, values are taken in
/// the table's canonical column order.
struct Row {
    table: &'static str,
    values: HashMap<String, Expr>,
}

impl Row {
    fn from_insert(insert: &ast::Insert, table: &'static str, canonical: &[&str], required: usize) -> Result<Self, SqlError> {
        let values = extract_insert_values(insert)?;
        let names: Vec<String> = if insert.columns.is_empty() {
            canonical.iter().map(|c| c.to_string()).collect()
        } else {
            insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
        };
        if values.len() > names.len() {
            return Err(SqlError::WrongArity(table, names.len(), values.len()));
        }
        let values: HashMap<String, Expr> = names.into_iter().zip(values).collect();
        for col in &canonical[..required] {
            if !values.contains_key(*col) {
                return Err(SqlError::MissingColumn(table, col.to_string()));
            }
        }
        Ok(Self { table, values })
    }

    fn get(&self, col: &str) -> Option<&Expr> {
        self.values.get(col).filter(|e| !is_null(e))
    }

    fn required(&self, col: &str) -> Result<&Expr, SqlError> {
        self.get(col).ok_or_else(|| SqlError::MissingColumn(self.table, col.to_string()))
    }

    fn ulid(&self, col: &str) -> Result<Ulid, SqlError> {
        parse_ulid_expr(self.required(col)?)
    }

    fn date(&self, col: &str) -> Result<NaiveDate, SqlError> {
        parse_date_expr(self.required(col)?)
    }

    fn string(&self, col: &str) -> Result<String, SqlError> {
        parse_string_expr(self.required(col)?)
    }

    fn u32(&self, col: &str) -> Result<u32, SqlError> {
        parse_u32(self.required(col)?)
    }

    fn opt_string(&self, col: &str) -> Result<Option<String>, SqlError> {
        self.get(col).map(parse_string_expr).transpose()
    }

    fn opt_u32(&self, col: &str) -> Result<Option<u32>, SqlError> {
        self.get(col).map(parse_u32).transpose()
    }

    fn opt_decimal(&self, col: &str) -> Result<Option<Decimal>, SqlError> {
        self.get(col).map(parse_decimal_expr).transpose()
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;

    match table.as_str() {
        "properties" => {
            let row = Row::from_insert(insert, "properties", PROPERTY_COLUMNS, 3)?;
            let status = match row.opt_string("status")? {
                Some(s) => PropertyStatus::parse(&s).ok_or_else(|| SqlError::BadValue(format!("property status {s}")))?,
                None => PropertyStatus::Active,
            };
            Ok(Command::UpsertProperty {
                id: row.ulid("id")?,
                name: row.string("name")?,
                max_guests: row.u32("max_guests")?,
                status,
            })
        }
        "pricing_policies" => {
            let row = Row::from_insert(insert, "pricing_policies", POLICY_COLUMNS, 1)?;
            let d = PricingPolicy::default();
            let policy = PricingPolicy {
                base_price: row.opt_decimal("base_price")?.unwrap_or(d.base_price),
                currency: row.opt_string("currency")?.unwrap_or(d.currency),
                cleaning_fee: row.opt_decimal("cleaning_fee")?.unwrap_or(d.cleaning_fee),
                security_deposit: row.opt_decimal("security_deposit")?.unwrap_or(d.security_deposit),
                minimum_stay: row.opt_u32("minimum_stay")?.unwrap_or(d.minimum_stay),
                maximum_stay: row.opt_u32("maximum_stay")?.unwrap_or(d.maximum_stay),
                weekly_discount: row.opt_decimal("weekly_discount")?.unwrap_or(d.weekly_discount),
                monthly_discount: row.opt_decimal("monthly_discount")?.unwrap_or(d.monthly_discount),
                last_minute_discount: row.opt_decimal("last_minute_discount")?.unwrap_or(d.last_minute_discount),
                early_bird_discount: row.opt_decimal("early_bird_discount")?.unwrap_or(d.early_bird_discount),
                tax_per_person_per_night: row
                    .opt_decimal("tax_per_person_per_night")?
                    .unwrap_or(d.tax_per_person_per_night),
                updated_at: None,
            };
            Ok(Command::SetPricingPolicy {
                property_id: row.ulid("property_id")?,
                policy,
            })
        }
        "seasons" => {
            let row = Row::from_insert(insert, "seasons", SEASON_COLUMNS, 7)?;
            Ok(Command::UpsertSeason {
                id: row.ulid("id")?,
                property_id: row.ulid("property_id")?,
                draft: SeasonDraft {
                    name: row.string("name")?,
                    start: row.date("start")?,
                    end: row.date("end")?,
                    price: parse_decimal_expr(row.required("price")?)?,
                    minimum_stay: row.u32("minimum_stay")?,
                    color: row.opt_string("color")?.unwrap_or_else(|| DEFAULT_SEASON_COLOR.to_string()),
                },
            })
        }
        "blocks" => {
            let row = Row::from_insert(insert, "blocks", BLOCK_COLUMNS, 3)?;
            let reason = match row.opt_string("reason")? {
                Some(s) => BlockReason::parse(&s).ok_or_else(|| SqlError::BadValue(format!("block reason {s}")))?,
                None => BlockReason::Blocked,
            };
            Ok(Command::InsertBlock {
                property_id: row.ulid("property_id")?,
                start: row.date("start")?,
                end: row.date("end")?,
                reason,
                note: row.opt_string("note")?,
            })
        }
        "day_overrides" => {
            let row = Row::from_insert(insert, "day_overrides", OVERRIDE_COLUMNS, 3)?;
            Ok(Command::InsertDayOverride {
                property_id: row.ulid("property_id")?,
                start: row.date("start")?,
                end: row.date("end")?,
                price: row.opt_decimal("price")?,
                minimum_stay: row.opt_u32("minimum_stay")?,
                note: row.opt_string("note")?,
            })
        }
        "reservations" => {
            let row = Row::from_insert(insert, "reservations", RESERVATION_COLUMNS, 7)?;
            Ok(Command::InsertReservation {
                request: ReservationRequest {
                    property_id: row.ulid("property_id")?,
                    check_in: row.date("check_in")?,
                    check_out: row.date("check_out")?,
                    guests: row.u32("guests")?,
                    guest: GuestContact {
                        name: row.string("name")?,
                        email: row.string("email")?,
                        phone: row.string("phone")?,
                    },
                    special_requests: row.opt_string("special_requests")?,
                },
            })
        }
        "reservation_status" => {
            let row = Row::from_insert(insert, "reservation_status", STATUS_COLUMNS, 2)?;
            let s = row.string("status")?;
            Ok(Command::SetReservationStatus {
                id: row.ulid("id")?,
                status: ReservationStatus::parse(&s).ok_or_else(|| SqlError::BadValue(format!("reservation status {s}")))?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── DELETE ────────────────────────────────────────────────────

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let filters = Filters::from_selection(delete.selection.as_ref())?;

    match table.as_str() {
        "reservations" => Ok(Command::CancelReservation {
            id: filters.ulid("id")?,
        }),
        "seasons" => Ok(Command::DeleteSeason {
            property_id: filters.ulid("property_id")?,
            id: filters.ulid("id")?,
        }),
        "blocks" => Ok(Command::DeleteBlock {
            property_id: filters.ulid("property_id")?,
            start: filters.date("start")?,
            end: filters.date("end")?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── SELECT ────────────────────────────────────────────────────

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    let table = table_factor_name(&select.from[0].relation)?;
    let filters = Filters::from_selection(select.selection.as_ref())?;

    match table.as_str() {
        "properties" => Ok(Command::SelectProperties),
        "pricing_policies" => Ok(Command::SelectPricingPolicy {
            property_id: filters.ulid("property_id")?,
        }),
        "seasons" => Ok(Command::SelectSeasons {
            property_id: filters.ulid("property_id")?,
        }),
        "calendar" => Ok(Command::SelectCalendar {
            property_id: filters.ulid("property_id")?,
            start: filters.date("start")?,
            end: filters.date("end")?,
        }),
        "quote" => Ok(Command::SelectQuote {
            property_id: filters.ulid("property_id")?,
            check_in: filters.date("check_in")?,
            check_out: filters.date("check_out")?,
            guests: filters.u32("guests")?,
        }),
        "availability" => Ok(Command::SelectAvailability {
            property_id: filters.ulid("property_id")?,
            check_in: filters.date("check_in")?,
            check_out: filters.date("check_out")?,
            guests: filters.u32("guests")?,
        }),
        "reservations" => Ok(Command::SelectReservations {
            property_id: filters.ulid("property_id")?,
        }),
        "ledger_report" => Ok(Command::SelectLedgerReport {
            property_id: filters.ulid("property_id")?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// `col = v`, `start >= v` and `"end" <= v` terms of an AND-chain, keyed by column.
/// Other terms are ignored.
struct Filters {
    values: HashMap<String, Expr>,
}

impl Filters {
    fn from_selection(selection: Option<&Expr>) -> Result<Self, SqlError> {
        let mut values = HashMap::new();
        if let Some(expr) = selection {
            collect_filters(expr, &mut values);
        }
        Ok(Self { values })
    }

    fn required(&self, col: &'static str) -> Result<&Expr, SqlError> {
        self.values.get(col).ok_or(SqlError::MissingFilter(col))
    }

    fn ulid(&self, col: &'static str) -> Result<Ulid, SqlError> {
        parse_ulid_expr(self.required(col)?)
    }

    fn date(&self, col: &'static str) -> Result<NaiveDate, SqlError> {
        parse_date_expr(self.required(col)?)
    }

    fn u32(&self, col: &'static str) -> Result<u32, SqlError> {
        parse_u32(self.required(col)?)
    }
}

fn collect_filters(expr: &Expr, out: &mut HashMap<String, Expr>) {
    match expr {
        Expr::Nested(inner) => collect_filters(inner, out),
        Expr::BinaryOp { left, op, right } => match op {
            ast::BinaryOperator::And => {
                collect_filters(left, out);
                collect_filters(right, out);
            }
            ast::BinaryOperator::Eq => {
                if let Some(col) = expr_column_name(left) {
                    out.insert(col, (**right).clone());
                }
            }
            ast::BinaryOperator::GtEq => {
                if let Some(col) = expr_column_name(left).filter(|c| c == "start") {
                    out.insert(col, (**right).clone());
                }
            }
            ast::BinaryOperator::LtEq => {
                if let Some(col) = expr_column_name(left).filter(|c| c == "end") {
                    out.insert(col, (**right).clone());
                }
            }
            _ => {}
        },
        _ => {}
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

fn extract_insert_values(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.len() {
            0 => Err(SqlError::Parse("empty VALUES".into())),
            1 => Ok(values.rows[0].clone()),
            _ => Err(SqlError::Unsupported("multi-row VALUES".into())),
        },
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

/// Look through `'..'::date` style casts and parentheses.
fn unwrap_expr(expr: &Expr) -> &Expr {
    match expr {
        Expr::Cast { expr, .. } | Expr::Nested(expr) => unwrap_expr(expr),
        other => other,
    }
}

fn extract_value(expr: &Expr) -> Option<&Value> {
    match unwrap_expr(expr) {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        _ => None,
    }
}

fn is_null(expr: &Expr) -> bool {
    matches!(extract_value(expr), Some(Value::Null))
}

fn parse_string_expr(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) | Some(Value::DoubleQuotedString(s)) | Some(Value::Number(s, _)) => {
            Ok(s.clone())
        }
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = parse_string_expr(expr)?;
    Ulid::from_string(&s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
}

fn parse_date_expr(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = parse_string_expr(expr)?;
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").map_err(|e| SqlError::Parse(format!("bad date {s}: {e}")))
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad i64: {e}"))),
            Value::SingleQuotedString(s) => s
                .trim()
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad i64: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value:?}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = unwrap_expr(expr)
    {
        Ok(-parse_i64_expr(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64_expr(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
}

fn parse_decimal_expr(expr: &Expr) -> Result<Decimal, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => {
                Decimal::from_str(s.trim()).map_err(|e| SqlError::Parse(format!("bad decimal {s}: {e}")))
            }
            _ => Err(SqlError::Parse(format!("expected number, got {value:?}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = unwrap_expr(expr)
    {
        Ok(-parse_decimal_expr(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum SqlError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("empty query")]
    Empty,
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("{0}: expected at most {1} values, got {2}")]
    WrongArity(&'static str, usize, usize),
    #[error("{0}: missing column {1}")]
    MissingColumn(&'static str, String),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
    #[error("bad value: {0}")]
    BadValue(String),
}
