use chrono::NaiveDate;
use sqlparser::ast::{self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;
use crate::time::TimeOfDay;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    RegisterPatient {
        id: Ulid,
        active: bool,
    },
    InsertAppointment {
        request: BookingRequest,
    },
    Reschedule {
        id: Ulid,
        changes: Reschedule,
    },
    SetStatus {
        id: Ulid,
        status: AppointmentStatus,
    },
    DeleteAppointment {
        id: Ulid,
    },
    SelectAppointment {
        id: Ulid,
    },
    SelectAppointments {
        scope: Scope,
        date: NaiveDate,
    },
    SelectAvailability {
        clinician_id: Ulid,
        date: NaiveDate,
        duration: u32,
        granularity: Option<u32>,
    },
    SelectConflicts {
        scope: Scope,
        date: NaiveDate,
        start: TimeOfDay,
        end: TimeOfDay,
    },
}

const PATIENT_COLUMNS: &[&str] = &["id", "active"];
const APPOINTMENT_COLUMNS: &[&str] =
    &["id", "patient_id", "date", "start_time", "duration", "kind", "notes"];
const RESCHEDULE_COLUMNS: &[&str] = &["appointment_id", "date", "start_time", "duration"];
const STATUS_COLUMNS: &[&str] = &["appointment_id", "status"];

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(stmt) = stmts.first() else {
        return Err(SqlError::Empty);
    };

    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    match table.as_str() {
        "patients" => {
            let row = Row::from_insert(insert, "patients", PATIENT_COLUMNS)?;
            Ok(Command::RegisterPatient {
                id: parse_ulid(row.required("id")?)?,
                active: row.get("active").map(parse_bool).transpose()?.unwrap_or(true),
            })
        }
        "appointments" => {
            let row = Row::from_insert(insert, "appointments", APPOINTMENT_COLUMNS)?;
            let kind = match row.get("kind") {
                Some(expr) => parse_text(expr)?
                    .parse()
                    .map_err(|e: UnknownVariant| SqlError::Parse(e.to_string()))?,
                None => AppointmentKind::Consultation,
            };
            Ok(Command::InsertAppointment {
                request: BookingRequest {
                    id: parse_ulid(row.required("id")?)?,
                    patient_id: parse_ulid(row.required("patient_id")?)?,
                    date: parse_date(row.required("date")?)?,
                    start: parse_time(row.required("start_time")?)?,
                    duration_minutes: parse_u32(row.required("duration")?)?,
                    kind,
                    notes: row.get("notes").map(parse_text_or_null).transpose()?.flatten(),
                },
            })
        }
        "reschedules" => {
            let row = Row::from_insert(insert, "reschedules", RESCHEDULE_COLUMNS)?;
            let optional = |column| row.get(column).filter(|e| !is_null(e));
            Ok(Command::Reschedule {
                id: parse_ulid(row.required("appointment_id")?)?,
                changes: Reschedule {
                    date: optional("date").map(parse_date).transpose()?,
                    start: optional("start_time").map(parse_time).transpose()?,
                    duration_minutes: optional("duration").map(parse_u32).transpose()?,
                },
            })
        }
        "status_changes" => {
            let row = Row::from_insert(insert, "status_changes", STATUS_COLUMNS)?;
            Ok(Command::SetStatus {
                id: parse_ulid(row.required("appointment_id")?)?,
                status: parse_text(row.required("status")?)?
                    .parse()
                    .map_err(|e: UnknownVariant| SqlError::Parse(e.to_string()))?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    if table != "appointments" {
        return Err(SqlError::UnknownTable(table));
    }
    let filters = Filters::from_selection(delete.selection.as_ref())?;
    Ok(Command::DeleteAppointment {
        id: parse_ulid(filters.required("id")?)?,
    })
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };
    let Some(from) = select.from.first() else {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    };
    let table = table_factor_name(&from.relation)?;
    let filters = Filters::from_selection(select.selection.as_ref())?;

    match table.as_str() {
        "appointments" => {
            if let Some(id) = filters.get("id") {
                return Ok(Command::SelectAppointment { id: parse_ulid(id)? });
            }
            let scope = match (filters.get("clinician_id"), filters.get("patient_id")) {
                (Some(c), _) => Scope::clinician(parse_ulid(c)?),
                (None, Some(p)) => Scope::patient(parse_ulid(p)?),
                (None, None) => return Err(SqlError::MissingFilter("id, clinician_id or patient_id")),
            };
            Ok(Command::SelectAppointments {
                scope,
                date: parse_date(filters.required("date")?)?,
            })
        }
        "availability" => Ok(Command::SelectAvailability {
            clinician_id: parse_ulid(filters.required("clinician_id")?)?,
            date: parse_date(filters.required("date")?)?,
            duration: parse_u32(filters.required("duration")?)?,
            granularity: filters.get("granularity").map(parse_u32).transpose()?,
        }),
        "conflicts" => {
            let kind: ScopeKind = parse_text(filters.required("scope")?)?
                .parse()
                .map_err(|e: UnknownVariant| SqlError::Parse(e.to_string()))?;
            Ok(Command::SelectConflicts {
                scope: Scope {
                    kind,
                    id: parse_ulid(filters.required("scope_id")?)?,
                },
                date: parse_date(filters.required("date")?)?,
                start: parse_time(filters.required("start_time")?)?,
                end: parse_time(filters.required("end_time")?)?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── Rows and filters ──────────────────────────────────────────

/// One VALUES row keyed by column. Without an explicit column list the
/// table's canonical column order applies.
struct Row {
    table: &'static str,
    cells: Vec<(String, Expr)>,
}

impl Row {
    fn from_insert(
        insert: &ast::Insert,
        table: &'static str,
        canonical: &[&str],
    ) -> Result<Self, SqlError> {
        let values = single_values_row(insert)?;
        let columns: Vec<String> = if insert.columns.is_empty() {
            if values.len() > canonical.len() {
                return Err(SqlError::WrongArity(table, canonical.len(), values.len()));
            }
            canonical.iter().map(|c| c.to_string()).collect()
        } else {
            if insert.columns.len() != values.len() {
                return Err(SqlError::WrongArity(table, insert.columns.len(), values.len()));
            }
            insert.columns.iter().map(|c| column_key(&c.to_string())).collect()
        };
        if let Some(unknown) = columns.iter().find(|c| !canonical.contains(&c.as_str())) {
            return Err(SqlError::UnknownColumn(table, unknown.clone()));
        }
        Ok(Self {
            table,
            cells: columns.into_iter().zip(values).collect(),
        })
    }

    fn get(&self, column: &str) -> Option<&Expr> {
        self.cells.iter().find(|(c, _)| c == column).map(|(_, e)| e)
    }

    fn required(&self, column: &'static str) -> Result<&Expr, SqlError> {
        self.get(column)
            .ok_or(SqlError::MissingColumn(self.table, column))
    }
}

/// `col = value` conjuncts of a WHERE clause.
struct Filters(Vec<(String, Expr)>);

impl Filters {
    fn from_selection(selection: Option<&Expr>) -> Result<Self, SqlError> {
        let mut found = Vec::new();
        if let Some(expr) = selection {
            collect_equalities(expr, &mut found)?;
        }
        Ok(Self(found))
    }

    fn get(&self, column: &str) -> Option<&Expr> {
        self.0.iter().find(|(c, _)| c == column).map(|(_, e)| e)
    }

    fn required(&self, column: &'static str) -> Result<&Expr, SqlError> {
        self.get(column).ok_or(SqlError::MissingFilter(column))
    }
}

fn collect_equalities(expr: &Expr, out: &mut Vec<(String, Expr)>) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_equalities(inner, out),
        Expr::BinaryOp { left, op: ast::BinaryOperator::And, right } => {
            collect_equalities(left, out)?;
            collect_equalities(right, out)
        }
        Expr::BinaryOp { left, op: ast::BinaryOperator::Eq, right } => {
            let column = expr_column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
            out.push((column, right.as_ref().clone()));
            Ok(())
        }
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

fn single_values_row(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
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

/// `"Start_Time"` or `a.start_time` -> `start_time`.
fn column_key(rendered: &str) -> String {
    let last = rendered.rsplit('.').next().unwrap_or(rendered);
    last.trim_matches('"').to_lowercase()
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

fn is_null(expr: &Expr) -> bool {
    matches!(extract_value(expr), Some(Value::Null))
}

fn parse_text(expr: &Expr) -> Result<&str, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_text_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    if is_null(expr) {
        return Ok(None);
    }
    parse_text(expr).map(|s| Some(s.to_string()))
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s) | Value::Number(s, _)) => {
            Ulid::from_string(s.trim()).map_err(|e| SqlError::Parse(format!("bad ULID {s:?}: {e}")))
        }
        Some(value) => Err(SqlError::Parse(format!("expected ULID, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_date(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = parse_text(expr)?;
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
        .map_err(|e| SqlError::Parse(format!("bad date {s:?}: {e}")))
}

fn parse_time(expr: &Expr) -> Result<TimeOfDay, SqlError> {
    let s = parse_text(expr)?;
    s.parse()
        .map_err(|e| SqlError::Parse(format!("bad time {s:?}: {e}")))
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
                .trim()
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad integer {s:?}: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value}"))),
        }
    } else if let Expr::UnaryOp { op: ast::UnaryOperator::Minus, expr } = expr {
        Ok(-parse_i64(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr}")))
    }
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of range")))
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

#[derive(Debug, PartialEq, thiserror::Error)]
pub enum SqlError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("empty query")]
    Empty,
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("{0}: unknown column {1}")]
    UnknownColumn(&'static str, String),
    #[error("{0}: expected {1} values, got {2}")]
    WrongArity(&'static str, usize, usize),
    #[error("{0}: missing column {1}")]
    MissingColumn(&'static str, &'static str),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: &str = "01ARZ3NDEKTSV4RRFFQ69G5FAV";
    const P: &str = "01BX5ZZKBKACTAV9WEVGEMMVRZ";

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn insert_patient_defaults_to_active() {
        let cmd = parse_sql(&format!("INSERT INTO patients (id) VALUES ('{P}')")).unwrap();
        assert_eq!(
            cmd,
            Command::RegisterPatient { id: P.parse().unwrap(), active: true }
        );
        let cmd = parse_sql(&format!("INSERT INTO patients VALUES ('{P}', false)")).unwrap();
        assert!(matches!(cmd, Command::RegisterPatient { active: false, .. }));
    }

    #[test]
    fn insert_appointment() {
        let sql = format!(
            "INSERT INTO appointments (id, patient_id, date, start_time, duration, kind, notes) \
             VALUES ('{A}', '{P}', '2026-06-02', '10:00', 60, 'follow_up', 'bring x-rays')"
        );
        match parse_sql(&sql).unwrap() {
            Command::InsertAppointment { request } => {
                assert_eq!(request.id.to_string(), A);
                assert_eq!(request.patient_id.to_string(), P);
                assert_eq!(request.date, date(2026, 6, 2));
                assert_eq!(request.start, TimeOfDay::hm(10, 0));
                assert_eq!(request.duration_minutes, 60);
                assert_eq!(request.kind, AppointmentKind::FollowUp);
                assert_eq!(request.notes.as_deref(), Some("bring x-rays"));
            }
            cmd => panic!("expected InsertAppointment, got {cmd:?}"),
        }
    }

    #[test]
    fn insert_appointment_columns_in_any_order() {
        let sql = format!(
            "INSERT INTO appointments (duration, start_time, date, patient_id, id) \
             VALUES ('30', '09:30', '2026-06-02', '{P}', '{A}')"
        );
        match parse_sql(&sql).unwrap() {
            Command::InsertAppointment { request } => {
                assert_eq!(request.duration_minutes, 30);
                assert_eq!(request.start, TimeOfDay::hm(9, 30));
                assert_eq!(request.kind, AppointmentKind::Consultation);
                assert_eq!(request.notes, None);
            }
            cmd => panic!("expected InsertAppointment, got {cmd:?}"),
        }
    }

    #[test]
    fn insert_appointment_missing_column() {
        let sql = format!("INSERT INTO appointments (id, patient_id) VALUES ('{A}', '{P}')");
        assert_eq!(
            parse_sql(&sql),
            Err(SqlError::MissingColumn("appointments", "date"))
        );
    }

    #[test]
    fn insert_unknown_column_rejected() {
        let sql = format!("INSERT INTO patients (id, name) VALUES ('{P}', 'x')");
        assert!(matches!(parse_sql(&sql), Err(SqlError::UnknownColumn("patients", _))));
    }

    #[test]
    fn reschedule_nulls_keep_fields() {
        let sql = format!(
            "INSERT INTO reschedules (appointment_id, date, start_time, duration) \
             VALUES ('{A}', NULL, '11:15', NULL)"
        );
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::Reschedule {
                id: A.parse().unwrap(),
                changes: Reschedule {
                    date: None,
                    start: Some(TimeOfDay::hm(11, 15)),
                    duration_minutes: None,
                },
            }
        );
    }

    #[test]
    fn status_change() {
        let sql = format!("INSERT INTO status_changes (appointment_id, status) VALUES ('{A}', 'no_show')");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::SetStatus { id: A.parse().unwrap(), status: AppointmentStatus::NoShow }
        );
        let sql = format!("INSERT INTO status_changes VALUES ('{A}', 'rescheduled')");
        assert!(matches!(parse_sql(&sql), Err(SqlError::Parse(_))));
    }

    #[test]
    fn delete_appointment() {
        let cmd = parse_sql(&format!("DELETE FROM appointments WHERE id = '{A}'")).unwrap();
        assert_eq!(cmd, Command::DeleteAppointment { id: A.parse().unwrap() });
        assert!(matches!(
            parse_sql("DELETE FROM appointments"),
            Err(SqlError::MissingFilter("id"))
        ));
    }

    #[test]
    fn select_appointments_by_scope() {
        let cmd = parse_sql(&format!(
            "SELECT * FROM appointments WHERE patient_id = '{P}' AND date = '2026-06-02'"
        ))
        .unwrap();
        assert_eq!(
            cmd,
            Command::SelectAppointments {
                scope: Scope::patient(P.parse().unwrap()),
                date: date(2026, 6, 2),
            }
        );
        let cmd = parse_sql(&format!("SELECT * FROM appointments WHERE id = '{A}'")).unwrap();
        assert_eq!(cmd, Command::SelectAppointment { id: A.parse().unwrap() });
    }

    #[test]
    fn select_availability() {
        let sql = format!(
            "SELECT * FROM availability WHERE clinician_id = '{A}' AND date = '2026-06-02' \
             AND duration = 30 AND granularity = 15"
        );
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::SelectAvailability {
                clinician_id: A.parse().unwrap(),
                date: date(2026, 6, 2),
                duration: 30,
                granularity: Some(15),
            }
        );
    }

    #[test]
    fn select_availability_needs_duration() {
        let sql = format!("SELECT * FROM availability WHERE clinician_id = '{A}' AND date = '2026-06-02'");
        assert_eq!(parse_sql(&sql), Err(SqlError::MissingFilter("duration")));
    }

    #[test]
    fn select_conflicts() {
        let sql = format!(
            "SELECT * FROM conflicts WHERE scope = 'clinician' AND scope_id = '{A}' \
             AND date = '2026-06-02' AND start_time = '10:30' AND end_time = '11:00'"
        );
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::SelectConflicts {
                scope: Scope::clinician(A.parse().unwrap()),
                date: date(2026, 6, 2),
                start: TimeOfDay::hm(10, 30),
                end: TimeOfDay::hm(11, 0),
            }
        );
    }

    #[test]
    fn bad_literals_are_parse_errors() {
        let bad_date = format!("SELECT * FROM appointments WHERE clinician_id = '{A}' AND date = '2026-13-01'");
        assert!(matches!(parse_sql(&bad_date), Err(SqlError::Parse(_))));
        let bad_time = format!(
            "INSERT INTO reschedules VALUES ('{A}', NULL, '25:00', NULL)"
        );
        assert!(matches!(parse_sql(&bad_time), Err(SqlError::Parse(_))));
        let bad_ulid = "DELETE FROM appointments WHERE id = 'nope'";
        assert!(matches!(parse_sql(bad_ulid), Err(SqlError::Parse(_))));
    }

    #[test]
    fn unsupported_shapes() {
        assert!(matches!(
            parse_sql(&format!("SELECT * FROM appointments WHERE id = '{A}' OR id = '{P}'")),
            Err(SqlError::Unsupported(_))
        ));
        assert!(matches!(
            parse_sql(&format!("INSERT INTO patients VALUES ('{A}', true), ('{P}', true)")),
            Err(SqlError::Unsupported(_))
        ));
        assert!(matches!(parse_sql("UPDATE appointments SET notes = 'x'"), Err(SqlError::Unsupported(_))));
    }

    #[test]
    fn unknown_table_errors() {
        let sql = format!("INSERT INTO rooms (id) VALUES ('{A}')");
        assert_eq!(parse_sql(&sql), Err(SqlError::UnknownTable("rooms".into())));
    }

    #[test]
    fn parse_empty_errors() {
        assert!(matches!(parse_sql(""), Err(SqlError::Empty)));
    }
}
