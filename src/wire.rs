use std::fmt::Debug;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::stream;
use futures::Sink;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo,
    QueryResponse, Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use ulid::Ulid;

use crate::auth::{clinician_from_user, CareSchedAuthSource};
use crate::engine::{Engine, SchedulingError};
use crate::model::*;
use crate::observability::{self, command_label};
use crate::practice::PracticeManager;
use crate::sql::{self, Command};

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub struct CareSchedHandler {
    practices: Arc<PracticeManager>,
    query_parser: Arc<CareSchedQueryParser>,
}

impl CareSchedHandler {
    pub fn new(practices: Arc<PracticeManager>) -> Self {
        Self {
            practices,
            query_parser: Arc::new(CareSchedQueryParser),
        }
    }

    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.practices.get_or_create(&db).map_err(|e| {
            metrics::counter!(observability::AUTH_FAILURES_TOTAL, "reason" => "practice")
                .increment(1);
            user_error("08006", format!("practice error: {e}"))
        })
    }

    /// Startup already refused user names that are not clinician ids.
    fn resolve_caller<C: ClientInfo>(&self, client: &C) -> PgWireResult<Ulid> {
        clinician_from_user(client.metadata().get("user").map(String::as_str))
    }

    async fn run<C: ClientInfo>(&self, client: &C, query: &str) -> PgWireResult<Vec<Response>> {
        let engine = self.resolve_engine(client)?;
        let caller = self.resolve_caller(client)?;
        let cmd = sql::parse_sql(query).map_err(sql_err)?;

        let label = command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(&engine, cmd, caller).await;
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        result
    }

    async fn execute_command(
        &self,
        engine: &Engine,
        cmd: Command,
        caller: Ulid,
    ) -> PgWireResult<Vec<Response>> {
        match cmd {
            Command::RegisterPatient { id, active } => {
                engine.register_patient(id, active).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::InsertAppointment { request } => {
                engine
                    .create_appointment(request, caller)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::Reschedule { id, changes } => {
                engine
                    .reschedule_appointment(id, changes, caller)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::SetStatus { id, status } => {
                engine
                    .set_appointment_status(id, status, caller)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::DeleteAppointment { id } => {
                engine.delete_appointment(id, caller).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::SelectAppointment { id } => {
                let found: Vec<_> = engine.get_appointment(&id).into_iter().collect();
                Ok(vec![appointments_response(&found)?])
            }
            Command::SelectAppointments { scope, date } => {
                let found = engine.list_appointments(scope, date);
                Ok(vec![appointments_response(&found)?])
            }
            Command::SelectAvailability {
                clinician_id,
                date,
                duration,
                granularity,
            } => {
                let slots = engine
                    .list_availability(clinician_id, date, duration, granularity)
                    .await
                    .map_err(engine_err)?;

                let schema = Arc::new(availability_schema());
                let cid_str = clinician_id.to_string();
                let date_str = date.to_string();
                let rows: Vec<PgWireResult<_>> = slots
                    .map(|start| {
                        let end = start.add_minutes(duration).map_err(api_err)?;
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&cid_str)?;
                        encoder.encode_field(&date_str)?;
                        encoder.encode_field(&start.to_string())?;
                        encoder.encode_field(&end.to_string())?;
                        Ok(encoder.take_row())
                    })
                    .collect();

                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::SelectConflicts {
                scope,
                date,
                start,
                end,
            } => {
                let conflict = engine
                    .find_conflicts(scope.kind, scope.id, date, start, end)
                    .await
                    .map_err(engine_err)?;

                let schema = Arc::new(conflicts_schema());
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&conflict)?;
                let rows = vec![Ok(encoder.take_row())];
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
        }
    }
}

fn appointments_response(appointments: &[Appointment]) -> PgWireResult<Response> {
    let schema = Arc::new(appointments_schema());
    let rows: Vec<PgWireResult<_>> = appointments
        .iter()
        .map(|a| {
            let end = a.end().map_err(api_err)?;
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&a.id.to_string())?;
            encoder.encode_field(&a.patient_id.to_string())?;
            encoder.encode_field(&a.clinician_id.to_string())?;
            encoder.encode_field(&a.date.to_string())?;
            encoder.encode_field(&a.start.to_string())?;
            encoder.encode_field(&end.to_string())?;
            encoder.encode_field(&(a.duration_minutes as i32))?;
            encoder.encode_field(&a.status.as_str())?;
            encoder.encode_field(&a.kind.as_str())?;
            encoder.encode_field(&a.notes)?;
            encoder.encode_field(&a.created_at.format(TIMESTAMP_FORMAT).to_string())?;
            encoder.encode_field(&a.updated_at.format(TIMESTAMP_FORMAT).to_string())?;
            encoder.encode_field(&(a.version as i64))?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(
        schema,
        stream::iter(rows),
    )))
}

fn text_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn appointments_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("patient_id"),
        text_field("clinician_id"),
        text_field("date"),
        text_field("start_time"),
        text_field("end_time"),
        FieldInfo::new("duration".into(), None, None, Type::INT4, FieldFormat::Text),
        text_field("status"),
        text_field("kind"),
        text_field("notes"),
        text_field("created_at"),
        text_field("updated_at"),
        FieldInfo::new("version".into(), None, None, Type::INT8, FieldFormat::Text),
    ]
}

fn availability_schema() -> Vec<FieldInfo> {
    vec![
        text_field("clinician_id"),
        text_field("date"),
        text_field("start_time"),
        text_field("end_time"),
    ]
}

fn conflicts_schema() -> Vec<FieldInfo> {
    vec![FieldInfo::new(
        "has_conflict".into(),
        None,
        None,
        Type::BOOL,
        FieldFormat::Text,
    )]
}

/// Row shape of a statement, guessed from its text before it runs.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let upper = sql.to_uppercase();
    if !upper.contains("SELECT") {
        vec![]
    } else if upper.contains("AVAILABILITY") {
        availability_schema()
    } else if upper.contains("CONFLICTS") {
        conflicts_schema()
    } else if upper.contains("APPOINTMENTS") {
        appointments_schema()
    } else {
        vec![]
    }
}

#[async_trait]
impl SimpleQueryHandler for CareSchedHandler {
    async fn do_query<C>(
        &self,
        client: &mut C,
        query: &str,
    ) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        self.run(client, query).await
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct CareSchedQueryParser;

#[async_trait]
impl QueryParser for CareSchedQueryParser {
    type Statement = String;

    async fn parse_sql<C>(
        &self,
        _client: &C,
        sql: &str,
        _types: &[Option<Type>],
    ) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(
        &self,
        stmt: &String,
        _column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        Ok(result_schema(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for CareSchedHandler {
    type Statement = String;
    type QueryParser = CareSchedQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let sql = substitute_params(portal);
        let mut responses = self.run(client, &sql).await?;
        Ok(responses.remove(0))
    }

    async fn do_describe_statement<C>(
        &self,
        _client: &mut C,
        target: &StoredStatement<Self::Statement>,
    ) -> PgWireResult<DescribeStatementResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let param_types = vec![Type::VARCHAR; count_params(&target.statement)];
        Ok(DescribeStatementResponse::new(
            param_types,
            result_schema(&target.statement),
        ))
    }

    async fn do_describe_portal<C>(
        &self,
        _client: &mut C,
        target: &Portal<Self::Statement>,
    ) -> PgWireResult<DescribePortalResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(DescribePortalResponse::new(result_schema(
            &target.statement.statement,
        )))
    }
}

/// Highest $N placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    let bytes = sql.as_bytes();
    let mut max = 0usize;
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'$' {
            i += 1;
            continue;
        }
        i += 1;
        let start = i;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
        if let Ok(n) = sql[start..i].parse::<usize>() {
            max = max.max(n);
        }
    }
    max
}

/// Inline bound text parameters as quoted literals. Highest index first so
/// `$1` never clobbers the prefix of `$10`.
fn substitute_params(portal: &Portal<String>) -> String {
    let mut result = portal.statement.statement.to_string();
    for (i, param) in portal.parameters.iter().enumerate().rev() {
        let placeholder = format!("${}", i + 1);
        let value = match param {
            Some(bytes) => {
                let text = String::from_utf8_lossy(bytes);
                format!("'{}'", text.replace('\'', "''"))
            }
            None => "NULL".to_string(),
        };
        result = result.replace(&placeholder, &value);
    }
    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct CareSchedFactory {
    handler: Arc<CareSchedHandler>,
    auth_handler: Arc<
        CleartextPasswordAuthStartupHandler<CareSchedAuthSource, DefaultServerParameterProvider>,
    >,
    noop: Arc<NoopHandler>,
}

impl CareSchedFactory {
    pub fn new(practices: Arc<PracticeManager>, password: String) -> Self {
        let auth_source = CareSchedAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(CareSchedHandler::new(practices)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for CareSchedFactory {
    fn simple_query_handler(&self) -> Arc<impl SimpleQueryHandler> {
        self.handler.clone()
    }

    fn extended_query_handler(&self) -> Arc<impl ExtendedQueryHandler> {
        self.handler.clone()
    }

    fn startup_handler(&self) -> Arc<impl StartupHandler> {
        self.auth_handler.clone()
    }

    fn copy_handler(&self) -> Arc<impl CopyHandler> {
        self.noop.clone()
    }
}

/// Serve one client until it disconnects.
pub async fn process_connection(
    socket: TcpStream,
    practices: Arc<PracticeManager>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = Arc::new(CareSchedFactory::new(practices, password));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        message,
    )))
}

fn engine_err(e: SchedulingError) -> PgWireError {
    user_error(e.sqlstate(), format!("{}: {e}", e.code()))
}

fn sql_err(e: sql::SqlError) -> PgWireError {
    user_error("42601", e.to_string())
}

fn api_err(e: crate::time::TimeError) -> PgWireError {
    PgWireError::ApiError(Box::new(e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn count_params_takes_highest_index() {
        assert_eq!(count_params("SELECT * FROM appointments WHERE id = $1"), 1);
        assert_eq!(count_params("INSERT INTO patients VALUES ($2, $10)"), 10);
        assert_eq!(count_params("SELECT 1"), 0);
        assert_eq!(count_params("SELECT '$'"), 0);
    }

    #[test]
    fn schema_follows_target_table() {
        let names = |sql: &str| -> Vec<String> {
            result_schema(sql).iter().map(|f| f.name().to_string()).collect()
        };
        assert_eq!(
            names("SELECT * FROM availability WHERE clinician_id = $1"),
            vec!["clinician_id", "date", "start_time", "end_time"]
        );
        assert_eq!(names("select * from conflicts"), vec!["has_conflict"]);
        assert_eq!(names("SELECT * FROM appointments").len(), 13);
        assert!(names("INSERT INTO appointments VALUES ($1)").is_empty());
    }

    #[test]
    fn engine_errors_carry_code_and_sqlstate() {
        let err = engine_err(SchedulingError::ClinicianConflict(Ulid::new()));
        let rendered = format!("{err:?}");
        assert!(rendered.contains("SC021"));
        assert!(rendered.contains("clinician_conflict: "));
    }
}
