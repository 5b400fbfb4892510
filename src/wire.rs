use std::fmt::Debug;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::stream;
use futures::Sink;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{AuthSource, DefaultServerParameterProvider, LoginInfo, Password, StartupHandler};
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
use tokio::net::TcpStream;

use crate::engine::EngineError;
use crate::model::*;
use crate::observability;
use crate::service::BookingService;
use crate::sql::{self, Command};

pub struct SalonHandler {
    service: Arc<BookingService>,
    query_parser: Arc<SalonQueryParser>,
}

impl SalonHandler {
    pub fn new(service: Arc<BookingService>) -> Self {
        Self {
            service,
            query_parser: Arc::new(SalonQueryParser),
        }
    }

    /// The connection's database name is the salon it acts for.
    fn resolve_tenant<C: ClientInfo>(&self, client: &C) -> PgWireResult<String> {
        client
            .metadata()
            .get("database")
            .cloned()
            .ok_or_else(|| engine_err(EngineError::UnknownTenant(String::new())))
    }

    /// Parse and execute one statement, recording query metrics.
    async fn run(
        &self,
        tenant: &str,
        sql: &str,
        format: Option<&Format>,
    ) -> PgWireResult<Vec<Response>> {
        let cmd = match sql::parse_sql(sql) {
            Ok(cmd) => cmd,
            Err(e) => {
                metrics::counter!(observability::QUERIES_TOTAL, "command" => "invalid", "status" => "error")
                    .increment(1);
                return Err(sql_err(e));
            }
        };

        let label = observability::command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(tenant, cmd, format).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(
        &self,
        tenant: &str,
        cmd: Command,
        format: Option<&Format>,
    ) -> PgWireResult<Vec<Response>> {
        match cmd {
            Command::InsertBooking { booking } => {
                let created = self
                    .service
                    .create_booking(tenant, booking)
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(id_schema(format));
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&created.id.to_string())?;
                let rows = vec![Ok(encoder.take_row())];
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::UpdateBooking { id, patch } => {
                self.service
                    .update_booking(id, tenant, patch)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::DeleteBooking { id } => {
                self.service
                    .delete_booking(id, tenant)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::SelectBookings { date } => {
                let bookings = self
                    .service
                    .list_by_tenant(tenant, date.as_deref())
                    .await
                    .map_err(engine_err)?;
                Ok(vec![booking_rows(&bookings, format)?])
            }
            Command::SelectBookingsByMaster { master } => {
                let bookings = self
                    .service
                    .list_by_master(&master)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![booking_rows(&bookings, format)?])
            }
            Command::SelectBookingsByPhone { phone } => {
                let bookings = self
                    .service
                    .list_by_phone(&phone)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![booking_rows(&bookings, format)?])
            }
            Command::SelectAvailability { query } => {
                let verdict = self
                    .service
                    .check_availability(tenant, query)
                    .await
                    .map_err(engine_err)?;
                let conflict = verdict
                    .conflict
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()
                    .map_err(|e| PgWireError::ApiError(Box::new(e)))?;

                let schema = Arc::new(availability_schema(format));
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&verdict.available)?;
                encoder.encode_field(&conflict)?;
                encoder.encode_field(&verdict.error)?;
                let rows = vec![Ok(encoder.take_row())];
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
        }
    }
}

// ── Result schemas ───────────────────────────────────────────────

fn field(name: &str, ty: Type, idx: usize, format: Option<&Format>) -> FieldInfo {
    let format = format.map_or(FieldFormat::Text, |f| f.format_for(idx));
    FieldInfo::new(name.into(), None, None, ty, format)
}

fn booking_schema(format: Option<&Format>) -> Vec<FieldInfo> {
    [
        ("id", Type::VARCHAR),
        ("tenant_id", Type::VARCHAR),
        ("name", Type::VARCHAR),
        ("phone", Type::VARCHAR),
        ("service", Type::VARCHAR),
        ("master", Type::VARCHAR),
        ("date", Type::VARCHAR),
        ("start_time", Type::VARCHAR),
        ("end_time", Type::VARCHAR),
        ("comment", Type::VARCHAR),
        ("created_at", Type::INT8),
    ]
    .into_iter()
    .enumerate()
    .map(|(idx, (name, ty))| field(name, ty, idx, format))
    .collect()
}

fn availability_schema(format: Option<&Format>) -> Vec<FieldInfo> {
    vec![
        field("available", Type::BOOL, 0, format),
        field("conflict", Type::VARCHAR, 1, format),
        field("error", Type::VARCHAR, 2, format),
    ]
}

fn id_schema(format: Option<&Format>) -> Vec<FieldInfo> {
    vec![field("id", Type::VARCHAR, 0, format)]
}

fn booking_rows(bookings: &[Booking], format: Option<&Format>) -> PgWireResult<Response> {
    let schema = Arc::new(booking_schema(format));
    let rows: Vec<PgWireResult<_>> = bookings
        .iter()
        .map(|b| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&b.id.to_string())?;
            encoder.encode_field(&b.tenant_id)?;
            encoder.encode_field(&b.client_name)?;
            encoder.encode_field(&b.client_phone)?;
            encoder.encode_field(&b.service_name)?;
            encoder.encode_field(&b.master)?;
            encoder.encode_field(&b.date.format("%Y-%m-%d").to_string())?;
            encoder.encode_field(&format_hhmm(b.start_time))?;
            // Legacy records without a stored end read back as NULL.
            encoder.encode_field(&b.end_time.map(format_hhmm))?;
            encoder.encode_field(&b.comment)?;
            encoder.encode_field(&b.created_at)?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

/// Columns a statement will return, judged from its text so `$n`
/// placeholders need not be bound yet.
fn result_schema(sql: &str, format: Option<&Format>) -> Vec<FieldInfo> {
    let upper = sql.trim_start().to_uppercase();
    if upper.starts_with("INSERT") {
        id_schema(format)
    } else if upper.starts_with("SELECT") && upper.contains("AVAILABILITY") {
        availability_schema(format)
    } else if upper.starts_with("SELECT") {
        booking_schema(format)
    } else {
        vec![]
    }
}

#[async_trait]
impl SimpleQueryHandler for SalonHandler {
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
        let tenant = self.resolve_tenant(client)?;
        self.run(&tenant, query, None).await
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct SalonQueryParser;

#[async_trait]
impl QueryParser for SalonQueryParser {
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
        column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        Ok(result_schema(stmt, column_format))
    }
}

#[async_trait]
impl ExtendedQueryHandler for SalonHandler {
    type Statement = String;
    type QueryParser = SalonQueryParser;

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
        let tenant = self.resolve_tenant(client)?;
        let sql = substitute_params(portal);
        let mut responses = self
            .run(&tenant, &sql, Some(&portal.result_column_format))
            .await?;
        if responses.is_empty() {
            return Ok(Response::EmptyQuery);
        }
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
            result_schema(&target.statement, None),
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
            Some(&target.result_column_format),
        )))
    }
}

/// Highest `$N` placeholder in the statement.
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

/// Inline bound parameters as quoted literals.
fn substitute_params(portal: &Portal<String>) -> String {
    inline_params(&portal.statement.statement, &portal.parameters)
}

/// One left-to-right pass: each `$N` is replaced exactly once, and text
/// inside a substituted value is never scanned again. Placeholders without
/// a bound value are left as written.
fn inline_params<B: AsRef<[u8]>>(sql: &str, params: &[Option<B>]) -> String {
    let bytes = sql.as_bytes();
    let mut out = String::with_capacity(sql.len());
    let mut copied = 0;
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'$' {
            i += 1;
            continue;
        }
        let start = i + 1;
        let mut end = start;
        while end < bytes.len() && bytes[end].is_ascii_digit() {
            end += 1;
        }
        let bound = sql[start..end]
            .parse::<usize>()
            .ok()
            .and_then(|n| n.checked_sub(1))
            .and_then(|idx| params.get(idx));
        if let Some(param) = bound {
            out.push_str(&sql[copied..i]);
            match param {
                Some(value) => {
                    let text = String::from_utf8_lossy(value.as_ref());
                    out.push('\'');
                    out.push_str(&text.replace('\'', "''"));
                    out.push('\'');
                }
                None => out.push_str("NULL"),
            }
            copied = end;
        }
        i = end;
    }
    out.push_str(&sql[copied..]);
    out
}

// ── Auth ─────────────────────────────────────────────────────────

/// One shared password for every salon; the database name picks the tenant.
#[derive(Debug)]
pub struct SalonAuthSource {
    password: String,
}

impl SalonAuthSource {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

#[async_trait]
impl AuthSource for SalonAuthSource {
    async fn get_password(&self, _login: &LoginInfo) -> PgWireResult<Password> {
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}

// ── Factory ──────────────────────────────────────────────────────

pub struct SalonFactory {
    handler: Arc<SalonHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<SalonAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl SalonFactory {
    pub fn new(service: Arc<BookingService>, password: String) -> Self {
        Self {
            handler: Arc::new(SalonHandler::new(service)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                SalonAuthSource::new(password),
                DefaultServerParameterProvider::default(),
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for SalonFactory {
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

/// Serve one client connection until it closes.
pub async fn process_connection(
    socket: TcpStream,
    service: Arc<BookingService>,
    password: String,
) -> io::Result<()> {
    let factory = Arc::new(SalonFactory::new(service, password));
    pgwire::tokio::process_socket(socket, None, factory).await
}

// ── Error mapping ────────────────────────────────────────────────

fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::Validation(_) | EngineError::LimitExceeded(_) => "22023",
        EngineError::Conflict(_) => "23P01",
        EngineError::NotFound(_) | EngineError::UnknownTenant(_) => "02000",
        EngineError::Forbidden(_) => "42501",
        EngineError::WalError(_) | EngineError::Internal => "XX000",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        sqlstate(&e).into(),
        e.to_string(),
    )))
}

fn sql_err(e: sql::SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "42601".into(),
        e.to_string(),
    )))
}
