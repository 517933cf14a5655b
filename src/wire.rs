use std::collections::HashMap;
use std::fmt::Debug;
use std::io;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::{stream, Sink, SinkExt};
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
use pgwire::messages::response::NotificationResponse;
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use tokio::sync::broadcast::error::TryRecvError;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, warn};
use ulid::Ulid;

use crate::auth::BenbAuthSource;
use crate::booking::{Booking, BookingError};
use crate::model::{DayState, Property};
use crate::notify::BookingEvent;
use crate::observability;
use crate::sql::{self, Command};

const CHANNEL_PREFIX: &str = "property_";

static NEXT_PID: AtomicI32 = AtomicI32::new(1);

/// Per-connection query handler. Owns the connection's LISTEN subscriptions; pending
/// notifications are flushed to the client around every query.
pub struct BenbHandler {
    booking: Booking,
    query_parser: Arc<BenbQueryParser>,
    listeners: Mutex<HashMap<String, broadcast::Receiver<BookingEvent>>>,
    pid: i32,
}

impl BenbHandler {
    pub fn new(booking: Booking) -> Self {
        Self {
            booking,
            query_parser: Arc::new(BenbQueryParser),
            listeners: Mutex::new(HashMap::new()),
            pid: NEXT_PID.fetch_add(1, Ordering::Relaxed),
        }
    }

    async fn run<C>(&self, client: &mut C, query: &str, format: &Format) -> PgWireResult<Vec<Response>>
    where
        C: Sink<PgWireBackendMessage> + Unpin + Send,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        self.deliver_notifications(client).await?;
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let label = observability::command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(cmd, format).await;
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        self.deliver_notifications(client).await?;
        result
    }

    async fn deliver_notifications<C>(&self, client: &mut C) -> PgWireResult<()>
    where
        C: Sink<PgWireBackendMessage> + Unpin + Send,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let mut pending = Vec::new();
        {
            let mut listeners = self.listeners.lock().await;
            for (channel, rx) in listeners.iter_mut() {
                loop {
                    match rx.try_recv() {
                        Ok(event) => pending.push((channel.clone(), event.payload())),
                        Err(TryRecvError::Lagged(skipped)) => {
                            warn!(channel = %channel, skipped, "listener lagged, notifications dropped");
                        }
                        Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
                    }
                }
            }
        }
        for (channel, payload) in pending {
            client
                .send(PgWireBackendMessage::NotificationResponse(NotificationResponse::new(
                    self.pid, channel, payload,
                )))
                .await?;
        }
        Ok(())
    }

    async fn execute_command(&self, cmd: Command, format: &Format) -> PgWireResult<Vec<Response>> {
        let booking = &self.booking;
        match cmd {
            Command::UpsertProperty {
                id,
                name,
                max_guests,
                status,
            } => {
                let mut property = match booking.admin.get_property(id).await.map_err(booking_err)? {
                    Some(existing) => Property {
                        name,
                        max_guests,
                        ..existing
                    },
                    None => Property::new(id, name, max_guests),
                };
                property.status = status;
                booking.admin.upsert_property(property).await.map_err(booking_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::SelectProperties => {
                let properties = booking.admin.list_properties().await.map_err(booking_err)?;
                Ok(vec![rows(properties_schema(), format, properties, |enc, p| {
                    enc.encode_field(&p.id.to_string())?;
                    enc.encode_field(&p.name)?;
                    enc.encode_field(&p.status.as_str().to_string())?;
                    enc.encode_field(&(p.max_guests as i64))?;
                    enc.encode_field(&p.check_in_time)?;
                    enc.encode_field(&p.check_out_time)
                })])
            }
            Command::SetPricingPolicy { property_id, policy } => {
                booking
                    .admin
                    .set_pricing_policy(property_id, policy)
                    .await
                    .map_err(booking_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::SelectPricingPolicy { property_id } => {
                let p = booking.admin.pricing_policy(property_id).await.map_err(booking_err)?;
                Ok(vec![rows(policy_schema(), format, vec![p], move |enc, p| {
                    enc.encode_field(&property_id.to_string())?;
                    enc.encode_field(&p.base_price.to_string())?;
                    enc.encode_field(&p.currency)?;
                    enc.encode_field(&p.cleaning_fee.to_string())?;
                    enc.encode_field(&p.security_deposit.to_string())?;
                    enc.encode_field(&(p.minimum_stay as i64))?;
                    enc.encode_field(&(p.maximum_stay as i64))?;
                    enc.encode_field(&p.weekly_discount.to_string())?;
                    enc.encode_field(&p.monthly_discount.to_string())?;
                    enc.encode_field(&p.last_minute_discount.to_string())?;
                    enc.encode_field(&p.early_bird_discount.to_string())?;
                    enc.encode_field(&p.tax_per_person_per_night.to_string())
                })])
            }
            Command::UpsertSeason { id, property_id, draft } => {
                booking
                    .admin
                    .upsert_season(id, property_id, draft)
                    .await
                    .map_err(booking_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::DeleteSeason { property_id, id } => {
                let deleted = booking.admin.delete_season(property_id, id).await.map_err(booking_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(usize::from(deleted)))])
            }
            Command::SelectSeasons { property_id } => {
                let seasons = booking.admin.list_seasons(property_id).await.map_err(booking_err)?;
                Ok(vec![rows(seasons_schema(), format, seasons, |enc, s| {
                    enc.encode_field(&s.id.to_string())?;
                    enc.encode_field(&s.name)?;
                    enc.encode_field(&s.start.to_string())?;
                    enc.encode_field(&s.end.to_string())?;
                    enc.encode_field(&s.price.to_string())?;
                    enc.encode_field(&(s.minimum_stay as i64))?;
                    enc.encode_field(&s.color)?;
                    enc.encode_field(&s.created_at.to_rfc3339())
                })])
            }
            Command::InsertBlock {
                property_id,
                start,
                end,
                reason,
                note,
            } => {
                let n = booking
                    .admin
                    .block_dates(property_id, start, end, reason, note)
                    .await
                    .map_err(booking_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(n))])
            }
            Command::DeleteBlock { property_id, start, end } => {
                let n = booking
                    .admin
                    .unblock_dates(property_id, start, end)
                    .await
                    .map_err(booking_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(n))])
            }
            Command::InsertDayOverride {
                property_id,
                start,
                end,
                price,
                minimum_stay,
                note,
            } => {
                let n = booking
                    .admin
                    .set_day_overrides(property_id, start, end, price, minimum_stay, note)
                    .await
                    .map_err(booking_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(n))])
            }
            Command::SelectCalendar { property_id, start, end } => {
                let days = booking
                    .rates
                    .calendar_view(property_id, start, end)
                    .await
                    .map_err(booking_err)?;
                Ok(vec![rows(calendar_schema(), format, days, |enc, day| {
                    let reservation_id = match day.state {
                        DayState::Reserved { reservation_id } => Some(reservation_id.to_string()),
                        _ => None,
                    };
                    enc.encode_field(&day.date.to_string())?;
                    enc.encode_field(&day.state.label().to_string())?;
                    enc.encode_field(&reservation_id)?;
                    enc.encode_field(&day.nightly_price.to_string())?;
                    enc.encode_field(&(day.minimum_stay as i64))?;
                    enc.encode_field(&day.season_id.map(|id| id.to_string()))?;
                    enc.encode_field(&day.note)
                })])
            }
            Command::SelectQuote {
                property_id,
                check_in,
                check_out,
                guests,
            } => {
                let quote = booking
                    .quote(property_id, check_in, check_out, guests)
                    .await
                    .map_err(booking_err)?;
                Ok(vec![rows(quote_schema(), format, quote.line_items(), |enc, item| {
                    enc.encode_field(&item.item.to_string())?;
                    enc.encode_field(&item.date.map(|d| d.to_string()))?;
                    enc.encode_field(&item.percent.map(|p| p.to_string()))?;
                    enc.encode_field(&item.amount.to_string())
                })])
            }
            Command::SelectAvailability {
                property_id,
                check_in,
                check_out,
                guests,
            } => {
                let row = match booking
                    .check_availability(property_id, check_in, check_out, guests)
                    .await
                {
                    Ok(nights) => (true, None, None, nights.len() as i64),
                    Err(BookingError::Unavailable(reason)) => {
                        (false, Some(reason.code().to_string()), Some(reason.to_string()), 0)
                    }
                    Err(e) => return Err(booking_err(e)),
                };
                Ok(vec![rows(availability_schema(), format, vec![row], |enc, (available, reason, detail, nights)| {
                    enc.encode_field(&available)?;
                    enc.encode_field(&reason)?;
                    enc.encode_field(&detail)?;
                    enc.encode_field(&nights)
                })])
            }
            Command::InsertReservation { request } => {
                let id = booking
                    .workflow
                    .create_reservation(request)
                    .await
                    .map_err(booking_err)?;
                let reservation = booking
                    .workflow
                    .get_reservation(id)
                    .await
                    .map_err(booking_err)?
                    .ok_or_else(|| booking_err(BookingError::Persistence(format!("reservation {id} not readable"))))?;
                Ok(vec![rows(created_schema(), format, vec![reservation], |enc, r| {
                    enc.encode_field(&r.id.to_string())?;
                    enc.encode_field(&r.status.as_str().to_string())?;
                    enc.encode_field(&r.total_price.to_string())?;
                    enc.encode_field(&r.currency)
                })])
            }
            Command::SetReservationStatus { id, status } => {
                booking.workflow.update_status(id, status).await.map_err(booking_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::CancelReservation { id } => {
                booking.workflow.cancel_reservation(id).await.map_err(booking_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::SelectReservations { property_id } => {
                let reservations = booking
                    .workflow
                    .list_reservations(property_id)
                    .await
                    .map_err(booking_err)?;
                Ok(vec![rows(reservations_schema(), format, reservations, |enc, r| {
                    enc.encode_field(&r.id.to_string())?;
                    enc.encode_field(&r.property_id.to_string())?;
                    enc.encode_field(&r.check_in.to_string())?;
                    enc.encode_field(&r.check_out.to_string())?;
                    enc.encode_field(&(r.guests as i64))?;
                    enc.encode_field(&(r.nights as i64))?;
                    enc.encode_field(&r.guest.name)?;
                    enc.encode_field(&r.guest.email)?;
                    enc.encode_field(&r.guest.phone)?;
                    enc.encode_field(&r.status.as_str().to_string())?;
                    enc.encode_field(&r.payment_status.as_str().to_string())?;
                    enc.encode_field(&r.price_per_night.to_string())?;
                    enc.encode_field(&r.total_price.to_string())?;
                    enc.encode_field(&r.currency)?;
                    enc.encode_field(&r.created_at.to_rfc3339())
                })])
            }
            Command::SelectLedgerReport { property_id } => {
                let report = booking.verify_ledger(property_id).await.map_err(booking_err)?;
                let mut lines: Vec<(&'static str, String, Option<String>)> = Vec::new();
                lines.extend(report.orphaned.iter().map(|(d, r)| ("orphaned", d.to_string(), Some(r.to_string()))));
                lines.extend(report.missing.iter().map(|(d, r)| ("missing", d.to_string(), Some(r.to_string()))));
                lines.extend(report.double_booked.iter().map(|d| ("double_booked", d.to_string(), None)));
                Ok(vec![rows(ledger_schema(), format, lines, |enc, (kind, date, reservation_id)| {
                    enc.encode_field(&kind.to_string())?;
                    enc.encode_field(&date)?;
                    enc.encode_field(&reservation_id)
                })])
            }
            Command::Listen { channel } => {
                let property_id = parse_channel(&channel)?;
                let mut listeners = self.listeners.lock().await;
                if !listeners.contains_key(&channel) {
                    listeners.insert(channel.clone(), booking.notify.subscribe(property_id));
                    debug!(%channel, pid = self.pid, "listening");
                }
                Ok(vec![Response::Execution(Tag::new("LISTEN"))])
            }
            Command::Unlisten { channel } => {
                if self.listeners.lock().await.remove(&channel).is_some()
                    && let Ok(property_id) = parse_channel(&channel)
                {
                    booking.notify.prune(&property_id);
                }
                Ok(vec![Response::Execution(Tag::new("UNLISTEN"))])
            }
            Command::UnlistenAll => {
                let drained: Vec<String> = self.listeners.lock().await.drain().map(|(c, _)| c).collect();
                for channel in drained {
                    if let Ok(property_id) = parse_channel(&channel) {
                        booking.notify.prune(&property_id);
                    }
                }
                Ok(vec![Response::Execution(Tag::new("UNLISTEN"))])
            }
        }
    }
}

impl Drop for BenbHandler {
    fn drop(&mut self) {
        for channel in self.listeners.get_mut().drain().map(|(c, _)| c) {
            if let Ok(property_id) = parse_channel(&channel) {
                self.booking.notify.prune(&property_id);
            }
        }
    }
}

fn parse_channel(channel: &str) -> PgWireResult<Ulid> {
    let id = channel.strip_prefix(CHANNEL_PREFIX).ok_or_else(|| {
        PgWireError::UserError(Box::new(ErrorInfo::new(
            "ERROR".into(),
            "42000".into(),
            format!("invalid channel: {channel} (expected {CHANNEL_PREFIX}{{property_id}})"),
        )))
    })?;
    Ulid::from_string(id).map_err(|e| {
        PgWireError::UserError(Box::new(ErrorInfo::new(
            "ERROR".into(),
            "42000".into(),
            format!("bad ULID in channel: {e}"),
        )))
    })
}

fn rows<T>(
    schema: Vec<FieldInfo>,
    format: &Format,
    items: Vec<T>,
    encode: impl Fn(&mut DataRowEncoder, T) -> PgWireResult<()>,
) -> Response {
    let schema = Arc::new(with_format(schema, format));
    let rows: Vec<PgWireResult<_>> = items
        .into_iter()
        .map(|item| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encode(&mut encoder, item)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

// ── Schemas ──────────────────────────────────────────────────────

/// Apply the client's requested result format column by column.
fn with_format(schema: Vec<FieldInfo>, format: &Format) -> Vec<FieldInfo> {
    schema
        .into_iter()
        .enumerate()
        .map(|(i, f)| {
            FieldInfo::new(
                f.name().to_string(),
                None,
                None,
                f.datatype().clone(),
                format.format_for(i),
            )
        })
        .collect()
}

fn field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn text_fields(names: &[&str]) -> Vec<FieldInfo> {
    names.iter().map(|n| field(n, Type::VARCHAR)).collect()
}

fn properties_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("name", Type::VARCHAR),
        field("status", Type::VARCHAR),
        field("max_guests", Type::INT8),
        field("check_in_time", Type::VARCHAR),
        field("check_out_time", Type::VARCHAR),
    ]
}

fn policy_schema() -> Vec<FieldInfo> {
    let mut fields = text_fields(&["property_id", "base_price", "currency", "cleaning_fee", "security_deposit"]);
    fields.push(field("minimum_stay", Type::INT8));
    fields.push(field("maximum_stay", Type::INT8));
    fields.extend(text_fields(&[
        "weekly_discount",
        "monthly_discount",
        "last_minute_discount",
        "early_bird_discount",
        "tax_per_person_per_night",
    ]));
    fields
}

fn seasons_schema() -> Vec<FieldInfo> {
    let mut fields = text_fields(&["id", "name", "start", "end", "price"]);
    fields.push(field("minimum_stay", Type::INT8));
    fields.extend(text_fields(&["color", "created_at"]));
    fields
}

fn calendar_schema() -> Vec<FieldInfo> {
    let mut fields = text_fields(&["date", "state", "reservation_id", "nightly_price"]);
    fields.push(field("minimum_stay", Type::INT8));
    fields.extend(text_fields(&["season_id", "note"]));
    fields
}

fn quote_schema() -> Vec<FieldInfo> {
    text_fields(&["item", "date", "percent", "amount"])
}

fn availability_schema() -> Vec<FieldInfo> {
    vec![
        field("available", Type::BOOL),
        field("reason", Type::VARCHAR),
        field("detail", Type::VARCHAR),
        field("nights", Type::INT8),
    ]
}

fn created_schema() -> Vec<FieldInfo> {
    text_fields(&["id", "status", "total_price", "currency"])
}

fn reservations_schema() -> Vec<FieldInfo> {
    let mut fields = text_fields(&["id", "property_id", "check_in", "check_out"]);
    fields.push(field("guests", Type::INT8));
    fields.push(field("nights", Type::INT8));
    fields.extend(text_fields(&[
        "guest_name",
        "guest_email",
        "guest_phone",
        "status",
        "payment_status",
        "price_per_night",
        "total_price",
        "currency",
        "created_at",
    ]));
    fields
}

fn ledger_schema() -> Vec<FieldInfo> {
    text_fields(&["kind", "date", "reservation_id"])
}

/// Result columns of a statement, judged from its leading keywords and target table.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let upper = sql.to_uppercase();
    let words: Vec<&str> = upper
        .split(|c: char| c.is_whitespace() || c == '(' || c == ';')
        .filter(|w| !w.is_empty())
        .collect();
    match words.as_slice() {
        ["SELECT", rest @ ..] => rest
            .windows(2)
            .find(|w| w[0] == "FROM")
            .map(|w| match w[1].trim_matches('"') {
                "PROPERTIES" => properties_schema(),
                "PRICING_POLICIES" => policy_schema(),
                "SEASONS" => seasons_schema(),
                "CALENDAR" => calendar_schema(),
                "QUOTE" => quote_schema(),
                "AVAILABILITY" => availability_schema(),
                "RESERVATIONS" => reservations_schema(),
                "LEDGER_REPORT" => ledger_schema(),
                _ => vec![],
            })
            .unwrap_or_default(),
        ["INSERT", "INTO", "RESERVATIONS", ..] => created_schema(),
        _ => vec![],
    }
}

#[async_trait]
impl SimpleQueryHandler for BenbHandler {
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
        self.run(client, query, &Format::UnifiedText).await
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct BenbQueryParser;

#[async_trait]
impl QueryParser for BenbQueryParser {
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
        let schema = result_schema(stmt);
        Ok(match column_format {
            Some(format) => with_format(schema, format),
            None => schema,
        })
    }
}

#[async_trait]
impl ExtendedQueryHandler for BenbHandler {
    type Statement = String;
    type QueryParser = BenbQueryParser;

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
        let responses = self.run(client, &sql, &portal.result_column_format).await?;
        responses.into_iter().next().ok_or_else(|| {
            PgWireError::UserError(Box::new(ErrorInfo::new(
                "ERROR".into(),
                "XX000".into(),
                "statement produced no response".into(),
            )))
        })
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
        Ok(DescribeStatementResponse::new(param_types, result_schema(&target.statement)))
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
        Ok(DescribePortalResponse::new(with_format(
            result_schema(&target.statement.statement),
            &target.result_column_format,
        )))
    }
}

/// Count the highest $N parameter placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    let mut max = 0usize;
    let bytes = sql.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' {
            i += 1;
            let start = i;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
            if i > start
                && let Ok(n) = sql[start..i].parse::<usize>()
            {
                max = max.max(n);
            }
        } else {
            i += 1;
        }
    }
    max
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
fn substitute_params(portal: &Portal<String>) -> String {
    bind_params(&portal.statement.statement, portal.parameters.as_slice())
}

/// One left-to-right pass over `sql`: each `$N` outside a string literal becomes the
/// quoted text of parameter N, or NULL. Substituted text is never scanned again.
fn bind_params<P: AsRef<[u8]>>(sql: &str, params: &[Option<P>]) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut in_literal = false;
    let mut chars = sql.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        if c == '\'' {
            in_literal = !in_literal;
        }
        if c != '$' || in_literal {
            out.push(c);
            continue;
        }
        let start = i + 1;
        let mut end = start;
        while let Some(&(j, d)) = chars.peek() {
            if !d.is_ascii_digit() {
                break;
            }
            end = j + 1;
            chars.next();
        }
        let index = sql[start..end].parse::<usize>().ok();
        match index.and_then(|n| n.checked_sub(1)).and_then(|n| params.get(n)) {
            Some(Some(bytes)) => {
                let text = String::from_utf8_lossy(bytes.as_ref());
                out.push('\'');
                out.push_str(&text.replace('\'', "''"));
                out.push('\'');
            }
            Some(None) => out.push_str("NULL"),
            None => out.push_str(&sql[i..end]),
        }
    }
    out
}

// ── Factory ──────────────────────────────────────────────────────

pub struct BenbFactory {
    handler: Arc<BenbHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<BenbAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl BenbFactory {
    pub fn new(booking: Booking, password: String) -> Self {
        let auth_source = BenbAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(BenbHandler::new(booking)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for BenbFactory {
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

/// Serve one client connection until it closes. Each connection gets its own handler,
/// and with it its own LISTEN subscriptions.
pub async fn process_connection(
    socket: TcpStream,
    booking: Booking,
    password: String,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = Arc::new(BenbFactory::new(booking, password));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

fn booking_err(e: BookingError) -> PgWireError {
    let code = match &e {
        BookingError::Validation(_) => "22023",
        BookingError::Unavailable(_) => "P0002",
        BookingError::Conflict { .. } => "P0003",
        BookingError::Persistence(_) => "58000",
    };
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        e.user_message(),
    )))
}

fn sql_err(e: crate::sql::SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "42601".into(),
        e.to_string(),
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_highest_placeholder() {
        assert_eq!(count_params("SELECT * FROM quote WHERE property_id = $1 AND guests = $4"), 4);
        assert_eq!(count_params("SELECT * FROM properties"), 0);
        assert_eq!(count_params("price = $12"), 12);
    }

    #[test]
    fn bound_values_are_never_rescanned() {
        let sql = "INSERT INTO reservations (property_id, special_requests) VALUES ($1, $2)";
        assert_eq!(
            bind_params(sql, &[Some("01J0"), Some("budget $150, it's $1 a night")]),
            "INSERT INTO reservations (property_id, special_requests) VALUES ('01J0', 'budget $150, it''s $1 a night')"
        );
        assert_eq!(bind_params("a = $1 AND b = $2", &[Some("x"), None]), "a = 'x' AND b = NULL");
        assert_eq!(
            bind_params("$10 $1", &[Some("1"), None, None, None, None, None, None, None, None, Some("10")]),
            "'10' '1'"
        );
        assert_eq!(bind_params("note = '$1' AND x = $3", &[Some("y")]), "note = '$1' AND x = $3");
    }

    #[test]
    fn schema_follows_target_table() {
        let q = result_schema("SELECT * FROM quote WHERE property_id = $1");
        let names: Vec<String> = q.iter().map(|f| f.name().to_string()).collect();
        assert_eq!(names, ["item", "date", "percent", "amount"]);
        assert_eq!(result_schema("select * from \"calendar\" where x = 1").len(), 7);
        assert_eq!(result_schema("INSERT INTO reservations (property_id) VALUES ($1)").len(), 4);
        assert!(result_schema("INSERT INTO blocks VALUES ($1)").is_empty());
        assert!(result_schema("LISTEN property_x").is_empty());
    }

    #[test]
    fn channel_names() {
        let id = Ulid::new();
        assert_eq!(parse_channel(&format!("property_{id}")).unwrap(), id);
        assert!(parse_channel("resource_x").is_err());
        assert!(parse_channel("property_nope").is_err());
    }

    #[test]
    fn booking_errors_map_to_sqlstate() {
        let rendered = |e: BookingError| match booking_err(e) {
            PgWireError::UserError(info) => format!("{info:?}"),
            other => panic!("unexpected {other:?}"),
        };
        assert!(rendered(BookingError::validation("x")).contains("\"22023\""));
        let conflict = rendered(BookingError::Conflict { dates: vec![] });
        assert!(conflict.contains("\"P0003\""));
        assert!(conflict.contains("no longer available"));
        assert!(rendered(BookingError::Persistence("x".into())).contains("\"58000\""));
    }
}
