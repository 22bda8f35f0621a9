use std::sync::Arc;
use std::time::Instant;

use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tracing::{debug, error};

use crate::engine::{EngineError, Engine};
use crate::limits::MAX_LINE_LEN;
use crate::model::*;
use crate::observability;
use crate::sql::{self, BookingOwner, Command};

/// One reply line. Serialized as a single JSON object.
#[derive(Debug, Serialize, PartialEq)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum Reply {
    Ok {
        tag: &'static str,
        rows: usize,
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        outcome: Option<&'static str>,
        #[serde(skip_serializing_if = "Option::is_none")]
        data: Option<serde_json::Value>,
    },
    Error {
        code: &'static str,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        conflict: Option<ConflictInfo>,
    },
}

/// The existing booking a rejected request collided with.
#[derive(Debug, Serialize, PartialEq)]
pub struct ConflictInfo {
    pub booking_id: BookingId,
    pub start: Ms,
    pub end: Ms,
}

impl Reply {
    fn done(tag: &'static str, rows: usize) -> Self {
        Reply::Ok {
            tag,
            rows,
            id: None,
            outcome: None,
            data: None,
        }
    }

    fn rows<T: Serialize>(rows: &[T]) -> Result<Self, serde_json::Error> {
        Ok(Reply::Ok {
            tag: "SELECT",
            rows: rows.len(),
            id: None,
            outcome: None,
            data: Some(serde_json::to_value(rows)?),
        })
    }

    fn error(code: &'static str, message: impl Into<String>) -> Self {
        Reply::Error {
            code,
            message: message.into(),
            conflict: None,
        }
    }

    fn is_ok(&self) -> bool {
        matches!(self, Reply::Ok { .. })
    }
}

impl From<EngineError> for Reply {
    fn from(e: EngineError) -> Self {
        let conflict = match &e {
            EngineError::BookingConflict { booking_id, span } => Some(ConflictInfo {
                booking_id: *booking_id,
                start: span.start,
                end: span.end,
            }),
            _ => None,
        };
        Reply::Error {
            code: e.code(),
            message: e.to_string(),
            conflict,
        }
    }
}

/// Serve one client: read SQL lines, answer each with a JSON line, until EOF.
pub async fn process_connection<S>(stream: S, engine: Arc<Engine>) -> Result<(), ServerError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut framed = Framed::new(stream, LinesCodec::new_with_max_length(MAX_LINE_LEN));

    while let Some(line) = framed.next().await {
        let reply = match line {
            Ok(line) if line.trim().is_empty() => continue,
            Ok(line) => handle_line(&engine, &line).await,
            Err(LinesCodecError::MaxLineLengthExceeded) => {
                // The framer cannot resync after this; answer and hang up.
                let reply = Reply::error(
                    "line_too_long",
                    format!("statement longer than {MAX_LINE_LEN} bytes"),
                );
                framed.send(serde_json::to_string(&reply)?).await?;
                return Ok(());
            }
            Err(LinesCodecError::Io(e)) => return Err(ServerError::Io(e)),
        };
        let json = serde_json::to_string(&reply)?;
        framed.send(json).await?;
    }
    Ok(())
}

async fn handle_line(engine: &Arc<Engine>, line: &str) -> Reply {
    let cmd = match sql::parse_sql(line) {
        Ok(cmd) => cmd,
        Err(e) => {
            debug!("rejected statement {line:?}: {e}");
            return Reply::error("syntax_error", e.to_string());
        }
    };

    let label = observability::command_label(&cmd);
    let started = Instant::now();
    // Run detached: a client hanging up must not abort a transaction between
    // its journal append and the in-memory apply.
    let engine = engine.clone();
    let reply = match tokio::spawn(async move { execute(&engine, cmd).await }).await {
        Ok(reply) => reply,
        Err(e) => {
            error!("{label} task failed: {e}");
            Reply::error("internal_error", "command aborted")
        }
    };

    let status = if reply.is_ok() { "ok" } else { "error" };
    metrics::counter!(observability::COMMANDS_TOTAL, "command" => label, "status" => status)
        .increment(1);
    metrics::histogram!(observability::COMMAND_DURATION_SECONDS, "command" => label)
        .record(started.elapsed().as_secs_f64());
    reply
}

/// Execute a parsed command against the engine.
pub async fn execute(engine: &Engine, cmd: Command) -> Reply {
    match run(engine, cmd).await {
        Ok(reply) => reply,
        Err(CommandError::Engine(e)) => e.into(),
        Err(CommandError::Encode(e)) => {
            error!("failed to encode result rows: {e}");
            Reply::error("internal_error", "failed to encode result")
        }
    }
}

enum CommandError {
    Engine(EngineError),
    Encode(serde_json::Error),
}

impl From<EngineError> for CommandError {
    fn from(e: EngineError) -> Self {
        CommandError::Engine(e)
    }
}

impl From<serde_json::Error> for CommandError {
    fn from(e: serde_json::Error) -> Self {
        CommandError::Encode(e)
    }
}

async fn run(engine: &Engine, cmd: Command) -> Result<Reply, CommandError> {
    match cmd {
        Command::RegisterVehicle {
            id,
            make,
            model,
            registration,
            condition,
        } => {
            engine
                .onboard_vehicle(id, make, model, registration, condition.unwrap_or_default())
                .await?;
            Ok(Reply::Ok {
                tag: "INSERT",
                rows: 1,
                id: Some(id),
                outcome: None,
                data: None,
            })
        }
        Command::CreateBooking {
            vehicle_id,
            user_id,
            start,
            end,
        } => {
            let id = engine
                .create_booking(vehicle_id, user_id, Span { start, end })
                .await?;
            Ok(Reply::Ok {
                tag: "INSERT",
                rows: 1,
                id: Some(id),
                outcome: None,
                data: None,
            })
        }
        Command::ModifyBooking { id, start, end } => {
            engine.modify_booking(id, Span { start, end }).await?;
            Ok(Reply::done("UPDATE", 1))
        }
        Command::CancelBooking { id } => {
            let outcome = engine.cancel_booking(id).await?;
            Ok(Reply::Ok {
                tag: "DELETE",
                rows: usize::from(outcome.changed()),
                id: None,
                outcome: Some(outcome.as_str()),
                data: None,
            })
        }
        Command::SelectVehicles { available } => {
            let mut vehicles = engine.list_vehicles(available == Some(true)).await;
            if available == Some(false) {
                vehicles.retain(|v| !v.is_available);
            }
            Ok(Reply::rows(&vehicles)?)
        }
        Command::SelectBookings { owner, filter } => {
            let bookings = match owner {
                BookingOwner::Vehicle(vehicle_id) => {
                    engine.bookings_for_vehicle(vehicle_id, filter).await?
                }
                BookingOwner::User(user_id) => engine.bookings_for_user(user_id, filter).await,
            };
            Ok(Reply::rows(&bookings)?)
        }
        Command::SelectRentalHistory { user_id } => {
            let history = engine.rental_history(user_id).await;
            Ok(Reply::rows(&history)?)
        }
        Command::SelectVehicleStatus { vehicle_id } => {
            let status = engine.get_vehicle_status(vehicle_id).await?;
            Ok(Reply::rows(std::slice::from_ref(&status))?)
        }
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ServerError {
    Io(std::io::Error),
    Codec(LinesCodecError),
    Encode(serde_json::Error),
}

impl From<std::io::Error> for ServerError {
    fn from(e: std::io::Error) -> Self {
        ServerError::Io(e)
    }
}

impl From<LinesCodecError> for ServerError {
    fn from(e: LinesCodecError) -> Self {
        ServerError::Codec(e)
    }
}

impl From<serde_json::Error> for ServerError {
    fn from(e: serde_json::Error) -> Self {
        ServerError::Encode(e)
    }
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerError::Io(e) => write!(f, "io error: {e}"),
            ServerError::Codec(e) => write!(f, "framing error: {e}"),
            ServerError::Encode(e) => write!(f, "encode error: {e}"),
        }
    }
}

impl std::error::Error for ServerError {}
