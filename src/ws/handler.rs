//! WebSocket upgrade handler
//!
//! Validates the join request, places the player in a room and runs the
//! session until the connection ends.

use std::panic::AssertUnwindSafe;
use std::time::Duration;

use axum::{
    extract::{
        ws::{WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::Uri,
    response::Response,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::{debug, error, info, warn};

use crate::app::AppState;
use crate::util::time::unix_millis;
use crate::ws::connection::{ConnectionHandle, ConnectionSettings};
use crate::ws::protocol::{close_code, ServerMsg};
use crate::ws::session::{close_message, run_session, write_loop, SessionTimers};

/// Longest display name kept, in characters
pub const MAX_PLAYER_NAME_LEN: usize = 32;
pub const DEFAULT_PLAYER_NAME: &str = "Guest";

/// How long the writer may keep flushing after the session ends
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Raw query parameters of a join request
#[derive(Debug, Default, Deserialize)]
struct JoinQuery {
    #[serde(rename = "userId")]
    user_id: Option<String>,
    #[serde(rename = "playerName")]
    player_name: Option<String>,
    debug: Option<String>,
}

/// Validated join request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinRequest {
    pub user_id: String,
    pub player_name: String,
    pub debug: bool,
}

/// Reasons a join request is refused before admission
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JoinRejection {
    #[error("Query params missing")]
    MissingQuery,

    #[error("userId required")]
    MissingUserId,

    #[error("Malformed query")]
    Malformed,
}

impl JoinRejection {
    pub fn close_code(&self) -> u16 {
        close_code::POLICY_VIOLATION
    }
}

impl JoinRequest {
    /// Parse `userId`, `playerName` and `debug` from the request URI
    pub fn from_uri(uri: &Uri) -> Result<Self, JoinRejection> {
        if uri.query().map_or(true, str::is_empty) {
            return Err(JoinRejection::MissingQuery);
        }

        let Query(query) =
            Query::<JoinQuery>::try_from_uri(uri).map_err(|_| JoinRejection::Malformed)?;

        let user_id = query
            .user_id
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
            .ok_or(JoinRejection::MissingUserId)?;

        let player_name = query
            .player_name
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(|name| name.chars().take(MAX_PLAYER_NAME_LEN).collect())
            .unwrap_or_else(|| DEFAULT_PLAYER_NAME.to_string());

        let debug = matches!(query.debug.as_deref(), Some("true") | Some("1"));

        Ok(Self {
            user_id,
            player_name,
            debug,
        })
    }
}

/// WebSocket upgrade handler
pub async fn ws_handler(ws: WebSocketUpgrade, uri: Uri, State(state): State<AppState>) -> Response {
    upgrade(ws, &uri, state)
}

/// Upgrade the connection; the join request is validated on the socket so a
/// rejection can carry a close code
pub fn upgrade(ws: WebSocketUpgrade, uri: &Uri, state: AppState) -> Response {
    let request = JoinRequest::from_uri(uri);
    ws.on_upgrade(move |socket| handle_socket(socket, request, state))
}

/// Handle the upgraded WebSocket connection
async fn handle_socket(
    socket: WebSocket,
    request: Result<JoinRequest, JoinRejection>,
    state: AppState,
) {
    let (mut ws_sink, ws_stream) = socket.split();

    let request = match request {
        Ok(request) => request,
        Err(rejection) => {
            warn!(error = %rejection, "Rejecting WebSocket connection");
            let _ = ws_sink
                .send(close_message(rejection.close_code(), rejection.to_string()))
                .await;
            return;
        }
    };

    info!(
        user_id = %request.user_id,
        player_name = %request.player_name,
        debug = request.debug,
        "New WebSocket connection"
    );

    let settings = ConnectionSettings::from(state.config.as_ref());
    let (conn, outbound_rx) = ConnectionHandle::new(
        request.user_id.clone(),
        request.player_name.clone(),
        request.debug,
        &settings,
    );

    // The simulation runs inside join; a panic there must still close the socket
    let joined = std::panic::catch_unwind(AssertUnwindSafe(|| state.matchmaker.join(&conn)));
    let room = match joined {
        Ok(Ok(room)) => room,
        Ok(Err(e)) => {
            warn!(user_id = %request.user_id, error = %e, "Join failed");
            let _ = ws_sink
                .send(close_message(e.close_code(), "No room available"))
                .await;
            return;
        }
        Err(_) => {
            error!(user_id = %request.user_id, "Join panicked");
            let _ = ws_sink
                .send(close_message(close_code::SERVER_ERROR, "Server Error"))
                .await;
            return;
        }
    };

    conn.send_text(&ServerMsg::JoinSuccess {
        user_id: request.user_id.clone(),
        player_name: request.player_name.clone(),
        room_id: room.id().to_string(),
        capacity: room.capacity(),
        player_count: room.player_count(),
        server_time: unix_millis(),
        debug: request.debug,
    });

    let writer = tokio::spawn(write_loop(ws_sink, outbound_rx, request.user_id.clone()));
    let writer_abort = writer.abort_handle();

    let timers = SessionTimers::from(state.config.as_ref());
    let end = run_session(&room, &conn, ws_stream, &timers).await;

    // No-op when the server already started the close
    conn.close(close_code::NORMAL, "");
    conn.mark_closed();

    let departure = state.matchmaker.release(&room, &conn);
    info!(
        user_id = %request.user_id,
        room_id = %room.id(),
        end = ?end,
        intentional = conn.was_intentional(),
        departure = ?departure,
        "WebSocket connection closed"
    );

    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, writer).await.is_err() {
        debug!(user_id = %request.user_id, "Writer did not drain in time");
        writer_abort.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(uri: &str) -> Result<JoinRequest, JoinRejection> {
        JoinRequest::from_uri(&uri.parse::<Uri>().unwrap())
    }

    #[test]
    fn test_full_request() {
        let request = parse("/?userId=u1&playerName=Alice&debug=true").unwrap();

        assert_eq!(
            request,
            JoinRequest {
                user_id: "u1".to_string(),
                player_name: "Alice".to_string(),
                debug: true,
            }
        );
    }

    #[test]
    fn test_missing_query() {
        assert_eq!(parse("/"), Err(JoinRejection::MissingQuery));
        assert_eq!(parse("/ws"), Err(JoinRejection::MissingQuery));
    }

    #[test]
    fn test_user_id_required() {
        assert_eq!(parse("/?playerName=Bob"), Err(JoinRejection::MissingUserId));
        assert_eq!(parse("/?userId="), Err(JoinRejection::MissingUserId));
        assert_eq!(parse("/?userId=%20%20"), Err(JoinRejection::MissingUserId));
    }

    #[test]
    fn test_player_name_defaults_and_truncates() {
        assert_eq!(parse("/?userId=u1").unwrap().player_name, DEFAULT_PLAYER_NAME);
        assert_eq!(
            parse("/?userId=u1&playerName=%20%20").unwrap().player_name,
            DEFAULT_PLAYER_NAME
        );
        assert_eq!(
            parse("/?userId=u1&playerName=%20Zed%20").unwrap().player_name,
            "Zed"
        );

        let long = "x".repeat(50);
        let request = parse(&format!("/?userId=u1&playerName={long}")).unwrap();
        assert_eq!(request.player_name.chars().count(), MAX_PLAYER_NAME_LEN);
    }

    #[test]
    fn test_debug_flag() {
        assert!(parse("/?userId=u1&debug=1").unwrap().debug);
        assert!(!parse("/?userId=u1&debug=yes").unwrap().debug);
        assert!(!parse("/?userId=u1").unwrap().debug);
    }

    #[test]
    fn test_rejections_use_policy_violation() {
        assert_eq!(JoinRejection::MissingUserId.close_code(), 1008);
        assert_eq!(JoinRejection::MissingUserId.to_string(), "userId required");
    }
}
