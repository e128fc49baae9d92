// src/api/voice.rs
// Token-gated relay between a client websocket and the upstream realtime
// voice API. The session is configured with a session.update event right
// after the upstream connects; after that, two pumps run until either side
// closes. Clients send realtime client events as JSON text frames, which
// are forwarded verbatim; server events come back unchanged.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use tokio_tungstenite::{connect_async, tungstenite};
use tracing::{info, warn};

use crate::state::AppState;

const UPSTREAM_VOICE_URL: &str = "wss://api.x.ai/v1/realtime";

#[derive(Debug, Deserialize)]
pub struct VoiceQuery {
    pub token: Option<String>,
    pub voice: Option<String>,
    pub instructions: Option<String>,
    /// "server_vad" for automatic turn detection, anything else is manual.
    pub turn: Option<String>,
    pub in_rate: Option<u32>,
    pub out_rate: Option<u32>,
}

/// The session.update event sent upstream before any audio flows. This is
/// what makes the realtime session usable: persona instructions, voice,
/// turn-detection mode, and PCM sample rates for both directions.
pub fn build_session_update(
    voice: &str,
    instructions: &str,
    turn: &str,
    in_rate: u32,
    out_rate: u32,
) -> JsonValue {
    let turn_detection = if turn.trim().eq_ignore_ascii_case("server_vad") {
        json!({"type": "server_vad"})
    } else {
        json!({"type": null})
    };

    json!({
        "type": "session.update",
        "session": {
            "instructions": instructions,
            "voice": voice,
            "turn_detection": turn_detection,
            "audio": {
                "input":  {"format": {"type": "audio/pcm", "rate": in_rate}},
                "output": {"format": {"type": "audio/pcm", "rate": out_rate}},
            },
            "input_audio_transcription": {"model": "default"},
        },
    })
}

/// GET /ws/voice
pub async fn ws_voice_relay(
    State(app): State<Arc<AppState>>,
    Query(q): Query<VoiceQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| relay(app, socket, q))
}

async fn send_error(socket: &mut WebSocket, msg: &str) {
    let payload = json!({"type": "error", "error": msg}).to_string();
    let _ = socket.send(Message::Text(payload.into())).await;
    let _ = socket.send(Message::Close(None)).await;
}

async fn relay(app: Arc<AppState>, mut client: WebSocket, q: VoiceQuery) {
    // Gate on the shared relay token.
    match (&app.config.voice_ws_token, q.token.as_deref()) {
        (Some(expected), Some(got)) if expected == got => {}
        (Some(_), _) => {
            send_error(&mut client, "unauthorized").await;
            return;
        }
        (None, _) => {
            send_error(&mut client, "voice relay disabled").await;
            return;
        }
    }

    let Some(api_key) = app.config.xai_api_key.clone() else {
        send_error(&mut client, "upstream key missing").await;
        return;
    };

    // Session knobs from the query string.
    let voice = q.voice.as_deref().unwrap_or("Ara");
    let instructions = q
        .instructions
        .as_deref()
        .unwrap_or("You are a helpful assistant.");
    let turn = q.turn.as_deref().unwrap_or("none");
    let in_rate = q.in_rate.unwrap_or(24_000);
    let out_rate = q.out_rate.unwrap_or(24_000);

    let request = match tungstenite::client::IntoClientRequest::into_client_request(
        UPSTREAM_VOICE_URL,
    ) {
        Ok(mut req) => {
            let value = match format!("Bearer {api_key}").parse() {
                Ok(v) => v,
                Err(_) => {
                    send_error(&mut client, "bad upstream credentials").await;
                    return;
                }
            };
            req.headers_mut().insert("authorization", value);
            req
        }
        Err(e) => {
            warn!("voice relay request build failed: {}", e);
            send_error(&mut client, "upstream unavailable").await;
            return;
        }
    };

    let upstream = match connect_async(request).await {
        Ok((stream, _)) => stream,
        Err(e) => {
            warn!("voice relay upstream connect failed: {}", e);
            send_error(&mut client, "upstream unavailable").await;
            return;
        }
    };

    let (mut upstream_tx, mut upstream_rx) = upstream.split();

    // Configure the session immediately, before any pumping starts.
    let session_update = build_session_update(voice, instructions, turn, in_rate, out_rate);
    if upstream_tx
        .send(tungstenite::Message::Text(session_update.to_string().into()))
        .await
        .is_err()
    {
        send_error(&mut client, "upstream unavailable").await;
        return;
    }

    info!(voice = %voice, turn = %turn, in_rate, out_rate, "voice relay established");

    let (client_tx, mut client_rx) = client.split();
    // Both pumps write to the client: relayed server events on one side,
    // protocol error notes on the other.
    let client_tx = Arc::new(tokio::sync::Mutex::new(client_tx));

    let client_to_upstream = {
        let client_tx = client_tx.clone();
        async move {
            while let Some(Ok(msg)) = client_rx.next().await {
                let out = match msg {
                    Message::Text(t) => {
                        // Only well-formed realtime event JSON goes upstream.
                        if serde_json::from_str::<JsonValue>(&t).is_err() {
                            let note = json!({
                                "type": "error",
                                "error": "client sent non-JSON message (expected realtime event JSON)",
                            })
                            .to_string();
                            let _ =
                                client_tx.lock().await.send(Message::Text(note.into())).await;
                            continue;
                        }
                        tungstenite::Message::Text(t.to_string().into())
                    }
                    Message::Close(_) => break,
                    // Binary frames and pings are not part of the event
                    // protocol.
                    _ => continue,
                };
                if upstream_tx.send(out).await.is_err() {
                    break;
                }
            }
            let _ = upstream_tx.send(tungstenite::Message::Close(None)).await;
        }
    };

    let upstream_to_client = {
        let client_tx = client_tx.clone();
        async move {
            while let Some(Ok(msg)) = upstream_rx.next().await {
                let out = match msg {
                    tungstenite::Message::Text(t) => Message::Text(t.to_string().into()),
                    // Upstream may frame events as bytes; the client expects
                    // text.
                    tungstenite::Message::Binary(b) => {
                        Message::Text(String::from_utf8_lossy(&b).to_string().into())
                    }
                    tungstenite::Message::Close(_) => break,
                    _ => continue,
                };
                if client_tx.lock().await.send(out).await.is_err() {
                    break;
                }
            }
            let _ = client_tx.lock().await.send(Message::Close(None)).await;
        }
    };

    tokio::join!(client_to_upstream, upstream_to_client);
    info!("voice relay closed");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_update_carries_all_knobs() {
        let ev = build_session_update("Ara", "Speak plainly.", "server_vad", 16_000, 24_000);
        assert_eq!(ev["type"], "session.update");

        let session = &ev["session"];
        assert_eq!(session["voice"], "Ara");
        assert_eq!(session["instructions"], "Speak plainly.");
        assert_eq!(session["turn_detection"]["type"], "server_vad");
        assert_eq!(session["audio"]["input"]["format"]["rate"], 16_000);
        assert_eq!(session["audio"]["input"]["format"]["type"], "audio/pcm");
        assert_eq!(session["audio"]["output"]["format"]["rate"], 24_000);
        assert_eq!(session["input_audio_transcription"]["model"], "default");
    }

    #[test]
    fn manual_turn_mode_disables_detection() {
        let ev = build_session_update("Ara", "x", "none", 24_000, 24_000);
        assert!(ev["session"]["turn_detection"]["type"].is_null());

        // Unknown modes fall back to manual as well.
        let ev = build_session_update("Ara", "x", "whatever", 24_000, 24_000);
        assert!(ev["session"]["turn_detection"]["type"].is_null());

        // Case-insensitive match for the vad mode.
        let ev = build_session_update("Ara", "x", "SERVER_VAD", 24_000, 24_000);
        assert_eq!(ev["session"]["turn_detection"]["type"], "server_vad");
    }
}
