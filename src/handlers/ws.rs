//! Bidirectional streaming channel
//!
//! All frames are JSON with a `type` discriminator and a `payload` field.
//! Malformed inbound frames get an `error` event back on the same channel;
//! the channel stays open.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;

use crate::engine::broadcast::ServerEvent;
use crate::models::{Anomaly, ImpactPrediction};
use crate::AppState;

#[derive(Debug, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
enum ClientMessage {
    Chat { message: String },
    SubscribeAnomalies,
    GetPredictions,
}

pub async fn upgrade(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle(socket, state))
}

async fn handle(socket: WebSocket, state: AppState) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerEvent>();

    let session_id = state.engine.lock().await.register_session(tx.clone());
    let _ = tx.send(ServerEvent::Connected { session_id });

    // Writer half: serialize queued events onto the socket
    let writer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let Ok(text) = serde_json::to_string(&event) else {
                continue;
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(message)) = stream.next().await {
        let text = match message {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };

        match serde_json::from_str::<ClientMessage>(&text) {
            Ok(ClientMessage::Chat { message }) => {
                let mut engine = state.engine.lock().await;
                match engine.chat(session_id, &message).await {
                    Ok(reply) => {
                        engine.send_to_session(session_id, ServerEvent::ChatResponse {
                            message: reply,
                        });
                    }
                    Err(e) => {
                        tracing::error!(%session_id, "Chat request failed: {}", e);
                        engine.send_to_session(session_id, ServerEvent::Error {
                            message: "Chat request failed".to_string(),
                        });
                    }
                }
            }
            Ok(ClientMessage::SubscribeAnomalies) => {
                let engine = state.engine.lock().await;
                match Anomaly::unresolved(engine.pool()).await {
                    Ok(anomalies) => {
                        // Immediate replay of the current unresolved list
                        for anomaly in anomalies {
                            engine.send_to_session(
                                session_id,
                                ServerEvent::AnomalyDetected { anomaly },
                            );
                        }
                    }
                    Err(e) => {
                        tracing::error!(%session_id, "Anomaly subscription failed: {}", e);
                        engine.send_to_session(session_id, ServerEvent::Error {
                            message: "Failed to load anomalies".to_string(),
                        });
                    }
                }
            }
            Ok(ClientMessage::GetPredictions) => {
                let engine = state.engine.lock().await;
                match ImpactPrediction::list(engine.pool(), 50).await {
                    Ok(predictions) => {
                        engine.send_to_session(
                            session_id,
                            ServerEvent::Predictions { predictions },
                        );
                    }
                    Err(e) => {
                        tracing::error!(%session_id, "Prediction listing failed: {}", e);
                        engine.send_to_session(session_id, ServerEvent::Error {
                            message: "Failed to load predictions".to_string(),
                        });
                    }
                }
            }
            Err(_) => {
                let engine = state.engine.lock().await;
                engine.send_to_session(session_id, ServerEvent::Error {
                    message: "Invalid message format".to_string(),
                });
            }
        }
    }

    state.engine.lock().await.unregister_session(session_id);
    writer.abort();
}
