//! One actor per push connection.
//!
//! The actor starts unauthenticated and must receive a valid `authenticate`
//! frame within the auth timeout or the connection is closed with
//! `auth-timeout`. All connection state (auth flag, liveness, topics) mutates
//! only inside the actor context, so it needs no locks of its own; anything
//! async (token verification, registry and buffer calls) runs in spawned
//! tasks that report back through the mailbox.

use crate::config::PushSettings;
use crate::error::AppError;
use crate::security::SessionTokenService;
use crate::websocket::frames::{parse_topic, ClientFrame, ServerFrame};
use crate::websocket::{ChannelManager, PushMessage};
use actix::{
    Actor, ActorContext, AsyncContext, Handler, Message as ActixMessage, StreamHandler,
};
use actix_web_actors::ws;
use chrono::Utc;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(ActixMessage)]
#[rtype(result = "()")]
struct AuthOutcome(Result<(Uuid, UnboundedReceiver<PushMessage>), String>);

#[derive(ActixMessage)]
#[rtype(result = "()")]
struct ReplayReady {
    topic: String,
    replay: Vec<String>,
    consumed: usize,
}

pub struct PushSession {
    conn_id: Uuid,
    user_id: Option<Uuid>,
    authenticated: bool,
    is_alive: bool,
    last_seen: Instant,
    manager: Arc<ChannelManager>,
    sessions: Arc<SessionTokenService>,
    settings: PushSettings,
}

impl PushSession {
    pub fn new(
        manager: Arc<ChannelManager>,
        sessions: Arc<SessionTokenService>,
        settings: PushSettings,
    ) -> Self {
        Self {
            conn_id: Uuid::new_v4(),
            user_id: None,
            authenticated: false,
            is_alive: true,
            last_seen: Instant::now(),
            manager,
            sessions,
            settings,
        }
    }

    fn touch(&mut self) {
        self.is_alive = true;
        self.last_seen = Instant::now();
    }

    fn send_frame(&self, ctx: &mut ws::WebsocketContext<Self>, frame: ServerFrame) {
        ctx.text(frame.encode());
    }

    /// Auth deadline: close unauthenticated connections after the timeout.
    fn schedule_auth_deadline(&self, ctx: &mut ws::WebsocketContext<Self>) {
        ctx.run_later(self.settings.auth_timeout(), |act, ctx| {
            if !act.authenticated {
                debug!(conn_id = %act.conn_id, "push connection never authenticated");
                ctx.close(Some(ws::CloseReason {
                    code: ws::CloseCode::Policy,
                    description: Some("auth-timeout".to_string()),
                }));
                ctx.stop();
            }
        });
    }

    /// Liveness: terminate dead or idle connections, otherwise reset the
    /// flag and ping. Any inbound traffic flips the flag back on.
    fn schedule_liveness(&self, ctx: &mut ws::WebsocketContext<Self>) {
        let inactive_timeout = self.settings.inactive_timeout();
        ctx.run_interval(self.settings.ping_interval(), move |act, ctx| {
            if !act.is_alive || act.last_seen.elapsed() > inactive_timeout {
                debug!(conn_id = %act.conn_id, "push connection failed liveness check");
                ctx.stop();
                return;
            }
            act.is_alive = false;
            ctx.ping(b"");
        });
    }

    fn handle_frame(&mut self, frame: ClientFrame, ctx: &mut ws::WebsocketContext<Self>) {
        match frame {
            ClientFrame::Authenticate { token } => self.handle_authenticate(token, ctx),
            ClientFrame::Ping => self.send_frame(ctx, ServerFrame::Pong),
            ClientFrame::Subscribe { topic } => self.handle_subscribe(topic, ctx),
            ClientFrame::Unsubscribe { topic } | ClientFrame::Cancel { topic } => {
                self.handle_unsubscribe(topic, ctx)
            }
        }
    }

    fn handle_authenticate(&mut self, token: String, ctx: &mut ws::WebsocketContext<Self>) {
        if self.authenticated {
            self.send_frame(
                ctx,
                ServerFrame::Error {
                    message: "already authenticated".to_string(),
                },
            );
            return;
        }

        let sessions = self.sessions.clone();
        let manager = self.manager.clone();
        let conn_id = self.conn_id;
        let addr = ctx.address();

        actix::spawn(async move {
            let outcome = match sessions.verify(&token).await {
                Ok(user_id) => {
                    let rx = manager.register(user_id, conn_id).await;
                    Ok((user_id, rx))
                }
                Err(err) => Err(auth_error_reason(&err)),
            };
            addr.do_send(AuthOutcome(outcome));
        });
    }

    fn handle_subscribe(&mut self, topic: String, ctx: &mut ws::WebsocketContext<Self>) {
        let Some(user_id) = self.require_auth(ctx) else {
            return;
        };
        if parse_topic(&topic).is_none() {
            self.send_frame(
                ctx,
                ServerFrame::Error {
                    message: format!("unsupported topic: {topic}"),
                },
            );
            return;
        }

        let manager = self.manager.clone();
        let conn_id = self.conn_id;
        let addr = ctx.address();

        actix::spawn(async move {
            let (replay, consumed) = manager.subscribe(user_id, conn_id, &topic).await;
            addr.do_send(ReplayReady {
                topic,
                replay,
                consumed,
            });
        });
    }

    fn handle_unsubscribe(&mut self, topic: String, ctx: &mut ws::WebsocketContext<Self>) {
        let Some(user_id) = self.require_auth(ctx) else {
            return;
        };

        let manager = self.manager.clone();
        let conn_id = self.conn_id;
        let unsub_topic = topic.clone();
        actix::spawn(async move {
            manager.unsubscribe(user_id, conn_id, &unsub_topic).await;
        });

        self.send_frame(ctx, ServerFrame::Unsubscribed { topic });
    }

    fn require_auth(&self, ctx: &mut ws::WebsocketContext<Self>) -> Option<Uuid> {
        match self.user_id {
            Some(user_id) if self.authenticated => Some(user_id),
            _ => {
                self.send_frame(
                    ctx,
                    ServerFrame::Error {
                        message: "authentication required".to_string(),
                    },
                );
                None
            }
        }
    }
}

/// Coarse reasons surfaced in `auth_error` frames.
fn auth_error_reason(err: &AppError) -> String {
    match err {
        AppError::ExpiredToken => "expired".to_string(),
        AppError::InvalidToken(reason) => reason.clone(),
        AppError::MissingToken => "invalid payload".to_string(),
        _ => "verification unavailable".to_string(),
    }
}

impl Actor for PushSession {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        debug!(conn_id = %self.conn_id, "push connection opened");
        self.send_frame(
            ctx,
            ServerFrame::Connected {
                server_time: Utc::now().timestamp(),
            },
        );
        self.schedule_auth_deadline(ctx);
        self.schedule_liveness(ctx);
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        if let Some(user_id) = self.user_id {
            info!(conn_id = %self.conn_id, user_id = %user_id, "push connection closed");
            let manager = self.manager.clone();
            let conn_id = self.conn_id;
            actix::spawn(async move {
                manager.deregister(user_id, conn_id).await;
            });
        }
    }
}

impl Handler<AuthOutcome> for PushSession {
    type Result = ();

    fn handle(&mut self, msg: AuthOutcome, ctx: &mut Self::Context) {
        match msg.0 {
            Ok((user_id, rx)) => {
                self.user_id = Some(user_id);
                self.authenticated = true;
                ctx.add_stream(UnboundedReceiverStream::new(rx));
                self.send_frame(ctx, ServerFrame::AuthSuccess { user_id });
                info!(conn_id = %self.conn_id, user_id = %user_id, "push connection authenticated");
            }
            Err(reason) => {
                warn!(conn_id = %self.conn_id, reason = %reason, "push authentication failed");
                self.send_frame(ctx, ServerFrame::AuthError { reason });
            }
        }
    }
}

impl Handler<ReplayReady> for PushSession {
    type Result = ();

    fn handle(&mut self, msg: ReplayReady, ctx: &mut Self::Context) {
        // Ack first, then the buffered events in enqueue order.
        self.send_frame(
            ctx,
            ServerFrame::Subscribed {
                topic: msg.topic.clone(),
            },
        );
        for payload in &msg.replay {
            ctx.text(payload.clone());
        }

        // Everything was handed to an open socket; that counts as delivered.
        if msg.consumed > 0 {
            if let Some(user_id) = self.user_id {
                let manager = self.manager.clone();
                let topic = msg.topic;
                let consumed = msg.consumed;
                actix::spawn(async move {
                    manager.confirm_replay(user_id, &topic, consumed).await;
                });
            }
        }
    }
}

/// Outbound queue drained through the actor so writes stay serialized.
impl StreamHandler<PushMessage> for PushSession {
    fn handle(&mut self, msg: PushMessage, ctx: &mut Self::Context) {
        match msg {
            PushMessage::Frame(frame) => self.send_frame(ctx, frame),
            PushMessage::Shutdown => {
                ctx.close(Some(ws::CloseReason {
                    code: ws::CloseCode::Away,
                    description: Some("server-shutdown".to_string()),
                }));
                ctx.stop();
            }
        }
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for PushSession {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Ping(payload)) => {
                self.touch();
                ctx.pong(&payload);
            }
            Ok(ws::Message::Pong(_)) => {
                self.touch();
            }
            Ok(ws::Message::Text(text)) => {
                self.touch();
                match ClientFrame::decode(&text) {
                    Ok(frame) => self.handle_frame(frame, ctx),
                    Err(err) => {
                        debug!(conn_id = %self.conn_id, error = %err, "unrecognized push frame");
                        self.send_frame(
                            ctx,
                            ServerFrame::Error {
                                message: "unrecognized frame".to_string(),
                            },
                        );
                    }
                }
            }
            Ok(ws::Message::Binary(_)) => {
                self.send_frame(
                    ctx,
                    ServerFrame::Error {
                        message: "binary frames not supported".to_string(),
                    },
                );
            }
            Ok(ws::Message::Close(reason)) => {
                ctx.close(reason);
                ctx.stop();
            }
            Ok(_) => {}
            Err(err) => {
                warn!(conn_id = %self.conn_id, error = %err, "push protocol error");
                ctx.stop();
            }
        }
    }
}
