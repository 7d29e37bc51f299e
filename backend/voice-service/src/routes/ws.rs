//! Push-channel upgrade endpoint.
//!
//! The socket opens unauthenticated; the session actor enforces the
//! authenticate-within-timeout contract itself.

use crate::state::AppState;
use crate::websocket::session::PushSession;
use actix_web::{get, web, Error, HttpRequest, HttpResponse};
use actix_web_actors::ws;

#[get("/ws")]
pub async fn push_channel(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
) -> Result<HttpResponse, Error> {
    let session = PushSession::new(
        state.push.clone(),
        state.sessions.clone(),
        state.settings.push.clone(),
    );
    ws::start(session, &req, stream)
}
