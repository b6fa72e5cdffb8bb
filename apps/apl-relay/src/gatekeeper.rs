use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::{
        ws::{rejection::WebSocketUpgradeRejection, Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, State,
    },
    http::{header, HeaderMap, StatusCode, Uri},
    response::{IntoResponse, Response},
};
use futures_util::{future, SinkExt, StreamExt};
use metrics::counter;
use tracing::{info, warn};

use crate::error::{RelayError, Result};
use crate::lifecycle::{run_session, InboundFrame, OutboundFrame, SessionContext};
use crate::server::RelayState;
use crate::telemetry::UPGRADES_TOTAL;

/// Sub-protocol a client must offer to open a session.
pub const SESSION_PROTOCOL: &str = "apl-protocol";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OriginPolicy {
    allowed: Vec<String>,
}

impl OriginPolicy {
    pub fn new<I, S>(allowed: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            allowed: allowed
                .into_iter()
                .map(|origin| normalise_origin(origin.as_ref()).to_string())
                .collect(),
        }
    }

    pub fn allows(&self, origin: &str) -> bool {
        let origin = normalise_origin(origin);
        !origin.is_empty() && self.allowed.iter().any(|allowed| allowed == origin)
    }
}

fn normalise_origin(origin: &str) -> &str {
    origin.trim().trim_end_matches('/')
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admission {
    pub origin: String,
    pub protocol: &'static str,
}

/// Decides whether an upgrade request may open a session.
pub fn admit(headers: &HeaderMap, policy: &OriginPolicy) -> Result<Admission> {
    let offers_protocol = headers
        .get_all(header::SEC_WEBSOCKET_PROTOCOL)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|offered| offered.trim() == SESSION_PROTOCOL);
    if !offers_protocol {
        return Err(RelayError::ProtocolMismatch {
            expected: SESSION_PROTOCOL,
        });
    }

    let origin = headers
        .get(header::ORIGIN)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    if !policy.allows(origin) {
        return Err(RelayError::OriginRejected {
            origin: origin.to_string(),
        });
    }

    Ok(Admission {
        origin: origin.to_string(),
        protocol: SESSION_PROTOCOL,
    })
}

/// Admits or refuses an upgrade request. Every decision produces exactly one
/// log line and one counter increment.
pub fn screen_upgrade(
    headers: &HeaderMap,
    policy: &OriginPolicy,
    remote: SocketAddr,
) -> Result<Admission> {
    match admit(headers, policy) {
        Ok(admission) => {
            info!(remote = %remote, origin = %admission.origin, "upgrade accepted");
            counter!(UPGRADES_TOTAL, "outcome" => "accepted").increment(1);
            Ok(admission)
        }
        Err(err) => {
            warn!(
                remote = %remote,
                origin = headers
                    .get(header::ORIGIN)
                    .and_then(|value| value.to_str().ok())
                    .unwrap_or("<none>"),
                error = %err,
                "upgrade rejected"
            );
            counter!(UPGRADES_TOTAL, "outcome" => err.metric_label()).increment(1);
            Err(err)
        }
    }
}

/// Handles every request on the relay listener.
///
/// Plain requests get an empty `404`; upgrade requests are admitted or
/// refused with `403` before any worker is spawned.
pub async fn gatekeeper(
    State(state): State<Arc<RelayState>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    uri: Uri,
    headers: HeaderMap,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let ws = match upgrade {
        Ok(ws) => ws,
        Err(_) => {
            info!(remote = %remote, path = %uri.path(), "received plain request; answering 404");
            counter!(UPGRADES_TOTAL, "outcome" => "not_upgrade").increment(1);
            return StatusCode::NOT_FOUND.into_response();
        }
    };

    let Ok(admission) = screen_upgrade(&headers, &state.origins, remote) else {
        return StatusCode::FORBIDDEN.into_response();
    };

    let ctx = SessionContext::new(Some(remote), admission.origin, admission.protocol);
    ws.protocols([SESSION_PROTOCOL])
        .on_failed_upgrade(move |err| {
            warn!(remote = %remote, error = %err, "websocket upgrade failed");
        })
        .on_upgrade(move |socket| serve_socket(socket, state, ctx))
}

async fn serve_socket(socket: WebSocket, state: Arc<RelayState>, ctx: SessionContext) {
    let _active = state.track_session();
    let (sink, stream) = socket.split();
    let inbound = stream.map(|message| message.map(inbound_frame));
    let outbound = sink.with(|frame| future::ready(Ok::<_, axum::Error>(outbound_message(frame))));

    let remote = ctx.remote;
    let report = run_session(
        ctx,
        state.session.clone(),
        inbound,
        outbound,
        state.shutdown_signal(),
    )
    .await;
    info!(
        remote = ?remote,
        connection_id = %report.connection_id,
        reason = ?report.reason.as_ref().map(|reason| reason.to_string()),
        duration_ms = report.duration.as_millis() as u64,
        "peer disconnected"
    );
}

fn inbound_frame(message: Message) -> InboundFrame {
    match message {
        Message::Text(text) => InboundFrame::Text(text),
        Message::Close(frame) => InboundFrame::Close(frame.map(|frame| frame.reason.into_owned())),
        Message::Binary(_) | Message::Ping(_) | Message::Pong(_) => InboundFrame::Ignored,
    }
}

fn outbound_message(frame: OutboundFrame) -> Message {
    match frame {
        OutboundFrame::Text(text) => Message::Text(text),
        OutboundFrame::Close => Message::Close(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use std::io;
    use std::sync::Mutex;

    #[derive(Clone, Default)]
    struct LogBuffer(Arc<Mutex<Vec<u8>>>);

    impl io::Write for LogBuffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().expect("log buffer").extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn logged_while(f: impl FnOnce()) -> String {
        let buffer = LogBuffer::default();
        let writer = buffer.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .without_time()
            .finish();
        tracing::subscriber::with_default(subscriber, f);
        let bytes = buffer.0.lock().expect("log buffer").clone();
        String::from_utf8(bytes).expect("utf-8 log output")
    }

    fn remote() -> SocketAddr {
        "203.0.113.7:50000".parse().expect("addr")
    }

    fn headers(origin: Option<&str>, protocol: Option<&str>) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Some(origin) = origin {
            headers.insert(header::ORIGIN, HeaderValue::from_str(origin).unwrap());
        }
        if let Some(protocol) = protocol {
            headers.insert(
                header::SEC_WEBSOCKET_PROTOCOL,
                HeaderValue::from_str(protocol).unwrap(),
            );
        }
        headers
    }

    fn policy() -> OriginPolicy {
        OriginPolicy::new(["http://juergen-sauermann.de/"])
    }

    #[test_timeout::timeout]
    fn allowed_origin_with_protocol_is_admitted() {
        let admission = admit(
            &headers(Some("http://juergen-sauermann.de"), Some("chat, apl-protocol")),
            &policy(),
        )
        .expect("admitted");
        assert_eq!(admission.origin, "http://juergen-sauermann.de");
        assert_eq!(admission.protocol, SESSION_PROTOCOL);
    }

    #[test_timeout::timeout]
    fn foreign_origin_is_rejected() {
        let err = admit(
            &headers(Some("http://evil.example"), Some(SESSION_PROTOCOL)),
            &policy(),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            RelayError::OriginRejected { ref origin } if origin == "http://evil.example"
        ));

        let err = admit(&headers(None, Some(SESSION_PROTOCOL)), &policy()).unwrap_err();
        assert!(matches!(err, RelayError::OriginRejected { .. }));
    }

    #[test_timeout::timeout]
    fn missing_protocol_is_rejected() {
        let err = admit(&headers(Some("http://juergen-sauermann.de"), None), &policy()).unwrap_err();
        assert!(matches!(err, RelayError::ProtocolMismatch { .. }));

        let err = admit(
            &headers(Some("http://juergen-sauermann.de"), Some("apl-protocol-v2")),
            &policy(),
        )
        .unwrap_err();
        assert!(matches!(err, RelayError::ProtocolMismatch { .. }));
    }

    #[test_timeout::timeout]
    fn non_text_frames_are_ignored() {
        assert_eq!(inbound_frame(Message::Binary(vec![1, 2])), InboundFrame::Ignored);
        assert_eq!(inbound_frame(Message::Ping(vec![])), InboundFrame::Ignored);
        assert_eq!(
            inbound_frame(Message::Text("1+1\n".into())),
            InboundFrame::Text("1+1\n".into())
        );
        assert_eq!(inbound_frame(Message::Close(None)), InboundFrame::Close(None));
    }

    #[test_timeout::timeout]
    fn each_decision_logs_exactly_one_line() {
        let logs = logged_while(|| {
            let refused = screen_upgrade(
                &headers(Some("http://evil.example"), Some(SESSION_PROTOCOL)),
                &policy(),
                remote(),
            );
            assert!(refused.is_err());
        });
        assert_eq!(logs.lines().count(), 1, "{logs}");
        assert_eq!(logs.matches("upgrade rejected").count(), 1, "{logs}");
        assert!(logs.contains("WARN"), "{logs}");
        assert!(logs.contains("http://evil.example"), "{logs}");

        let logs = logged_while(|| {
            let admitted = screen_upgrade(
                &headers(Some("http://juergen-sauermann.de"), Some(SESSION_PROTOCOL)),
                &policy(),
                remote(),
            );
            assert!(admitted.is_ok());
        });
        assert_eq!(logs.lines().count(), 1, "{logs}");
        assert_eq!(logs.matches("upgrade accepted").count(), 1, "{logs}");
        assert!(logs.contains("203.0.113.7:50000"), "{logs}");
    }
}
