use axum::{
    extract::State,
    response::{
        sse::{Event, KeepAlive},
        Sse,
    },
};

use visor_core::EventEnvelope;

use super::AppState;

/// `GET /api/v1/notifications`
///
/// Server-sent events, one per notification. Lagging clients skip what
/// they missed.
pub async fn notifications(
    State(state): State<AppState>,
) -> Sse<impl futures::Stream<Item = Result<Event, std::convert::Infallible>>> {
    let rx = state.events.subscribe();

    use tokio_stream::StreamExt as _;
    let stream = tokio_stream::wrappers::BroadcastStream::new(rx).filter_map(
        |result: Result<EventEnvelope, _>| match result {
            Ok(envelope) => match serde_json::to_string(&envelope) {
                Ok(json) => Some(Ok(Event::default()
                    .event(envelope.event_type.clone())
                    .id(envelope.event_id.to_string())
                    .data(json))),
                Err(_) => None,
            },
            Err(_) => None,
        },
    );

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(std::time::Duration::from_secs(15))
            .text("keepalive"),
    )
}
