//! Status publisher.
//!
//! A periodic snapshot feed for UI observers, entirely separate from the
//! signal hub: no Signal ever travels on this path. Each consumer gets its
//! own stream, so one slow or dead consumer cannot affect another.

use crate::app::{BlockView, Core, Status};
use crate::machine::Runtime;
use axum::response::sse::Event;
use futures_util::stream::{self, Stream};
use serde::Serialize;
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

/// How often each consumer is pushed a fresh payload.
pub const PUBLISH_INTERVAL: Duration = Duration::from_millis(800);

/// Comment-frame keep-alive cadence (`: ping`).
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// The rich observer payload: status plus the latest blocks, per-machine
/// runtime state, and the current signal subscriber count.
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub status: Status,
    pub blocks: Vec<BlockView>,
    pub machines: HashMap<String, Runtime>,
    pub subscribers: usize,
}

pub fn snapshot(core: &Core) -> Snapshot {
    Snapshot {
        status: core.status(),
        blocks: core.blocks(),
        machines: core.engine().runtime_snapshot(),
        subscribers: core.hub().count(),
    }
}

/// `status` events with the bare status payload. The first event is pushed
/// immediately, then one per interval.
pub fn status_stream(core: Arc<Core>) -> impl Stream<Item = Result<Event, Infallible>> {
    stream::unfold(
        (core, tokio::time::interval(PUBLISH_INTERVAL)),
        |(core, mut tick)| async move {
            tick.tick().await;
            let event = json_event("status", &core.status());
            Some((Ok(event), (core, tick)))
        },
    )
}

/// `snapshot` events with the full observer payload.
pub fn snapshot_stream(core: Arc<Core>) -> impl Stream<Item = Result<Event, Infallible>> {
    stream::unfold(
        (core, tokio::time::interval(PUBLISH_INTERVAL)),
        |(core, mut tick)| async move {
            tick.tick().await;
            let event = json_event("snapshot", &snapshot(&core));
            Some((Ok(event), (core, tick)))
        },
    )
}

fn json_event<T: Serialize>(name: &str, value: &T) -> Event {
    match Event::default().event(name).json_data(value) {
        Ok(event) => event,
        // a Serialize impl that fails here would be a bug; keep the stream up
        Err(_) => Event::default().event(name).data("{}"),
    }
}
