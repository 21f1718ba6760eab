//! Server-Sent Events support: turns an `EventBus` subscription into an
//! axum SSE response. Grounded on teacher's `api/sse.rs`, adapted from a
//! `broadcast::Receiver` to the Event Bus's per-subscriber `mpsc::Receiver`
//! (each dashboard connection gets its own bounded sink rather than all
//! connections sharing one broadcast channel).

use crate::event_bus::BusEvent;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::Stream;
use std::convert::Infallible;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;

pub fn sse_stream(receiver: mpsc::Receiver<BusEvent>) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = ReceiverStream::new(receiver).map(|event| Ok(bus_event_to_axum(event)));

    Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)).text("ping"))
}

fn bus_event_to_axum(event: BusEvent) -> Event {
    let event_type = match &event {
        BusEvent::TaskCreated { .. } => "task_created",
        BusEvent::TaskUpdate { .. } => "task_update",
        BusEvent::ScheduleExecuted { .. } => "schedule_executed",
        BusEvent::StorageUpdate { .. } => "storage_update",
        BusEvent::Ping => "ping",
    };
    let data = serde_json::to_string(&event).unwrap_or_else(|_| "{}".to_string());
    Event::default().event(event_type).data(data)
}
