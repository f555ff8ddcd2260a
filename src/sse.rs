//! Server-sent Event Writer
//!
//! Turns one device's notification channel into an event-stream body:
//! `event: msg` frames for messages, `event: otkey` frames for prekey
//! replenishment signals, one JSON object per frame, flushed as produced.
//! Frame order equals channel arrival order.
//!
//! When the stream is dropped (the request's cancellation) the device id is
//! posted back to the dispatcher's closing channel so the registration goes
//! away.

use std::pin::Pin;
use std::task::{Context, Poll};

use axum::response::sse::Event;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::Stream;

use crate::registry::Notification;

fn frame(notification: Notification) -> Result<Event, axum::Error> {
    match notification {
        Notification::Message(msg) => Event::default().event("msg").json_data(&msg),
        Notification::PrekeyLow(needs) => Event::default().event("otkey").json_data(&needs),
    }
}

/// One subscriber's notification channel as an SSE body.
pub struct EventStream {
    rx: ReceiverStream<Notification>,
    _deregister: Deregister,
}

impl EventStream {
    pub fn new(
        device_id: String,
        rx: mpsc::Receiver<Notification>,
        closing: mpsc::Sender<String>,
    ) -> Self {
        EventStream {
            rx: ReceiverStream::new(rx),
            _deregister: Deregister { device_id, closing },
        }
    }
}

impl Stream for EventStream {
    type Item = Result<Event, axum::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match Pin::new(&mut self.rx).poll_next(cx) {
            Poll::Ready(Some(notification)) => Poll::Ready(Some(frame(notification))),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

struct Deregister {
    device_id: String,
    closing: mpsc::Sender<String>,
}

impl Drop for Deregister {
    fn drop(&mut self) {
        let closing = self.closing.clone();
        let device_id = std::mem::take(&mut self.device_id);
        tokio::spawn(async move {
            let _ = closing.send(device_id).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{NeedsOneTimeKey, OutgoingMessage};
    use std::time::Duration;
    use tokio_stream::StreamExt;

    #[tokio::test]
    async fn test_stream_yields_frames_in_channel_order() {
        let (tx, rx) = mpsc::channel(10);
        let (closing_tx, _closing_rx) = mpsc::channel(1);
        let mut stream = EventStream::new("d".to_string(), rx, closing_tx);

        tx.try_send(Notification::Message(OutgoingMessage {
            sender: "s".to_string(),
            payload: serde_json::json!("p"),
            seq_id: 1,
        }))
        .unwrap();
        tx.try_send(Notification::PrekeyLow(NeedsOneTimeKey {
            device_id: "d".to_string(),
            needs: 20,
        }))
        .unwrap();

        assert!(stream.next().await.unwrap().is_ok());
        assert!(stream.next().await.unwrap().is_ok());

        drop(tx);
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_drop_reports_closing_device() {
        let (_tx, rx) = mpsc::channel(10);
        let (closing_tx, mut closing_rx) = mpsc::channel(1);

        let stream = EventStream::new("device-gone".to_string(), rx, closing_tx);
        drop(stream);

        let reported = tokio::time::timeout(Duration::from_secs(1), closing_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reported, "device-gone");
    }
}
