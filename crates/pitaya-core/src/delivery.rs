//! Response delivery back to the transport.
//!
//! Every dispatched request owes the transport exactly one response. That
//! obligation is a [`PendingResponse`]: it is consumed by
//! [`PendingResponse::respond`], and if it is dropped unconsumed (the
//! dispatch future was dropped or unwound) it delivers an internal error
//! instead.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::error::{DeliveryError, CODE_INTERNAL};
use crate::protos::Response;

/// Opaque identifier the transport uses to match a response to its request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestHandle(u64);

impl RequestHandle {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn id(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for RequestHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The transport side of the response path.
pub trait ResponseDelivery: Send + Sync {
    /// Hand envelope-encoded response bytes back to the transport.
    fn deliver(&self, handle: RequestHandle, response: Vec<u8>) -> Result<(), DeliveryError>;
}

/// A response that has been handed to a [`ChannelDelivery`].
#[derive(Debug, Clone, PartialEq)]
pub struct Delivered {
    pub handle: RequestHandle,
    pub response: Vec<u8>,
}

impl Delivered {
    pub fn decode(&self) -> Result<Response, serde_json::Error> {
        Response::decode(&self.response)
    }
}

/// Delivers responses over an unbounded tokio channel.
#[derive(Debug, Clone)]
pub struct ChannelDelivery {
    tx: mpsc::UnboundedSender<Delivered>,
}

impl ChannelDelivery {
    /// Create the delivery side and the receiver the transport drains.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Delivered>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl ResponseDelivery for ChannelDelivery {
    fn deliver(&self, handle: RequestHandle, response: Vec<u8>) -> Result<(), DeliveryError> {
        self.tx
            .send(Delivered { handle, response })
            .map_err(|_| DeliveryError::ChannelClosed)
    }
}

/// The obligation to answer one request.
pub struct PendingResponse {
    handle: RequestHandle,
    delivery: Option<Arc<dyn ResponseDelivery>>,
}

impl PendingResponse {
    pub fn new(handle: RequestHandle, delivery: Arc<dyn ResponseDelivery>) -> Self {
        Self {
            handle,
            delivery: Some(delivery),
        }
    }

    pub fn handle(&self) -> RequestHandle {
        self.handle
    }

    /// Encode and deliver `response`. Failures are logged and dropped.
    pub fn respond(mut self, response: &Response) {
        if let Some(delivery) = self.delivery.take() {
            send(self.handle, delivery.as_ref(), response);
        }
    }
}

impl Drop for PendingResponse {
    fn drop(&mut self) {
        if let Some(delivery) = self.delivery.take() {
            tracing::error!(
                "[Delivery] Request {} finished without a response, sending internal error",
                self.handle
            );
            let response = Response::error(CODE_INTERNAL, "request ended without a response");
            send(self.handle, delivery.as_ref(), &response);
        }
    }
}

fn send(handle: RequestHandle, delivery: &dyn ResponseDelivery, response: &Response) {
    let result = response
        .encode()
        .map_err(DeliveryError::from)
        .and_then(|bytes| delivery.deliver(handle, bytes));
    if let Err(e) = result {
        tracing::error!("[Delivery] Failed to deliver response for {}: {}", handle, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        delivered: Mutex<Vec<(RequestHandle, Response)>>,
    }

    impl ResponseDelivery for Recorder {
        fn deliver(&self, handle: RequestHandle, response: Vec<u8>) -> Result<(), DeliveryError> {
            let response = Response::decode(&response)?;
            self.delivered.lock().unwrap().push((handle, response));
            Ok(())
        }
    }

    #[test]
    fn test_respond_delivers_once() {
        let recorder = Arc::new(Recorder::default());
        let pending = PendingResponse::new(RequestHandle::new(1), recorder.clone());
        pending.respond(&Response::ok(b"\"hi\"".to_vec()));

        let delivered = recorder.delivered.lock().unwrap();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].0, RequestHandle::new(1));
        assert_eq!(delivered[0].1.data, b"\"hi\"".to_vec());
    }

    #[test]
    fn test_dropped_obligation_sends_internal_error() {
        let recorder = Arc::new(Recorder::default());
        drop(PendingResponse::new(RequestHandle::new(2), recorder.clone()));

        let delivered = recorder.delivered.lock().unwrap();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].1.error.as_ref().unwrap().code, "PIT-500");
    }

    #[tokio::test]
    async fn test_channel_delivery() {
        let (delivery, mut rx) = ChannelDelivery::channel();
        delivery.deliver(RequestHandle::new(3), b"{}".to_vec()).unwrap();
        let got = rx.recv().await.unwrap();
        assert_eq!(got.handle.id(), 3);
        assert_eq!(got.decode().unwrap(), Response::default());
    }

    #[test]
    fn test_channel_closed_is_delivery_failure() {
        let (delivery, rx) = ChannelDelivery::channel();
        drop(rx);
        let err = delivery.deliver(RequestHandle::new(4), Vec::new()).unwrap_err();
        assert!(matches!(err, DeliveryError::ChannelClosed));

        // Logged and dropped, never panics.
        PendingResponse::new(RequestHandle::new(4), Arc::new(delivery))
            .respond(&Response::ok(Vec::new()));
    }
}
