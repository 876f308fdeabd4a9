//! Built-in request handlers shared by hub and leaf
//!
//! Both roles expose the same small surface to the services installed here
//! and to the record store: send an envelope, answer a request, and ask the
//! hub for something.

use std::sync::{Arc, PoisonError, RwLock, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use fabric_core::{
    Envelope, EventDispatcher, FabricError, FabricResult, MessageKind, Payload, PermissionCheck,
    Ping, Timestamp,
};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};
use uuid::Uuid;

/// Decides whether a player holds a permission on this node
pub type PermissionCheckFn = Arc<dyn Fn(Uuid, &str) -> bool + Send + Sync>;

pub(crate) type PermissionSlot = Arc<RwLock<Option<PermissionCheckFn>>>;

/// The sending half of a hub or leaf
#[async_trait]
pub trait Endpoint: Send + Sync {
    /// Name this node is known by on the fabric
    fn local_name(&self) -> String;

    /// Send an envelope, routed by its forward target
    async fn publish(&self, envelope: Envelope) -> FabricResult<()>;

    /// Answer `request`, received from `sender`, with `payload`
    async fn respond(&self, sender: &str, request: &Envelope, payload: Payload) -> FabricResult<()>;

    /// Send a request toward the hub and wait for the answer
    async fn request_upstream(&self, envelope: Envelope, timeout: Duration)
        -> FabricResult<Envelope>;
}

/// Serialize a typed struct as an envelope payload
pub fn typed_payload<T: Serialize>(value: &T) -> FabricResult<Payload> {
    match serde_json::to_value(value)? {
        Value::Object(map) => Ok(map),
        Value::Null => Ok(Payload::new()),
        other => Err(FabricError::malformed(format!(
            "payload must be a JSON object, got {}",
            other
        ))),
    }
}

// ----------------------------------------------------------------------------
// Dispatch Queue
// ----------------------------------------------------------------------------

/// Inbound envelopes waiting for local dispatch, tagged with their sender
pub(crate) type DispatchQueue = mpsc::UnboundedSender<(String, Envelope)>;

/// Run listeners off the reader tasks, in arrival order
pub(crate) fn spawn_dispatch_worker(
    dispatcher: Arc<EventDispatcher>,
    mut inbox: mpsc::UnboundedReceiver<(String, Envelope)>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some((sender, envelope)) = inbox.recv().await {
            let matched = dispatcher.execute(&sender, &envelope);
            if matched == 0 {
                trace!("No listener for {} from {}", envelope.kind(), sender);
            }
        }
    })
}

// ----------------------------------------------------------------------------
// Request Builders
// ----------------------------------------------------------------------------

pub(crate) fn ping_request() -> FabricResult<Envelope> {
    Envelope::new(MessageKind::Ping).with_typed_payload(&Ping {
        sent_at: Timestamp::now().as_millis(),
    })
}

/// Await a ping round trip and return its duration
pub(crate) async fn time_ping<F>(exchange: F) -> FabricResult<Duration>
where
    F: std::future::Future<Output = FabricResult<Envelope>>,
{
    let started = Instant::now();
    let response = exchange.await?;
    response.decode::<Ping>()?;
    Ok(started.elapsed())
}

pub(crate) fn permission_request(player: Uuid, permission: &str) -> FabricResult<Envelope> {
    Envelope::new(MessageKind::HasPermission).with_typed_payload(&PermissionCheck::Query {
        player,
        permission: permission.to_string(),
    })
}

pub(crate) fn permission_answer(response: &Envelope) -> FabricResult<bool> {
    match response.decode::<PermissionCheck>()? {
        PermissionCheck::Answer { result } => Ok(result),
        PermissionCheck::Query { .. } => Err(FabricError::malformed(
            "expected a permission answer, got a query",
        )),
    }
}

// ----------------------------------------------------------------------------
// Service Installation
// ----------------------------------------------------------------------------

fn is_request(envelope: &Envelope) -> bool {
    envelope.id().is_some() && !envelope.is_response()
}

fn answer_later(endpoint: &Weak<dyn Endpoint>, sender: &str, request: &Envelope, payload: Payload) {
    let Some(endpoint) = endpoint.upgrade() else {
        return;
    };
    let sender = sender.to_string();
    let request = request.clone();
    tokio::spawn(async move {
        if let Err(e) = endpoint.respond(&sender, &request, payload).await {
            warn!("Could not answer {} from {}: {}", request.kind(), sender, e);
        }
    });
}

/// Register the ping and permission responders on `dispatcher`
pub(crate) fn install_builtin_services(
    dispatcher: &EventDispatcher,
    endpoint: Weak<dyn Endpoint>,
    permissions: PermissionSlot,
) {
    let ping_endpoint = endpoint.clone();
    dispatcher.register(MessageKind::Ping, None, move |sender, envelope| {
        if is_request(envelope) {
            debug!("Ping from {}", sender);
            answer_later(&ping_endpoint, sender, envelope, envelope.payload().clone());
        }
        Ok(())
    });

    dispatcher.register(MessageKind::HasPermission, None, move |sender, envelope| {
        if !is_request(envelope) {
            return Ok(());
        }
        let (player, permission) = match envelope.decode::<PermissionCheck>()? {
            PermissionCheck::Query { player, permission } => (player, permission),
            PermissionCheck::Answer { .. } => return Ok(()),
        };
        let result = permissions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|check| check(player, &permission))
            .unwrap_or(false);
        debug!("{} asks whether {} has {}: {}", sender, player, permission, result);
        answer_later(
            &endpoint,
            sender,
            envelope,
            typed_payload(&PermissionCheck::Answer { result })?,
        );
        Ok(())
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use fabric_core::{ChatMessage, Identifier};
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingEndpoint {
        answers: Mutex<Vec<(String, Payload)>>,
    }

    #[async_trait]
    impl Endpoint for RecordingEndpoint {
        fn local_name(&self) -> String {
            "test".to_string()
        }

        async fn publish(&self, _envelope: Envelope) -> FabricResult<()> {
            Ok(())
        }

        async fn respond(&self, sender: &str, _request: &Envelope, payload: Payload) -> FabricResult<()> {
            self.answers
                .lock()
                .unwrap()
                .push((sender.to_string(), payload));
            Ok(())
        }

        async fn request_upstream(&self, _envelope: Envelope, timeout: Duration) -> FabricResult<Envelope> {
            Err(FabricError::timeout(timeout))
        }
    }

    fn create_test_request(envelope: Envelope) -> Envelope {
        let mut envelope = envelope;
        envelope.assign_id(Identifier::compose(3, 9)).unwrap();
        envelope
    }

    #[test]
    fn test_typed_payload_requires_object() {
        let chat = ChatMessage {
            message: "hi".into(),
            recipients: vec![],
            permission: None,
        };
        assert!(typed_payload(&chat).unwrap().contains_key("message"));
        assert!(typed_payload(&5u32).is_err());
    }

    #[test]
    fn test_permission_answer_rejects_query() {
        let query = permission_request(Uuid::new_v4(), "fly").unwrap();
        assert!(permission_answer(&query).is_err());
    }

    #[tokio::test]
    async fn test_builtin_services_answer_requests() {
        let recorder = Arc::new(RecordingEndpoint::default());
        let endpoint: Arc<dyn Endpoint> = recorder.clone();
        let slot: PermissionSlot = Arc::new(RwLock::new(None));
        let dispatcher = EventDispatcher::new();
        install_builtin_services(&dispatcher, Arc::downgrade(&endpoint), slot.clone());

        let player = Uuid::new_v4();
        let query = create_test_request(permission_request(player, "fly").unwrap());
        dispatcher.execute("alpha", &query);

        *slot.write().unwrap() = Some(Arc::new(move |id: Uuid, perm: &str| {
            id == player && perm == "fly"
        }));
        dispatcher.execute("alpha", &query);
        dispatcher.execute("beta", &create_test_request(ping_request().unwrap()));
        tokio::time::sleep(Duration::from_millis(50)).await;

        let answers = recorder.answers.lock().unwrap().clone();
        assert_eq!(answers.len(), 3);
        let results: Vec<Option<Value>> = answers
            .iter()
            .filter(|(sender, _)| sender == "alpha")
            .map(|(_, payload)| payload.get("result").cloned())
            .collect();
        assert!(results.contains(&Some(Value::Bool(false))));
        assert!(results.contains(&Some(Value::Bool(true))));
        assert!(answers.iter().any(|(sender, payload)| sender == "beta" && payload.contains_key("sent_at")));
    }
}
