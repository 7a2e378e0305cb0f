//! Consumers of acquired samples.
//!
//! A [`Client`] receives each sample together with its capture timestamp. Clients
//! are kept in a [`ClientStack`]: pushing a client shadows the previous one and
//! popping restores it. Only the top of the stack receives newly captured
//! samples, while anything already queued for a client still on the stack is
//! delivered to it.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use crossbeam::channel::Sender;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::{DeviceError, DeviceResult};

/// Delivery failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// The client is gone and should not be tried again.
    #[error("Connection to client closed")]
    ConnectionClosed,

    /// The client rejected this delivery.
    #[error("Delivery failed: {0}")]
    Delivery(String),
}

/// Serializable description of an acquisition fault.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteError {
    /// Human readable description.
    pub message: String,
}

impl From<&DeviceError> for RemoteError {
    fn from(err: &DeviceError) -> Self {
        Self {
            message: err.to_string(),
        }
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// What a client receives: a sample, or the fault that replaced one.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload<S> {
    /// Processed sample.
    Data(S),
    /// The fetch hook failed for this sample.
    Error(RemoteError),
}

impl<S> Payload<S> {
    /// The sample, if this is not a fault.
    pub fn data(self) -> Option<S> {
        match self {
            Payload::Data(sample) => Some(sample),
            Payload::Error(_) => None,
        }
    }

    /// True for faults.
    pub fn is_error(&self) -> bool {
        matches!(self, Payload::Error(_))
    }
}

/// A consumer of samples.
pub trait Client<S>: Send + Sync {
    /// Deliver one sample.
    ///
    /// Return [`ClientError::ConnectionClosed`] when the client can no longer
    /// be reached so that it is dropped from further deliveries.
    fn receive(&self, payload: Payload<S>, timestamp: DateTime<Utc>) -> Result<(), ClientError>;
}

impl<S: Send> Client<S> for Sender<(Payload<S>, DateTime<Utc>)> {
    fn receive(&self, payload: Payload<S>, timestamp: DateTime<Utc>) -> Result<(), ClientError> {
        self.send((payload, timestamp))
            .map_err(|_| ClientError::ConnectionClosed)
    }
}

/// Adapts a closure into a [`Client`].
pub struct FnClient<F>(pub F);

impl<S, F> Client<S> for FnClient<F>
where
    F: Fn(Payload<S>, DateTime<Utc>) -> Result<(), ClientError> + Send + Sync,
{
    fn receive(&self, payload: Payload<S>, timestamp: DateTime<Utc>) -> Result<(), ClientError> {
        (self.0)(payload, timestamp)
    }
}

/// Turns a locator string (for example a remote URI) into a client.
pub trait ClientResolver<S>: Send + Sync {
    /// Resolve `locator`.
    fn resolve(&self, locator: &str) -> DeviceResult<Arc<dyn Client<S>>>;
}

/// A client given directly or by locator.
pub enum ClientSpec<S> {
    /// Already constructed client.
    Direct(Arc<dyn Client<S>>),
    /// Locator resolved through the device's [`ClientResolver`].
    Locator(String),
}

impl<S> From<Arc<dyn Client<S>>> for ClientSpec<S> {
    fn from(client: Arc<dyn Client<S>>) -> Self {
        ClientSpec::Direct(client)
    }
}

impl<S> From<&str> for ClientSpec<S> {
    fn from(locator: &str) -> Self {
        ClientSpec::Locator(locator.to_string())
    }
}

/// Identifies one push onto a [`ClientStack`].
pub type ClientId = u64;

/// A client together with the id of the push that installed it.
pub struct ClientHandle<S> {
    id: ClientId,
    client: Arc<dyn Client<S>>,
}

impl<S> ClientHandle<S> {
    /// Push id.
    pub fn id(&self) -> ClientId {
        self.id
    }

    /// Deliver through the wrapped client.
    pub fn receive(&self, payload: Payload<S>, timestamp: DateTime<Utc>) -> Result<(), ClientError> {
        self.client.receive(payload, timestamp)
    }
}

impl<S> Clone for ClientHandle<S> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            client: Arc::clone(&self.client),
        }
    }
}

/// Last-in first-out set of clients.
///
/// A client is live while its entry is on the stack and it has not been
/// marked dead. Dead clients stay on the stack so that pops keep pairing with
/// pushes.
pub struct ClientStack<S> {
    entries: Vec<ClientHandle<S>>,
    dead: HashSet<ClientId>,
    next_id: ClientId,
}

impl<S> Default for ClientStack<S> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            dead: HashSet::new(),
            next_id: 0,
        }
    }
}

impl<S> ClientStack<S> {
    /// Empty stack.
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `client` on top.
    pub fn push(&mut self, client: Arc<dyn Client<S>>) -> ClientId {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.push(ClientHandle { id, client });
        id
    }

    /// Remove the top client.
    pub fn pop(&mut self) -> Option<ClientId> {
        let handle = self.entries.pop()?;
        self.dead.remove(&handle.id);
        Some(handle.id)
    }

    /// Remove a specific entry wherever it is.
    pub fn remove(&mut self, id: ClientId) -> bool {
        self.dead.remove(&id);
        match self.entries.iter().position(|h| h.id == id) {
            Some(pos) => {
                self.entries.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Client receiving newly captured samples.
    pub fn current(&self) -> Option<ClientHandle<S>> {
        self.entries.last().cloned()
    }

    /// Whether samples queued for `id` should still be delivered.
    pub fn is_live(&self, id: ClientId) -> bool {
        !self.dead.contains(&id) && self.entries.iter().any(|h| h.id == id)
    }

    /// Stop delivering to `id`.
    pub fn mark_dead(&mut self, id: ClientId) {
        if self.entries.iter().any(|h| h.id == id) {
            self.dead.insert(id);
        }
    }

    /// Number of entries, dead or alive.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no client is installed.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam::channel::unbounded;

    fn channel_client() -> (Arc<dyn Client<u32>>, crossbeam::channel::Receiver<(Payload<u32>, DateTime<Utc>)>) {
        let (tx, rx) = unbounded::<(Payload<u32>, DateTime<Utc>)>();
        (Arc::new(tx), rx)
    }

    #[test]
    fn test_push_shadows_and_pop_restores() {
        let mut stack = ClientStack::new();
        let (a, _ra) = channel_client();
        let (b, _rb) = channel_client();
        let id_a = stack.push(a);
        let id_b = stack.push(b);
        assert_eq!(stack.current().map(|h| h.id()), Some(id_b));
        assert!(stack.is_live(id_a));
        assert_eq!(stack.pop(), Some(id_b));
        assert!(!stack.is_live(id_b));
        assert_eq!(stack.current().map(|h| h.id()), Some(id_a));
    }

    #[test]
    fn test_dead_client_stays_on_stack() {
        let mut stack = ClientStack::new();
        let (a, _ra) = channel_client();
        let id = stack.push(a);
        stack.mark_dead(id);
        assert!(!stack.is_live(id));
        assert_eq!(stack.len(), 1);
        assert_eq!(stack.pop(), Some(id));
        assert!(stack.is_empty());
    }

    #[test]
    fn test_remove_from_middle() {
        let mut stack = ClientStack::new();
        let (a, _ra) = channel_client();
        let (b, _rb) = channel_client();
        let id_a = stack.push(a);
        let id_b = stack.push(b);
        assert!(stack.remove(id_a));
        assert!(!stack.remove(id_a));
        assert_eq!(stack.current().map(|h| h.id()), Some(id_b));
    }

    #[test]
    fn test_sender_reports_closed_connection() {
        let (client, rx) = channel_client();
        client.receive(Payload::Data(1), Utc::now()).unwrap();
        assert_eq!(rx.recv().unwrap().0, Payload::Data(1));
        drop(rx);
        assert_eq!(
            client.receive(Payload::Data(2), Utc::now()),
            Err(ClientError::ConnectionClosed)
        );
    }

    #[test]
    fn test_remote_error_from_device_error() {
        let remote = RemoteError::from(&DeviceError::Hardware("overheated".into()));
        assert_eq!(remote.to_string(), "Hardware error: overheated");
        let payload: Payload<u32> = Payload::Error(remote);
        assert!(payload.is_error());
        assert_eq!(payload.data(), None);
    }
}
