//! Per-connection session state and the protocol router.
//!
//! A session starts unbound, binds to exactly one backend on a successful
//! `init` handshake, and stays bound until the connection goes away. The
//! binding is one-way: once bound, the backend reference and client id never
//! change for the life of the session.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

use pime_common::protocol::{self, ClientMessage};

use crate::registry::{Backend, BackendRegistry};

enum SessionState {
    Unbound,
    Bound {
        backend: Arc<dyn Backend>,
        client_id: String,
    },
}

enum Step {
    Continue,
    Quit,
}

/// State for one connected client.
pub struct ClientSession<S> {
    stream: S,
    id: u64,
    state: SessionState,
}

impl<S> ClientSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, id: u64) -> Self {
        Self {
            stream,
            id,
            state: SessionState::Unbound,
        }
    }

    /// Drive the session to completion: read messages one at a time, route
    /// each, and stop on disconnect, read/write failure, or a quit request.
    ///
    /// Reads and writes alternate within this loop, so a session never has
    /// two reads or two writes in flight, and responses leave in the order
    /// their requests arrived.
    pub async fn run(mut self, registry: Arc<BackendRegistry>, quit: mpsc::Sender<()>) {
        loop {
            let payload = match protocol::read_message(&mut self.stream).await {
                Ok(Some(payload)) => payload,
                Ok(None) => {
                    tracing::debug!(session = self.id, "client disconnected");
                    break;
                }
                Err(e) => {
                    tracing::debug!(session = self.id, error = %e, "read failed");
                    break;
                }
            };

            match self.route(&payload, &registry).await {
                Ok(Step::Continue) => {}
                Ok(Step::Quit) => {
                    // No response; the launcher is about to go away.
                    let _ = quit.try_send(());
                    break;
                }
                Err(e) => {
                    tracing::warn!(session = self.id, error = %e, "write failed");
                    break;
                }
            }
        }
        self.close();
    }

    /// Apply the routing rules to one inbound message, in order: the quit
    /// control payload, then the handshake while unbound, then verbatim
    /// forwarding once bound.
    async fn route(
        &mut self,
        payload: &[u8],
        registry: &BackendRegistry,
    ) -> std::io::Result<Step> {
        let message = ClientMessage::decode(payload);

        if message == ClientMessage::Quit {
            tracing::info!(session = self.id, "quit control message received");
            return Ok(Step::Quit);
        }

        if let SessionState::Bound { backend, client_id } = &self.state {
            // Once bound, nothing is parsed here any more; whatever the
            // client sent goes to the backend as-is.
            let Ok(text) = std::str::from_utf8(payload) else {
                tracing::warn!(session = self.id, "non-text payload on bound session dropped");
                return Ok(Step::Continue);
            };
            let response = backend.handle_request(client_id, text);
            protocol::write_message(&mut self.stream, response.as_bytes()).await?;
            return Ok(Step::Continue);
        }

        self.handshake(message, registry).await
    }

    /// First contact: only a well-formed `init` naming a known backend binds
    /// the session. Everything else is dropped without a response and the
    /// session stays unbound, free to retry.
    async fn handshake(
        &mut self,
        message: ClientMessage,
        registry: &BackendRegistry,
    ) -> std::io::Result<Step> {
        match message {
            ClientMessage::Init { id, raw } => {
                let Some(backend) = registry.lookup(&id) else {
                    tracing::warn!(session = self.id, profile = %id, "handshake for unknown backend dropped");
                    return Ok(Step::Continue);
                };

                let client_id = backend.register_client();
                tracing::info!(session = self.id, profile = %id, client = %client_id, "session bound");

                // The init payload itself goes to the backend; its answer is
                // the init response the client is waiting for.
                let response = backend.handle_request(&client_id, &raw);
                self.state = SessionState::Bound { backend, client_id };
                protocol::write_message(&mut self.stream, response.as_bytes()).await?;
                Ok(Step::Continue)
            }
            ClientMessage::Forward { .. } | ClientMessage::Malformed => {
                tracing::warn!(session = self.id, "message before handshake dropped");
                Ok(Step::Continue)
            }
            ClientMessage::Quit => Ok(Step::Quit),
        }
    }

    /// Release the session: notify the bound backend (best-effort) and let
    /// the connection handle drop with `self`, exactly once.
    fn close(&mut self) {
        if let SessionState::Bound { backend, client_id } = &self.state {
            tracing::debug!(session = self.id, client = %client_id, "unregistering client");
            backend.unregister_client(client_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
    use tokio::time::timeout;

    use super::*;

    const PROFILE: &str = "F80736AF-4502-4D8F-A684-1889C2B3BBBD";

    struct RecordingBackend {
        next_client: AtomicUsize,
        requests: Mutex<Vec<(String, String)>>,
        unregisters: AtomicUsize,
    }

    impl RecordingBackend {
        fn new() -> Self {
            Self {
                next_client: AtomicUsize::new(1),
                requests: Mutex::new(Vec::new()),
                unregisters: AtomicUsize::new(0),
            }
        }
    }

    impl Backend for RecordingBackend {
        fn register_client(&self) -> String {
            let n = self.next_client.fetch_add(1, Ordering::SeqCst);
            format!("client-{n}")
        }

        fn handle_request(&self, client_id: &str, message: &str) -> String {
            self.requests
                .lock()
                .unwrap()
                .push((client_id.to_string(), message.to_string()));
            format!("response:{message}")
        }

        fn unregister_client(&self, _client_id: &str) {
            self.unregisters.fetch_add(1, Ordering::SeqCst);
        }

        fn shutdown(&self) {}
    }

    struct Harness {
        client: DuplexStream,
        backend: Arc<RecordingBackend>,
        session: tokio::task::JoinHandle<()>,
        quit_rx: mpsc::Receiver<()>,
    }

    fn spawn_session() -> Harness {
        let (client, server) = tokio::io::duplex(4096);
        let backend = Arc::new(RecordingBackend::new());
        let registry = Arc::new(BackendRegistry::initialize(Path::new(".")));
        registry.insert(PROFILE, backend.clone());
        let (quit_tx, quit_rx) = mpsc::channel(1);
        let session = tokio::spawn(ClientSession::new(server, 1).run(registry, quit_tx));
        Harness {
            client,
            backend,
            session,
            quit_rx,
        }
    }

    async fn send(client: &mut DuplexStream, payload: &str) {
        client.write_all(payload.as_bytes()).await.unwrap();
        client.flush().await.unwrap();
    }

    async fn recv(client: &mut DuplexStream) -> String {
        let mut buf = vec![0u8; 4096];
        let n = client.read(&mut buf).await.unwrap();
        String::from_utf8(buf[..n].to_vec()).unwrap()
    }

    async fn assert_no_response(client: &mut DuplexStream) {
        let mut buf = [0u8; 1];
        let read = timeout(Duration::from_millis(100), client.read(&mut buf)).await;
        assert!(read.is_err(), "expected silence, got a response");
    }

    #[tokio::test]
    async fn unknown_backend_handshake_is_silent_and_retryable() {
        let mut h = spawn_session();

        send(&mut h.client, r#"{"method":"init","id":"not-a-profile"}"#).await;
        assert_no_response(&mut h.client).await;

        // Still unbound: a later init against a known profile succeeds.
        let init = format!(r#"{{"method":"init","id":"{PROFILE}"}}"#);
        send(&mut h.client, &init).await;
        let response = recv(&mut h.client).await;
        assert_eq!(response, format!("response:{init}"));
    }

    #[tokio::test]
    async fn messages_before_handshake_are_dropped() {
        let mut h = spawn_session();

        send(&mut h.client, r#"{"method":"keyDown","keyCode":65}"#).await;
        assert_no_response(&mut h.client).await;
        send(&mut h.client, "not even json").await;
        assert_no_response(&mut h.client).await;

        assert!(h.backend.requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn bound_session_forwards_verbatim_in_order() {
        let mut h = spawn_session();

        send(
            &mut h.client,
            &format!(r#"{{"method":"init","id":"{PROFILE}"}}"#),
        )
        .await;
        recv(&mut h.client).await;

        for i in 0..3 {
            let message = format!(r#"{{"method":"keyDown","keyCode":{i}}}"#);
            send(&mut h.client, &message).await;
            assert_eq!(recv(&mut h.client).await, format!("response:{message}"));
        }

        let requests = h.backend.requests.lock().unwrap();
        // Every request was attributed to the one client id issued at bind.
        assert!(requests.iter().all(|(client, _)| client == "client-1"));
    }

    #[tokio::test]
    async fn two_sessions_get_distinct_client_ids() {
        let backend = Arc::new(RecordingBackend::new());
        let registry = Arc::new(BackendRegistry::initialize(Path::new(".")));
        registry.insert(PROFILE, backend.clone());
        let (quit_tx, _quit_rx) = mpsc::channel(1);

        let mut clients = Vec::new();
        for id in 0..2u64 {
            let (client, server) = tokio::io::duplex(4096);
            tokio::spawn(ClientSession::new(server, id).run(registry.clone(), quit_tx.clone()));
            clients.push(client);
        }

        for client in &mut clients {
            send(client, &format!(r#"{{"method":"init","id":"{PROFILE}"}}"#)).await;
            recv(client).await;
        }

        let requests = h_requests(&backend);
        assert_eq!(requests.len(), 2);
        assert_ne!(requests[0].0, requests[1].0);
    }

    fn h_requests(backend: &RecordingBackend) -> Vec<(String, String)> {
        backend.requests.lock().unwrap().clone()
    }

    #[tokio::test]
    async fn disconnect_unregisters_exactly_once() {
        let mut h = spawn_session();

        send(
            &mut h.client,
            &format!(r#"{{"method":"init","id":"{PROFILE}"}}"#),
        )
        .await;
        recv(&mut h.client).await;

        drop(h.client);
        h.session.await.unwrap();

        assert_eq!(h.backend.unregisters.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unbound_disconnect_never_notifies_a_backend() {
        let h = spawn_session();
        drop(h.client);
        h.session.await.unwrap();
        assert_eq!(h.backend.unregisters.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn quit_payload_signals_shutdown_without_a_response() {
        let mut h = spawn_session();

        send(&mut h.client, "quit").await;
        timeout(Duration::from_secs(1), h.quit_rx.recv())
            .await
            .expect("quit signal not raised")
            .expect("quit channel closed");

        // The session ends without writing anything back; the client sees
        // either silence or a bare EOF.
        let mut buf = [0u8; 1];
        match timeout(Duration::from_millis(100), h.client.read(&mut buf)).await {
            Err(_) | Ok(Ok(0)) => {}
            Ok(other) => panic!("expected no response to quit, got {other:?}"),
        }
    }
}
