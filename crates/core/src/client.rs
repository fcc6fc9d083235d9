//! Session Client
//!
//! Orchestrates the request/response side of a session: verification, inviting
//! participants, avatar exchange and latency probing. Every operation runs as
//! its own future with a single completion point that updates the shared
//! `SessionStore`; failures are logged and reported as a `RequestOutcome`
//! rather than returned as errors.

use crate::gateway::{AvatarSource, CharacterGateway};
use crate::models::{AvatarAsset, Session, VerificationReply};
use crate::store::{CacheLocation, ParticipantId, SessionStore, SharedStore};
use crate::transport::{ApiResponse, ApiTransport, UploadFile};
use anyhow::{Context, Result};
use futures::future::join_all;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};

/// What a single client operation ended up doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    /// A precondition (usually an active session) was not met; nothing was sent.
    Skipped,
    /// The service accepted the request and local state was updated.
    Completed,
    /// The service answered with a non-success status.
    Rejected { status: u16 },
    /// The exchange could not be completed, or a local step failed.
    Failed,
    /// The service answered with success but the body could not be parsed.
    InvalidResponse,
}

pub struct SessionClient {
    transport: Arc<dyn ApiTransport>,
    store: SharedStore,
    gateway: Arc<dyn CharacterGateway>,
    avatars: Arc<dyn AvatarSource>,
    latencies: Mutex<Vec<f64>>,
}

impl SessionClient {
    pub fn new(
        transport: Arc<dyn ApiTransport>,
        store: SharedStore,
        gateway: Arc<dyn CharacterGateway>,
        avatars: Arc<dyn AvatarSource>,
    ) -> Self {
        Self {
            transport,
            store,
            gateway,
            avatars,
            latencies: Mutex::new(Vec::new()),
        }
    }

    /// The store shared with the realtime engine.
    pub fn store(&self) -> SharedStore {
        self.store.clone()
    }

    pub async fn has_session(&self) -> bool {
        self.store.lock().await.has_session()
    }

    /// Asks the service to start (or restart) verification of `user_id`.
    /// Local state is never touched.
    #[instrument(skip(self))]
    pub async fn initiate_session(&self, user_id: &str) -> RequestOutcome {
        let response = match self.transport.get(&format!("verify/{}", user_id)).await {
            Ok(response) => response,
            Err(e) => {
                error!(error = ?e, "Verification request failed");
                return RequestOutcome::Failed;
            }
        };

        if !response.is_success() {
            warn!(status = response.status, body = %response.body, "Verification was not started");
            return RequestOutcome::Rejected {
                status: response.status,
            };
        }

        let message = serde_json::from_str::<VerificationReply>(&response.body)
            .map(|reply| reply.message)
            .unwrap_or_else(|_| response.body.clone());
        info!(status = response.status, %message, "Verification started");
        RequestOutcome::Completed
    }

    /// Exchanges a one-time verification code for a session.
    ///
    /// On failure the previous session, if any, is kept.
    #[instrument(skip(self, verification_code))]
    pub async fn complete_verification(
        &self,
        user_id: &str,
        verification_code: &str,
    ) -> RequestOutcome {
        let path = format!("verify/{}/{}", user_id, verification_code);
        let response = match self.transport.get(&path).await {
            Ok(response) => response,
            Err(e) => {
                error!(error = ?e, "Session request failed");
                return RequestOutcome::Failed;
            }
        };

        if !response.is_ok() {
            warn!(status = response.status, body = %response.body, "Session was not issued");
            return RequestOutcome::Rejected {
                status: response.status,
            };
        }

        let reply = match serde_json::from_str::<VerificationReply>(&response.body) {
            Ok(reply) => reply,
            Err(e) => {
                error!(error = %e, body = %response.body, "Could not parse session payload");
                return RequestOutcome::InvalidResponse;
            }
        };

        match reply.session_id.filter(|id| !id.is_empty()) {
            Some(session_id) => {
                info!(message = %reply.message, "Session established");
                self.store.lock().await.set_session(Session {
                    message: reply.message,
                    session_id,
                });
                RequestOutcome::Completed
            }
            None => {
                warn!(message = %reply.message, "Verification reply carried no session id");
                RequestOutcome::InvalidResponse
            }
        }
    }

    /// Invites `friend_user_id` into the session.
    ///
    /// The participant is listed before the request is sent. A 200 commits it
    /// and marks the id verified; anything else removes exactly that entry
    /// again, leaving other in-flight requests for the same id alone.
    #[instrument(skip(self))]
    pub async fn request_participant(&self, friend_user_id: &str) -> RequestOutcome {
        let (pending, path) = {
            let mut store = self.store.lock().await;
            let Some(session_id) = store.session_id().map(str::to_owned) else {
                debug!("No session; participant request skipped");
                return RequestOutcome::Skipped;
            };
            let pending = store.add_tentative(friend_user_id);
            (
                pending,
                format!("request-session/{}/{}", session_id, friend_user_id),
            )
        };

        let result = self.transport.get(&path).await;

        let mut store = self.store.lock().await;
        match result {
            Ok(response) if response.is_ok() => {
                let newly_verified = pending.commit(&mut store);
                info!(newly_verified, "Participant verified");
                RequestOutcome::Completed
            }
            Ok(response) => {
                let _ = pending.rollback(&mut store);
                warn!(status = response.status, "Participant rejected; removed from list");
                RequestOutcome::Rejected {
                    status: response.status,
                }
            }
            Err(e) => {
                let _ = pending.rollback(&mut store);
                error!(error = ?e, "Participant request failed; removed from list");
                RequestOutcome::Failed
            }
        }
    }

    /// Lists `user_id` as a participant without asking the service.
    pub async fn add_participant(&self, user_id: &str) -> ParticipantId {
        self.store.lock().await.add_participant(user_id)
    }

    /// Fetches the avatar of every listed participant concurrently.
    ///
    /// Each fetch completes on its own; one failing never affects the others,
    /// and results may arrive in any order. Returns one outcome per
    /// participant, empty if there is no session or nobody to fetch.
    #[instrument(skip(self))]
    pub async fn fetch_avatars(&self) -> Vec<(String, RequestOutcome)> {
        let (session_id, targets) = {
            let store = self.store.lock().await;
            let Some(session_id) = store.session_id().map(str::to_owned) else {
                debug!("No session; avatar fetch skipped");
                return Vec::new();
            };
            let targets: Vec<(ParticipantId, String)> = store
                .participants()
                .iter()
                .map(|p| (p.id, p.user_id.clone()))
                .collect();
            (session_id, targets)
        };

        if targets.is_empty() {
            debug!("No participants; avatar fetch skipped");
            return Vec::new();
        }

        let fetches = targets.into_iter().map(|(id, user_id)| {
            let session_id = session_id.as_str();
            async move {
                info!(user_id = %user_id, "Fetching avatars");
                let outcome = self.fetch_avatar(session_id, id, &user_id).await;
                (user_id, outcome)
            }
        });
        join_all(fetches).await
    }

    async fn fetch_avatar(
        &self,
        session_id: &str,
        id: ParticipantId,
        user_id: &str,
    ) -> RequestOutcome {
        let path = format!("get-avatars/{}/{}", session_id, user_id);
        let response = match self.transport.get(&path).await {
            Ok(response) => response,
            Err(e) => {
                error!(user_id = %user_id, error = ?e, "Avatar request failed");
                return RequestOutcome::Failed;
            }
        };

        if !response.is_ok() {
            warn!(user_id = %user_id, status = response.status, "Avatar request rejected");
            return RequestOutcome::Rejected {
                status: response.status,
            };
        }

        let asset: AvatarAsset = match serde_json::from_str(&response.body) {
            Ok(asset) => asset,
            Err(e) => {
                error!(user_id = %user_id, error = %e, "Could not parse avatar payload");
                return RequestOutcome::InvalidResponse;
            }
        };
        for filename in asset.filenames() {
            debug!(user_id = %user_id, %filename, "Received avatar image");
        }

        let mut store = self.store.lock().await;
        match self.provision(&mut store, id, &asset) {
            Ok(()) => RequestOutcome::Completed,
            Err(e) => {
                error!(user_id = %user_id, error = ?e, "Failed to provision character");
                RequestOutcome::Failed
            }
        }
    }

    /// Creates the participant's character on its first avatar and updates it
    /// in place afterwards.
    fn provision(
        &self,
        store: &mut SessionStore,
        id: ParticipantId,
        asset: &AvatarAsset,
    ) -> Result<()> {
        let Some(participant) = store.participant_mut(id) else {
            warn!("Participant left the list before its avatars arrived");
            return Ok(());
        };

        match participant.character {
            Some(handle) => {
                self.gateway.update_character(handle, asset)?;
                debug!(user_id = %participant.user_id, ?handle, "Character updated");
            }
            None => {
                let handle = self
                    .gateway
                    .create_character(&participant.user_id, asset)?;
                participant.character = Some(handle);
                info!(user_id = %participant.user_id, ?handle, "Character created");
            }
        }
        Ok(())
    }

    /// Uploads every locally cached avatar image as one multipart request.
    #[instrument(skip(self))]
    pub async fn upload_avatars(&self) -> RequestOutcome {
        let Some(session_id) = self.store.lock().await.session_id().map(str::to_owned) else {
            debug!("No session; avatar upload skipped");
            return RequestOutcome::Skipped;
        };

        let files = match self.collect_uploads().await {
            Ok(files) => files,
            Err(e) => {
                error!(error = ?e, "Failed to collect cached avatars");
                return RequestOutcome::Failed;
            }
        };
        let count = files.len();

        let path = format!("upload-avatar/{}", session_id);
        match self.transport.post_multipart(&path, "avatar", files).await {
            Ok(response) if response.is_success() => {
                info!(status = response.status, count, "Avatars uploaded");
                RequestOutcome::Completed
            }
            Ok(response) => {
                error!(status = response.status, body = %response.body, "Avatar upload rejected");
                RequestOutcome::Rejected {
                    status: response.status,
                }
            }
            Err(e) => {
                error!(error = ?e, "Avatar upload failed");
                RequestOutcome::Failed
            }
        }
    }

    async fn collect_uploads(&self) -> Result<Vec<UploadFile>> {
        let mut files = Vec::new();
        for path in self.avatars.cached_avatar_paths()? {
            let bytes = tokio::fs::read(&path)
                .await
                .with_context(|| format!("Failed to read {}", path.display()))?;
            let file_name = path
                .file_name()
                .and_then(|name| name.to_str())
                .with_context(|| format!("Avatar path has no file name: {}", path.display()))?
                .to_string();
            files.push(UploadFile { file_name, bytes });
        }
        Ok(files)
    }

    /// Probes the service and records the round trip in milliseconds.
    ///
    /// Every answered probe is recorded, whatever its status. The history
    /// grows without bound.
    #[instrument(skip(self))]
    pub async fn ping(&self) -> RequestOutcome {
        let started = Instant::now();
        let result = self.transport.get("ping").await;
        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;

        match result {
            Ok(ApiResponse { status, .. }) => {
                self.latencies.lock().await.push(latency_ms);
                info!(status, latency_ms, "API ping");
                if (200..300).contains(&status) {
                    RequestOutcome::Completed
                } else {
                    RequestOutcome::Rejected { status }
                }
            }
            Err(e) => {
                error!(error = ?e, "API ping failed");
                RequestOutcome::Failed
            }
        }
    }

    /// Round-trip times of all answered pings, oldest first.
    pub async fn latency_history(&self) -> Vec<f64> {
        self.latencies.lock().await.clone()
    }

    /// Replaces the store's contents with the cache at `location`.
    ///
    /// Never fails: a missing or corrupt file yields an empty cache. The file
    /// is read before the store is locked.
    pub async fn load_cache(&self, location: &CacheLocation) {
        let restored = SessionStore::load(location).await;
        *self.store.lock().await = restored;
    }

    /// Writes the current cache to the location set by `load_cache`. Only the
    /// snapshot is taken under the lock.
    pub async fn save_cache(&self) -> Result<()> {
        let snapshot = self.store.lock().await.snapshot()?;
        snapshot.write().await
    }

    pub async fn link_external_id(&self, external_id: &str) {
        self.store.lock().await.set_linked_external_id(external_id);
    }

    /// Drops the current session so a new one can be verified.
    pub async fn reset_session(&self) {
        self.store.lock().await.reset_session();
        info!("Session reset");
    }

    /// Records the local user's current voice level and expression for the
    /// next realtime broadcast.
    pub async fn set_self_activity(&self, voice_activity: f32, action: &str) {
        self.store
            .lock()
            .await
            .set_self_activity(voice_activity, action);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{CharacterHandle, MockAvatarSource, MockCharacterGateway};
    use crate::store::SessionStore;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use mockall::{Sequence, mock};
    use std::collections::{HashMap, VecDeque};
    use tokio::sync::oneshot;

    mock! {
        Transport {}
        #[async_trait]
        impl ApiTransport for Transport {
            async fn get(&self, path: &str) -> Result<ApiResponse>;
            async fn post_multipart(
                &self,
                path: &str,
                field: &str,
                files: Vec<UploadFile>,
            ) -> Result<ApiResponse>;
        }
    }

    /// Transport whose responses are released by the test, in any order.
    /// Dropping a gate's sender makes that request fail.
    #[derive(Default)]
    struct GatedTransport {
        gates: std::sync::Mutex<HashMap<String, VecDeque<oneshot::Receiver<ApiResponse>>>>,
    }

    impl GatedTransport {
        fn gate(&self, path: &str) -> oneshot::Sender<ApiResponse> {
            let (tx, rx) = oneshot::channel();
            self.gates
                .lock()
                .unwrap()
                .entry(path.to_string())
                .or_default()
                .push_back(rx);
            tx
        }
    }

    #[async_trait]
    impl ApiTransport for GatedTransport {
        async fn get(&self, path: &str) -> Result<ApiResponse> {
            let gate = self
                .gates
                .lock()
                .unwrap()
                .get_mut(path)
                .and_then(VecDeque::pop_front)
                .ok_or_else(|| anyhow!("unexpected request: {}", path))?;
            gate.await.map_err(|_| anyhow!("connection reset"))
        }

        async fn post_multipart(
            &self,
            path: &str,
            _field: &str,
            _files: Vec<UploadFile>,
        ) -> Result<ApiResponse> {
            Err(anyhow!("unexpected upload: {}", path))
        }
    }

    fn store_with_session(session_id: &str) -> SharedStore {
        let mut store = SessionStore::new();
        store.set_session(Session {
            message: "ok".into(),
            session_id: session_id.into(),
        });
        Arc::new(Mutex::new(store))
    }

    fn client_with(
        transport: impl ApiTransport + 'static,
        store: SharedStore,
        gateway: MockCharacterGateway,
    ) -> SessionClient {
        SessionClient::new(
            Arc::new(transport),
            store,
            Arc::new(gateway),
            Arc::new(MockAvatarSource::new()),
        )
    }

    fn asset_body(filename: &str) -> String {
        format!(r#"{{"avatars":[{{"base64":"aGVsbG8=","filename":"{}"}}]}}"#, filename)
    }

    async fn wait_for_participants(store: &SharedStore, count: usize) {
        for _ in 0..1000 {
            if store.lock().await.participants().len() == count {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("participant list never reached {}", count);
    }

    #[tokio::test]
    async fn test_complete_verification_stores_session() {
        let mut transport = MockTransport::new();
        transport
            .expect_get()
            .withf(|path| path == "verify/u1/code1")
            .times(1)
            .returning(|_| Ok(ApiResponse::new(200, r#"{"message":"ok","session_id":"abc123"}"#)));
        let store = Arc::new(Mutex::new(SessionStore::new()));
        let client = client_with(transport, store.clone(), MockCharacterGateway::new());

        assert!(!client.has_session().await);
        let outcome = client.complete_verification("u1", "code1").await;

        assert_eq!(outcome, RequestOutcome::Completed);
        assert!(client.has_session().await);
        assert_eq!(store.lock().await.session_id(), Some("abc123"));
    }

    #[tokio::test]
    async fn test_failed_verification_keeps_previous_session() {
        let mut transport = MockTransport::new();
        transport
            .expect_get()
            .returning(|_| Ok(ApiResponse::new(403, "bad code")));
        let store = store_with_session("old");
        let client = client_with(transport, store.clone(), MockCharacterGateway::new());

        let outcome = client.complete_verification("u1", "wrong").await;

        assert_eq!(outcome, RequestOutcome::Rejected { status: 403 });
        assert_eq!(store.lock().await.session_id(), Some("old"));
    }

    #[tokio::test]
    async fn test_malformed_session_payload_is_ignored() {
        let mut transport = MockTransport::new();
        transport
            .expect_get()
            .returning(|_| Ok(ApiResponse::new(200, "<html>")));
        let store = Arc::new(Mutex::new(SessionStore::new()));
        let client = client_with(transport, store.clone(), MockCharacterGateway::new());

        let outcome = client.complete_verification("u1", "code1").await;

        assert_eq!(outcome, RequestOutcome::InvalidResponse);
        assert!(!store.lock().await.has_session());
    }

    #[tokio::test]
    async fn test_verification_reply_without_session_id_keeps_session() {
        let mut transport = MockTransport::new();
        let mut seq = Sequence::new();
        transport
            .expect_get()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(ApiResponse::new(200, r#"{"message":"invalid code"}"#)));
        transport
            .expect_get()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| {
                Ok(ApiResponse::new(
                    200,
                    r#"{"message":"invalid code","session_id":""}"#,
                ))
            });
        let store = store_with_session("old");
        let client = client_with(transport, store.clone(), MockCharacterGateway::new());

        for _ in 0..2 {
            let outcome = client.complete_verification("u1", "bad").await;
            assert_eq!(outcome, RequestOutcome::InvalidResponse);
        }

        let store = store.lock().await;
        assert!(store.has_session());
        assert_eq!(store.session_id(), Some("old"));
    }

    #[tokio::test]
    async fn test_initiate_session_never_touches_store() {
        let mut transport = MockTransport::new();
        let mut seq = Sequence::new();
        transport
            .expect_get()
            .withf(|path| path == "verify/u1")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(ApiResponse::new(200, r#"{"message":"code sent"}"#)));
        transport
            .expect_get()
            .withf(|path| path == "verify/u1")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Err(anyhow!("connection refused")));
        let store = Arc::new(Mutex::new(SessionStore::new()));
        let client = client_with(transport, store.clone(), MockCharacterGateway::new());

        assert_eq!(client.initiate_session("u1").await, RequestOutcome::Completed);
        assert_eq!(client.initiate_session("u1").await, RequestOutcome::Failed);
        assert!(!store.lock().await.has_session());
    }

    #[tokio::test]
    async fn test_request_participant_without_session_is_noop() {
        let transport = MockTransport::new();
        let store = Arc::new(Mutex::new(SessionStore::new()));
        let client = client_with(transport, store.clone(), MockCharacterGateway::new());

        assert_eq!(
            client.request_participant("u2").await,
            RequestOutcome::Skipped
        );
        assert!(store.lock().await.participants().is_empty());
    }

    #[tokio::test]
    async fn test_rejected_participant_is_rolled_back() {
        let transport = Arc::new(GatedTransport::default());
        let gate = transport.gate("request-session/abc123/u2");
        let store = store_with_session("abc123");
        let client = Arc::new(SessionClient::new(
            transport.clone(),
            store.clone(),
            Arc::new(MockCharacterGateway::new()),
            Arc::new(MockAvatarSource::new()),
        ));

        let request = tokio::spawn({
            let client = client.clone();
            async move { client.request_participant("u2").await }
        });

        // Listed optimistically while the request is in flight.
        wait_for_participants(&store, 1).await;
        assert_eq!(store.lock().await.participant_user_ids(), vec!["u2"]);

        gate.send(ApiResponse::new(404, "not found")).unwrap();
        assert_eq!(
            request.await.unwrap(),
            RequestOutcome::Rejected { status: 404 }
        );

        let store = store.lock().await;
        assert!(store.participants().is_empty());
        assert!(store.verified().is_empty());
    }

    #[tokio::test]
    async fn test_only_successful_participant_requests_remain() {
        let transport = Arc::new(GatedTransport::default());
        let first = transport.gate("request-session/abc123/u2");
        let second = transport.gate("request-session/abc123/u2");
        let third = transport.gate("request-session/abc123/u3");
        let store = store_with_session("abc123");
        let client = Arc::new(SessionClient::new(
            transport.clone(),
            store.clone(),
            Arc::new(MockCharacterGateway::new()),
            Arc::new(MockAvatarSource::new()),
        ));

        let mut requests = Vec::new();
        for friend in ["u2", "u2", "u3"] {
            let client = client.clone();
            requests.push(tokio::spawn(async move {
                client.request_participant(friend).await
            }));
            // Keep the gate order aligned with the request order.
            wait_for_participants(&store, requests.len()).await;
        }

        // Resolve out of order: transport failure, success, rejection.
        drop(third);
        second.send(ApiResponse::new(200, "")).unwrap();
        first.send(ApiResponse::new(500, "")).unwrap();

        let mut outcomes = Vec::new();
        for request in requests {
            outcomes.push(request.await.unwrap());
        }
        let successes = outcomes
            .iter()
            .filter(|o| **o == RequestOutcome::Completed)
            .count();

        let store = store.lock().await;
        assert_eq!(successes, 1);
        assert_eq!(store.participants().len(), successes);
        assert_eq!(store.participant_user_ids(), vec!["u2"]);
        assert_eq!(store.verified().iter().collect::<Vec<_>>(), vec!["u2"]);
    }

    #[tokio::test]
    async fn test_repeated_verification_does_not_duplicate_verified_id() {
        let mut transport = MockTransport::new();
        transport
            .expect_get()
            .times(3)
            .returning(|_| Ok(ApiResponse::new(200, "")));
        let store = store_with_session("abc123");
        let client = client_with(transport, store.clone(), MockCharacterGateway::new());

        for _ in 0..3 {
            assert_eq!(
                client.request_participant("u1").await,
                RequestOutcome::Completed
            );
        }

        let store = store.lock().await;
        assert_eq!(store.verified().len(), 1);
        assert_eq!(store.participants().len(), 3);
    }

    #[tokio::test]
    async fn test_fetch_avatars_creates_then_updates_character() {
        let mut transport = MockTransport::new();
        transport
            .expect_get()
            .withf(|path| path == "get-avatars/abc123/u1")
            .times(2)
            .returning(|_| Ok(ApiResponse::new(200, asset_body("idle.png"))));

        let mut gateway = MockCharacterGateway::new();
        gateway
            .expect_create_character()
            .withf(|user_id, asset| user_id == "u1" && asset.avatars.len() == 1)
            .times(1)
            .returning(|_, _| Ok(CharacterHandle(7)));
        gateway
            .expect_update_character()
            .withf(|handle, _| *handle == CharacterHandle(7))
            .times(1)
            .returning(|_, _| Ok(()));

        let store = store_with_session("abc123");
        let client = client_with(transport, store.clone(), gateway);
        client.add_participant("u1").await;

        assert_eq!(
            client.fetch_avatars().await,
            vec![("u1".to_string(), RequestOutcome::Completed)]
        );
        assert_eq!(
            client.fetch_avatars().await,
            vec![("u1".to_string(), RequestOutcome::Completed)]
        );

        let store = store.lock().await;
        assert_eq!(store.participants()[0].character, Some(CharacterHandle(7)));
    }

    #[tokio::test]
    async fn test_fetch_avatars_failure_does_not_block_others() {
        let transport = Arc::new(GatedTransport::default());
        let slow = transport.gate("get-avatars/abc123/u1");
        let failing = transport.gate("get-avatars/abc123/u2");
        let fast = transport.gate("get-avatars/abc123/u3");

        let mut gateway = MockCharacterGateway::new();
        gateway
            .expect_create_character()
            .times(2)
            .returning(|user_id, _| Ok(CharacterHandle(if user_id == "u1" { 1 } else { 3 })));

        let store = store_with_session("abc123");
        let client = SessionClient::new(
            transport.clone(),
            store.clone(),
            Arc::new(gateway),
            Arc::new(MockAvatarSource::new()),
        );
        for user in ["u1", "u2", "u3"] {
            client.add_participant(user).await;
        }

        let release = async {
            fast.send(ApiResponse::new(200, asset_body("a.png"))).unwrap();
            failing.send(ApiResponse::new(404, "")).unwrap();
            slow.send(ApiResponse::new(200, asset_body("b.png"))).unwrap();
        };
        let (outcomes, ()) = tokio::join!(client.fetch_avatars(), release);

        assert_eq!(
            outcomes,
            vec![
                ("u1".to_string(), RequestOutcome::Completed),
                ("u2".to_string(), RequestOutcome::Rejected { status: 404 }),
                ("u3".to_string(), RequestOutcome::Completed),
            ]
        );
        let store = store.lock().await;
        let characters: Vec<_> = store.participants().iter().map(|p| p.character).collect();
        assert_eq!(
            characters,
            vec![Some(CharacterHandle(1)), None, Some(CharacterHandle(3))]
        );
    }

    #[tokio::test]
    async fn test_fetch_avatars_requires_session_and_participants() {
        let transport = MockTransport::new();
        let client = client_with(
            transport,
            Arc::new(Mutex::new(SessionStore::new())),
            MockCharacterGateway::new(),
        );
        client.add_participant("u1").await;
        assert!(client.fetch_avatars().await.is_empty());

        let transport = MockTransport::new();
        let client = client_with(transport, store_with_session("abc123"), MockCharacterGateway::new());
        assert!(client.fetch_avatars().await.is_empty());
    }

    #[tokio::test]
    async fn test_upload_avatars_sends_cached_files() {
        let dir = tempfile::tempdir().unwrap();
        let idle = dir.path().join("idle.png");
        let talk = dir.path().join("talk.png");
        std::fs::write(&idle, b"idle-bytes").unwrap();
        std::fs::write(&talk, b"talk-bytes").unwrap();

        let mut avatars = MockAvatarSource::new();
        avatars
            .expect_cached_avatar_paths()
            .returning(move || Ok(vec![idle.clone(), talk.clone()]));

        let mut transport = MockTransport::new();
        transport
            .expect_post_multipart()
            .withf(|path, field, files| {
                path == "upload-avatar/abc123"
                    && field == "avatar"
                    && files
                        == &vec![
                            UploadFile {
                                file_name: "idle.png".into(),
                                bytes: b"idle-bytes".to_vec(),
                            },
                            UploadFile {
                                file_name: "talk.png".into(),
                                bytes: b"talk-bytes".to_vec(),
                            },
                        ]
            })
            .times(1)
            .returning(|_, _, _| Ok(ApiResponse::new(200, "uploaded")));

        let client = SessionClient::new(
            Arc::new(transport),
            store_with_session("abc123"),
            Arc::new(MockCharacterGateway::new()),
            Arc::new(avatars),
        );

        assert_eq!(client.upload_avatars().await, RequestOutcome::Completed);
    }

    #[tokio::test]
    async fn test_upload_avatars_without_session_is_skipped() {
        let client = client_with(
            MockTransport::new(),
            Arc::new(Mutex::new(SessionStore::new())),
            MockCharacterGateway::new(),
        );
        assert_eq!(client.upload_avatars().await, RequestOutcome::Skipped);
    }

    #[tokio::test]
    async fn test_ping_records_latency_for_answered_probes() {
        let mut transport = MockTransport::new();
        let mut seq = Sequence::new();
        transport
            .expect_get()
            .withf(|path| path == "ping")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(ApiResponse::new(200, "pong")));
        transport
            .expect_get()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(ApiResponse::new(503, "")));
        transport
            .expect_get()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Err(anyhow!("timeout")));
        let client = client_with(
            transport,
            Arc::new(Mutex::new(SessionStore::new())),
            MockCharacterGateway::new(),
        );

        assert_eq!(client.ping().await, RequestOutcome::Completed);
        assert_eq!(client.ping().await, RequestOutcome::Rejected { status: 503 });
        assert_eq!(client.ping().await, RequestOutcome::Failed);

        let history = client.latency_history().await;
        assert_eq!(history.len(), 2);
        assert!(history.iter().all(|ms| *ms >= 0.0));
    }

    #[tokio::test]
    async fn test_cache_round_trip_through_client() {
        let dir = tempfile::tempdir().unwrap();
        let location = CacheLocation::new(dir.path().join("network"), "session.json");

        let mut transport = MockTransport::new();
        transport
            .expect_get()
            .returning(|_| Ok(ApiResponse::new(200, r#"{"message":"ok","session_id":"abc123"}"#)));
        let client = client_with(
            transport,
            Arc::new(Mutex::new(SessionStore::new())),
            MockCharacterGateway::new(),
        );
        client.load_cache(&location).await;
        client.complete_verification("u1", "code1").await;
        client.link_external_id("ext-9").await;
        client.save_cache().await.unwrap();

        let fresh = client_with(
            MockTransport::new(),
            Arc::new(Mutex::new(SessionStore::new())),
            MockCharacterGateway::new(),
        );
        fresh.load_cache(&location).await;
        let store = fresh.store();
        let store = store.lock().await;
        assert_eq!(store.session_id(), Some("abc123"));
        assert_eq!(store.linked_external_id(), "ext-9");
    }
}
