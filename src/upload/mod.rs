use anyhow::{Context, Result};
use reqwest::Client;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::auth::{AuthError, CredentialProvider, SessionStore, StoredSessionProvider};
use crate::config::Config;
use crate::media::CandidateFile;
use crate::utils::format_file_size;
use crate::UploadError;

pub mod destination;
pub mod progress;
pub mod registrar;
pub mod transport;
pub mod validator;

pub use destination::UploadDestination;
pub use progress::{ProgressSink, ProgressTracker};
pub use registrar::{FileRecord, MetadataRegistrar, NewFileRecord, RecordId, RegistrationError, RestMetadataRegistrar, UploadStatus};
pub use transport::{HttpStorageTransport, StorageTransport, TransferRequest, TransportError};
pub use validator::{UploadPolicy, ValidationError};

/// Where a single upload attempt stands
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadState {
    Idle,
    Validating,
    AwaitingCredential,
    Transferring,
    Registering,
    Succeeded(FileRecord),
    Failed(UploadError),
}

impl UploadState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, UploadState::Succeeded(_) | UploadState::Failed(_))
    }

    /// Whether `next` is a legal successor of this state
    pub fn can_transition_to(&self, next: &UploadState) -> bool {
        use UploadState::*;

        match (self, next) {
            (Idle, Validating)
            | (Validating, AwaitingCredential)
            | (AwaitingCredential, Transferring)
            | (Transferring, Registering)
            | (Registering, Succeeded(_)) => true,
            (current, Failed(_)) => !current.is_terminal(),
            _ => false,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            UploadState::Idle => "idle",
            UploadState::Validating => "validating",
            UploadState::AwaitingCredential => "awaiting credential",
            UploadState::Transferring => "transferring",
            UploadState::Registering => "registering",
            UploadState::Succeeded(_) => "succeeded",
            UploadState::Failed(_) => "failed",
        }
    }
}

/// Snapshot of an attempt: its state and transfer progress in percent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadUpdate {
    pub state: UploadState,
    pub progress: u8,
}

impl UploadUpdate {
    fn initial() -> Self {
        Self {
            state: UploadState::Idle,
            progress: 0,
        }
    }
}

/// Publishes every change to both the current-value channel and the event stream
#[derive(Clone)]
struct StatusPublisher {
    current: Arc<watch::Sender<UploadUpdate>>,
    events: mpsc::UnboundedSender<UploadUpdate>,
}

impl StatusPublisher {
    fn new() -> (Self, watch::Receiver<UploadUpdate>, mpsc::UnboundedReceiver<UploadUpdate>) {
        let (current, current_rx) = watch::channel(UploadUpdate::initial());
        let (events, events_rx) = mpsc::unbounded_channel();
        let _ = events.send(UploadUpdate::initial());

        let publisher = Self {
            current: Arc::new(current),
            events,
        };
        (publisher, current_rx, events_rx)
    }

    fn transition(&self, next: UploadState) {
        let mut snapshot = None;
        self.current.send_modify(|update| {
            if !update.state.can_transition_to(&next) {
                tracing::error!("Illegal upload transition {} -> {}", update.state.label(), next.label());
                return;
            }
            tracing::debug!("Upload state {} -> {}", update.state.label(), next.label());
            update.state = next;
            snapshot = Some(update.clone());
        });

        if let Some(update) = snapshot {
            let _ = self.events.send(update);
        }
    }

    /// Progress only moves forward, and only while transferring
    fn progress(&self, percent: u8) {
        let mut snapshot = None;
        self.current.send_if_modified(|update| {
            if update.state != UploadState::Transferring || percent <= update.progress {
                return false;
            }
            update.progress = percent.min(100);
            snapshot = Some(update.clone());
            true
        });

        if let Some(update) = snapshot {
            let _ = self.events.send(update);
        }
    }
}

/// Caller's side of a running upload attempt
pub struct UploadHandle {
    updates: mpsc::UnboundedReceiver<UploadUpdate>,
    current: watch::Receiver<UploadUpdate>,
    cancel: CancellationToken,
    task: JoinHandle<Result<FileRecord, UploadError>>,
}

impl UploadHandle {
    /// Latest state and progress
    pub fn current(&self) -> UploadUpdate {
        self.current.borrow().clone()
    }

    /// A receiver that always holds the latest snapshot
    pub fn watch(&self) -> watch::Receiver<UploadUpdate> {
        self.current.clone()
    }

    /// Next update in order; `None` once the attempt is over and drained
    pub async fn next_update(&mut self) -> Option<UploadUpdate> {
        self.updates.recv().await
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the attempt to end
    pub async fn finish(self) -> Result<FileRecord, UploadError> {
        match self.task.await {
            Ok(outcome) => outcome,
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(_) => Err(UploadError::Cancelled),
        }
    }
}

/// Validate → credential → transfer → register
#[derive(Clone)]
pub struct UploadPipeline {
    policy: UploadPolicy,
    namespace: String,
    credentials: Arc<dyn CredentialProvider>,
    transport: Arc<dyn StorageTransport>,
    registrar: Arc<dyn MetadataRegistrar>,
}

impl UploadPipeline {
    pub fn new(
        policy: UploadPolicy,
        namespace: impl Into<String>,
        credentials: Arc<dyn CredentialProvider>,
        transport: Arc<dyn StorageTransport>,
        registrar: Arc<dyn MetadataRegistrar>,
    ) -> Self {
        Self {
            policy,
            namespace: namespace.into(),
            credentials,
            transport,
            registrar,
        }
    }

    /// Wire the HTTP storage and table clients plus the stored session from configuration
    pub fn from_config(config: &Config) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build HTTP client")?;

        let service = &config.service;
        let transport = HttpStorageTransport::new(client.clone(), config.storage_root(), &service.bucket)
            .with_api_key(service.anon_key.clone())
            .with_cache_control(service.cache_control_seconds);
        let registrar = RestMetadataRegistrar::new(client, config.rest_root(), &service.files_table)
            .with_api_key(service.anon_key.clone());
        let credentials = StoredSessionProvider::new(SessionStore::new(config.session_path()?));

        Ok(Self::new(
            config.upload_policy(),
            &service.namespace,
            Arc::new(credentials),
            Arc::new(transport),
            Arc::new(registrar),
        ))
    }

    /// Start a new attempt on its own task
    ///
    /// Every call is a separate attempt with its own destination and handle,
    /// even when given a clone of a file that is already uploading.
    pub fn start(&self, file: CandidateFile) -> UploadHandle {
        let (publisher, current, updates) = StatusPublisher::new();
        let cancel = CancellationToken::new();

        let pipeline = self.clone();
        let token = cancel.clone();
        let task = tokio::spawn(async move { pipeline.drive(file, publisher, token).await });

        UploadHandle {
            updates,
            current,
            cancel,
            task,
        }
    }

    /// Run one attempt to completion, ignoring intermediate updates
    pub async fn upload(&self, file: CandidateFile) -> Result<FileRecord, UploadError> {
        self.start(file).finish().await
    }

    async fn drive(
        self,
        file: CandidateFile,
        status: StatusPublisher,
        cancel: CancellationToken,
    ) -> Result<FileRecord, UploadError> {
        let outcome = self.attempt(&file, &status, &cancel).await;

        match &outcome {
            Ok(record) => {
                tracing::info!("Uploaded {} as record {}", file.name(), record.id);
                status.transition(UploadState::Succeeded(record.clone()));
            }
            Err(e) => {
                tracing::warn!("Upload of {} failed: {}", file.name(), e);
                status.transition(UploadState::Failed(e.clone()));
            }
        }

        outcome
    }

    async fn attempt(
        &self,
        file: &CandidateFile,
        status: &StatusPublisher,
        cancel: &CancellationToken,
    ) -> Result<FileRecord, UploadError> {
        status.transition(UploadState::Validating);
        tracing::info!("Validating {} ({}, {})", file.name(), format_file_size(file.size()), file.mime_type());
        self.policy.validate(file)?;

        status.transition(UploadState::AwaitingCredential);
        let session = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(UploadError::Cancelled),
            session = self.credentials.current_session() => session,
        };
        let session = session.ok_or(AuthError::NoSession)?;

        // The token is captured here and used for the whole transfer.
        let destination = UploadDestination::generate(&self.namespace, &session.user_id, file);
        status.transition(UploadState::Transferring);
        tracing::info!("Uploading {} to {}", file.name(), destination);

        let publisher = status.clone();
        let sink = ProgressSink::new(file.size(), move |percent| publisher.progress(percent));
        let request = TransferRequest {
            source: file.source(),
            destination: &destination,
            content_type: file.mime_type(),
            content_length: file.size(),
            access_token: &session.access_token,
        };

        tokio::select! {
            biased;
            result = self.transport.put_object(request, sink) => result?,
            _ = cancel.cancelled() => {
                tracing::info!("Upload of {} cancelled during transfer", file.name());
                return Err(UploadError::Cancelled);
            }
        }
        status.progress(100);

        status.transition(UploadState::Registering);
        let record = NewFileRecord {
            user_id: session.user_id.clone(),
            original_filename: file.name().to_string(),
            size: file.size(),
            upload_status: UploadStatus::Uploaded,
            storage_path: destination.to_string(),
        };

        self.registrar.register(&session, &record).await.map_err(|e| {
            tracing::error!(
                storage_path = %record.storage_path,
                user_id = %record.user_id,
                "Object stored without metadata: {}",
                e
            );
            UploadError::from(e)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{MockCredentialProvider, SessionCredential, StaticCredentials};
    use crate::upload::registrar::MockMetadataRegistrar;
    use async_trait::async_trait;
    use chrono::{Duration, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    const MB: u64 = 1_000_000;

    /// Transport that reports progress in fixed steps and then returns a scripted outcome
    struct ScriptedTransport {
        steps: usize,
        outcome: std::result::Result<(), TransportError>,
        hang_at_half: bool,
        calls: AtomicUsize,
        tokens: Mutex<Vec<String>>,
        destinations: Mutex<Vec<String>>,
    }

    impl ScriptedTransport {
        fn new(outcome: std::result::Result<(), TransportError>) -> Self {
            Self {
                steps: 7,
                outcome,
                hang_at_half: false,
                calls: AtomicUsize::new(0),
                tokens: Mutex::new(Vec::new()),
                destinations: Mutex::new(Vec::new()),
            }
        }

        fn hanging() -> Self {
            Self {
                hang_at_half: true,
                ..Self::new(Ok(()))
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl StorageTransport for ScriptedTransport {
        async fn put_object(
            &self,
            request: TransferRequest<'_>,
            mut progress: ProgressSink,
        ) -> std::result::Result<(), TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.tokens.lock().unwrap().push(request.access_token.to_string());
            self.destinations.lock().unwrap().push(request.destination.to_string());

            if self.hang_at_half {
                progress.advance(request.content_length / 2);
                std::future::pending::<()>().await;
            }

            let step = request.content_length / self.steps as u64;
            for _ in 0..self.steps {
                progress.advance(step);
                tokio::task::yield_now().await;
            }
            if self.outcome.is_ok() {
                progress.complete();
            }
            self.outcome.clone()
        }
    }

    fn session() -> SessionCredential {
        SessionCredential::new("user-1", "token-abc", Utc::now() + Duration::hours(1))
    }

    fn signed_in() -> Arc<MockCredentialProvider> {
        let mut credentials = MockCredentialProvider::new();
        credentials.expect_current_session().returning(|| Some(session()));
        Arc::new(credentials)
    }

    fn row_for(record: &NewFileRecord) -> FileRecord {
        FileRecord {
            id: RecordId::Number(1),
            user_id: record.user_id.clone(),
            original_filename: record.original_filename.clone(),
            size: record.size,
            storage_path: record.storage_path.clone(),
            upload_status: record.upload_status,
            created_at: Utc::now(),
        }
    }

    fn accepting_registrar() -> Arc<MockMetadataRegistrar> {
        let mut registrar = MockMetadataRegistrar::new();
        registrar
            .expect_register()
            .times(1)
            .returning(|_, record| Ok(row_for(record)));
        Arc::new(registrar)
    }

    fn unused_registrar() -> Arc<MockMetadataRegistrar> {
        let mut registrar = MockMetadataRegistrar::new();
        registrar.expect_register().times(0);
        Arc::new(registrar)
    }

    fn policy() -> UploadPolicy {
        UploadPolicy::new(200 * MB, ["audio/mpeg", "audio/wav", "video/mp4"])
    }

    fn pipeline(
        credentials: Arc<dyn CredentialProvider>,
        transport: Arc<ScriptedTransport>,
        registrar: Arc<dyn MetadataRegistrar>,
    ) -> UploadPipeline {
        UploadPipeline::new(policy(), "uploads", credentials, transport, registrar)
    }

    fn audio(size: u64) -> CandidateFile {
        CandidateFile::from_bytes("interview.mp3", "audio/mpeg", vec![0u8; size as usize])
    }

    async fn collect(mut handle: UploadHandle) -> (Vec<UploadUpdate>, std::result::Result<FileRecord, UploadError>) {
        let mut updates = Vec::new();
        while let Some(update) = handle.next_update().await {
            updates.push(update);
        }
        (updates, handle.finish().await)
    }

    fn states(updates: &[UploadUpdate]) -> Vec<&'static str> {
        let mut labels: Vec<&'static str> = updates.iter().map(|u| u.state.label()).collect();
        labels.dedup();
        labels
    }

    #[test]
    fn test_transition_table() {
        use UploadState::*;
        let failed = Failed(UploadError::Cancelled);

        assert!(Idle.can_transition_to(&Validating));
        assert!(Transferring.can_transition_to(&Registering));
        assert!(!Idle.can_transition_to(&Transferring));
        assert!(!Validating.can_transition_to(&Registering));
        assert!(AwaitingCredential.can_transition_to(&failed));
        assert!(!failed.can_transition_to(&Validating));
        assert!(!failed.can_transition_to(&failed));
    }

    #[tokio::test]
    async fn test_ten_megabyte_upload_succeeds() {
        let transport = Arc::new(ScriptedTransport::new(Ok(())));
        let pipeline = pipeline(signed_in(), transport.clone(), accepting_registrar());

        let (updates, outcome) = collect(pipeline.start(audio(10 * MB))).await;
        let record = outcome.unwrap();

        assert_eq!(record.size, 10_000_000);
        assert_eq!(record.upload_status, UploadStatus::Uploaded);
        assert_eq!(record.user_id, "user-1");
        assert!(record.storage_path.starts_with("uploads/user-1/"));
        assert!(record.storage_path.ends_with(".mp3"));
        assert_eq!(
            states(&updates),
            vec!["idle", "validating", "awaiting credential", "transferring", "registering", "succeeded"]
        );
        assert_eq!(*transport.tokens.lock().unwrap(), vec!["token-abc".to_string()]);
    }

    #[tokio::test]
    async fn test_progress_is_monotonic_and_ends_at_full() {
        let transport = Arc::new(ScriptedTransport::new(Ok(())));
        let pipeline = pipeline(signed_in(), transport, accepting_registrar());

        let (updates, outcome) = collect(pipeline.start(audio(1_000_003))).await;
        assert!(outcome.is_ok());

        let progress: Vec<u8> = updates.iter().map(|u| u.progress).collect();
        assert!(progress.windows(2).all(|w| w[0] <= w[1]), "{:?}", progress);
        assert_eq!(progress.last(), Some(&100));

        let transferring: Vec<u8> = updates
            .iter()
            .filter(|u| u.state == UploadState::Transferring)
            .map(|u| u.progress)
            .collect();
        assert!(transferring.len() > 2);
        assert_eq!(transferring.last(), Some(&100));
    }

    #[tokio::test]
    async fn test_oversized_file_fails_before_network() {
        let mut credentials = MockCredentialProvider::new();
        credentials.expect_current_session().times(0);
        let transport = Arc::new(ScriptedTransport::new(Ok(())));
        let pipeline = pipeline(Arc::new(credentials), transport.clone(), unused_registrar());

        let tmp = tempfile::Builder::new().suffix(".mp3").tempfile().unwrap();
        tmp.as_file().set_len(250 * MB).unwrap();
        let file = CandidateFile::from_path(tmp.path()).await.unwrap();

        let err = pipeline.upload(file).await.unwrap_err();

        assert!(matches!(err, UploadError::Validation(ValidationError::TooLarge { .. })));
        assert!(err.to_string().contains("Maximum size is 200 MB"));
        assert_eq!(transport.calls(), 0);
    }

    #[tokio::test]
    async fn test_unsupported_type_fails_before_network() {
        let transport = Arc::new(ScriptedTransport::new(Ok(())));
        let pipeline = pipeline(signed_in(), transport.clone(), unused_registrar());
        let file = CandidateFile::from_bytes("notes.txt", "text/plain", vec![1u8; 10]);

        let err = pipeline.upload(file).await.unwrap_err();

        assert!(matches!(err, UploadError::Validation(ValidationError::UnsupportedType { .. })));
        assert_eq!(transport.calls(), 0);
    }

    #[tokio::test]
    async fn test_missing_session_never_contacts_storage() {
        let transport = Arc::new(ScriptedTransport::new(Ok(())));
        let pipeline = pipeline(Arc::new(StaticCredentials::signed_out()), transport.clone(), unused_registrar());

        let (updates, outcome) = collect(pipeline.start(audio(MB))).await;

        assert_eq!(outcome.unwrap_err(), UploadError::Authentication(AuthError::NoSession));
        assert_eq!(transport.calls(), 0);
        assert_eq!(states(&updates), vec!["idle", "validating", "awaiting credential", "failed"]);
    }

    #[tokio::test]
    async fn test_storage_rejection_skips_registration() {
        let transport = Arc::new(ScriptedTransport::new(Err(TransportError::Rejected {
            status: 403,
            message: "Unauthorized".to_string(),
        })));
        let pipeline = pipeline(signed_in(), transport, unused_registrar());

        let (updates, outcome) = collect(pipeline.start(audio(MB))).await;

        match outcome.unwrap_err() {
            UploadError::Transport(TransportError::Rejected { status, .. }) => assert_eq!(status, 403),
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(!states(&updates).contains(&"registering"));
        assert!(matches!(updates.last().map(|u| &u.state), Some(UploadState::Failed(_))));
    }

    #[tokio::test]
    async fn test_network_failure_is_distinct() {
        let transport = Arc::new(ScriptedTransport::new(Err(TransportError::Network {
            message: "connection reset".to_string(),
        })));
        let pipeline = pipeline(signed_in(), transport, unused_registrar());

        let err = pipeline.upload(audio(MB)).await.unwrap_err();
        assert!(matches!(err, UploadError::Transport(TransportError::Network { .. })));
    }

    #[tokio::test]
    async fn test_registration_failure_after_upload() {
        let mut registrar = MockMetadataRegistrar::new();
        registrar.expect_register().times(1).returning(|_, record| {
            Err(RegistrationError::AfterSuccessfulUpload {
                storage_path: record.storage_path.clone(),
                status: Some(500),
                message: "insert failed".to_string(),
            })
        });
        let transport = Arc::new(ScriptedTransport::new(Ok(())));
        let pipeline = pipeline(signed_in(), transport.clone(), Arc::new(registrar));

        let err = pipeline.upload(audio(MB)).await.unwrap_err();

        match err {
            UploadError::Registration(RegistrationError::AfterSuccessfulUpload { storage_path, .. }) => {
                assert_eq!(vec![storage_path], *transport.destinations.lock().unwrap());
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_registrar_receives_uploaded_object_details() {
        let mut registrar = MockMetadataRegistrar::new();
        registrar
            .expect_register()
            .withf(|session, record| {
                session.access_token == "token-abc"
                    && record.user_id == "user-1"
                    && record.original_filename == "interview.mp3"
                    && record.size == 2048
                    && record.upload_status == UploadStatus::Uploaded
            })
            .times(1)
            .returning(|_, record| Ok(row_for(record)));
        let transport = Arc::new(ScriptedTransport::new(Ok(())));
        let pipeline = pipeline(signed_in(), transport, Arc::new(registrar));

        tokio_test::assert_ok!(pipeline.upload(audio(2048)).await);
    }

    #[tokio::test]
    async fn test_each_attempt_gets_a_fresh_destination() {
        let mut registrar = MockMetadataRegistrar::new();
        registrar
            .expect_register()
            .times(2)
            .returning(|_, record| Ok(row_for(record)));
        let transport = Arc::new(ScriptedTransport::new(Ok(())));
        let pipeline = pipeline(signed_in(), transport.clone(), Arc::new(registrar));

        let first = pipeline.upload(audio(1000)).await.unwrap();
        let second = pipeline.upload(audio(1000)).await.unwrap();

        assert_ne!(first.storage_path, second.storage_path);
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test]
    async fn test_cancel_during_transfer() {
        let transport = Arc::new(ScriptedTransport::hanging());
        let pipeline = pipeline(signed_in(), transport.clone(), unused_registrar());

        let mut handle = pipeline.start(audio(1000));
        while let Some(update) = handle.next_update().await {
            if update.state == UploadState::Transferring && update.progress == 50 {
                handle.cancel();
                break;
            }
        }

        assert_eq!(handle.finish().await.unwrap_err(), UploadError::Cancelled);
        assert_eq!(transport.calls(), 1);
    }

    /// Never answers, as when the identity provider hangs
    struct StalledCredentials;

    #[async_trait]
    impl CredentialProvider for StalledCredentials {
        async fn current_session(&self) -> Option<SessionCredential> {
            std::future::pending().await
        }
    }

    /// Holds each insert until released
    struct GatedRegistrar {
        release: Arc<tokio::sync::Notify>,
    }

    #[async_trait]
    impl MetadataRegistrar for GatedRegistrar {
        async fn register(
            &self,
            _session: &SessionCredential,
            record: &NewFileRecord,
        ) -> std::result::Result<FileRecord, RegistrationError> {
            self.release.notified().await;
            Ok(row_for(record))
        }
    }

    #[tokio::test]
    async fn test_cancel_while_awaiting_credential() {
        let transport = Arc::new(ScriptedTransport::new(Ok(())));
        let pipeline = pipeline(Arc::new(StalledCredentials), transport.clone(), unused_registrar());

        let mut handle = pipeline.start(audio(1000));
        while let Some(update) = handle.next_update().await {
            if update.state == UploadState::AwaitingCredential {
                handle.cancel();
                break;
            }
        }

        let (updates, outcome) = collect(handle).await;
        assert_eq!(outcome.unwrap_err(), UploadError::Cancelled);
        assert_eq!(updates.last().map(|u| &u.state), Some(&UploadState::Failed(UploadError::Cancelled)));
        assert_eq!(transport.calls(), 0);
    }

    #[tokio::test]
    async fn test_cancel_after_storage_ack_still_registers() {
        let release = Arc::new(tokio::sync::Notify::new());
        let registrar = Arc::new(GatedRegistrar {
            release: release.clone(),
        });
        let transport = Arc::new(ScriptedTransport::new(Ok(())));
        let pipeline = pipeline(signed_in(), transport.clone(), registrar);

        let mut handle = pipeline.start(audio(1000));
        while let Some(update) = handle.next_update().await {
            if update.state == UploadState::Registering {
                handle.cancel();
                release.notify_one();
                break;
            }
        }

        let (updates, outcome) = collect(handle).await;
        let record = outcome.unwrap();
        assert_eq!(record.upload_status, UploadStatus::Uploaded);
        assert_eq!(updates.last().map(|u| &u.state), Some(&UploadState::Succeeded(record)));
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn test_current_snapshot_is_terminal_after_finish() {
        let transport = Arc::new(ScriptedTransport::new(Ok(())));
        let pipeline = pipeline(signed_in(), transport, accepting_registrar());

        let handle = pipeline.start(audio(500));
        let mut watch = handle.watch();
        let outcome = handle.finish().await.unwrap();

        let last = watch.borrow_and_update().clone();
        assert_eq!(last.state, UploadState::Succeeded(outcome));
        assert_eq!(last.progress, 100);
    }

    #[tokio::test]
    async fn test_concurrent_attempts_are_independent() {
        let mut registrar = MockMetadataRegistrar::new();
        registrar
            .expect_register()
            .times(3)
            .returning(|_, record| Ok(row_for(record)));
        let transport = Arc::new(ScriptedTransport::new(Ok(())));
        let pipeline = pipeline(signed_in(), transport.clone(), Arc::new(registrar));

        let handles: Vec<UploadHandle> = (0..3).map(|_| pipeline.start(audio(4096))).collect();
        let mut paths = Vec::new();
        for handle in handles {
            paths.push(handle.finish().await.unwrap().storage_path);
        }
        paths.sort();
        paths.dedup();

        assert_eq!(paths.len(), 3);
        assert_eq!(transport.calls(), 3);
    }

    mod over_http {
        use super::*;
        use crate::upload::registrar::RestMetadataRegistrar;
        use crate::upload::transport::HttpStorageTransport;
        use mockito::Matcher;

        fn http_pipeline(server_url: &str) -> UploadPipeline {
            let client = Client::new();
            UploadPipeline::new(
                policy(),
                "uploads",
                Arc::new(StaticCredentials::new(session())),
                Arc::new(HttpStorageTransport::new(client.clone(), format!("{}/storage/v1", server_url), "files-bucket")),
                Arc::new(RestMetadataRegistrar::new(client, format!("{}/rest/v1", server_url), "files")),
            )
        }

        #[tokio::test]
        async fn test_end_to_end_success() {
            let mut server = mockito::Server::new_async().await;
            let upload = server
                .mock("POST", Matcher::Regex(r"^/storage/v1/object/files-bucket/uploads/user-1/[0-9a-f-]{36}\.wav$".to_string()))
                .match_header("authorization", "Bearer token-abc")
                .with_status(200)
                .create_async()
                .await;
            let insert = server
                .mock("POST", "/rest/v1/files")
                .match_header("authorization", "Bearer token-abc")
                .match_body(Matcher::PartialJson(serde_json::json!({
                    "user_id": "user-1",
                    "original_filename": "memo.wav",
                    "size": 4096,
                    "upload_status": "uploaded"
                })))
                .with_status(201)
                .with_body(r#"[{"id":"c0ffee","user_id":"user-1","original_filename":"memo.wav","size":4096,"storage_path":"uploads/user-1/x.wav","upload_status":"uploaded","created_at":"2025-03-01T10:15:00Z"}]"#)
                .create_async()
                .await;

            let file = CandidateFile::from_bytes("memo.wav", "audio/wav", vec![3u8; 4096]);
            let record = http_pipeline(&server.url()).upload(file).await.unwrap();

            upload.assert_async().await;
            insert.assert_async().await;
            assert_eq!(record.id, RecordId::Text("c0ffee".to_string()));
        }

        #[tokio::test]
        async fn test_forbidden_upload_never_inserts() {
            let mut server = mockito::Server::new_async().await;
            server
                .mock("POST", Matcher::Regex(r"^/storage/v1/object/".to_string()))
                .with_status(403)
                .with_body(r#"{"statusCode":"403","error":"Unauthorized","message":"jwt expired"}"#)
                .create_async()
                .await;
            let insert = server
                .mock("POST", "/rest/v1/files")
                .expect(0)
                .create_async()
                .await;

            let file = CandidateFile::from_bytes("memo.wav", "audio/wav", vec![3u8; 10]);
            let err = http_pipeline(&server.url()).upload(file).await.unwrap_err();

            insert.assert_async().await;
            assert_eq!(
                err,
                UploadError::Transport(TransportError::Rejected {
                    status: 403,
                    message: "jwt expired".to_string()
                })
            );
        }
    }
}
