//! Server-mode build directory reader
//!
//! [`ServerModeReader`] drives one CMake server through the request sequence
//! `handshake → configure → compute → codemodel → cache → cmakeInputs` and
//! publishes the result as one [`Snapshot`]. All state changes happen inside
//! [`ServerModeReader::process_next_event`] and
//! [`ServerModeReader::process_pending_events`] on the caller's task.
//!
//! # Lifecycle
//!
//! 1. `set_parameters()` names the source and build directory
//! 2. `parse(force)` launches the server (or reuses a ready connection)
//! 3. the owner pumps events until `is_parsing()` turns false
//! 4. accessors read the published snapshot
//!
//! `stop()` disengages at any point. Everything the old server still sends
//! afterwards is dropped.

use serde::Serialize;
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

use crate::codemodel::{CodeModel, project_code_model};
use crate::config::ReaderParameters;
use crate::error::ReaderError;
use crate::log_timing;
use crate::model::cache::CacheEntry;
use crate::model::extract::{extract_cache, extract_cmake_inputs, extract_code_model};
use crate::model::{CmakeInputFile, Diagnostic, Snapshot, TargetType};
use crate::server::channel::{ChannelEvent, ServerChannel, ServerLauncher};
use crate::server::correlator::{Correlation, Correlator};
use crate::server::message::{HandshakeParams, ProtocolVersion, RequestKind, ServerMessage};
use crate::server::progress::{ProgressTracker, ProgressUpdate};
use crate::server::state::{Effect, Event, ProtocolState, Transition, transition};
use crate::tree::{KnownFile, ProjectTree, ReconcileReport, reconcile};

/// Notifications to the owner of the reader
#[derive(Debug, Clone, PartialEq)]
pub enum ReaderEvent {
    Started,
    Progress(ProgressUpdate),
    /// Log text from the server
    Message {
        title: Option<String>,
        message: String,
    },
    /// The server saw its inputs change; a reparse is due
    Dirty,
    FileChange { path: PathBuf },
    Finished,
    Failed(String),
}

/// A target as the build/run side sees it
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BuildTarget {
    pub name: String,
    pub target_type: TargetType,
    /// First artifact of an executable target
    pub executable: Option<PathBuf>,
    pub artifacts: Vec<PathBuf>,
    pub working_directory: PathBuf,
    pub source_directory: PathBuf,
    pub include_paths: Vec<PathBuf>,
    pub defines: Vec<String>,
}

pub struct ServerModeReader {
    launcher: Box<dyn ServerLauncher>,
    parameters: Option<ReaderParameters>,
    /// Parameters the current connection was launched with
    connected: Option<ReaderParameters>,
    state: ProtocolState,
    generation: u64,
    correlator: Correlator,
    channel: Option<ServerChannel>,
    progress: ProgressTracker,
    force_configure: bool,
    builder: Option<Snapshot>,
    published: Option<Arc<Snapshot>>,
    last_error: Option<String>,
    cycle_started: Option<Instant>,
    subscribers: Vec<mpsc::UnboundedSender<ReaderEvent>>,
}

impl ServerModeReader {
    pub fn new(launcher: impl ServerLauncher + 'static) -> Self {
        Self {
            launcher: Box::new(launcher),
            parameters: None,
            connected: None,
            state: ProtocolState::Unconnected,
            generation: 0,
            correlator: Correlator::new(0),
            channel: None,
            progress: ProgressTracker::new(),
            force_configure: false,
            builder: None,
            published: None,
            last_error: None,
            cycle_started: None,
            subscribers: Vec::new(),
        }
    }

    // ========================================================================
    // Configuration
    // ========================================================================

    /// Takes effect on the next `parse()`. A connection launched for
    /// incompatible parameters is replaced then.
    pub fn set_parameters(&mut self, parameters: ReaderParameters) {
        debug!(
            "Reader parameters: source={} build={}",
            parameters.source_directory.display(),
            parameters.build_directory.display()
        );
        self.parameters = Some(parameters);
    }

    pub fn parameters(&self) -> Option<&ReaderParameters> {
        self.parameters.as_ref()
    }

    /// Whether `parameters` can be served by this reader without a relaunch
    pub fn is_compatible(&self, parameters: &ReaderParameters) -> bool {
        self.parameters
            .as_ref()
            .is_some_and(|current| current.is_server_compatible(parameters))
    }

    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<ReaderEvent> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.subscribers.push(sender);
        receiver
    }

    // ========================================================================
    // Status
    // ========================================================================

    pub fn state(&self) -> ProtocolState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == ProtocolState::Ready
    }

    pub fn is_parsing(&self) -> bool {
        self.state.is_busy()
    }

    /// True only in `Ready`. Published data outlives this flag: after a
    /// failure or `stop()` the accessors keep serving the last snapshot.
    pub fn has_data(&self) -> bool {
        self.is_ready() && self.published.is_some()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Current published snapshot, shared with the caller
    pub fn snapshot(&self) -> Option<Arc<Snapshot>> {
        self.published.clone()
    }

    // ========================================================================
    // Control
    // ========================================================================

    /// Start a parse cycle. Completion is reported through events and
    /// observed by pumping [`process_next_event`](Self::process_next_event).
    pub async fn parse(&mut self, force: bool) -> Result<(), ReaderError> {
        let parameters = self.parameters.clone().ok_or(ReaderError::NoParameters)?;
        if self.state.is_busy() {
            return Err(ReaderError::invalid_state("parse", self.state));
        }

        self.force_configure = force || !parameters.cache_file().exists();
        self.builder = Some(Snapshot::default());
        self.progress.reset();
        self.last_error = None;
        self.cycle_started = Some(Instant::now());
        info!(
            "Parsing {} (force configure: {})",
            parameters.build_directory.display(),
            self.force_configure
        );
        self.emit(ReaderEvent::Started);

        let reusable = self.state == ProtocolState::Ready
            && self.channel.is_some()
            && self
                .connected
                .as_ref()
                .is_some_and(|connected| connected.is_server_compatible(&parameters));
        if reusable {
            return self.apply(Event::Reparse);
        }

        self.teardown().await;
        match self.launcher.launch(&parameters).await {
            Ok(channel) => {
                self.channel = Some(channel);
                self.connected = Some(parameters);
                self.apply(Event::Launched)
            }
            Err(e) => {
                self.state = ProtocolState::Error;
                self.fail(format!("Failed to start CMake server: {e}"));
                Err(e)
            }
        }
    }

    /// Disengage from the server. No message of the current session is
    /// applied after this returns. Published data stays available.
    pub async fn stop(&mut self) {
        if self.state.is_busy() {
            info!("Stopping parse in state {:?}", self.state);
        }
        self.builder = None;
        self.progress.reset();
        self.teardown().await;
    }

    /// Drop all parsed data, published or in progress
    pub fn reset_data(&mut self) {
        self.builder = None;
        self.published = None;
    }

    async fn teardown(&mut self) {
        if let Some(channel) = self.channel.take() {
            channel.close();
        }
        self.launcher.terminate().await;
        self.connected = None;

        self.generation += 1;
        self.correlator.reset(self.generation);

        let Transition { next, .. } = transition(self.state, Event::Stop);
        self.set_state(next);
    }

    // ========================================================================
    // Event processing
    // ========================================================================

    /// Wait for one event from the server and apply it. Returns `false`
    /// when there is no connection to wait on.
    pub async fn process_next_event(&mut self) -> Result<bool, ReaderError> {
        let Some(channel) = self.channel.as_mut() else {
            return Ok(false);
        };
        let event = channel.recv().await.unwrap_or_else(|| ChannelEvent::Closed {
            reason: "server channel ended".to_string(),
        });
        self.handle_channel_event(event)?;
        Ok(true)
    }

    /// Apply everything already queued without waiting. Returns the count.
    pub fn process_pending_events(&mut self) -> Result<usize, ReaderError> {
        let mut processed = 0;
        while let Some(event) = self.channel.as_mut().and_then(ServerChannel::try_recv) {
            self.handle_channel_event(event)?;
            processed += 1;
        }
        Ok(processed)
    }

    /// Pump events until the current cycle ends
    pub async fn wait_for_completion(&mut self) -> Result<(), ReaderError> {
        while self.is_parsing() {
            if !self.process_next_event().await? {
                break;
            }
        }
        match self.state {
            ProtocolState::Error => Err(ReaderError::Failed(
                self.last_error
                    .clone()
                    .unwrap_or_else(|| "CMake server parse failed".to_string()),
            )),
            _ => Ok(()),
        }
    }

    fn handle_channel_event(&mut self, event: ChannelEvent) -> Result<(), ReaderError> {
        match event {
            ChannelEvent::Message(message) => self.handle_message(message),
            ChannelEvent::Malformed { text, error } => {
                warn!("Malformed message from CMake server: {} ({} bytes)", error, text.len());
                if self.state.is_busy() {
                    self.apply(Event::ChannelClosed {
                        reason: format!("malformed message: {error}"),
                    })
                } else {
                    Ok(())
                }
            }
            ChannelEvent::Closed { reason } => {
                self.channel = None;
                self.connected = None;
                self.apply(Event::ChannelClosed { reason })
            }
        }
    }

    fn handle_message(&mut self, message: ServerMessage) -> Result<(), ReaderError> {
        match self.correlator.resolve(message) {
            Correlation::Reply { kind, payload } => self.apply(Event::Reply { kind, payload }),
            Correlation::ErrorReply { kind, message } => {
                self.apply(Event::ErrorReply { kind, message })
            }
            Correlation::Progress { kind, progress } => self.apply(Event::Progress {
                kind,
                minimum: progress.progress_minimum,
                current: progress.progress_current,
                maximum: progress.progress_maximum,
                message: progress.progress_message,
            }),
            Correlation::Unsolicited(message) => self.handle_unsolicited(message),
            Correlation::Stale | Correlation::Unmatched { .. } => Ok(()),
        }
    }

    fn handle_unsolicited(&mut self, message: ServerMessage) -> Result<(), ReaderError> {
        match message {
            ServerMessage::Hello(hello) => self.apply(Event::Hello {
                supported: hello.supported_protocol_versions,
            }),
            ServerMessage::Message(log) => {
                debug!("CMake: {}", log.message);
                self.emit(ReaderEvent::Message {
                    title: log.title,
                    message: log.message,
                });
                Ok(())
            }
            ServerMessage::Signal(signal) => {
                match signal.name.as_str() {
                    "dirty" => self.emit(ReaderEvent::Dirty),
                    "fileChange" => {
                        if let Some(path) = signal.path {
                            self.emit(ReaderEvent::FileChange {
                                path: PathBuf::from(path),
                            });
                        }
                    }
                    other => debug!("Ignoring CMake server signal {:?}", other),
                }
                Ok(())
            }
            other => {
                debug!("Ignoring unsolicited {} message", other.type_name());
                Ok(())
            }
        }
    }

    // ========================================================================
    // State machine driver
    // ========================================================================

    fn set_state(&mut self, next: ProtocolState) {
        if self.state != next {
            debug!("Reader state: {:?} -> {:?}", self.state, next);
            self.state = next;
        }
    }

    fn apply(&mut self, event: Event) -> Result<(), ReaderError> {
        let Transition { next, effects } = transition(self.state, event);
        self.set_state(next);

        for effect in effects {
            if let Err(e) = self.run_effect(effect) {
                self.set_state(ProtocolState::Error);
                self.fail(e.to_string());
                return Err(e);
            }
        }
        Ok(())
    }

    fn run_effect(&mut self, effect: Effect) -> Result<(), ReaderError> {
        match effect {
            Effect::SendHandshake(version) => {
                let params = self.handshake_params(version)?;
                self.send_request(RequestKind::Handshake, params)
            }
            Effect::Send(kind) => {
                let mut params = Map::new();
                if kind == RequestKind::Configure && self.force_configure {
                    let arguments = self
                        .parameters
                        .as_ref()
                        .map(ReaderParameters::cache_arguments)
                        .unwrap_or_default();
                    params.insert("cacheArguments".to_string(), Value::from(arguments));
                }
                let overall = self.progress.step_started(kind);
                self.emit(ReaderEvent::Progress(ProgressUpdate {
                    step: kind,
                    fraction: 0.0,
                    overall,
                    message: format!("Running {kind} step"),
                }));
                self.send_request(kind, params)
            }
            Effect::Extract { kind, payload } => {
                self.extract(kind, &payload);
                Ok(())
            }
            Effect::Progress(step) => {
                let update = self.progress.observe(step);
                self.emit(ReaderEvent::Progress(update));
                Ok(())
            }
            Effect::Publish => {
                self.publish();
                Ok(())
            }
            Effect::Fail(message) => {
                self.fail(message);
                Ok(())
            }
            Effect::Ignore(why) => {
                trace!("Ignored: {}", why);
                Ok(())
            }
        }
    }

    fn handshake_params(&self, version: ProtocolVersion) -> Result<Map<String, Value>, ReaderError> {
        let parameters = self.connected.as_ref().ok_or(ReaderError::NoParameters)?;
        let handshake = HandshakeParams {
            protocol_version: version,
            source_directory: parameters.source_directory.clone(),
            build_directory: parameters.build_directory.clone(),
            generator: parameters.generator.clone(),
            extra_generator: parameters.extra_generator.clone(),
            platform: parameters.platform.clone(),
            toolset: parameters.toolset.clone(),
        };
        match serde_json::to_value(handshake)? {
            Value::Object(map) => Ok(map),
            _ => Ok(Map::new()),
        }
    }

    fn send_request(&mut self, kind: RequestKind, params: Map<String, Value>) -> Result<(), ReaderError> {
        let request = self.correlator.send(kind, params)?;
        let text = request.to_json()?;
        debug!("Sending {} request ({})", kind, request.cookie);

        let channel = self
            .channel
            .as_ref()
            .ok_or_else(|| ReaderError::Transport("not connected".to_string()))?;
        channel.send(text)
    }

    fn extract(&mut self, kind: RequestKind, payload: &Map<String, Value>) {
        let builder = self.builder.get_or_insert_with(Snapshot::default);
        match kind {
            RequestKind::CodeModel => {
                extract_code_model(payload, &mut builder.model, &mut builder.diagnostics)
            }
            RequestKind::Cache => builder.cache = extract_cache(payload, &mut builder.diagnostics),
            RequestKind::CmakeInputs => {
                builder.inputs = extract_cmake_inputs(payload, &mut builder.diagnostics)
            }
            other => trace!("No data to extract from {} reply", other),
        }
    }

    fn publish(&mut self) {
        let snapshot = self.builder.take().unwrap_or_default();
        info!(
            "Parse finished: {} targets, {} cache entries, {} diagnostics",
            snapshot.model.target_count(),
            snapshot.cache.len(),
            snapshot.diagnostics.len()
        );
        if let Some(started) = self.cycle_started.take() {
            log_timing!(tracing::Level::INFO, "parse", started.elapsed());
        }

        self.published = Some(Arc::new(snapshot));
        self.force_configure = false;
        self.emit(ReaderEvent::Finished);
    }

    fn fail(&mut self, message: String) {
        error!("{}", message);
        self.builder = None;
        self.cycle_started = None;
        if let Some(channel) = self.channel.take() {
            channel.close();
        }
        self.connected = None;
        self.last_error = Some(message.clone());
        self.emit(ReaderEvent::Failed(message));
    }

    fn emit(&mut self, event: ReaderEvent) {
        self.subscribers
            .retain(|subscriber| subscriber.send(event.clone()).is_ok());
    }

    // ========================================================================
    // Published data
    // ========================================================================

    pub fn build_targets(&self) -> Vec<BuildTarget> {
        let Some(snapshot) = &self.published else {
            return Vec::new();
        };
        let model = &snapshot.model;

        model
            .targets()
            .map(|(id, target)| {
                let mut include_paths: Vec<PathBuf> = Vec::new();
                let mut defines = Vec::new();
                for group in model.file_groups_of(id) {
                    for include in &group.include_paths {
                        if !include_paths.contains(&include.path) {
                            include_paths.push(include.path.clone());
                        }
                    }
                    defines.extend(group.defines.iter().cloned());
                }

                let executable = match target.target_type {
                    TargetType::Executable => target.artifacts.first().cloned(),
                    _ => None,
                };

                BuildTarget {
                    name: target.name.clone(),
                    target_type: target.target_type.clone(),
                    executable,
                    artifacts: target.artifacts.clone(),
                    working_directory: target.build_directory.clone(),
                    source_directory: target.source_directory.clone(),
                    include_paths,
                    defines,
                }
            })
            .collect()
    }

    /// The cache as the last successful cycle reported it
    pub fn parsed_configuration(&self) -> Vec<CacheEntry> {
        self.published
            .as_ref()
            .map(|snapshot| snapshot.cache.entries.clone())
            .unwrap_or_default()
    }

    pub fn cmake_inputs(&self) -> Vec<CmakeInputFile> {
        self.published
            .as_ref()
            .map(|snapshot| snapshot.inputs.files.clone())
            .unwrap_or_default()
    }

    pub fn diagnostics(&self) -> Vec<Diagnostic> {
        self.published
            .as_ref()
            .map(|snapshot| snapshot.diagnostics.clone())
            .unwrap_or_default()
    }

    /// Reconcile `tree` with the published snapshot; `None` without data
    pub fn generate_project_tree(&self, tree: &mut ProjectTree, all_files: &[KnownFile]) -> Option<ReconcileReport> {
        self.published
            .as_ref()
            .map(|snapshot| reconcile(tree, snapshot, all_files))
    }

    pub fn update_code_model(&self) -> Option<CodeModel> {
        self.published.as_deref().map(project_code_model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::fake_server::{
        FakeLauncher, FakeServer, Responder, error_reply, progress, reply, standard_responder,
    };
    use serde_json::json;
    use std::path::Path;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn reader_for(launcher: FakeLauncher, build: &Path) -> ServerModeReader {
        let mut reader = ServerModeReader::new(launcher);
        reader.set_parameters(ReaderParameters::builder("/p", build).build());
        reader
    }

    fn drain(events: &mut mpsc::UnboundedReceiver<ReaderEvent>) -> Vec<ReaderEvent> {
        let mut collected = Vec::new();
        while let Ok(event) = events.try_recv() {
            collected.push(event);
        }
        collected
    }

    fn request_types(server: &FakeServer) -> Vec<String> {
        server
            .requests()
            .iter()
            .map(|request| request["type"].as_str().unwrap_or_default().to_string())
            .collect()
    }

    #[tokio::test]
    async fn test_full_sequence_reaches_ready() {
        let build = tempfile::tempdir().unwrap();
        let (launcher, server) = FakeLauncher::new(standard_responder());
        let mut reader = reader_for(launcher, build.path());
        let mut events = reader.subscribe();

        assert!(!reader.has_data());
        reader.parse(false).await.unwrap();
        assert!(reader.is_parsing());
        reader.wait_for_completion().await.unwrap();

        assert!(reader.is_ready());
        assert!(reader.has_data());
        assert!(!reader.is_parsing());
        assert_eq!(
            request_types(&server),
            vec!["handshake", "configure", "compute", "codemodel", "cache", "cmakeInputs"]
        );

        let handshake = &server.requests()[0];
        assert_eq!(handshake["protocolVersion"]["major"], 1);
        assert_eq!(handshake["generator"], "Unix Makefiles");
        // No CMakeCache.txt in the build directory yet
        assert_eq!(server.requests()[1]["cacheArguments"], json!([""]));

        let targets = reader.build_targets();
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].name, "app");
        assert_eq!(targets[0].executable, Some(PathBuf::from("/p/build/app.exe")));
        assert_eq!(targets[0].defines, vec!["DEBUG", "DEBUG"]);
        assert_eq!(reader.parsed_configuration().len(), 2);
        assert!(!reader.cmake_inputs().is_empty());

        let events = drain(&mut events);
        assert_eq!(events.first(), Some(&ReaderEvent::Started));
        assert_eq!(events.last(), Some(&ReaderEvent::Finished));
    }

    #[tokio::test]
    async fn test_existing_cache_skips_cache_arguments() {
        let build = tempfile::tempdir().unwrap();
        std::fs::write(build.path().join("CMakeCache.txt"), "").unwrap();
        let (launcher, server) = FakeLauncher::new(standard_responder());
        let mut reader = reader_for(launcher, build.path());

        reader.parse(false).await.unwrap();
        reader.wait_for_completion().await.unwrap();
        assert!(server.requests()[1].get("cacheArguments").is_none());

        reader.parse(true).await.unwrap();
        reader.wait_for_completion().await.unwrap();
        let configures: Vec<_> = server
            .requests()
            .into_iter()
            .filter(|r| r["type"] == "configure")
            .collect();
        assert_eq!(configures.len(), 2);
        assert_eq!(configures[1]["cacheArguments"], json!([""]));
    }

    #[tokio::test]
    async fn test_reparse_reuses_connection() {
        let build = tempfile::tempdir().unwrap();
        let (launcher, server) = FakeLauncher::new(standard_responder());
        let mut reader = reader_for(launcher, build.path());

        reader.parse(false).await.unwrap();
        reader.wait_for_completion().await.unwrap();
        let first = reader.snapshot().unwrap();

        reader.parse(false).await.unwrap();
        assert_eq!(reader.state(), ProtocolState::ConfigureRequested);
        reader.wait_for_completion().await.unwrap();

        assert_eq!(server.launch_count(), 1);
        let second = reader.snapshot().unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(first.model, second.model);
    }

    #[tokio::test]
    async fn test_error_reply_keeps_previous_snapshot() {
        let build = tempfile::tempdir().unwrap();
        let failing = Arc::new(AtomicBool::new(false));
        let responder: Responder = {
            let failing = Arc::clone(&failing);
            let standard = standard_responder();
            Arc::new(move |request: &Value| {
                if request["type"] == "configure" && failing.load(Ordering::SeqCst) {
                    vec![error_reply(request, "Could not create named generator Bogus")]
                } else {
                    standard(request)
                }
            })
        };
        let (launcher, _server) = FakeLauncher::new(responder);
        let mut reader = reader_for(launcher, build.path());
        let mut events = reader.subscribe();

        reader.parse(false).await.unwrap();
        reader.wait_for_completion().await.unwrap();
        let before = reader.snapshot().unwrap();
        drain(&mut events);

        failing.store(true, Ordering::SeqCst);
        reader.parse(true).await.unwrap();
        let result = reader.wait_for_completion().await;

        assert!(matches!(result, Err(ReaderError::Failed(ref m)) if m.contains("configure")));
        assert_eq!(reader.state(), ProtocolState::Error);
        assert!(!reader.is_ready());
        assert!(Arc::ptr_eq(&before, &reader.snapshot().unwrap()));
        assert!(
            drain(&mut events)
                .iter()
                .any(|e| matches!(e, ReaderEvent::Failed(m) if m.contains("Bogus")))
        );

        // Error is left by the next parse, which relaunches
        failing.store(false, Ordering::SeqCst);
        reader.parse(false).await.unwrap();
        reader.wait_for_completion().await.unwrap();
        assert!(reader.is_ready());
    }

    #[tokio::test]
    async fn test_stop_discards_in_flight_cycle() {
        let build = tempfile::tempdir().unwrap();
        let hold_compute = Arc::new(AtomicBool::new(false));
        let responder: Responder = {
            let hold = Arc::clone(&hold_compute);
            let standard = standard_responder();
            Arc::new(move |request: &Value| {
                if request["type"] == "compute" && hold.load(Ordering::SeqCst) {
                    Vec::new()
                } else {
                    standard(request)
                }
            })
        };
        let (launcher, server) = FakeLauncher::new(responder);
        let mut reader = reader_for(launcher, build.path());

        reader.parse(false).await.unwrap();
        reader.wait_for_completion().await.unwrap();
        let before = reader.snapshot().unwrap();

        hold_compute.store(true, Ordering::SeqCst);
        reader.parse(false).await.unwrap();
        while reader.state() != ProtocolState::ComputeRequested {
            assert!(reader.process_next_event().await.unwrap());
        }
        let held_compute = server.wait_for_requests(8).await.remove(7);
        assert_eq!(held_compute["type"], "compute");

        reader.stop().await;
        assert_eq!(reader.state(), ProtocolState::Unconnected);
        assert!(!reader.is_parsing());
        assert!(!reader.has_data());
        assert_eq!(reader.build_targets().len(), 1);
        assert!(server.terminate_count() >= 1);

        // The late reply has nowhere to go
        server.inject(reply(&held_compute, json!({})));
        assert_eq!(reader.process_pending_events().unwrap(), 0);
        assert!(Arc::ptr_eq(&before, &reader.snapshot().unwrap()));

        // A fresh session ignores the old session's cookies
        hold_compute.store(false, Ordering::SeqCst);
        reader.parse(false).await.unwrap();
        server.inject(reply(&held_compute, json!({})));
        reader.wait_for_completion().await.unwrap();
        assert!(reader.is_ready());
        assert_eq!(server.launch_count(), 2);
    }

    #[tokio::test]
    async fn test_connection_loss_fails_cycle() {
        let build = tempfile::tempdir().unwrap();
        let responder: Responder = {
            let standard = standard_responder();
            Arc::new(move |request: &Value| {
                if request["type"] == "compute" {
                    Vec::new()
                } else {
                    standard(request)
                }
            })
        };
        let (launcher, server) = FakeLauncher::new(responder);
        let mut reader = reader_for(launcher, build.path());

        reader.parse(false).await.unwrap();
        while reader.state() != ProtocolState::ComputeRequested {
            reader.process_next_event().await.unwrap();
        }
        server.disconnect("cmake exited with status 1");

        let result = reader.wait_for_completion().await;
        assert!(matches!(result, Err(ReaderError::Failed(ref m)) if m.contains("connection lost")));
        assert!(!reader.has_data());
        assert_eq!(reader.last_error().map(|e| e.contains("status 1")), Some(true));
    }

    #[tokio::test]
    async fn test_progress_is_monotone_within_step() {
        let build = tempfile::tempdir().unwrap();
        let responder: Responder = {
            let standard = standard_responder();
            Arc::new(move |request: &Value| {
                if request["type"] == "compute" {
                    let mut messages = vec![
                        progress(request, 0, 50, 100),
                        progress(request, 0, 30, 100),
                        progress(request, 5, 5, 5),
                        progress(request, 0, 100, 100),
                    ];
                    messages.extend(standard(request));
                    messages
                } else {
                    standard(request)
                }
            })
        };
        let (launcher, _server) = FakeLauncher::new(responder);
        let mut reader = reader_for(launcher, build.path());
        let mut events = reader.subscribe();

        reader.parse(false).await.unwrap();
        reader.wait_for_completion().await.unwrap();

        let updates: Vec<ProgressUpdate> = drain(&mut events)
            .into_iter()
            .filter_map(|event| match event {
                ReaderEvent::Progress(update) => Some(update),
                _ => None,
            })
            .collect();

        let compute: Vec<f64> = updates
            .iter()
            .filter(|u| u.step == RequestKind::Compute)
            .map(|u| u.fraction)
            .collect();
        assert_eq!(compute, vec![0.0, 0.5, 0.5, 0.5, 1.0]);
        assert!(updates.iter().all(|u| (0.0..=1.0).contains(&u.overall)));
        assert!(updates.windows(2).all(|w| w[0].overall <= w[1].overall));
    }

    #[tokio::test]
    async fn test_malformed_file_group_still_ready() {
        let build = tempfile::tempdir().unwrap();
        let responder: Responder = {
            let standard = standard_responder();
            Arc::new(move |request: &Value| {
                if request["type"] == "codemodel" {
                    vec![reply(
                        request,
                        json!({"configurations": [{"projects": [{
                            "name": "App",
                            "sourceDirectory": "/p",
                            "targets": [{
                                "name": "app",
                                "type": "EXECUTABLE",
                                "fileGroups": [
                                    {"language": "CXX", "sources": {"bad": true}},
                                    {"language": "CXX", "sources": ["main.cpp"]}
                                ]
                            }]
                        }]}]}),
                    )]
                } else {
                    standard(request)
                }
            })
        };
        let (launcher, _server) = FakeLauncher::new(responder);
        let mut reader = reader_for(launcher, build.path());

        reader.parse(false).await.unwrap();
        reader.wait_for_completion().await.unwrap();

        assert!(reader.is_ready());
        assert_eq!(reader.diagnostics().len(), 1);
        let code_model = reader.update_code_model().unwrap();
        assert_eq!(code_model.parts.len(), 1);
        assert_eq!(
            code_model.file_settings(Path::new("/p/main.cpp"))[0].language,
            "CXX"
        );
    }

    #[tokio::test]
    async fn test_incompatible_hello_fails() {
        let build = tempfile::tempdir().unwrap();
        let (launcher, server) = FakeLauncher::new(standard_responder());
        let launcher = launcher.with_hello(json!({
            "type": "hello",
            "supportedProtocolVersions": [{"major": 2, "minor": 0}]
        }));
        let mut reader = reader_for(launcher, build.path());

        reader.parse(false).await.unwrap();
        let result = reader.wait_for_completion().await;
        assert!(matches!(result, Err(ReaderError::Failed(_))));
        assert!(server.requests().is_empty());
    }

    #[tokio::test]
    async fn test_signals_and_messages_forwarded() {
        let build = tempfile::tempdir().unwrap();
        let (launcher, server) = FakeLauncher::new(standard_responder());
        let mut reader = reader_for(launcher, build.path());
        let mut events = reader.subscribe();

        reader.parse(false).await.unwrap();
        reader.wait_for_completion().await.unwrap();
        drain(&mut events);

        server.inject(json!({"type": "signal", "name": "dirty"}));
        server.inject(json!({"type": "signal", "name": "fileChange", "path": "/p/CMakeLists.txt"}));
        server.inject(json!({"type": "message", "message": "-- Configuring done", "inReplyTo": "configure"}));
        assert_eq!(reader.process_pending_events().unwrap(), 3);
        let seen = drain(&mut events);

        assert_eq!(seen[0], ReaderEvent::Dirty);
        assert_eq!(
            seen[1],
            ReaderEvent::FileChange {
                path: PathBuf::from("/p/CMakeLists.txt")
            }
        );
        assert!(matches!(&seen[2], ReaderEvent::Message { message, .. } if message.contains("Configuring")));
        assert!(reader.is_ready());
    }

    #[tokio::test]
    async fn test_operations_without_parameters_or_data() {
        let (launcher, _server) = FakeLauncher::new(standard_responder());
        let mut reader = ServerModeReader::new(launcher);

        assert!(matches!(reader.parse(false).await, Err(ReaderError::NoParameters)));
        assert!(reader.build_targets().is_empty());
        assert!(reader.update_code_model().is_none());
        let mut tree = ProjectTree::new();
        assert!(reader.generate_project_tree(&mut tree, &[]).is_none());
        assert!(!reader.process_next_event().await.unwrap());
    }

    #[tokio::test]
    async fn test_parse_while_busy_is_rejected() {
        let build = tempfile::tempdir().unwrap();
        let (launcher, _server) = FakeLauncher::new(standard_responder());
        let mut reader = reader_for(launcher, build.path());

        reader.parse(false).await.unwrap();
        assert!(matches!(
            reader.parse(false).await,
            Err(ReaderError::InvalidState { operation: "parse", .. })
        ));
        reader.wait_for_completion().await.unwrap();

        reader.reset_data();
        assert!(!reader.has_data());
        assert!(reader.is_ready());
    }

    #[tokio::test]
    async fn test_project_tree_from_published_snapshot() {
        let build = tempfile::tempdir().unwrap();
        let (launcher, _server) = FakeLauncher::new(standard_responder());
        let mut reader = reader_for(launcher, build.path());

        reader.parse(false).await.unwrap();
        reader.wait_for_completion().await.unwrap();

        let mut tree = ProjectTree::new();
        let files = vec![KnownFile::new("/p/app.h")];
        let first = reader.generate_project_tree(&mut tree, &files).unwrap();
        assert!(!first.added.is_empty());
        assert!(tree.find_path(&["App", "app", "main.cpp"]).is_some());
        assert!(tree.find_path(&["App", "app", "app.h"]).is_some());

        let second = reader.generate_project_tree(&mut tree, &files).unwrap();
        assert!(second.is_unchanged());
    }

    #[cfg(feature = "cmake-integration-tests")]
    #[tokio::test]
    async fn test_real_cmake_server_parse() {
        use crate::server::channel::CmakeServerLauncher;
        use crate::test_utils::{get_test_cmake_path, integration::TestProject};

        let project = TestProject::new().unwrap();
        let mut reader = ServerModeReader::new(CmakeServerLauncher::new());
        reader.set_parameters(
            ReaderParameters::builder(&project.source_directory, &project.build_directory)
                .cmake_executable(get_test_cmake_path())
                .build(),
        );

        reader.parse(true).await.unwrap();
        reader.wait_for_completion().await.unwrap();

        let targets = reader.build_targets();
        assert!(targets.iter().any(|t| t.name == "app"));
        let code_model = reader.update_code_model().unwrap();
        let main = project.source_directory.join("main.cpp");
        assert!(!code_model.file_settings(&main).is_empty());
        reader.stop().await;
    }
}
