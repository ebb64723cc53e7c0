//! Test utilities and global setup
//!
//! Provides centralized test logging configuration, an in-memory CMake
//! server and a small on-disk project for integration tests.

/// Test logging utilities
#[cfg(all(test, feature = "test-logging"))]
pub mod logging {
    use std::sync::Once;
    use tracing_subscriber::{EnvFilter, fmt};

    static INIT: Once = Once::new();

    /// Initialize test logging globally - safe to call multiple times
    ///
    /// Respects `RUST_LOG`, defaulting to debug for this crate and info for
    /// tokio. Output goes through the test writer so it is captured per test.
    ///
    /// ```bash
    /// RUST_LOG=cmake_server_reader::server=trace cargo test --features test-logging
    /// ```
    pub fn init() {
        INIT.call_once(|| {
            let env_filter = EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("debug,tokio=info"));

            fmt()
                .with_env_filter(env_filter)
                .with_test_writer()
                .with_target(true)
                .with_thread_ids(true)
                .compact()
                .try_init()
                .ok();
        });
    }
}

#[cfg(all(test, feature = "test-logging"))]
#[macro_export]
macro_rules! setup_test_logging {
    () => {
        #[ctor::ctor]
        fn init_test_logging() {
            $crate::test_utils::logging::init();
        }
    };
}

/// cmake binary for integration tests: `CMAKE_PATH` or `cmake`
///
/// Server mode was removed in CMake 3.20, so CI points `CMAKE_PATH` at an
/// older release.
#[cfg(all(test, feature = "cmake-integration-tests"))]
pub fn get_test_cmake_path() -> String {
    std::env::var("CMAKE_PATH").unwrap_or_else(|_| "cmake".to_string())
}

/// In-memory CMake server
///
/// [`FakeLauncher`] hands out channels served by a task that answers each
/// request through a [`Responder`]. The paired [`FakeServer`] records every
/// request and can inject arbitrary messages into the live channel.
#[cfg(test)]
pub mod fake_server {
    use async_trait::async_trait;
    use serde_json::{Value, json};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    use crate::config::ReaderParameters;
    use crate::error::ReaderError;
    use crate::server::channel::{ChannelEvent, ServerChannel, ServerLauncher};
    use crate::server::message::ServerMessage;

    /// Maps one decoded request to the messages sent back for it
    pub type Responder = Arc<dyn Fn(&Value) -> Vec<Value> + Send + Sync>;

    #[derive(Clone, Default)]
    pub struct FakeServer {
        requests: Arc<Mutex<Vec<Value>>>,
        inbound: Arc<Mutex<Option<mpsc::UnboundedSender<ChannelEvent>>>>,
        launches: Arc<AtomicUsize>,
        terminations: Arc<AtomicUsize>,
    }

    fn deliver(sender: &mpsc::UnboundedSender<ChannelEvent>, message: &Value) {
        let event = match ServerMessage::decode(&message.to_string()) {
            Ok(message) => ChannelEvent::Message(message),
            Err(e) => ChannelEvent::Malformed {
                text: message.to_string(),
                error: e.to_string(),
            },
        };
        let _ = sender.send(event);
    }

    impl FakeServer {
        pub fn requests(&self) -> Vec<Value> {
            self.requests.lock().unwrap().clone()
        }

        /// Wait until at least `count` requests have been answered
        pub async fn wait_for_requests(&self, count: usize) -> Vec<Value> {
            for _ in 0..5000 {
                let requests = self.requests();
                if requests.len() >= count {
                    return requests;
                }
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
            panic!("expected {count} requests, got {:?}", self.requests());
        }

        /// Push a message into the most recently launched channel
        pub fn inject(&self, message: Value) {
            if let Some(sender) = self.inbound.lock().unwrap().as_ref() {
                deliver(sender, &message);
            }
        }

        /// Close the most recently launched channel from the server side
        pub fn disconnect(&self, reason: &str) {
            if let Some(sender) = self.inbound.lock().unwrap().take() {
                let _ = sender.send(ChannelEvent::Closed {
                    reason: reason.to_string(),
                });
            }
        }

        pub fn launch_count(&self) -> usize {
            self.launches.load(Ordering::SeqCst)
        }

        pub fn terminate_count(&self) -> usize {
            self.terminations.load(Ordering::SeqCst)
        }
    }

    pub struct FakeLauncher {
        responder: Responder,
        hello: Value,
        server: FakeServer,
    }

    impl FakeLauncher {
        pub fn new(responder: Responder) -> (Self, FakeServer) {
            let server = FakeServer::default();
            let launcher = Self {
                responder,
                hello: hello(),
                server: server.clone(),
            };
            (launcher, server)
        }

        pub fn with_hello(mut self, hello: Value) -> Self {
            self.hello = hello;
            self
        }
    }

    #[async_trait]
    impl ServerLauncher for FakeLauncher {
        async fn launch(&mut self, _parameters: &ReaderParameters) -> Result<ServerChannel, ReaderError> {
            let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();
            let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<ChannelEvent>();
            let cancel = CancellationToken::new();

            deliver(&inbound_tx, &self.hello);
            *self.server.inbound.lock().unwrap() = Some(inbound_tx.clone());
            self.server.launches.fetch_add(1, Ordering::SeqCst);

            let responder = Arc::clone(&self.responder);
            let requests = Arc::clone(&self.server.requests);
            let token = cancel.clone();
            tokio::spawn(async move {
                loop {
                    let text = tokio::select! {
                        _ = token.cancelled() => break,
                        text = outbound_rx.recv() => text,
                    };
                    let Some(text) = text else { break };
                    let Ok(request) = serde_json::from_str::<Value>(&text) else {
                        continue;
                    };
                    requests.lock().unwrap().push(request.clone());
                    for message in responder(&request) {
                        deliver(&inbound_tx, &message);
                    }
                }
            });

            Ok(ServerChannel::from_parts(outbound_tx, inbound_rx, cancel))
        }

        async fn terminate(&mut self) {
            self.server.terminations.fetch_add(1, Ordering::SeqCst);
        }
    }

    // ========================================================================
    // Messages
    // ========================================================================

    pub fn hello() -> Value {
        json!({
            "type": "hello",
            "supportedProtocolVersions": [{"major": 1, "minor": 0}, {"major": 1, "minor": 2}]
        })
    }

    fn answer(kind: &str, request: &Value) -> Value {
        json!({
            "type": kind,
            "inReplyTo": request["type"],
            "cookie": request["cookie"],
        })
    }

    pub fn reply(request: &Value, payload: Value) -> Value {
        let mut message = answer("reply", request);
        if let (Some(message), Value::Object(payload)) = (message.as_object_mut(), payload) {
            message.extend(payload);
        }
        message
    }

    pub fn error_reply(request: &Value, error: &str) -> Value {
        let mut message = answer("error", request);
        message["errorMessage"] = json!(error);
        message
    }

    pub fn progress(request: &Value, minimum: i64, current: i64, maximum: i64) -> Value {
        let mut message = answer("progress", request);
        message["progressMessage"] = json!("Working");
        message["progressMinimum"] = json!(minimum);
        message["progressCurrent"] = json!(current);
        message["progressMaximum"] = json!(maximum);
        message
    }

    // ========================================================================
    // Payloads for one project "App" with one executable "app"
    // ========================================================================

    pub fn app_code_model() -> Value {
        json!({
            "configurations": [{
                "name": "",
                "projects": [{
                    "name": "App",
                    "sourceDirectory": "/p",
                    "buildDirectory": "/p/build",
                    "targets": [{
                        "name": "app",
                        "fullName": "app.exe",
                        "type": "EXECUTABLE",
                        "sourceDirectory": "/p",
                        "buildDirectory": "/p/build",
                        "artifacts": ["/p/build/app.exe"],
                        "linkerLanguage": "CXX",
                        "fileGroups": [{
                            "compileFlags": "-g",
                            "defines": ["DEBUG", "DEBUG"],
                            "includePath": [{"path": "/p/include"}],
                            "language": "CXX",
                            "sources": ["main.cpp"],
                            "isGenerated": false
                        }]
                    }]
                }]
            }]
        })
    }

    pub fn app_cache() -> Value {
        json!({
            "cache": [
                {"key": "CMAKE_BUILD_TYPE", "value": "Debug", "type": "STRING",
                 "properties": {"HELPSTRING": "Choose the type of build"}},
                {"key": "CMAKE_CXX_COMPILER", "value": "/usr/bin/c++", "type": "FILEPATH",
                 "properties": {"ADVANCED": "1"}}
            ]
        })
    }

    pub fn app_cmake_inputs() -> Value {
        json!({
            "sourceDirectory": "/p",
            "cmakeRootDirectory": "/usr/share/cmake",
            "buildFiles": [
                {"isCMake": false, "isTemporary": false, "sources": ["CMakeLists.txt"]},
                {"isCMake": true, "isTemporary": false,
                 "sources": ["/usr/share/cmake/Modules/CMakeCXXInformation.cmake"]},
                {"isCMake": false, "isTemporary": true,
                 "sources": ["/p/build/CMakeFiles/feature_tests.cxx"]}
            ]
        })
    }

    /// Answers every step successfully with the "App" payloads
    pub fn standard_responder() -> Responder {
        Arc::new(|request: &Value| {
            let message = match request["type"].as_str().unwrap_or_default() {
                "handshake" | "configure" | "compute" => reply(request, json!({})),
                "codemodel" => reply(request, app_code_model()),
                "cache" => reply(request, app_cache()),
                "cmakeInputs" => reply(request, app_cmake_inputs()),
                other => error_reply(request, &format!("unknown request type {other}")),
            };
            vec![message]
        })
    }
}

/// A minimal CMake project on disk
#[cfg(all(test, feature = "cmake-integration-tests"))]
pub mod integration {
    use std::fs;
    use std::path::{Path, PathBuf};
    use tempfile::TempDir;

    pub struct TestProject {
        _temp: TempDir,
        pub source_directory: PathBuf,
        pub build_directory: PathBuf,
    }

    impl TestProject {
        pub fn new() -> std::io::Result<Self> {
            let temp = TempDir::new()?;
            let source_directory = temp.path().join("src");
            let build_directory = temp.path().join("build");
            fs::create_dir_all(source_directory.join("include"))?;

            write(
                &source_directory,
                "CMakeLists.txt",
                "cmake_minimum_required(VERSION 3.7)\n\
                 project(App CXX)\n\
                 add_executable(app main.cpp)\n\
                 target_include_directories(app PRIVATE include)\n\
                 target_compile_definitions(app PRIVATE DEBUG)\n",
            )?;
            write(&source_directory, "main.cpp", "#include \"app.h\"\nint main() { return 0; }\n")?;
            write(&source_directory, "include/app.h", "#pragma once\n")?;

            Ok(Self {
                _temp: temp,
                source_directory,
                build_directory,
            })
        }
    }

    fn write(dir: &Path, name: &str, content: &str) -> std::io::Result<()> {
        fs::write(dir.join(name), content)
    }
}
