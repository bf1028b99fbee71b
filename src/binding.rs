//! Host binding layer for console tooling.
//!
//! A [`ConsoleHost`] owns the engine, context and transport of one device.
//! It is shared behind a [`SharedEngine`] lock; the lock is taken for each
//! request and released before any socket I/O is awaited.
//!
//! The console protocol is line-delimited JSON. Each request is a
//! [`ConsoleRequest`] and each response an [`EvalStatus`].

use crate::context::BusContext;
use crate::engine::ScriptEngine;
use crate::error::{eval_status, BridgeError, Result};
use crate::message;
use crate::natives::NativeScope;
use crate::value::ScriptValue;
use crate::wire::BusTransport;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufStream};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};

/// Engine, context and transport of one device
pub struct ConsoleHost {
    engine: Box<dyn ScriptEngine + Send>,
    ctx: BusContext,
    transport: Box<dyn BusTransport + Send>,
}

/// Console host behind the global engine lock
pub type SharedEngine = Arc<Mutex<ConsoleHost>>;

/// Outcome of a console request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvalStatus {
    /// One of the [`eval_status`] codes
    pub status: i32,
    /// Result text or error message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl EvalStatus {
    /// Success without a message
    pub fn ok() -> Self {
        Self {
            status: eval_status::OK,
            message: None,
        }
    }

    /// The request itself failed
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: eval_status::CALL_FAILED,
            message: Some(message.into()),
        }
    }

    /// Whether the status is [`eval_status::OK`]
    pub fn is_ok(&self) -> bool {
        self.status == eval_status::OK
    }
}

/// Console request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum ConsoleRequest {
    /// Check that the console talks to the named device
    Connect {
        /// Device name, empty for any
        device: String,
    },
    /// Evaluate script source
    Eval {
        /// Source text
        script: String,
    },
    /// Persist a script
    Install {
        /// Script name
        name: String,
        /// Hex-encoded script bytes
        data: String,
    },
    /// Leave all sessions and detach
    Reboot,
}

impl ConsoleHost {
    /// Create a host
    pub fn new(
        engine: Box<dyn ScriptEngine + Send>,
        ctx: BusContext,
        transport: Box<dyn BusTransport + Send>,
    ) -> Self {
        Self {
            engine,
            ctx,
            transport,
        }
    }

    /// Wrap the host in the shared lock
    pub fn into_shared(self) -> SharedEngine {
        Arc::new(Mutex::new(self))
    }

    /// Bridge state
    pub fn context(&self) -> &BusContext {
        &self.ctx
    }

    /// Mutable bridge state
    pub fn context_mut(&mut self) -> &mut BusContext {
        &mut self.ctx
    }

    /// Accept a console for `device`, or for any device when empty
    pub fn connect(&mut self, device: &str) -> EvalStatus {
        let name = self.ctx.properties.get("DeviceName").unwrap_or_default();
        if device.is_empty() || device == name {
            tracing::info!(device = name, "Console connected");
            EvalStatus::ok()
        } else {
            tracing::warn!(requested = device, device = name, "Console asked for another device");
            EvalStatus::failed(format!("device is '{}'", name))
        }
    }

    /// Evaluate source text, mapping failures to console status codes
    pub fn eval(&mut self, script: &str) -> EvalStatus {
        let result = {
            let mut scope = NativeScope::new(&mut self.ctx, self.transport.as_mut());
            self.engine.eval(script, &mut scope)
        };
        self.engine.clear_pinned();
        match result {
            Ok(ScriptValue::Undefined) => EvalStatus::ok(),
            Ok(value) => EvalStatus {
                status: eval_status::OK,
                message: Some(value.to_key_string()),
            },
            Err(e) => {
                tracing::warn!(error = %e, "Console eval failed");
                EvalStatus {
                    status: e.eval_status(),
                    message: Some(e.message),
                }
            }
        }
    }

    /// Persist a script in the property store
    pub fn install(&mut self, name: &str, bytes: &[u8]) -> Result<()> {
        if name.is_empty() {
            return Err(BridgeError::InvalidState("script name is empty".to_string()));
        }
        self.ctx.properties.install_script(name, bytes)
    }

    /// Leave every session and detach from the bus
    pub fn reboot(&mut self) {
        for session_id in self.ctx.discovery.end_sessions() {
            let sent = message::leave_session_call(session_id)
                .and_then(|msg| self.ctx.deliver(self.transport.as_mut(), msg));
            if let Err(e) = sent {
                tracing::debug!(session_id, error = %e, "LeaveSession not sent");
            }
        }
        self.ctx.detach();
        tracing::info!("Console requested reboot");
    }

    /// Handle one decoded request
    pub fn handle(&mut self, request: ConsoleRequest) -> EvalStatus {
        match request {
            ConsoleRequest::Connect { device } => self.connect(&device),
            ConsoleRequest::Eval { script } => self.eval(&script),
            ConsoleRequest::Install { name, data } => {
                let installed = hex::decode(&data)
                    .map_err(|e| BridgeError::Serialization(e.to_string()))
                    .and_then(|bytes| self.install(&name, &bytes));
                match installed {
                    Ok(()) => EvalStatus::ok(),
                    Err(e) => EvalStatus::failed(e.to_string()),
                }
            }
            ConsoleRequest::Reboot => {
                self.reboot();
                EvalStatus::ok()
            }
        }
    }
}

impl std::fmt::Debug for ConsoleHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsoleHost").field("ctx", &self.ctx).finish()
    }
}

fn handle_line(engine: &SharedEngine, line: &str) -> EvalStatus {
    match serde_json::from_str::<ConsoleRequest>(line) {
        Ok(request) => engine.lock().handle(request),
        Err(e) => EvalStatus::failed(format!("bad request: {}", e)),
    }
}

/// Serve console requests on one stream until it closes
pub async fn serve_connection<S>(stream: S, engine: SharedEngine) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (reader, mut writer) = tokio::io::split(stream);
    let mut lines = BufReader::new(reader).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let response = handle_line(&engine, &line);
        let mut out = serde_json::to_string(&response)?;
        out.push('\n');
        writer.write_all(out.as_bytes()).await?;
        writer.flush().await?;
    }
    tracing::debug!("Console connection closed");
    Ok(())
}

/// Accept console connections forever, one task per connection
pub async fn serve_console(listener: TcpListener, engine: SharedEngine) -> Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        tracing::info!(%peer, "Console connection");
        let engine = engine.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_connection(stream, engine).await {
                tracing::warn!(%peer, error = %e, "Console connection failed");
            }
        });
    }
}

/// Async console client
#[derive(Debug)]
pub struct ConsoleClient<S> {
    stream: BufStream<S>,
}

impl ConsoleClient<TcpStream> {
    /// Connect to a console server over TCP
    pub async fn connect_tcp(addr: impl ToSocketAddrs) -> Result<Self> {
        Ok(Self::new(TcpStream::connect(addr).await?))
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> ConsoleClient<S> {
    /// Client over an established stream
    pub fn new(stream: S) -> Self {
        Self {
            stream: BufStream::new(stream),
        }
    }

    async fn request(&mut self, request: &ConsoleRequest) -> Result<EvalStatus> {
        let mut line = serde_json::to_string(request)?;
        line.push('\n');
        self.stream.write_all(line.as_bytes()).await?;
        self.stream.flush().await?;

        let mut response = String::new();
        if self.stream.read_line(&mut response).await? == 0 {
            return Err(BridgeError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "console closed the connection",
            )));
        }
        Ok(serde_json::from_str(&response)?)
    }

    /// Select the device; returns an [`eval_status`] code
    pub async fn connect(&mut self, device: &str) -> Result<i32> {
        let request = ConsoleRequest::Connect {
            device: device.to_string(),
        };
        Ok(self.request(&request).await?.status)
    }

    /// Evaluate script source on the device
    pub async fn eval(&mut self, script: &str) -> Result<EvalStatus> {
        let request = ConsoleRequest::Eval {
            script: script.to_string(),
        };
        self.request(&request).await
    }

    /// Install a script on the device
    pub async fn install(&mut self, name: &str, bytes: &[u8]) -> Result<()> {
        let request = ConsoleRequest::Install {
            name: name.to_string(),
            data: hex::encode(bytes),
        };
        let status = self.request(&request).await?;
        if status.is_ok() {
            Ok(())
        } else {
            Err(BridgeError::InvalidState(status.message.unwrap_or_default()))
        }
    }

    /// Ask the device to leave its sessions and detach
    pub async fn reboot(&mut self) -> Result<()> {
        self.request(&ConsoleRequest::Reboot).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BridgeConfig;
    use crate::engine::{NativeHost, ValueStack};
    use crate::error::{ErrorCode, ScriptError};
    use crate::interface::ObjectTable;
    use crate::propstore::{MemoryStorage, PropertyStore};
    use crate::value::ScriptFnId;
    use crate::wire::MemoryTransport;

    /// Evaluates `n+m` sums and rejects anything else as a syntax error
    #[derive(Default)]
    struct SumEngine {
        stack: ValueStack,
    }

    impl ScriptEngine for SumEngine {
        fn stack(&self) -> &ValueStack {
            &self.stack
        }

        fn stack_mut(&mut self) -> &mut ValueStack {
            &mut self.stack
        }

        fn invoke(
            &mut self,
            _func: ScriptFnId,
            _this: &ScriptValue,
            _args: &[ScriptValue],
            _host: &mut dyn NativeHost,
        ) -> std::result::Result<ScriptValue, ScriptError> {
            Ok(ScriptValue::Undefined)
        }

        fn eval(
            &mut self,
            source: &str,
            _host: &mut dyn NativeHost,
        ) -> std::result::Result<ScriptValue, ScriptError> {
            let parsed: Option<f64> = source
                .split('+')
                .map(|t| t.trim().parse::<f64>().ok())
                .sum();
            parsed
                .map(ScriptValue::Number)
                .ok_or_else(|| ScriptError::new(ErrorCode::SyntaxError, "unexpected token"))
        }
    }

    fn create_host() -> ConsoleHost {
        let properties = PropertyStore::open(Box::new(MemoryStorage::new()), Some("lamp")).unwrap();
        let mut ctx = BusContext::new(BridgeConfig::default(), ObjectTable::new(), properties);
        ctx.attach(":1.3");
        ConsoleHost::new(Box::new(SumEngine::default()), ctx, Box::new(MemoryTransport::new()))
    }

    #[test]
    fn test_connect_checks_device() {
        let mut host = create_host();
        assert!(host.connect("lamp").is_ok());
        assert!(host.connect("").is_ok());
        assert_eq!(host.connect("fridge").status, eval_status::CALL_FAILED);
    }

    #[test]
    fn test_eval_statuses() {
        let mut host = create_host();
        let status = host.eval("2 + 3");
        assert_eq!(status, EvalStatus { status: eval_status::OK, message: Some("5".to_string()) });

        let status = host.eval("2 +");
        assert_eq!(status.status, eval_status::SYNTAX_ERROR);
    }

    #[test]
    fn test_request_decoding() {
        let request: ConsoleRequest =
            serde_json::from_str(r#"{"op":"install","name":"main.js","data":"6869"}"#).unwrap();
        assert_eq!(
            request,
            ConsoleRequest::Install { name: "main.js".to_string(), data: "6869".to_string() }
        );
        assert_eq!(serde_json::to_string(&ConsoleRequest::Reboot).unwrap(), r#"{"op":"reboot"}"#);
    }

    #[test]
    fn test_reboot_detaches() {
        let mut host = create_host();
        host.context_mut().discovery.peer_accepted(":1.8", 2, 12);
        assert_eq!(host.handle(ConsoleRequest::Reboot), EvalStatus::ok());
        assert!(!host.context().is_attached());
        assert_eq!(host.context().discovery.session_count(), 0);
    }

    #[tokio::test]
    async fn test_console_round_trip() {
        let engine = create_host().into_shared();
        let (client_end, server_end) = tokio::io::duplex(4096);
        let server = tokio::spawn(serve_connection(server_end, engine.clone()));

        let mut client = ConsoleClient::new(client_end);
        assert_eq!(client.connect("lamp").await.unwrap(), eval_status::OK);
        assert_eq!(client.eval("1 + 1").await.unwrap().message.as_deref(), Some("2"));
        client.install("main.js", b"AJ.onAttach = null;").await.unwrap();
        assert!(client.install("", b"x").await.is_err());
        client.reboot().await.unwrap();

        drop(client);
        server.await.unwrap().unwrap();

        let host = engine.lock();
        assert_eq!(
            host.context().properties.script("main.js").unwrap().as_deref(),
            Some(&b"AJ.onAttach = null;"[..])
        );
        assert!(!host.context().is_attached());
    }

    #[tokio::test]
    async fn test_bad_request_reported() {
        let engine = create_host().into_shared();
        let (client_end, server_end) = tokio::io::duplex(1024);
        let server = tokio::spawn(serve_connection(server_end, engine));

        let mut stream = BufStream::new(client_end);
        stream.write_all(b"{\"op\":\"dance\"}\n").await.unwrap();
        stream.flush().await.unwrap();
        let mut line = String::new();
        stream.read_line(&mut line).await.unwrap();
        let status: EvalStatus = serde_json::from_str(&line).unwrap();
        assert_eq!(status.status, eval_status::CALL_FAILED);

        drop(stream);
        server.await.unwrap().unwrap();
    }
}
