use std::{sync::Arc, time::Duration};

use {
    plughub_protocol::{
        CapabilityDef, CapabilityList, Frame, HandshakeResult, decode, encode, error_codes,
    },
    serde_json::{Value, json},
    tokio::{
        io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader},
        sync::Mutex,
        task::JoinSet,
    },
    tracing::{debug, info, warn},
};

/// Longest sleep the `sleep` tool accepts.
const MAX_SLEEP_MS: u64 = 60_000;

const MOTD: &str = "All plugins nominal.";

#[derive(Debug, Clone)]
pub struct Options {
    pub name: String,
    pub delay: Duration,
    pub crash_after: Option<u64>,
    pub duplicate: bool,
    pub silent: bool,
    pub protocol_version: u32,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            name: "echo".into(),
            delay: Duration::ZERO,
            crash_after: None,
            duplicate: false,
            silent: false,
            protocol_version: plughub_protocol::PROTOCOL_VERSION,
        }
    }
}

/// Why [`serve`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    Shutdown,
    Eof,
    Crash,
}

#[derive(Debug)]
struct ToolError {
    code: i64,
    message: String,
}

impl ToolError {
    fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

type SharedWriter<W> = Arc<Mutex<W>>;

/// Answer frames from `reader` on `writer` until shutdown, end of input or a
/// requested crash. Invocations run concurrently and reply in completion
/// order.
pub async fn serve<R, W>(reader: R, writer: W, options: Options) -> anyhow::Result<Exit>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let writer: SharedWriter<W> = Arc::new(Mutex::new(writer));
    let mut lines = BufReader::new(reader).lines();
    let mut in_flight = JoinSet::new();
    let mut invocations: u64 = 0;

    let exit = loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                if let Err(e) = joined {
                    warn!(error = %e, "invocation task failed");
                }
                continue;
            },
        };
        let Some(line) = line else {
            break Exit::Eof;
        };
        if line.trim().is_empty() {
            continue;
        }

        let frame = match decode(&line) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "dropping undecodable frame");
                continue;
            },
        };

        match frame {
            Frame::Handshake {
                id,
                protocol_version,
                host,
            } => {
                info!(host = %host.name, host_version = %host.version, protocol_version, "handshake");
                if options.silent {
                    debug!("not answering handshake");
                    continue;
                }
                let result = HandshakeResult {
                    name: options.name.clone(),
                    version: Some(env!("CARGO_PKG_VERSION").to_string()),
                    protocol_version: options.protocol_version,
                };
                write_frame(&writer, &Frame::reply(id, serde_json::to_value(result)?)).await?;
            },
            Frame::ListCapabilities { id } => {
                let list = capabilities(options.duplicate);
                write_frame(&writer, &Frame::reply(id, serde_json::to_value(list)?)).await?;
            },
            Frame::Invoke {
                id,
                name,
                arguments,
                ..
            } => {
                if options.crash_after.is_some_and(|limit| invocations >= limit) {
                    break Exit::Crash;
                }
                invocations += 1;

                let writer = Arc::clone(&writer);
                let delay = options.delay;
                in_flight.spawn(async move {
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    let frame = match invoke(&name, arguments).await {
                        Ok(result) => Frame::reply(id, result),
                        Err(e) => Frame::error(id, e.code, e.message),
                    };
                    if let Err(e) = write_frame(&writer, &frame).await {
                        warn!(id, error = %e, "failed to write invocation response");
                    }
                });
            },
            Frame::Shutdown { id } => {
                write_frame(&writer, &Frame::reply(id, Value::Null)).await?;
                break Exit::Shutdown;
            },
            other => debug!(kind = other.kind(), "ignoring frame"),
        }
    };

    in_flight.abort_all();
    info!(?exit, invocations, "worker exiting");
    Ok(exit)
}

async fn write_frame<W>(writer: &SharedWriter<W>, frame: &Frame) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let line = encode(frame)?;
    let mut writer = writer.lock().await;
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

fn capabilities(duplicate: bool) -> CapabilityList {
    let mut echo = CapabilityDef::new("echo");
    echo.description = Some("Return the arguments unchanged".into());
    echo.schema = json!({"type": "object"});

    let mut sleep = CapabilityDef::new("sleep");
    sleep.description = Some("Wait `ms` milliseconds, then answer".into());
    sleep.schema = json!({
        "type": "object",
        "properties": {"ms": {"type": "integer", "minimum": 0, "maximum": MAX_SLEEP_MS}},
        "required": ["ms"],
    });

    let mut fail = CapabilityDef::new("fail");
    fail.description = Some("Answer with an error frame".into());
    fail.schema = json!({
        "type": "object",
        "properties": {"message": {"type": "string"}},
    });

    let mut tools = vec![echo.clone(), sleep, fail];
    if duplicate {
        tools.push(echo);
    }

    let mut motd = CapabilityDef::new("motd");
    motd.description = Some("Message of the day".into());

    let mut greet = CapabilityDef::new("greet");
    greet.description = Some("Greeting prompt".into());
    greet.schema = json!({
        "type": "object",
        "properties": {"name": {"type": "string"}},
    });

    CapabilityList {
        tools,
        resources: vec![motd],
        prompts: vec![greet],
    }
}

async fn invoke(name: &str, arguments: Value) -> Result<Value, ToolError> {
    match name {
        "echo" => Ok(arguments),
        "sleep" => {
            let ms = arguments
                .get("ms")
                .and_then(Value::as_u64)
                .ok_or_else(|| {
                    ToolError::new(
                        error_codes::INVALID_ARGUMENTS,
                        "`ms` must be a non-negative integer",
                    )
                })?;
            if ms > MAX_SLEEP_MS {
                return Err(ToolError::new(
                    error_codes::INVALID_ARGUMENTS,
                    format!("`ms` must be at most {MAX_SLEEP_MS}"),
                ));
            }
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(json!({"sleptMs": ms}))
        },
        "fail" => {
            let message = arguments
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("requested failure");
            Err(ToolError::new(error_codes::INTERNAL_ERROR, message))
        },
        "motd" => Ok(json!({"text": MOTD})),
        "greet" => {
            let who = arguments
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or("there");
            Ok(json!({
                "messages": [{"role": "user", "content": format!("Hello, {who}!")}],
            }))
        },
        other => Err(ToolError::new(
            error_codes::UNKNOWN_CAPABILITY,
            format!("unknown capability: {other}"),
        )),
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        plughub_protocol::HostInfo,
        tokio::{
            io::{DuplexStream, Lines, duplex},
            task::JoinHandle,
        },
    };

    struct Client {
        input: DuplexStream,
        output: Lines<BufReader<DuplexStream>>,
        server: JoinHandle<anyhow::Result<Exit>>,
    }

    impl Client {
        fn start(options: Options) -> Self {
            let (input, server_in) = duplex(64 * 1024);
            let (server_out, output) = duplex(64 * 1024);
            let server = tokio::spawn(serve(server_in, server_out, options));
            Self {
                input,
                output: BufReader::new(output).lines(),
                server,
            }
        }

        async fn send(&mut self, frame: Frame) {
            let line = encode(&frame).unwrap();
            self.input.write_all(line.as_bytes()).await.unwrap();
        }

        async fn recv(&mut self) -> Frame {
            let line = tokio::time::timeout(Duration::from_secs(5), self.output.next_line())
                .await
                .expect("timed out waiting for a frame")
                .unwrap()
                .expect("worker closed its output");
            decode(&line).unwrap()
        }

        async fn finish(self) -> Exit {
            drop(self.input);
            self.server.await.unwrap().unwrap()
        }
    }

    fn handshake(id: u64) -> Frame {
        Frame::Handshake {
            id,
            protocol_version: plughub_protocol::PROTOCOL_VERSION,
            host: HostInfo {
                name: "test".into(),
                version: "0".into(),
            },
        }
    }

    fn invoke_frame(id: u64, name: &str, arguments: Value) -> Frame {
        Frame::Invoke {
            id,
            name: name.into(),
            arguments,
            timeout_ms: None,
        }
    }

    #[tokio::test]
    async fn handshake_then_capabilities() {
        let mut client = Client::start(Options::default());
        client.send(handshake(1)).await;
        let Frame::Reply { id, result } = client.recv().await else {
            panic!("expected a reply");
        };
        assert_eq!(id, 1);
        let hs: HandshakeResult = serde_json::from_value(result).unwrap();
        assert_eq!(hs.name, "echo");
        assert_eq!(hs.protocol_version, plughub_protocol::PROTOCOL_VERSION);

        client.send(Frame::ListCapabilities { id: 2 }).await;
        let Frame::Reply { result, .. } = client.recv().await else {
            panic!("expected a reply");
        };
        let list: CapabilityList = serde_json::from_value(result).unwrap();
        let tools: Vec<_> = list.tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(tools, ["echo", "sleep", "fail"]);
        assert_eq!(list.resources[0].name, "motd");
        assert_eq!(list.prompts[0].name, "greet");

        assert_eq!(client.finish().await, Exit::Eof);
    }

    #[tokio::test]
    async fn shutdown_is_answered_before_exit() {
        let mut client = Client::start(Options::default());
        client.send(Frame::Shutdown { id: 4 }).await;
        assert_eq!(client.recv().await, Frame::reply(4, Value::Null));
        assert_eq!(client.finish().await, Exit::Shutdown);
    }

    #[tokio::test]
    async fn silent_worker_skips_handshake_only() {
        let mut client = Client::start(Options {
            silent: true,
            ..Default::default()
        });
        client.send(handshake(1)).await;
        client.send(Frame::ListCapabilities { id: 2 }).await;
        assert_eq!(client.recv().await.id(), Some(2));
    }

    #[tokio::test]
    async fn duplicate_advertises_echo_twice() {
        let list = capabilities(true);
        let echoes = list.tools.iter().filter(|t| t.name == "echo").count();
        assert_eq!(echoes, 2);
    }

    #[tokio::test]
    async fn slow_invocation_does_not_block_fast_one() {
        let mut client = Client::start(Options::default());
        client
            .send(invoke_frame(1, "sleep", json!({"ms": 300})))
            .await;
        client
            .send(invoke_frame(2, "echo", json!({"x": [1, 2]})))
            .await;

        assert_eq!(client.recv().await, Frame::reply(2, json!({"x": [1, 2]})));
        assert_eq!(client.recv().await, Frame::reply(1, json!({"sleptMs": 300})));
    }

    #[tokio::test]
    async fn errors_carry_protocol_codes() {
        let mut client = Client::start(Options::default());
        client
            .send(invoke_frame(1, "fail", json!({"message": "boom"})))
            .await;
        match client.recv().await {
            Frame::Error { id, code, message, .. } => {
                assert_eq!(id, 1);
                assert_eq!(code, error_codes::INTERNAL_ERROR);
                assert_eq!(message, "boom");
            },
            other => panic!("unexpected frame: {other:?}"),
        }

        client.send(invoke_frame(2, "teleport", Value::Null)).await;
        assert!(matches!(
            client.recv().await,
            Frame::Error { code: error_codes::UNKNOWN_CAPABILITY, .. }
        ));

        client.send(invoke_frame(3, "sleep", json!({"ms": "soon"}))).await;
        assert!(matches!(
            client.recv().await,
            Frame::Error { code: error_codes::INVALID_ARGUMENTS, .. }
        ));
    }

    #[tokio::test]
    async fn crash_after_limit() {
        let mut client = Client::start(Options {
            crash_after: Some(1),
            ..Default::default()
        });
        client.send(invoke_frame(1, "echo", json!(1))).await;
        assert_eq!(client.recv().await, Frame::reply(1, json!(1)));

        client.send(invoke_frame(2, "echo", json!(2))).await;
        let exit = client.server.await.unwrap().unwrap();
        assert_eq!(exit, Exit::Crash);
    }

    #[tokio::test]
    async fn resource_and_prompt() {
        assert_eq!(invoke("motd", Value::Null).await.unwrap()["text"], MOTD);
        let prompt = invoke("greet", json!({"name": "Ada"})).await.unwrap();
        assert_eq!(prompt["messages"][0]["content"], "Hello, Ada!");
    }

    #[tokio::test]
    async fn undecodable_lines_are_skipped() {
        let mut client = Client::start(Options::default());
        client.input.write_all(b"not json\n\n").await.unwrap();
        client.send(Frame::ListCapabilities { id: 9 }).await;
        assert_eq!(client.recv().await.id(), Some(9));
    }
}
