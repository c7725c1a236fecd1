use crate::config::Config;
use crate::protocol::PING_MSG;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use std::cmp;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use url::Url;

#[derive(Debug)]
pub enum LinkEvent {
    Open,
    Closed,
    Text(String),
    Binary(Vec<u8>),
}

#[derive(Debug)]
pub enum LinkCommand {
    Connect,
    Disconnect,
    SendText(String),
    SendBinary(Vec<u8>),
}

/// 下一次重连的延迟：线性退避并封顶，成功建连后 attempt 归零
pub fn reconnect_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    cmp::min(base.saturating_mul(attempt.max(1)), max)
}

/// Clonable handle to the link actor. Sends are fire-and-forget: when
/// the link is down they are logged and dropped, never queued, so the
/// audio worker cannot block on the network.
#[derive(Clone)]
pub struct WsLinkHandle {
    cmd_tx: mpsc::Sender<LinkCommand>,
}

impl WsLinkHandle {
    pub async fn connect(&self) {
        let _ = self.cmd_tx.send(LinkCommand::Connect).await;
    }

    pub async fn disconnect(&self) {
        let _ = self.cmd_tx.send(LinkCommand::Disconnect).await;
    }

    pub async fn send_text(&self, text: String) {
        let _ = self.cmd_tx.send(LinkCommand::SendText(text)).await;
    }

    /// Non-blocking send for the capture thread. Drops the message if
    /// the command queue is full.
    pub fn try_send_text(&self, text: String) {
        if self.cmd_tx.try_send(LinkCommand::SendText(text)).is_err() {
            log::warn!("Link queue full, dropping control message");
        }
    }

    /// Non-blocking binary send for the capture thread.
    pub fn try_send_binary(&self, data: Vec<u8>) {
        let len = data.len();
        if self.cmd_tx.try_send(LinkCommand::SendBinary(data)).is_err() {
            log::warn!("Link queue full, dropping {} byte segment", len);
        }
    }
}

enum LoopExit {
    /// 调用方显式断开，不自动重连
    Disconnect,
    /// 命令通道关闭，整个链路退出
    Shutdown,
}

/// Reconnecting duplex WebSocket channel to the transcription service.
///
/// Owns the socket on its own task; everything else talks to it
/// through `WsLinkHandle`. Failures are never fatal: unless the caller
/// explicitly disconnected, a reconnect is always scheduled.
pub struct WsLink {
    config: Config,
    tx: mpsc::Sender<LinkEvent>,
    rx_cmd: mpsc::Receiver<LinkCommand>,
    /// 重连尝试计数，成功后归零
    attempt: u32,
    /// 显式关闭标志，禁用自动重连
    closed: bool,
}

impl WsLink {
    pub fn new(config: Config, tx: mpsc::Sender<LinkEvent>) -> (Self, WsLinkHandle) {
        let (cmd_tx, rx_cmd) = mpsc::channel::<LinkCommand>(100);
        (
            Self {
                config,
                tx,
                rx_cmd,
                attempt: 0,
                // 初始为显式关闭状态，收到 Connect 后才开始建连
                closed: true,
            },
            WsLinkHandle { cmd_tx },
        )
    }

    pub async fn run(mut self) {
        loop {
            if self.closed {
                // 显式关闭状态：只等待 Connect，其余消息丢弃
                match self.rx_cmd.recv().await {
                    Some(LinkCommand::Connect) => {
                        self.closed = false;
                        self.attempt = 0;
                    }
                    Some(LinkCommand::Disconnect) => {}
                    Some(_) => {
                        log::debug!("Link explicitly closed, dropping outbound message");
                    }
                    None => return,
                }
                continue;
            }

            match self.connect_and_loop().await {
                Ok(LoopExit::Disconnect) => {
                    self.closed = true;
                    let _ = self.tx.send(LinkEvent::Closed).await;
                }
                Ok(LoopExit::Shutdown) => return,
                Err(e) => {
                    self.attempt += 1;
                    let delay = reconnect_delay(
                        self.attempt,
                        Duration::from_millis(self.config.base_delay_ms),
                        Duration::from_millis(self.config.max_delay_ms),
                    );
                    log::warn!(
                        "Connection error: {}. Retrying in {:?} (attempt {})",
                        e,
                        delay,
                        self.attempt
                    );
                    let _ = self.tx.send(LinkEvent::Closed).await;
                    if !self.backoff(delay).await {
                        return;
                    }
                }
            }
        }
    }

    /// Wait out the reconnect delay while staying responsive to
    /// commands: Disconnect cancels the pending reconnect, Connect
    /// retries immediately. Returns false on shutdown.
    async fn backoff(&mut self, delay: Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return true,
                cmd = self.rx_cmd.recv() => match cmd {
                    Some(LinkCommand::Disconnect) => {
                        self.closed = true;
                        return true;
                    }
                    Some(LinkCommand::Connect) => return true,
                    Some(_) => {
                        log::debug!("Link down, dropping outbound message");
                    }
                    None => return false,
                },
            }
        }
    }

    // 进入连接和主循环，处理WebSocket消息和发送命令
    async fn connect_and_loop(&mut self) -> anyhow::Result<LoopExit> {
        // 根据配置构建WebSocket请求
        let url = Url::parse(self.config.ws_url)?;
        let host = url.host_str().unwrap_or("localhost");

        let request = tokio_tungstenite::tungstenite::http::Request::builder()
            .method("GET")
            .uri(self.config.ws_url)
            .header("Host", host)
            .header("Connection", "Upgrade")
            .header("Upgrade", "websocket")
            .header("Sec-WebSocket-Version", "13")
            .header(
                "Sec-WebSocket-Key",
                tokio_tungstenite::tungstenite::handshake::client::generate_key(),
            )
            .header("Authorization", format!("Bearer {}", self.config.ws_token))
            .header("Device-Id", &self.config.device_id)
            .header("Client-Id", &self.config.client_id)
            .header("Protocol-Version", "1")
            .body(())?;

        log::info!("Connecting to {}...", self.config.ws_url);
        let (ws_stream, _) = connect_async(request).await?;
        log::info!("Connected");
        self.attempt = 0;

        let (mut write, mut read) = ws_stream.split();

        self.tx.send(LinkEvent::Open).await?;

        // 保活 ping，固定间隔，连接断开即停止
        let keepalive = Duration::from_secs(self.config.keepalive_secs);
        let mut ping_timer = interval_at(Instant::now() + keepalive, keepalive);
        ping_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // 主循环，处理读取、写入和保活
        loop {
            tokio::select! {
                msg = read.next() => {
                    match msg {
                        Some(Ok(msg)) => match msg {
                            Message::Text(text) => {
                                self.tx.send(LinkEvent::Text(text.to_string())).await?;
                            }
                            Message::Binary(data) => {
                                self.tx.send(LinkEvent::Binary(data.to_vec())).await?;
                            }
                            Message::Close(frame) => {
                                log::info!("Server closed connection: {:?}", frame);
                                return Err(anyhow::anyhow!("Connection closed"));
                            }
                            _ => {}
                        },
                        Some(Err(e)) => return Err(e.into()),
                        None => return Err(anyhow::anyhow!("Connection closed")),
                    }
                }
                cmd = self.rx_cmd.recv() => {
                    match cmd {
                        Some(LinkCommand::SendText(text)) => {
                            write.send(Message::Text(text.into())).await?;
                        }
                        Some(LinkCommand::SendBinary(data)) => {
                            write.send(Message::Binary(Bytes::from(data))).await?;
                        }
                        Some(LinkCommand::Disconnect) => {
                            let _ = write.send(Message::Close(None)).await;
                            return Ok(LoopExit::Disconnect);
                        }
                        // 已连接时 Connect 是幂等空操作
                        Some(LinkCommand::Connect) => {}
                        None => return Ok(LoopExit::Shutdown),
                    }
                }
                _ = ping_timer.tick() => {
                    write.send(Message::Text(PING_MSG.into())).await?;
                }
            }
        }
    }
}
