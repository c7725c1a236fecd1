mod audio;
mod config;
mod coordinator;
mod protocol;
mod transport;

use async_trait::async_trait;
use audio::{CaptureSession, SessionConfig, SessionEvent};
use config::Config;
use coordinator::{Coordinator, TextSink};
use mac_address::get_mac_address;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::mpsc;
use uuid::Uuid;

/// 转写文本输出，作为外部文本流水线的占位实现
struct StdoutSink;

#[async_trait]
impl TextSink for StdoutSink {
    async fn dispatch(&self, text: String) {
        println!(">> {}", text);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志
    env_logger::init();

    // 加载配置
    let mut config = Config::new().unwrap_or_default();

    // 设备id和客户端id的处理
    if config.device_id == "unknown-device" {
        config.device_id = match get_mac_address() {
            Ok(Some(mac)) => mac.to_string().to_lowercase(),
            _ => Uuid::new_v4().to_string(),
        };
    }

    // 设备端UUID，先从本地文件读取以保持重启间身份一致，如果不存在则生成新的并保存
    let uuid_file_path = "voicelink_uuid.txt";
    if config.client_id == "unknown-client" {
        if let Ok(content) = std::fs::read_to_string(uuid_file_path) {
            let trimmed = content.trim();
            if !trimmed.is_empty() {
                config.client_id = trimmed.to_string();
                println!("Loaded Client ID from file: {}", config.client_id);
            }
        }
    }

    // 生成新的UUID并保存
    if config.client_id == "unknown-client" {
        config.client_id = Uuid::new_v4().to_string();
        println!("Generated new Client ID: {}", config.client_id);
        if let Err(e) = std::fs::write(uuid_file_path, &config.client_id) {
            eprintln!("Failed to save Client ID to file: {}", e);
        } else {
            println!("Saved Client ID to {}", uuid_file_path);
        }
    }

    // 采集会话事件通道
    let (session_tx, session_rx) = mpsc::channel::<SessionEvent>(100);

    // 采集会话：独占音频设备和传输链路
    let session_cfg = SessionConfig::from_config(&config);
    let session = CaptureSession::new(session_cfg, config.clone(), session_tx);

    // 协调状态机：唯一的麦克风状态变更入口
    let (coordinator, handle) = Coordinator::new(session, Arc::new(StdoutSink), session_rx);
    let coord_task = tokio::spawn(coordinator.run());

    // 启动采集并开始发送
    handle.activate().await;
    println!("Voicelink Core Started. Mic: {:?}", handle.current_state());

    // 等待 Ctrl+C 信号退出，经由协调器停机以便冲刷未完成的语音段
    signal::ctrl_c().await?;
    println!("Received Ctrl+C, shutting down...");
    handle.shutdown().await;
    let _ = coord_task.await;
    Ok(())
}
