use serde::{Deserialize, Serialize};

/// 每次连接建立后发送一次，告知服务端采样率和语言
#[derive(Serialize, Debug)]
pub struct StartMessage {
    #[serde(rename = "type")]
    pub msg_type: String,
    pub sr: u32,
    pub lang: String,
}

impl StartMessage {
    pub fn new(sr: u32, lang: &str) -> Self {
        Self {
            msg_type: "start".to_string(),
            sr,
            lang: lang.to_string(),
        }
    }
}

// 固定控制消息
pub const STOP_MSG: &str = r#"{"type":"stop"}"#;
pub const PING_MSG: &str = r#"{"type":"ping"}"#;

#[derive(Deserialize, Debug, Clone)]
pub struct ServerMessage {
    #[serde(rename = "type")]
    pub msg_type: String,
    pub text: Option<String>,
}

impl ServerMessage {
    /// 识别结果消息类型，携带转写文本
    pub fn is_transcript(&self) -> bool {
        matches!(self.msg_type.as_str(), "stt" | "result")
    }
}
