use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    // 网络配置（静态部分）
    pub ws_url: &'static str,
    pub ws_token: &'static str,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub keepalive_secs: u64,

    // 设备标识（动态部分，可在运行时修改）
    pub device_id: String,
    pub client_id: String,

    // 采集配置
    pub preferred_device: &'static str,
    pub sample_rate: u32,
    pub block_ms: u32,
    pub language: &'static str,
    pub route_timeout_ms: u64,
    pub stall_timeout_ms: u64,

    // VAD 配置
    pub vad_profile: &'static str,
    pub speech_threshold: u8,
    pub silence_hold_ms: u64,
    pub min_utterance_ms: u64,
    pub drop_short: bool,

    // 噪声门配置
    pub gate_enabled: bool,
    pub gate_threshold: u8,
    pub gate_attenuation: f32,
}

impl Config {
    /// 从编译时设置的环境变量创建配置
    /// 所有参数都在编译时从 config.toml 中读取
    pub fn new() -> Result<Self, &'static str> {
        Ok(Self {
            // 网络配置
            ws_url: env!("WS_URL"),
            ws_token: env!("WS_TOKEN"),
            base_delay_ms: env!("BASE_DELAY_MS").parse()
                .map_err(|_| "Failed to parse BASE_DELAY_MS")?,
            max_delay_ms: env!("MAX_DELAY_MS").parse()
                .map_err(|_| "Failed to parse MAX_DELAY_MS")?,
            keepalive_secs: env!("KEEPALIVE_SECS").parse()
                .map_err(|_| "Failed to parse KEEPALIVE_SECS")?,

            // 设备标识初始化为config.toml中的值
            device_id: env!("DEVICE_ID").to_string(),
            client_id: env!("CLIENT_ID").to_string(),

            // 采集配置
            preferred_device: env!("PREFERRED_DEVICE"),
            sample_rate: env!("SAMPLE_RATE").parse()
                .map_err(|_| "Failed to parse SAMPLE_RATE")?,
            block_ms: env!("BLOCK_MS").parse()
                .map_err(|_| "Failed to parse BLOCK_MS")?,
            language: env!("LANGUAGE"),
            route_timeout_ms: env!("ROUTE_TIMEOUT_MS").parse()
                .map_err(|_| "Failed to parse ROUTE_TIMEOUT_MS")?,
            stall_timeout_ms: env!("STALL_TIMEOUT_MS").parse()
                .map_err(|_| "Failed to parse STALL_TIMEOUT_MS")?,

            // VAD 配置
            vad_profile: env!("VAD_PROFILE"),
            speech_threshold: env!("SPEECH_THRESHOLD").parse()
                .map_err(|_| "Failed to parse SPEECH_THRESHOLD")?,
            silence_hold_ms: env!("SILENCE_HOLD_MS").parse()
                .map_err(|_| "Failed to parse SILENCE_HOLD_MS")?,
            min_utterance_ms: env!("MIN_UTTERANCE_MS").parse()
                .map_err(|_| "Failed to parse MIN_UTTERANCE_MS")?,
            drop_short: env!("DROP_SHORT").parse()
                .map_err(|_| "Failed to parse DROP_SHORT")?,

            // 噪声门配置
            gate_enabled: env!("GATE_ENABLED").parse()
                .map_err(|_| "Failed to parse GATE_ENABLED")?,
            gate_threshold: env!("GATE_THRESHOLD").parse()
                .map_err(|_| "Failed to parse GATE_THRESHOLD")?,
            gate_attenuation: env!("GATE_ATTENUATION").parse()
                .map_err(|_| "Failed to parse GATE_ATTENUATION")?,
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new().expect("Failed to create default Config from build-time environment variables")
    }
}
