use std::fs;
use std::path::Path;
use serde::Deserialize;

#[derive(Deserialize)]
struct Config {
    network: Network,
    capture: Capture,
    vad: Vad,
    gate: Gate,
}

#[derive(Deserialize)]
struct Network {
    ws_url: String,
    ws_token: String,
    device_id: String,
    client_id: String,
    base_delay_ms: u64,
    max_delay_ms: u64,
    keepalive_secs: u64,
}

#[derive(Deserialize)]
struct Capture {
    preferred_device: String,
    sample_rate: u32,
    block_ms: u32,
    language: String,
    route_timeout_ms: u64,
    stall_timeout_ms: u64,
}

#[derive(Deserialize)]
struct Vad {
    profile: String,
    speech_threshold: u8,
    silence_hold_ms: u64,
    min_utterance_ms: u64,
    drop_short: bool,
}

#[derive(Deserialize)]
struct Gate {
    enabled: bool,
    threshold: u8,
    attenuation: f32,
}

// 在编译时读取 config.toml 并设置环境变量
fn main() {
    println!("cargo:rerun-if-changed=config.toml");

    let config_path = Path::new("config.toml");
    if !config_path.exists() {
        panic!("config.toml not found!");
    }

    let config_str = fs::read_to_string(config_path).expect("Failed to read config.toml");
    let config: Config = toml::from_str(&config_str).expect("Failed to parse config.toml");

    // 网络配置
    println!("cargo:rustc-env=WS_URL={}", config.network.ws_url);
    println!("cargo:rustc-env=WS_TOKEN={}", config.network.ws_token);
    println!("cargo:rustc-env=DEVICE_ID={}", config.network.device_id);
    println!("cargo:rustc-env=CLIENT_ID={}", config.network.client_id);
    println!("cargo:rustc-env=BASE_DELAY_MS={}", config.network.base_delay_ms);
    println!("cargo:rustc-env=MAX_DELAY_MS={}", config.network.max_delay_ms);
    println!("cargo:rustc-env=KEEPALIVE_SECS={}", config.network.keepalive_secs);

    // 采集配置
    println!("cargo:rustc-env=PREFERRED_DEVICE={}", config.capture.preferred_device);
    println!("cargo:rustc-env=SAMPLE_RATE={}", config.capture.sample_rate);
    println!("cargo:rustc-env=BLOCK_MS={}", config.capture.block_ms);
    println!("cargo:rustc-env=LANGUAGE={}", config.capture.language);
    println!("cargo:rustc-env=ROUTE_TIMEOUT_MS={}", config.capture.route_timeout_ms);
    println!("cargo:rustc-env=STALL_TIMEOUT_MS={}", config.capture.stall_timeout_ms);

    // VAD 配置
    println!("cargo:rustc-env=VAD_PROFILE={}", config.vad.profile);
    println!("cargo:rustc-env=SPEECH_THRESHOLD={}", config.vad.speech_threshold);
    println!("cargo:rustc-env=SILENCE_HOLD_MS={}", config.vad.silence_hold_ms);
    println!("cargo:rustc-env=MIN_UTTERANCE_MS={}", config.vad.min_utterance_ms);
    println!("cargo:rustc-env=DROP_SHORT={}", config.vad.drop_short);

    // 噪声门配置
    println!("cargo:rustc-env=GATE_ENABLED={}", config.gate.enabled);
    println!("cargo:rustc-env=GATE_THRESHOLD={}", config.gate.threshold);
    println!("cargo:rustc-env=GATE_ATTENUATION={}", config.gate.attenuation);
}
