//! Capture session: one ALSA device, one transport link.
//!
//! The read loop runs on a dedicated OS thread (NOT a tokio task) so
//! real-time capture never contends with async network tasks. Each
//! block flows meter -> gate -> segmenter; completed segments are
//! flushed through the transmit policy with the send-active flag read
//! at flush time.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::Result;
use tokio::sync::{mpsc, watch};
use tokio::task;

use crate::config::Config;
use crate::protocol::{ServerMessage, StartMessage, STOP_MSG};
use crate::transport::{LinkEvent, WsLink, WsLinkHandle};

use super::alsa_device;
use super::gate::NoiseGate;
use super::meter;
use super::segmenter::{should_transmit, Segment, Segmenter, VadConfig};

/// Events surfaced to the coordination layer.
#[derive(Debug)]
pub enum SessionEvent {
    /// Recognized text from the remote service
    Transcript(String),
    /// Hardware produced no samples past the stall threshold; the
    /// session must be restarted with a fresh device and link
    Stalled,
    /// The input device could not be opened at all
    Unavailable,
    /// Link connectivity, for health reporting only
    LinkUp,
    LinkDown,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Preferred capture route (external accessory mic); None goes
    /// straight to the built-in default
    pub preferred_device: Option<String>,
    pub sample_rate: u32,
    pub block_ms: u32,
    pub language: String,
    pub route_timeout_ms: u64,
    pub stall_timeout_ms: u64,
    pub vad: VadConfig,
    pub gate_enabled: bool,
    pub gate_threshold: u8,
    pub gate_attenuation: f32,
}

impl SessionConfig {
    pub fn from_config(cfg: &Config) -> Self {
        let explicit = VadConfig {
            speech_threshold: cfg.speech_threshold,
            silence_hold_ms: cfg.silence_hold_ms,
            min_utterance_ms: cfg.min_utterance_ms,
            drop_short: cfg.drop_short,
        };
        Self {
            preferred_device: if cfg.preferred_device.is_empty() {
                None
            } else {
                Some(cfg.preferred_device.to_string())
            },
            sample_rate: cfg.sample_rate,
            block_ms: cfg.block_ms,
            language: cfg.language.to_string(),
            route_timeout_ms: cfg.route_timeout_ms,
            stall_timeout_ms: cfg.stall_timeout_ms,
            vad: resolve_vad(cfg.vad_profile, explicit),
            gate_enabled: cfg.gate_enabled,
            gate_threshold: cfg.gate_threshold,
            gate_attenuation: cfg.gate_attenuation,
        }
    }
}

/// A named profile wins over the explicit values; an unknown name
/// falls back to them with a warning.
fn resolve_vad(profile: &str, explicit: VadConfig) -> VadConfig {
    if profile.is_empty() {
        return explicit;
    }
    match VadConfig::profile(profile) {
        Some(vad) => vad,
        None => {
            log::warn!("Unknown VAD profile '{}', using explicit values", profile);
            explicit
        }
    }
}

struct Inner {
    running: Arc<AtomicBool>,
    link: WsLinkHandle,
    capture: Option<JoinHandle<()>>,
    pump_task: task::JoinHandle<()>,
    link_task: task::JoinHandle<()>,
}

/// Owns the audio input device and the transport link for the STT
/// direction. At most one session is open at a time; the device and
/// link are exclusively its own.
pub struct CaptureSession {
    cfg: SessionConfig,
    net_cfg: Config,
    events: mpsc::Sender<SessionEvent>,
    send_active: Arc<AtomicBool>,
    inner: Option<Inner>,
}

impl CaptureSession {
    pub fn new(cfg: SessionConfig, net_cfg: Config, events: mpsc::Sender<SessionEvent>) -> Self {
        Self {
            cfg,
            net_cfg,
            events,
            send_active: Arc::new(AtomicBool::new(false)),
            inner: None,
        }
    }

    /// The session counts as running only while its capture thread is
    /// alive; a thread that died on a failed device open leaves the
    /// session stopped even if teardown has not happened yet.
    pub fn is_running(&self) -> bool {
        self.inner
            .as_ref()
            .and_then(|inner| inner.capture.as_ref())
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    /// Completed segments are transmitted.
    pub fn activate_sending(&self) {
        self.send_active.store(true, Ordering::SeqCst);
    }

    /// Completed segments are discarded without tearing down the
    /// device or the connection, keeping the mute/resume transition
    /// cheap and glitch-free.
    pub fn mute_sending(&self) {
        self.send_active.store(false, Ordering::SeqCst);
    }

    /// Start the session: link task, inbound event pump, and the
    /// capture thread. No-op if already running; a leftover session
    /// whose capture thread has died is torn down and reopened.
    pub async fn start(&mut self) -> Result<()> {
        if self.is_running() {
            return Ok(());
        }
        if let Some(stale) = self.inner.take() {
            log::warn!("Capture thread is gone, tearing down the stale session");
            stale.pump_task.abort();
            stale.link_task.abort();
        }

        let (link_event_tx, link_event_rx) = mpsc::channel::<LinkEvent>(100);
        let (ws_link, link) = WsLink::new(self.net_cfg.clone(), link_event_tx);
        let link_task = tokio::spawn(ws_link.run());

        // The capture thread publishes the negotiated rate here; the
        // pump holds the start handshake until it arrives so the
        // handshake reports what the hardware actually runs at
        let (rate_tx, rate_rx) = watch::channel(None::<u32>);

        let pump_task = tokio::spawn(event_pump(
            link_event_rx,
            link.clone(),
            self.cfg.clone(),
            rate_rx,
            self.events.clone(),
        ));

        let running = Arc::new(AtomicBool::new(true));
        let capture = {
            let cfg = self.cfg.clone();
            let link = link.clone();
            let send_active = self.send_active.clone();
            let running = running.clone();
            let events = self.events.clone();
            thread::Builder::new()
                .name("audio-capture".into())
                .spawn(move || {
                    if let Err(e) =
                        capture_thread(&cfg, &link, &send_active, &running, &rate_tx, &events)
                    {
                        log::error!("Capture thread error: {}", e);
                        let _ = events.blocking_send(SessionEvent::Unavailable);
                    }
                })?
        };

        link.connect().await;

        self.inner = Some(Inner {
            running,
            link,
            capture: Some(capture),
            pump_task,
            link_task,
        });
        Ok(())
    }

    /// Stop the session: join the capture thread (which flushes any
    /// open segment through the normal policy), send a best-effort
    /// final stop, and close the link. Idempotent.
    pub async fn stop(&mut self) {
        let Some(inner) = self.inner.take() else {
            return;
        };
        let Inner {
            running,
            link,
            mut capture,
            pump_task,
            link_task,
        } = inner;
        running.store(false, Ordering::SeqCst);
        if let Some(handle) = capture.take() {
            // readi returns within one block period, so this is bounded
            let _ = task::spawn_blocking(move || {
                let _ = handle.join();
            })
            .await;
        }
        link.send_text(STOP_MSG.to_string()).await;
        link.disconnect().await;
        // The link task exits once every command handle is gone: ours
        // here, and the pump's clone when the abort lands
        pump_task.abort();
        drop(link);
        let _ = link_task.await;
        log::info!("Capture session stopped");
    }

    /// Full restart after a hardware stall: fresh device handle, fresh
    /// link, same config and same sending flag.
    pub async fn restart(&mut self) -> Result<()> {
        log::warn!("Restarting capture session after stall");
        self.stop().await;
        self.start().await
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take() {
            inner.running.store(false, Ordering::SeqCst);
            inner.pump_task.abort();
            inner.link_task.abort();
        }
    }
}

// ======================== Capture thread ========================

fn capture_thread(
    cfg: &SessionConfig,
    link: &WsLinkHandle,
    send_active: &AtomicBool,
    running: &AtomicBool,
    rate_tx: &watch::Sender<Option<u32>>,
    events: &mpsc::Sender<SessionEvent>,
) -> Result<()> {
    // 1. Open the capture route (preferred with bounded retry, then
    //    built-in fallback)
    let (pcm, params) = alsa_device::open_capture_route(
        cfg.preferred_device.as_deref(),
        cfg.sample_rate,
        Duration::from_millis(cfg.route_timeout_ms),
    )?;
    let _ = rate_tx.send(Some(params.sample_rate));

    // 2. Per-block pipeline state
    let block_samples = (params.sample_rate as u64 * u64::from(cfg.block_ms) / 1000) as usize;
    let mut read_buf = vec![0i16; block_samples];
    let gate = NoiseGate::new(cfg.gate_enabled, cfg.gate_threshold, cfg.gate_attenuation);
    let mut segmenter = Segmenter::new(cfg.vad.clone(), params.sample_rate);

    let io = pcm.io_i16()?;
    let stall_timeout = Duration::from_millis(cfg.stall_timeout_ms);
    let mut last_data = Instant::now();

    log::info!(
        "Capture started: rate={}, block={}ms ({} samples)",
        params.sample_rate,
        cfg.block_ms,
        block_samples,
    );

    while running.load(Ordering::Relaxed) {
        match io.readi(&mut read_buf) {
            Ok(0) => {
                if last_data.elapsed() >= stall_timeout {
                    log::error!(
                        "No samples for {:?}, treating as hardware stall",
                        stall_timeout
                    );
                    let _ = events.blocking_send(SessionEvent::Stalled);
                    return Ok(());
                }
                thread::sleep(Duration::from_millis(10));
            }
            Ok(frames) => {
                last_data = Instant::now();
                let block = &mut read_buf[..frames];
                let level = meter::level(block);
                gate.apply(block, level);
                if let Some(seg) = segmenter.push_block(block, level, Instant::now()) {
                    flush_segment(seg, &cfg.vad, send_active, link);
                }
            }
            Err(e) => {
                log::warn!("ALSA capture error: {}, recovering...", e);
                if pcm.prepare().is_err() || last_data.elapsed() >= stall_timeout {
                    let _ = events.blocking_send(SessionEvent::Stalled);
                    return Ok(());
                }
            }
        }
    }

    // Trailing speech at shutdown goes through the same flush policy
    if let Some(seg) = segmenter.finish() {
        flush_segment(seg, &cfg.vad, send_active, link);
    }

    log::info!("Capture stopped");
    Ok(())
}

fn flush_segment(seg: Segment, vad: &VadConfig, send_active: &AtomicBool, link: &WsLinkHandle) {
    // Read at flush time so a concurrent mute is honored
    let active = send_active.load(Ordering::SeqCst);
    if !should_transmit(&seg, vad, active) {
        log::debug!(
            "Discarding segment: {}ms, send_active={}",
            seg.duration_ms,
            active
        );
        return;
    }
    log::info!(
        "Flushing segment: {}ms ({} bytes)",
        seg.duration_ms,
        seg.pcm.len()
    );
    // One binary frame, then the end-of-segment control message
    link.try_send_binary(seg.pcm);
    link.try_send_text(STOP_MSG.to_string());
}

// ======================== Inbound event pump ========================

/// The socket can open before the device finishes negotiating its
/// rate. Hold the handshake until the capture thread publishes it; if
/// the thread died (or negotiation is badly stuck) fall back to the
/// requested rate rather than hanging the pump.
async fn negotiated_sample_rate(
    rate_rx: &mut watch::Receiver<Option<u32>>,
    fallback: u32,
    wait: Duration,
) -> u32 {
    match tokio::time::timeout(wait, rate_rx.wait_for(|rate| rate.is_some())).await {
        Ok(Ok(rate)) => (*rate).unwrap_or(fallback),
        _ => {
            log::warn!("Sample rate not negotiated, reporting requested {}", fallback);
            fallback
        }
    }
}

/// Translates link events: the start handshake on open, transcript
/// extraction on text, health events on connectivity changes.
async fn event_pump(
    mut rx: mpsc::Receiver<LinkEvent>,
    link: WsLinkHandle,
    cfg: SessionConfig,
    mut rate_rx: watch::Receiver<Option<u32>>,
    events: mpsc::Sender<SessionEvent>,
) {
    // 留足首选路由重试加默认回退的开启时间
    let negotiation_wait = Duration::from_millis(cfg.route_timeout_ms + 1000);
    while let Some(event) = rx.recv().await {
        match event {
            LinkEvent::Open => {
                let sr =
                    negotiated_sample_rate(&mut rate_rx, cfg.sample_rate, negotiation_wait).await;
                let start = StartMessage::new(sr, &cfg.language);
                match serde_json::to_string(&start) {
                    Ok(json) => link.send_text(json).await,
                    Err(e) => log::error!("Failed to encode start message: {}", e),
                }
                let _ = events.send(SessionEvent::LinkUp).await;
            }
            LinkEvent::Closed => {
                let _ = events.send(SessionEvent::LinkDown).await;
            }
            LinkEvent::Text(text) => {
                let msg: ServerMessage = match serde_json::from_str(&text) {
                    Ok(msg) => msg,
                    Err(e) => {
                        log::warn!("Malformed server message, ignoring: {}", e);
                        continue;
                    }
                };
                if msg.is_transcript() {
                    match msg.text {
                        // Single-character transcripts are noise
                        Some(t) if t.chars().count() > 1 => {
                            let _ = events.send(SessionEvent::Transcript(t)).await;
                        }
                        _ => log::debug!("Ignoring empty or single-character transcript"),
                    }
                } else {
                    log::debug!("Unhandled message type: {}", msg.msg_type);
                }
            }
            LinkEvent::Binary(data) => {
                log::debug!("Ignoring {} byte binary frame from server", data.len());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn explicit() -> VadConfig {
        VadConfig {
            speech_threshold: 42,
            silence_hold_ms: 321,
            min_utterance_ms: 123,
            drop_short: false,
        }
    }

    #[test]
    fn named_profile_overrides_explicit_values() {
        let vad = resolve_vad("quiet", explicit());
        assert_eq!(vad.speech_threshold, 30);
        assert_eq!(vad.silence_hold_ms, 500);
    }

    #[test]
    fn empty_profile_keeps_explicit_values() {
        let vad = resolve_vad("", explicit());
        assert_eq!(vad.speech_threshold, 42);
        assert_eq!(vad.silence_hold_ms, 321);
    }

    #[test]
    fn unknown_profile_falls_back_to_explicit_values() {
        let vad = resolve_vad("studio", explicit());
        assert_eq!(vad.speech_threshold, 42);
        assert!(!vad.drop_short);
    }

    #[tokio::test]
    async fn dead_capture_thread_does_not_count_as_running() {
        let config = Config::default();
        let (events, _events_rx) = mpsc::channel(8);
        let mut session =
            CaptureSession::new(SessionConfig::from_config(&config), config.clone(), events);
        assert!(!session.is_running());

        // A session whose capture thread already exited, as after a
        // failed device open
        let (_ws_link, link) = WsLink::new(config, mpsc::channel(8).0);
        let capture = thread::spawn(|| {});
        while !capture.is_finished() {
            thread::yield_now();
        }
        session.inner = Some(Inner {
            running: Arc::new(AtomicBool::new(false)),
            link,
            capture: Some(capture),
            pump_task: tokio::spawn(async {}),
            link_task: tokio::spawn(async {}),
        });
        assert!(!session.is_running());

        // stop() still clears it so a later start() reopens cleanly
        session.stop().await;
        assert!(session.inner.is_none());
    }

    #[tokio::test]
    async fn handshake_rate_waits_for_device_negotiation() {
        let (rate_tx, mut rate_rx) = watch::channel(None::<u32>);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let _ = rate_tx.send(Some(48000));
        });
        let sr = negotiated_sample_rate(&mut rate_rx, 16000, Duration::from_secs(2)).await;
        assert_eq!(sr, 48000);
    }

    #[tokio::test]
    async fn handshake_rate_falls_back_when_device_never_opens() {
        let (rate_tx, mut rate_rx) = watch::channel(None::<u32>);
        // the capture thread exited before negotiating
        drop(rate_tx);
        let sr = negotiated_sample_rate(&mut rate_rx, 16000, Duration::from_secs(2)).await;
        assert_eq!(sr, 16000);
    }
}
