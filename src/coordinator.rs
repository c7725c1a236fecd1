use crate::audio::{CaptureSession, SessionEvent};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// 麦克风状态：关闭 / 静默采集 / 采集并发送
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MicState {
    /// No device open, no session
    Off = 0,
    /// Device open and segmenting, but completed segments are
    /// discarded (a response is being spoken)
    Muted = 1,
    /// Device open, segmenting, segments transmitted
    Active = 2,
}

impl MicState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => MicState::Muted,
            2 => MicState::Active,
            _ => MicState::Off,
        }
    }
}

/// Fire-and-forget sink for recognized text, consumed by the outer
/// text pipeline.
#[async_trait]
pub trait TextSink: Send + Sync {
    async fn dispatch(&self, text: String);
}

#[derive(Debug)]
pub enum CoordCommand {
    Activate,
    Mute,
    PlaybackStarted,
    PlaybackFinished,
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MicAction {
    StartSession,
    EnableSending,
    DisableSending,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Transition {
    next: MicState,
    action: Option<MicAction>,
}

/// The only place mic state changes. Pure so the table is testable
/// without any device or network I/O.
fn transition(state: MicState, cmd: &CoordCommand) -> Transition {
    use CoordCommand::*;
    use MicState::*;
    let (next, action) = match (state, cmd) {
        (Off, Activate) => (Active, Some(MicAction::StartSession)),
        (Muted, Activate) => (Active, Some(MicAction::EnableSending)),
        (Active, Mute) | (Active, PlaybackStarted) => (Muted, Some(MicAction::DisableSending)),
        (Muted, PlaybackFinished) => (Active, Some(MicAction::EnableSending)),
        // everything else leaves the state unchanged
        _ => (state, None),
    };
    Transition { next, action }
}

struct Shared {
    state: AtomicU8,
    available: AtomicBool,
    /// Pipeline Lock: a request is in flight / a response is being
    /// rendered. Set on transcript dispatch, cleared when playback of
    /// the response finishes.
    pipeline_busy: AtomicBool,
}

/// Handle exposed to the outer application and the playback notifier.
#[derive(Clone)]
pub struct CoordinatorHandle {
    cmd_tx: mpsc::Sender<CoordCommand>,
    shared: Arc<Shared>,
}

impl CoordinatorHandle {
    pub async fn activate(&self) {
        let _ = self.cmd_tx.send(CoordCommand::Activate).await;
    }

    pub async fn mute(&self) {
        let _ = self.cmd_tx.send(CoordCommand::Mute).await;
    }

    pub async fn playback_started(&self) {
        let _ = self.cmd_tx.send(CoordCommand::PlaybackStarted).await;
    }

    pub async fn playback_finished(&self) {
        let _ = self.cmd_tx.send(CoordCommand::PlaybackFinished).await;
    }

    pub async fn shutdown(&self) {
        let _ = self.cmd_tx.send(CoordCommand::Shutdown).await;
    }

    pub fn current_state(&self) -> MicState {
        MicState::from_u8(self.shared.state.load(Ordering::SeqCst))
    }

    pub fn is_available(&self) -> bool {
        self.shared.available.load(Ordering::SeqCst)
    }

    pub fn pipeline_busy(&self) -> bool {
        self.shared.pipeline_busy.load(Ordering::SeqCst)
    }
}

/// Top-level controller: arbitrates between "not capturing",
/// "capturing but suppressed", and "capturing and transmitting", and
/// is the single point that mutes capture while a response is spoken.
pub struct Coordinator {
    session: CaptureSession,
    sink: Arc<dyn TextSink>,
    shared: Arc<Shared>,
    cmd_rx: mpsc::Receiver<CoordCommand>,
    session_rx: mpsc::Receiver<SessionEvent>,
}

impl Coordinator {
    pub fn new(
        session: CaptureSession,
        sink: Arc<dyn TextSink>,
        session_rx: mpsc::Receiver<SessionEvent>,
    ) -> (Self, CoordinatorHandle) {
        let (cmd_tx, cmd_rx) = mpsc::channel::<CoordCommand>(100);
        let shared = Arc::new(Shared {
            state: AtomicU8::new(MicState::Off as u8),
            available: AtomicBool::new(true),
            pipeline_busy: AtomicBool::new(false),
        });
        let handle = CoordinatorHandle {
            cmd_tx,
            shared: shared.clone(),
        };
        (
            Self {
                session,
                sink,
                shared,
                cmd_rx,
                session_rx,
            },
            handle,
        )
    }

    pub async fn run(mut self) {
        loop {
            tokio::select! {
                Some(cmd) = self.cmd_rx.recv() => {
                    if matches!(cmd, CoordCommand::Shutdown) {
                        self.session.stop().await;
                        self.set_state(MicState::Off);
                        log::info!("Coordinator shut down");
                        return;
                    }
                    self.handle_command(cmd).await;
                }
                Some(event) = self.session_rx.recv() => {
                    self.handle_session_event(event).await;
                }
                else => return,
            }
        }
    }

    fn state(&self) -> MicState {
        MicState::from_u8(self.shared.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: MicState) {
        self.shared.state.store(state as u8, Ordering::SeqCst);
    }

    async fn handle_command(&mut self, cmd: CoordCommand) {
        let before = self.state();
        let t = transition(before, &cmd);
        match t.action {
            Some(MicAction::StartSession) => match self.session.start().await {
                Ok(()) => {
                    self.session.activate_sending();
                    self.shared.available.store(true, Ordering::SeqCst);
                    self.set_state(t.next);
                }
                Err(e) => {
                    log::error!("Failed to start capture session: {}", e);
                    self.shared.available.store(false, Ordering::SeqCst);
                }
            },
            Some(MicAction::EnableSending) => {
                self.session.activate_sending();
                self.set_state(t.next);
            }
            Some(MicAction::DisableSending) => {
                self.session.mute_sending();
                self.set_state(t.next);
            }
            None => {}
        }
        // 播放结束：解除流水线锁，接受新的语音输入
        if matches!(cmd, CoordCommand::PlaybackFinished) {
            self.shared.pipeline_busy.store(false, Ordering::SeqCst);
        }
        let after = self.state();
        if before != after {
            log::info!("Mic state: {:?} -> {:?} ({:?})", before, after, cmd);
        }
    }

    async fn handle_session_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Transcript(text) => {
                if self.shared.pipeline_busy.load(Ordering::SeqCst) {
                    // 上一条请求还在处理中，丢弃新的转写结果
                    log::debug!("Pipeline busy, dropping transcript: {}", text);
                    return;
                }
                log::info!("Transcript: {}", text);
                self.shared.pipeline_busy.store(true, Ordering::SeqCst);
                self.sink.dispatch(text).await;
            }
            SessionEvent::Stalled => {
                if let Err(e) = self.session.restart().await {
                    log::error!("Session restart failed: {}", e);
                    self.shared.available.store(false, Ordering::SeqCst);
                    self.set_state(MicState::Off);
                }
            }
            SessionEvent::Unavailable => {
                log::error!("Audio input unavailable");
                // The capture thread is already gone; tear down the
                // link and pump too so a later activate reopens from
                // scratch instead of finding a half-dead session
                self.session.stop().await;
                self.shared.available.store(false, Ordering::SeqCst);
                self.set_state(MicState::Off);
            }
            // 链路断开由传输层自动重连，这里只做健康上报
            SessionEvent::LinkUp => {
                log::info!("Transport link up");
            }
            SessionEvent::LinkDown => {
                log::warn!("Transport link down, reconnect pending");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::SessionConfig;
    use crate::config::Config;
    use std::time::Duration;

    fn step(state: MicState, cmd: CoordCommand) -> Transition {
        transition(state, &cmd)
    }

    #[test]
    fn activate_from_off_starts_session() {
        let t = step(MicState::Off, CoordCommand::Activate);
        assert_eq!(t.next, MicState::Active);
        assert_eq!(t.action, Some(MicAction::StartSession));
    }

    #[test]
    fn activate_mute_activate_is_a_valid_path() {
        let t1 = step(MicState::Off, CoordCommand::Activate);
        assert_eq!(t1.next, MicState::Active);
        let t2 = step(t1.next, CoordCommand::Mute);
        assert_eq!(t2.next, MicState::Muted);
        assert_eq!(t2.action, Some(MicAction::DisableSending));
        let t3 = step(t2.next, CoordCommand::Activate);
        assert_eq!(t3.next, MicState::Active);
        assert_eq!(t3.action, Some(MicAction::EnableSending));
    }

    #[test]
    fn mute_is_noop_outside_active() {
        for state in [MicState::Off, MicState::Muted] {
            let t = step(state, CoordCommand::Mute);
            assert_eq!(t.next, state);
            assert_eq!(t.action, None);
        }
    }

    #[test]
    fn activate_while_active_is_noop() {
        let t = step(MicState::Active, CoordCommand::Activate);
        assert_eq!(t.next, MicState::Active);
        assert_eq!(t.action, None);
    }

    #[test]
    fn playback_mutes_and_resumes() {
        let t = step(MicState::Active, CoordCommand::PlaybackStarted);
        assert_eq!(t.next, MicState::Muted);
        assert_eq!(t.action, Some(MicAction::DisableSending));
        let t = step(MicState::Muted, CoordCommand::PlaybackFinished);
        assert_eq!(t.next, MicState::Active);
        assert_eq!(t.action, Some(MicAction::EnableSending));
    }

    #[test]
    fn playback_events_are_noop_when_off() {
        for cmd in [CoordCommand::PlaybackStarted, CoordCommand::PlaybackFinished] {
            let t = step(MicState::Off, cmd);
            assert_eq!(t.next, MicState::Off);
            assert_eq!(t.action, None);
        }
    }

    #[test]
    fn mic_state_round_trips_through_u8() {
        for state in [MicState::Off, MicState::Muted, MicState::Active] {
            assert_eq!(MicState::from_u8(state as u8), state);
        }
    }

    struct NullSink;

    #[async_trait]
    impl TextSink for NullSink {
        async fn dispatch(&self, _text: String) {}
    }

    #[tokio::test]
    async fn unavailable_event_marks_mic_off_and_unavailable() {
        let config = Config::default();
        let (session_tx, session_rx) = mpsc::channel(8);
        let session = CaptureSession::new(
            SessionConfig::from_config(&config),
            config.clone(),
            session_tx.clone(),
        );
        let (coordinator, handle) = Coordinator::new(session, Arc::new(NullSink), session_rx);
        let task = tokio::spawn(coordinator.run());

        assert!(handle.is_available());
        session_tx.send(SessionEvent::Unavailable).await.unwrap();

        // the coordinator consumes the event asynchronously
        let mut settled = false;
        for _ in 0..100 {
            if !handle.is_available() && handle.current_state() == MicState::Off {
                settled = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(settled, "coordinator did not mark the mic unavailable");

        handle.shutdown().await;
        let _ = task.await;
    }
}
