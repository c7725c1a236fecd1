//! Utterance segmentation driven by metered block levels.
//!
//! A two-state hysteresis machine: a block at or above the trigger
//! level opens a segment, and the segment closes once no block has
//! reached the trigger for the configured hold duration. Separate
//! trigger and hold avoid rapid toggling on breath noise and word gaps.

use std::mem;
use std::time::{Duration, Instant};

/// Tunable VAD parameters, fixed for the lifetime of one capture
/// session. Either a named profile or explicit values from config.
#[derive(Debug, Clone)]
pub struct VadConfig {
    /// Level (0-100) at or above which a block counts as speech
    pub speech_threshold: u8,
    /// Silence duration that closes an open segment
    pub silence_hold_ms: u64,
    /// Segments shorter than this are dropped when `drop_short` is set
    pub min_utterance_ms: u64,
    /// Whether sub-minimum segments are discarded rather than sent
    pub drop_short: bool,
}

impl VadConfig {
    /// Look up a named calibration profile.
    pub fn profile(name: &str) -> Option<Self> {
        match name {
            "quiet" => Some(Self {
                speech_threshold: 30,
                silence_hold_ms: 500,
                min_utterance_ms: 450,
                drop_short: true,
            }),
            "noisy" => Some(Self {
                speech_threshold: 45,
                silence_hold_ms: 600,
                min_utterance_ms: 450,
                drop_short: true,
            }),
            "extreme" => Some(Self {
                speech_threshold: 60,
                silence_hold_ms: 700,
                min_utterance_ms: 500,
                drop_short: true,
            }),
            _ => None,
        }
    }
}

/// One completed candidate utterance: raw little-endian S16LE mono PCM
/// plus the duration derived from byte length and sample rate.
#[derive(Debug)]
pub struct Segment {
    pub pcm: Vec<u8>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VadState {
    Idle,
    InSpeech,
}

pub struct Segmenter {
    cfg: VadConfig,
    sample_rate: u32,
    state: VadState,
    buf: Vec<u8>,
    /// Buffer length as of the last block that reached the trigger
    /// level. The flush truncates to this, so the silence tail that
    /// closed the segment is not part of the utterance.
    voiced_len: usize,
    last_sound: Instant,
}

impl Segmenter {
    pub fn new(cfg: VadConfig, sample_rate: u32) -> Self {
        Self {
            cfg,
            sample_rate,
            state: VadState::Idle,
            buf: Vec::new(),
            voiced_len: 0,
            last_sound: Instant::now(),
        }
    }

    /// Feed one leveled block. Returns a completed segment when the
    /// silence hold expires.
    pub fn push_block(&mut self, block: &[i16], level: u8, now: Instant) -> Option<Segment> {
        match self.state {
            VadState::Idle => {
                if level >= self.cfg.speech_threshold {
                    self.state = VadState::InSpeech;
                    self.last_sound = now;
                    self.append(block);
                    self.voiced_len = self.buf.len();
                }
                None
            }
            VadState::InSpeech => {
                self.append(block);
                if level >= self.cfg.speech_threshold {
                    self.last_sound = now;
                    self.voiced_len = self.buf.len();
                }
                if now.duration_since(self.last_sound)
                    >= Duration::from_millis(self.cfg.silence_hold_ms)
                {
                    self.state = VadState::Idle;
                    Some(self.take_segment())
                } else {
                    None
                }
            }
        }
    }

    /// Flush a still-open segment at session shutdown, so trailing
    /// speech goes through the same policy instead of being lost.
    pub fn finish(&mut self) -> Option<Segment> {
        if self.state == VadState::InSpeech && self.voiced_len > 0 {
            self.state = VadState::Idle;
            Some(self.take_segment())
        } else {
            self.buf.clear();
            self.voiced_len = 0;
            None
        }
    }

    fn append(&mut self, block: &[i16]) {
        self.buf.reserve(block.len() * 2);
        for &s in block {
            self.buf.extend_from_slice(&s.to_le_bytes());
        }
    }

    fn take_segment(&mut self) -> Segment {
        self.buf.truncate(self.voiced_len);
        self.voiced_len = 0;
        let pcm = mem::take(&mut self.buf);
        let samples = (pcm.len() / 2) as u64;
        let duration_ms = samples * 1000 / u64::from(self.sample_rate);
        Segment { pcm, duration_ms }
    }
}

/// Flush policy: a segment is handed to the transport only when
/// sending is active and, with short-segment dropping enabled, it
/// meets the minimum utterance duration.
pub fn should_transmit(seg: &Segment, cfg: &VadConfig, send_active: bool) -> bool {
    if !send_active {
        return false;
    }
    if cfg.drop_short && seg.duration_ms < cfg.min_utterance_ms {
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    const RATE: u32 = 16000;
    const BLOCK_MS: u64 = 30;

    fn cfg() -> VadConfig {
        VadConfig {
            speech_threshold: 30,
            silence_hold_ms: 500,
            min_utterance_ms: 450,
            drop_short: true,
        }
    }

    fn block() -> Vec<i16> {
        vec![1000i16; (RATE as u64 * BLOCK_MS / 1000) as usize]
    }

    /// Feed `loud` blocks above threshold then `quiet` blocks below,
    /// one block per 30ms tick, collecting any flushed segments.
    fn run(seg: &mut Segmenter, loud: usize, quiet: usize) -> Vec<Segment> {
        let t0 = Instant::now();
        let mut out = Vec::new();
        let b = block();
        for i in 0..(loud + quiet) {
            let level = if i < loud { 50 } else { 5 };
            let now = t0 + Duration::from_millis(i as u64 * BLOCK_MS);
            if let Some(s) = seg.push_block(&b, level, now) {
                out.push(s);
            }
        }
        out
    }

    #[test]
    fn below_threshold_never_flushes() {
        let mut seg = Segmenter::new(cfg(), RATE);
        let flushed = run(&mut seg, 0, 100);
        assert!(flushed.is_empty());
        assert!(seg.finish().is_none());
    }

    #[test]
    fn speech_then_silence_flushes_one_segment_of_speech_duration() {
        let mut seg = Segmenter::new(cfg(), RATE);
        // 600ms speech, 600ms silence, hold is 500ms
        let flushed = run(&mut seg, 20, 20);
        assert_eq!(flushed.len(), 1);
        let d = flushed[0].duration_ms;
        assert!(
            d >= 600 - BLOCK_MS && d <= 600 + BLOCK_MS,
            "duration {} not within one block of 600ms",
            d
        );
        assert!(should_transmit(&flushed[0], &cfg(), true));
    }

    #[test]
    fn segment_pcm_is_little_endian_of_voiced_blocks() {
        let mut seg = Segmenter::new(cfg(), RATE);
        let flushed = run(&mut seg, 20, 20);
        let pcm = &flushed[0].pcm;
        // 600ms @16kHz mono S16 = 19200 bytes, one block tolerance
        let expect = 19200usize;
        let tol = (RATE as usize * BLOCK_MS as usize / 1000) * 2;
        assert!(pcm.len() >= expect - tol && pcm.len() <= expect + tol);
        assert_eq!(&pcm[..2], &1000i16.to_le_bytes());
    }

    #[test]
    fn silence_between_words_does_not_split_segment() {
        let mut seg = Segmenter::new(cfg(), RATE);
        let t0 = Instant::now();
        let b = block();
        let mut flushed = 0;
        // 300ms speech, 300ms gap (under the 500ms hold), 300ms speech,
        // then enough silence to close
        for i in 0..60 {
            let level = match i {
                0..=9 => 50,
                10..=19 => 5,
                20..=29 => 50,
                _ => 5,
            };
            let now = t0 + Duration::from_millis(i as u64 * BLOCK_MS);
            if seg.push_block(&b, level, now).is_some() {
                flushed += 1;
            }
        }
        assert_eq!(flushed, 1);
    }

    #[test]
    fn muted_flush_is_discarded() {
        let mut seg = Segmenter::new(cfg(), RATE);
        let flushed = run(&mut seg, 20, 20);
        assert!(!should_transmit(&flushed[0], &cfg(), false));
    }

    #[test]
    fn short_segments_dropped_only_when_enabled() {
        // 300ms of speech is under the 450ms minimum
        let mut seg = Segmenter::new(cfg(), RATE);
        let flushed = run(&mut seg, 10, 20);
        assert_eq!(flushed.len(), 1);
        assert!(!should_transmit(&flushed[0], &cfg(), true));

        let mut lenient = cfg();
        lenient.drop_short = false;
        assert!(should_transmit(&flushed[0], &lenient, true));
    }

    #[test]
    fn finish_flushes_open_segment() {
        let mut seg = Segmenter::new(cfg(), RATE);
        // speech never followed by enough silence
        let flushed = run(&mut seg, 20, 2);
        assert!(flushed.is_empty());
        let trailing = seg.finish().expect("trailing speech flushed on stop");
        assert!(trailing.duration_ms >= 600 - BLOCK_MS);
        // a second finish is a no-op
        assert!(seg.finish().is_none());
    }

    #[test]
    fn named_profiles_resolve() {
        for name in ["quiet", "noisy", "extreme"] {
            assert!(VadConfig::profile(name).is_some(), "profile {}", name);
        }
        assert!(VadConfig::profile("studio").is_none());
    }
}
