//! ALSA PCM device wrappers for mono audio capture.

use std::thread;
use std::time::{Duration, Instant};

use alsa::pcm::{Access, Format, HwParams, PCM};
use alsa::{Direction, ValueOr};
use anyhow::{Context, Result};

/// How often the preferred route is re-probed while waiting for it.
const ROUTE_RETRY_INTERVAL: Duration = Duration::from_millis(250);

/// Parameters negotiated with the ALSA hardware.
#[derive(Debug, Clone)]
pub struct AlsaParams {
    /// Actual sample rate after negotiation
    pub sample_rate: u32,
    /// Period size in frames
    pub period_size: usize,
}

/// Open a PCM device for capture (recording), mono S16LE.
pub fn open_capture(device: &str, sample_rate: u32) -> Result<(PCM, AlsaParams)> {
    let pcm = PCM::new(device, Direction::Capture, false)
        .with_context(|| format!("Failed to open PCM device '{}' for capture", device))?;

    // Configure hardware parameters
    {
        let hwp = HwParams::any(&pcm).with_context(|| "Failed to initialize HwParams")?;
        hwp.set_access(Access::RWInterleaved)?;
        hwp.set_format(Format::S16LE)?;
        hwp.set_channels(1)?;
        hwp.set_rate_near(sample_rate, ValueOr::Nearest)?;
        pcm.hw_params(&hwp)?;
    }

    // Read back actual negotiated parameters
    let (actual_rate, period_size) = {
        let hwp = pcm.hw_params_current()?;
        let rate = hwp.get_rate()?;
        let ps = hwp.get_period_size()? as usize;
        (rate, ps)
    };

    let params = AlsaParams {
        sample_rate: actual_rate,
        period_size,
    };

    log::info!(
        "ALSA capture: device={}, rate={}, period_size={}",
        device,
        actual_rate,
        period_size,
    );

    Ok((pcm, params))
}

/// Open the preferred capture route if one is configured, retrying for
/// a bounded window while it materializes (an external accessory mic
/// may enumerate late). Falls back to the built-in `default` route
/// once the window expires.
pub fn open_capture_route(
    preferred: Option<&str>,
    sample_rate: u32,
    route_timeout: Duration,
) -> Result<(PCM, AlsaParams)> {
    if let Some(device) = preferred {
        let deadline = Instant::now() + route_timeout;
        loop {
            match open_capture(device, sample_rate) {
                Ok(opened) => return Ok(opened),
                Err(e) => {
                    if Instant::now() >= deadline {
                        log::warn!(
                            "Preferred route '{}' unavailable ({}), falling back to default",
                            device,
                            e
                        );
                        break;
                    }
                    thread::sleep(ROUTE_RETRY_INTERVAL);
                }
            }
        }
    }
    open_capture("default", sample_rate)
}
