use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use huddle_shared::types::{DeviceKind, MediaKind, TrackId};
use huddle_shared::MediaAccessError;

use crate::devices::{DeviceInfo, MediaConstraints, MediaDevices};
use crate::track::LocalTrack;

#[derive(Debug, Clone)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub channels: u16,
    pub frame_size_ms: u32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48000,
            channels: 1,
            frame_size_ms: 20,
        }
    }
}

impl AudioConfig {
    pub fn frame_size_samples(&self) -> usize {
        (self.sample_rate as usize * self.frame_size_ms as usize * self.channels as usize) / 1000
    }
}

/// One fixed-size block of captured PCM.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    pub track_id: TrackId,
    pub samples: Vec<f32>,
}

/// Microphone capture through the host audio API.
///
/// Camera and display capture are not available on this runtime and are
/// reported as [`MediaAccessError::Unsupported`].
pub struct HostAudioDevices {
    config: AudioConfig,
    frame_tx: Option<mpsc::Sender<AudioFrame>>,
}

impl HostAudioDevices {
    /// `frame_tx` receives PCM frames from every microphone track while it
    /// is live. Frames are dropped when the receiver lags.
    pub fn new(config: AudioConfig, frame_tx: Option<mpsc::Sender<AudioFrame>>) -> Self {
        Self { config, frame_tx }
    }

    fn find_input(&self, requested: Option<&str>) -> Result<cpal::Device, MediaAccessError> {
        let host = cpal::default_host();
        match requested {
            None => host
                .default_input_device()
                .ok_or_else(|| MediaAccessError::DeviceNotFound("default".to_string())),
            Some(id) => host
                .input_devices()
                .map_err(|e| MediaAccessError::Runtime(e.to_string()))?
                .find(|d| d.name().map(|n| n == id).unwrap_or(false))
                .ok_or_else(|| MediaAccessError::DeviceNotFound(id.to_string())),
        }
    }

    async fn start_capture(&self, device: cpal::Device) -> Result<LocalTrack, MediaAccessError> {
        let name = device.name().unwrap_or_else(|_| "unknown".to_string());
        info!(device = %name, "Using input device");

        let track = LocalTrack::new(MediaKind::Audio, Some(name.clone()), name);
        let stream_config = cpal::StreamConfig {
            channels: self.config.channels,
            sample_rate: cpal::SampleRate(self.config.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };
        let frame_size = self.config.frame_size_samples();
        let frame_tx = self.frame_tx.clone();
        let runtime = tokio::runtime::Handle::current();
        let (ready_tx, ready_rx) = oneshot::channel();

        // cpal streams are not Send; each one lives on its own thread until
        // the track ends.
        let capture_track = track.clone();
        std::thread::Builder::new()
            .name("huddle-audio-capture".into())
            .spawn(move || {
                let stream = match build_stream(
                    &device,
                    &stream_config,
                    frame_size,
                    capture_track.clone(),
                    frame_tx,
                ) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(MediaAccessError::Runtime(e.to_string())));
                    return;
                }
                let _ = ready_tx.send(Ok(()));

                runtime.block_on(capture_track.ended());
                drop(stream);
                debug!(track = %capture_track.id(), "Audio capture stopped");
            })
            .map_err(|e| MediaAccessError::Runtime(e.to_string()))?;

        ready_rx
            .await
            .map_err(|_| MediaAccessError::Runtime("capture thread exited".into()))??;
        debug!(track = %track.id(), "Audio capture started");
        Ok(track)
    }
}

/// Dropped frames are reported on the first drop and then once per
/// `DROP_LOG_INTERVAL` drops, keeping the capture callback quiet.
const DROP_LOG_INTERVAL: u64 = 250;

#[derive(Debug, Default)]
struct DropCounter {
    dropped: u64,
}

impl DropCounter {
    /// Count one drop. Returns the running total when it should be logged.
    fn record(&mut self) -> Option<u64> {
        self.dropped += 1;
        (self.dropped == 1 || self.dropped % DROP_LOG_INTERVAL == 0).then_some(self.dropped)
    }
}

fn build_stream(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    frame_size: usize,
    track: LocalTrack,
    frame_tx: Option<mpsc::Sender<AudioFrame>>,
) -> Result<cpal::Stream, MediaAccessError> {
    let mut buffer: Vec<f32> = Vec::with_capacity(frame_size);
    let mut drops = DropCounter::default();
    let track_id = track.id();

    device
        .build_input_stream(
            config,
            move |data: &[f32], _info: &cpal::InputCallbackInfo| {
                if !track.is_live() {
                    return;
                }
                if track.is_enabled() {
                    buffer.extend_from_slice(data);
                } else {
                    // Silence keeps the receiver's playout clock running.
                    buffer.extend(std::iter::repeat(0.0f32).take(data.len()));
                }
                while buffer.len() >= frame_size {
                    let samples: Vec<f32> = buffer.drain(..frame_size).collect();
                    if let Some(tx) = &frame_tx {
                        if tx.try_send(AudioFrame { track_id, samples }).is_err() {
                            if let Some(dropped) = drops.record() {
                                warn!(dropped, "Audio frame channel full, dropping frames");
                            }
                        }
                    }
                }
            },
            move |err| {
                error!("Audio input error: {err}");
            },
            None,
        )
        .map_err(|e| match e {
            cpal::BuildStreamError::DeviceNotAvailable => {
                MediaAccessError::DeviceBusy(device.name().unwrap_or_default())
            }
            other => MediaAccessError::Runtime(other.to_string()),
        })
}

#[async_trait]
impl MediaDevices for HostAudioDevices {
    async fn enumerate_devices(&self) -> Result<Vec<DeviceInfo>, MediaAccessError> {
        let host = cpal::default_host();
        let default_name = host.default_input_device().and_then(|d| d.name().ok());

        let devices = host
            .input_devices()
            .map_err(|e| MediaAccessError::Runtime(e.to_string()))?
            .filter_map(|d| d.name().ok())
            .map(|name| DeviceInfo {
                is_default: default_name.as_deref() == Some(name.as_str()),
                id: name.clone(),
                label: name,
                kind: DeviceKind::AudioInput,
            })
            .collect();
        Ok(devices)
    }

    async fn get_user_media(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<Vec<LocalTrack>, MediaAccessError> {
        if constraints.video {
            return Err(MediaAccessError::Unsupported(MediaKind::Video));
        }
        if !constraints.audio {
            return Ok(Vec::new());
        }

        let device = self.find_input(constraints.audio_device.as_deref())?;
        Ok(vec![self.start_capture(device).await?])
    }

    async fn get_display_media(&self) -> Result<LocalTrack, MediaAccessError> {
        Err(MediaAccessError::Unsupported(MediaKind::Screen))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drop_logging_is_rate_limited() {
        let mut drops = DropCounter::default();
        let logged: Vec<u64> = (0..600).filter_map(|_| drops.record()).collect();
        assert_eq!(logged, vec![1, 250, 500]);
    }

    #[test]
    fn test_frame_size() {
        let config = AudioConfig::default();
        assert_eq!(config.frame_size_samples(), 960);

        let stereo = AudioConfig {
            channels: 2,
            ..AudioConfig::default()
        };
        assert_eq!(stereo.frame_size_samples(), 1920);
    }

    #[tokio::test]
    async fn test_video_and_display_unsupported() {
        let devices = HostAudioDevices::new(AudioConfig::default(), None);
        let constraints = MediaConstraints {
            video: true,
            audio: true,
            ..MediaConstraints::default()
        };
        assert_eq!(
            devices.get_user_media(&constraints).await.unwrap_err(),
            MediaAccessError::Unsupported(MediaKind::Video)
        );
        assert_eq!(
            devices.get_display_media().await.unwrap_err(),
            MediaAccessError::Unsupported(MediaKind::Screen)
        );
    }

    #[tokio::test]
    async fn test_empty_request_captures_nothing() {
        let devices = HostAudioDevices::new(AudioConfig::default(), None);
        let tracks = devices
            .get_user_media(&MediaConstraints::default())
            .await
            .unwrap();
        assert!(tracks.is_empty());
    }
}
