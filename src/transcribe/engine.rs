use async_trait::async_trait;
use std::path::Path;
use thiserror::Error;

use crate::config::WhisperConfig;

/// One timestamped piece of speech from a single track.
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    /// Start time in seconds from the beginning of the recording.
    pub start: f64,
    pub text: String,
}

/// Errors from the speech engine. Model-load failures abort the whole
/// transcription stage; per-file failures are logged and skipped.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to load speech model: {0}")]
    ModelLoad(String),

    #[error("failed to decode {path}: {message}")]
    Decode { path: String, message: String },

    #[error("transcription failed for {path}: {message}")]
    Inference { path: String, message: String },
}

/// Speech-to-text over one audio file at a time.
///
/// Implementors must be `Send + Sync` so the worker can hold them behind
/// an `Arc<dyn SpeechEngine>`.
#[async_trait]
pub trait SpeechEngine: Send + Sync {
    /// Engine/model description for logs.
    fn describe(&self) -> String;

    /// Load the model. Called once at the start of a transcription stage;
    /// failure here is stage-fatal.
    async fn prepare(&self) -> Result<(), EngineError>;

    /// Transcribe one track into time-ordered segments.
    async fn transcribe(&self, path: &Path) -> Result<Vec<Segment>, EngineError>;
}

/// Whisper-backed engine. Real inference requires the `whisper` cargo
/// feature (whisper.cpp via whisper-rs, which needs cmake at build time);
/// without it, `prepare` fails with guidance.
pub struct WhisperEngine {
    config: WhisperConfig,
    #[cfg(feature = "whisper")]
    context: std::sync::Arc<std::sync::Mutex<Option<whisper_rs::WhisperContext>>>,
}

impl WhisperEngine {
    pub fn new(config: WhisperConfig) -> Self {
        Self {
            config,
            #[cfg(feature = "whisper")]
            context: std::sync::Arc::new(std::sync::Mutex::new(None)),
        }
    }

    fn model_name(&self) -> String {
        self.config
            .model_path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("unknown")
            .to_string()
    }
}

#[cfg(feature = "whisper")]
mod whisper_impl {
    use super::*;
    use std::path::PathBuf;
    use whisper_rs::{FullParams, SamplingStrategy, WhisperContext, WhisperContextParameters};

    /// Whisper expects 16 kHz mono f32 in [-1.0, 1.0].
    const WHISPER_SAMPLE_RATE: u32 = 16_000;

    #[async_trait]
    impl SpeechEngine for WhisperEngine {
        fn describe(&self) -> String {
            format!("whisper ({})", self.model_name())
        }

        async fn prepare(&self) -> Result<(), EngineError> {
            {
                let guard = self
                    .context
                    .lock()
                    .map_err(|_| EngineError::ModelLoad("context lock poisoned".into()))?;
                if guard.is_some() {
                    return Ok(());
                }
            }

            if !self.config.model_path.exists() {
                return Err(EngineError::ModelLoad(format!(
                    "model file not found: {}",
                    self.config.model_path.display()
                )));
            }

            let model_path = self.config.model_path.clone();
            let loaded = tokio::task::spawn_blocking(move || {
                let path = model_path
                    .to_str()
                    .ok_or_else(|| "invalid UTF-8 in model path".to_string())?;
                WhisperContext::new_with_params(path, WhisperContextParameters::default())
                    .map_err(|e| e.to_string())
            })
            .await
            .map_err(|e| EngineError::ModelLoad(format!("model load task panicked: {}", e)))?
            .map_err(EngineError::ModelLoad)?;

            let mut guard = self
                .context
                .lock()
                .map_err(|_| EngineError::ModelLoad("context lock poisoned".into()))?;
            *guard = Some(loaded);
            Ok(())
        }

        async fn transcribe(&self, path: &Path) -> Result<Vec<Segment>, EngineError> {
            let path_buf: PathBuf = path.to_path_buf();
            let context = std::sync::Arc::clone(&self.context);
            let language = self.config.language.clone();
            let threads = self.config.threads;
            let beam_size = self.config.beam_size;

            // Inference is CPU-bound; keep it off the async runtime.
            tokio::task::spawn_blocking(move || {
                let samples = decode_to_mono_16k(&path_buf)?;

                let guard = context.lock().map_err(|_| EngineError::Inference {
                    path: path_buf.display().to_string(),
                    message: "context lock poisoned".into(),
                })?;
                let ctx = guard.as_ref().ok_or_else(|| {
                    EngineError::ModelLoad("prepare() was not called before transcribe()".into())
                })?;

                let mut state = ctx.create_state().map_err(|e| EngineError::Inference {
                    path: path_buf.display().to_string(),
                    message: format!("failed to create state: {}", e),
                })?;

                let strategy = match beam_size {
                    Some(width) => SamplingStrategy::BeamSearch {
                        beam_size: width as i32,
                        patience: -1.0,
                    },
                    None => SamplingStrategy::Greedy { best_of: 1 },
                };
                let mut params = FullParams::new(strategy);
                params.set_language(Some(&language));
                if let Some(threads) = threads {
                    params.set_n_threads(threads as i32);
                }
                params.set_print_special(false);
                params.set_print_progress(false);
                params.set_print_realtime(false);
                params.set_print_timestamps(false);

                state
                    .full(params, &samples)
                    .map_err(|e| EngineError::Inference {
                        path: path_buf.display().to_string(),
                        message: format!("inference failed: {}", e),
                    })?;

                let count = state.full_n_segments().map_err(|e| EngineError::Inference {
                    path: path_buf.display().to_string(),
                    message: format!("segment count unavailable: {}", e),
                })?;

                let mut segments = Vec::with_capacity(count as usize);
                for i in 0..count {
                    let text = state
                        .full_get_segment_text(i)
                        .map_err(|e| EngineError::Inference {
                            path: path_buf.display().to_string(),
                            message: format!("segment {} text unavailable: {}", i, e),
                        })?;
                    // Timestamps are in 10 ms ticks.
                    let t0 = state
                        .full_get_segment_t0(i)
                        .map_err(|e| EngineError::Inference {
                            path: path_buf.display().to_string(),
                            message: format!("segment {} start unavailable: {}", i, e),
                        })?;
                    segments.push(Segment {
                        start: t0 as f64 * 0.01,
                        text: text.trim().to_string(),
                    });
                }
                Ok(segments)
            })
            .await
            .map_err(|e| EngineError::Inference {
                path: path.display().to_string(),
                message: format!("transcription task panicked: {}", e),
            })?
        }
    }

    /// Decode any supported container/codec to mono f32 at 16 kHz.
    ///
    /// Channels are averaged into mono; higher sample rates are reduced by
    /// decimation (Craig exports are 48 kHz, an exact multiple).
    fn decode_to_mono_16k(path: &Path) -> Result<Vec<f32>, EngineError> {
        use symphonia::core::audio::SampleBuffer;
        use symphonia::core::io::MediaSourceStream;
        use symphonia::core::probe::Hint;

        let decode_err = |message: String| EngineError::Decode {
            path: path.display().to_string(),
            message,
        };

        let file = std::fs::File::open(path).map_err(|e| decode_err(e.to_string()))?;
        let mss = MediaSourceStream::new(Box::new(file), Default::default());

        let mut hint = Hint::new();
        if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            hint.with_extension(ext);
        }

        let probed = symphonia::default::get_probe()
            .format(&hint, mss, &Default::default(), &Default::default())
            .map_err(|e| decode_err(e.to_string()))?;
        let mut format = probed.format;

        let track = format
            .default_track()
            .ok_or_else(|| decode_err("no audio track".into()))?;
        let track_id = track.id;

        let mut decoder = symphonia::default::get_codecs()
            .make(&track.codec_params, &Default::default())
            .map_err(|e| decode_err(e.to_string()))?;

        let mut mono: Vec<f32> = Vec::new();
        let mut sample_rate = 0u32;

        loop {
            let packet = match format.next_packet() {
                Ok(packet) => packet,
                Err(symphonia::core::errors::Error::IoError(_)) => break,
                Err(symphonia::core::errors::Error::ResetRequired) => break,
                Err(e) => return Err(decode_err(e.to_string())),
            };
            if packet.track_id() != track_id {
                continue;
            }

            let decoded = match decoder.decode(&packet) {
                Ok(decoded) => decoded,
                Err(symphonia::core::errors::Error::DecodeError(_)) => continue,
                Err(e) => return Err(decode_err(e.to_string())),
            };

            let spec = *decoded.spec();
            sample_rate = spec.rate;
            let channels = spec.channels.count().max(1);

            let mut buf = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
            buf.copy_interleaved_ref(decoded);

            for frame in buf.samples().chunks_exact(channels) {
                let sum: f32 = frame.iter().sum();
                mono.push(sum / channels as f32);
            }
        }

        if sample_rate == 0 {
            return Err(decode_err("no decodable audio".into()));
        }

        if sample_rate > WHISPER_SAMPLE_RATE {
            let ratio = (sample_rate / WHISPER_SAMPLE_RATE).max(1) as usize;
            mono = mono.into_iter().step_by(ratio).collect();
        }

        Ok(mono)
    }
}

#[cfg(not(feature = "whisper"))]
#[async_trait]
impl SpeechEngine for WhisperEngine {
    fn describe(&self) -> String {
        format!("whisper ({}) [feature disabled]", self.model_name())
    }

    async fn prepare(&self) -> Result<(), EngineError> {
        Err(EngineError::ModelLoad(
            "whisper feature not enabled; rebuild with --features whisper (requires cmake)"
                .to_string(),
        ))
    }

    async fn transcribe(&self, _path: &Path) -> Result<Vec<Segment>, EngineError> {
        Err(EngineError::ModelLoad(
            "whisper feature not enabled".to_string(),
        ))
    }
}
