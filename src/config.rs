//! Configuration for the Chime gateway
//!
//! The gateway takes one explicit [`Config`] at construction time — there is
//! no process-wide config singleton. Defaults live in code, an optional TOML
//! file overlays them field by field, and API keys are picked up from the
//! environment last.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::{Error, Result};

/// Default WebSocket listen port
pub const DEFAULT_PORT: u16 = 8192;

/// Fixed audio contract for one direction of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    /// Samples per second
    pub sample_rate: u32,

    /// Channel count (the wire protocol is mono)
    pub channels: u16,

    /// Duration of one frame in milliseconds
    pub frame_duration_ms: u32,
}

impl AudioFormat {
    /// Samples contained in one frame (`sample_rate * frame_duration / 1000`)
    #[must_use]
    pub const fn samples_per_frame(&self) -> usize {
        (self.sample_rate as usize * self.channels as usize * self.frame_duration_ms as usize)
            / 1000
    }

    /// Bytes of 16-bit PCM in one frame
    #[must_use]
    pub const fn frame_bytes(&self) -> usize {
        self.samples_per_frame() * 2
    }

    /// Playback duration of one frame
    #[must_use]
    pub const fn frame_duration(&self) -> Duration {
        Duration::from_millis(self.frame_duration_ms as u64)
    }
}

/// Audio the device sends up: 16 kHz mono, 60 ms frames
pub const AUDIO_IN: AudioFormat = AudioFormat {
    sample_rate: 16_000,
    channels: 1,
    frame_duration_ms: 60,
};

/// Audio the server sends down: 24 kHz mono, 60 ms frames
pub const AUDIO_OUT: AudioFormat = AudioFormat {
    sample_rate: 24_000,
    channels: 1,
    frame_duration_ms: 60,
};

/// Gateway configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Listen address and port
    pub server: ServerConfig,

    /// Audio contract for inbound device audio
    pub audio_in: AudioFormat,

    /// Audio contract for outbound synthesized audio
    pub audio_out: AudioFormat,

    /// Speech-to-text provider settings
    pub stt: SttConfig,

    /// Response generation settings (ordered fallback chain)
    pub llm: LlmConfig,

    /// Speech synthesis provider settings
    pub tts: TtsConfig,

    /// Per-session behavior
    pub session: SessionConfig,
}

/// Listen address configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Speech-to-text provider settings
#[derive(Debug, Clone)]
pub struct SttConfig {
    /// Provider backend: "whisper" (OpenAI-compatible) or "deepgram"
    pub provider: String,

    pub api_key: String,

    /// Base URL for OpenAI-compatible endpoints
    pub base_url: String,

    pub model: String,

    /// Transcription language hint (ISO 639-1), when the provider supports it
    pub language: Option<String>,
}

/// One entry in the LLM fallback chain
#[derive(Debug, Clone, Deserialize)]
pub struct LlmProvider {
    /// Display name used in logs
    pub name: String,

    pub base_url: String,

    #[serde(default)]
    pub api_key: String,

    pub model: String,
}

/// Response generation settings
#[derive(Debug, Clone)]
pub struct LlmConfig {
    /// Providers tried in order until one starts streaming
    pub providers: Vec<LlmProvider>,

    pub max_tokens: u32,

    pub temperature: f32,

    pub system_prompt: String,
}

/// Speech synthesis provider settings
#[derive(Debug, Clone)]
pub struct TtsConfig {
    /// Provider backend: "openai" (OpenAI-compatible) or "elevenlabs"
    pub provider: String,

    pub api_key: String,

    /// Base URL for OpenAI-compatible endpoints
    pub base_url: String,

    pub model: String,

    /// Voice identifier (OpenAI voice name or ElevenLabs voice id)
    pub voice: String,

    pub speed: f32,
}

/// Per-session behavior knobs
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Bounded conversation-history window, in entries (2 per turn)
    pub max_history: usize,

    /// Utterances shorter than this are treated as empty transcriptions
    pub min_utterance_ms: u32,

    /// Upper bound on a single provider call
    pub provider_timeout_secs: u64,

    /// Run-on text is soft-split past this many characters without a
    /// sentence boundary
    pub max_sentence_chars: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: DEFAULT_PORT,
            },
            audio_in: AUDIO_IN,
            audio_out: AUDIO_OUT,
            stt: SttConfig {
                provider: "whisper".to_string(),
                api_key: String::new(),
                base_url: "https://api.groq.com/openai/v1".to_string(),
                model: "whisper-large-v3-turbo".to_string(),
                language: None,
            },
            llm: LlmConfig {
                providers: Vec::new(),
                max_tokens: 500,
                temperature: 0.7,
                system_prompt: "You are a friendly voice assistant. Keep responses short, \
                                conversational, and suitable for being read aloud."
                    .to_string(),
            },
            tts: TtsConfig {
                provider: "openai".to_string(),
                api_key: String::new(),
                base_url: "https://api.openai.com/v1".to_string(),
                model: "tts-1".to_string(),
                voice: "alloy".to_string(),
                speed: 1.0,
            },
            session: SessionConfig {
                max_history: 20,
                min_utterance_ms: 300,
                provider_timeout_secs: 30,
                max_sentence_chars: 120,
            },
        }
    }
}

impl Config {
    /// Load configuration: defaults, then the TOML file overlay, then
    /// environment keys.
    ///
    /// An explicitly given `path` must parse; the default path
    /// (`~/.config/omni/chime/config.toml`) is a best-effort overlay.
    ///
    /// # Errors
    ///
    /// Returns error if an explicit config file is missing or malformed, or
    /// if the resulting configuration fails validation.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = Self::default();

        let file = match path {
            Some(p) => {
                let content = std::fs::read_to_string(p)
                    .map_err(|e| Error::Config(format!("cannot read {}: {e}", p.display())))?;
                toml::from_str(&content)?
            }
            None => load_default_file(),
        };

        config.apply(file);
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Overlay a parsed config file onto the current values
    fn apply(&mut self, file: ConfigFile) {
        if let Some(host) = file.server.host {
            self.server.host = host;
        }
        if let Some(port) = file.server.port {
            self.server.port = port;
        }

        if let Some(rate) = file.audio.output_sample_rate {
            self.audio_out.sample_rate = rate;
        }
        if let Some(ms) = file.audio.frame_duration_ms {
            self.audio_in.frame_duration_ms = ms;
            self.audio_out.frame_duration_ms = ms;
        }

        if let Some(provider) = file.stt.provider {
            self.stt.provider = provider;
        }
        if let Some(key) = file.stt.api_key {
            self.stt.api_key = key;
        }
        if let Some(url) = file.stt.base_url {
            self.stt.base_url = url;
        }
        if let Some(model) = file.stt.model {
            self.stt.model = model;
        }
        if file.stt.language.is_some() {
            self.stt.language = file.stt.language;
        }

        if let Some(providers) = file.llm.providers {
            self.llm.providers = providers;
        }
        if let Some(max_tokens) = file.llm.max_tokens {
            self.llm.max_tokens = max_tokens;
        }
        if let Some(temperature) = file.llm.temperature {
            self.llm.temperature = temperature;
        }
        if let Some(prompt) = file.llm.system_prompt {
            self.llm.system_prompt = prompt;
        }

        if let Some(provider) = file.tts.provider {
            self.tts.provider = provider;
        }
        if let Some(key) = file.tts.api_key {
            self.tts.api_key = key;
        }
        if let Some(url) = file.tts.base_url {
            self.tts.base_url = url;
        }
        if let Some(model) = file.tts.model {
            self.tts.model = model;
        }
        if let Some(voice) = file.tts.voice {
            self.tts.voice = voice;
        }
        if let Some(speed) = file.tts.speed {
            self.tts.speed = speed;
        }

        if let Some(max_history) = file.session.max_history {
            self.session.max_history = max_history;
        }
        if let Some(ms) = file.session.min_utterance_ms {
            self.session.min_utterance_ms = ms;
        }
        if let Some(secs) = file.session.provider_timeout_secs {
            self.session.provider_timeout_secs = secs;
        }
        if let Some(chars) = file.session.max_sentence_chars {
            self.session.max_sentence_chars = chars;
        }
    }

    /// Pick up API keys and a default LLM provider from the environment
    fn apply_env(&mut self) {
        if self.stt.api_key.is_empty() {
            if let Ok(key) = std::env::var("GROQ_API_KEY") {
                self.stt.api_key = key;
            } else if let Ok(key) = std::env::var("DEEPGRAM_API_KEY") {
                self.stt.api_key = key;
                self.stt.provider = "deepgram".to_string();
            } else if let Ok(key) = std::env::var("OPENAI_API_KEY") {
                self.stt.api_key = key;
                self.stt.base_url = "https://api.openai.com/v1".to_string();
                self.stt.model = "whisper-1".to_string();
            }
        }

        if self.llm.providers.is_empty() {
            let base_url = std::env::var("OPENAI_BASE_URL")
                .unwrap_or_else(|_| "https://api.openai.com/v1".to_string());
            let model =
                std::env::var("OPENAI_LLM_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string());
            self.llm.providers.push(LlmProvider {
                name: "default".to_string(),
                base_url,
                api_key: std::env::var("OPENAI_API_KEY").unwrap_or_default(),
                model,
            });
        }

        if self.tts.api_key.is_empty() {
            if let Ok(key) = std::env::var("ELEVENLABS_API_KEY") {
                self.tts.api_key = key;
                self.tts.provider = "elevenlabs".to_string();
            } else if let Ok(key) = std::env::var("OPENAI_API_KEY") {
                self.tts.api_key = key;
            }
        }
    }

    /// Validate that the configuration is internally consistent
    ///
    /// # Errors
    ///
    /// Returns error naming the first invalid field.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(Error::Config("server.port must not be 0".to_string()));
        }
        if self.audio_in.channels != 1 || self.audio_out.channels != 1 {
            return Err(Error::Config("only mono audio is supported".to_string()));
        }
        if self.audio_in.frame_duration_ms == 0 || self.audio_out.frame_duration_ms == 0 {
            return Err(Error::Config("frame duration must be positive".to_string()));
        }
        if self.llm.providers.is_empty() {
            return Err(Error::Config(
                "at least one LLM provider is required".to_string(),
            ));
        }
        if self.session.max_history == 0 {
            return Err(Error::Config("session.max_history must be positive".to_string()));
        }
        Ok(())
    }
}

/// Top-level TOML configuration file schema — all fields optional, the file
/// is a partial overlay on top of defaults
#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    server: ServerFileConfig,

    #[serde(default)]
    audio: AudioFileConfig,

    #[serde(default)]
    stt: SttFileConfig,

    #[serde(default)]
    llm: LlmFileConfig,

    #[serde(default)]
    tts: TtsFileConfig,

    #[serde(default)]
    session: SessionFileConfig,
}

#[derive(Debug, Default, Deserialize)]
struct ServerFileConfig {
    host: Option<String>,
    port: Option<u16>,
}

#[derive(Debug, Default, Deserialize)]
struct AudioFileConfig {
    /// Outbound sample rate (inbound is fixed by the device fleet)
    output_sample_rate: Option<u32>,
    frame_duration_ms: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct SttFileConfig {
    provider: Option<String>,
    api_key: Option<String>,
    base_url: Option<String>,
    model: Option<String>,
    language: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct LlmFileConfig {
    providers: Option<Vec<LlmProvider>>,
    max_tokens: Option<u32>,
    temperature: Option<f32>,
    system_prompt: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct TtsFileConfig {
    provider: Option<String>,
    api_key: Option<String>,
    base_url: Option<String>,
    model: Option<String>,
    voice: Option<String>,
    speed: Option<f32>,
}

#[derive(Debug, Default, Deserialize)]
struct SessionFileConfig {
    max_history: Option<usize>,
    min_utterance_ms: Option<u32>,
    provider_timeout_secs: Option<u64>,
    max_sentence_chars: Option<usize>,
}

/// Load the TOML file from the standard path, tolerating absence and parse
/// failures (a broken user config should not take the gateway down)
fn load_default_file() -> ConfigFile {
    let Some(path) = config_file_path() else {
        return ConfigFile::default();
    };

    if !path.exists() {
        return ConfigFile::default();
    }

    match std::fs::read_to_string(&path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "loaded config file");
                config
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config file, using defaults"
                );
                ConfigFile::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read config file"
            );
            ConfigFile::default()
        }
    }
}

/// Return the config file path: `~/.config/omni/chime/config.toml`
#[must_use]
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new()
        .map(|d| d.config_dir().join("omni").join("chime").join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_arithmetic() {
        assert_eq!(AUDIO_IN.samples_per_frame(), 960);
        assert_eq!(AUDIO_IN.frame_bytes(), 1920);
        assert_eq!(AUDIO_OUT.samples_per_frame(), 1440);
        assert_eq!(AUDIO_OUT.frame_duration(), Duration::from_millis(60));
    }

    #[test]
    fn default_config_fails_validation_without_llm_provider() {
        let config = Config::default();
        assert!(config.validate().is_err());
    }

    #[test]
    fn file_overlay_is_partial() {
        let file: ConfigFile = toml::from_str(
            r#"
            [server]
            port = 9000

            [tts]
            voice = "nova"
            "#,
        )
        .unwrap();

        let mut config = Config::default();
        config.apply(file);

        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.tts.voice, "nova");
        assert_eq!(config.tts.model, "tts-1");
    }

    #[test]
    fn llm_providers_parse_from_toml() {
        let file: ConfigFile = toml::from_str(
            r#"
            [[llm.providers]]
            name = "primary"
            base_url = "https://api.example.com/v1"
            api_key = "sk-test"
            model = "fast-chat"

            [[llm.providers]]
            name = "fallback"
            base_url = "http://127.0.0.1:8045/v1"
            model = "local-chat"
            "#,
        )
        .unwrap();

        let mut config = Config::default();
        config.apply(file);

        assert_eq!(config.llm.providers.len(), 2);
        assert_eq!(config.llm.providers[0].name, "primary");
        assert_eq!(config.llm.providers[1].api_key, "");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validation_rejects_zero_port() {
        let mut config = Config::default();
        config.llm.providers.push(LlmProvider {
            name: "p".to_string(),
            base_url: "http://localhost".to_string(),
            api_key: String::new(),
            model: "m".to_string(),
        });
        config.server.port = 0;
        assert!(config.validate().is_err());
    }
}
