//! Per-instance session state
//!
//! Tracks the current prompt, the current timestep, the output generated
//! for that prompt and the generation settings. The cached output is only
//! valid for the prompt it was produced from under the current settings
//! and weights; anything that could change the decode result drops it.
//!
//! Captures past the end of the output extend it by generation. The longest
//! such extension is kept beside the output and dropped with it, so a later
//! capture continues from it instead of sampling a different continuation.

use serde::{Deserialize, Serialize};

/// Decode parameters used by `generate` and by timestep extension
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationSettings {
    pub max_new_tokens: usize,
    /// `<= 0.0` means greedy decoding
    pub temperature: f32,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            max_new_tokens: 32,
            temperature: 0.0,
        }
    }
}

/// Timestep used until `set_timestep` is called
pub const DEFAULT_TIMESTEP: i64 = 1;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionState {
    current_prompt: Option<String>,
    current_timestep: i64,
    current_output: Option<String>,
    /// Output plus capture-time continuation
    extension: Option<String>,
    settings: GenerationSettings,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            current_prompt: None,
            current_timestep: DEFAULT_TIMESTEP,
            current_output: None,
            extension: None,
            settings: GenerationSettings::default(),
        }
    }
}

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn prompt(&self) -> Option<&str> {
        self.current_prompt.as_deref()
    }

    pub fn output(&self) -> Option<&str> {
        self.current_output.as_deref()
    }

    pub fn extension(&self) -> Option<&str> {
        self.extension.as_deref()
    }

    pub fn timestep(&self) -> i64 {
        self.current_timestep
    }

    pub fn settings(&self) -> GenerationSettings {
        self.settings
    }

    /// The cached output, if it was produced for exactly `prompt`
    pub fn cached_output(&self, prompt: &str) -> Option<&str> {
        match (&self.current_prompt, &self.current_output) {
            (Some(p), Some(out)) if p == prompt => Some(out),
            _ => None,
        }
    }

    /// Record `prompt` as current ahead of decoding; a different prompt
    /// drops the stale output
    pub fn begin_prompt(&mut self, prompt: &str) {
        if self.current_prompt.as_deref() != Some(prompt) {
            self.current_prompt = Some(prompt.to_string());
            self.invalidate_output();
        }
    }

    pub fn record_output(&mut self, output: String) {
        self.current_output = Some(output);
        self.extension = None;
    }

    /// Keep `text` as the continuation captures resolve against
    pub fn record_extension(&mut self, text: String) {
        self.extension = Some(text);
    }

    pub fn invalidate_output(&mut self) {
        self.current_output = None;
        self.extension = None;
    }

    pub fn set_timestep(&mut self, timestep: i64) {
        self.current_timestep = timestep;
    }

    pub fn set_settings(&mut self, settings: GenerationSettings) {
        if settings != self.settings {
            self.invalidate_output();
        }
        self.settings = settings;
    }

    /// Text the timestep is measured against: the longest known
    /// continuation of the current prompt, else the prompt itself
    pub fn base_text(&self) -> &str {
        self.extension
            .as_deref()
            .or(self.current_output.as_deref())
            .or(self.current_prompt.as_deref())
            .unwrap_or("")
    }

    /// The prompt, if one is established and has at least one word
    pub fn established_prompt(&self) -> Option<&str> {
        self.current_prompt
            .as_deref()
            .filter(|p| p.split_whitespace().next().is_some())
    }
}
