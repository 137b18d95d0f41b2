use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    #[serde(default)]
    pub model_dir: Option<String>,
    #[serde(default = "default_encoder_file")]
    pub encoder_file: String,
    #[serde(default = "default_decoder_file")]
    pub decoder_file: String,
    #[serde(default = "default_vocab_file")]
    pub vocab_file: String,
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,
    #[serde(default = "default_bos_id")]
    pub bos_id: i64,
    #[serde(default = "default_eos_id")]
    pub eos_id: i64,
    #[serde(default = "default_intra_threads")]
    pub intra_threads: usize,
    #[serde(default = "default_sidecar_enabled")]
    pub sidecar_enabled: bool,
    #[serde(default = "default_ep_auto")]
    pub ep_auto: bool,
    #[serde(default = "default_ep_coreml")]
    pub ep_coreml: bool,
    #[serde(default)]
    pub ep_cuda: bool,
    #[serde(default)]
    pub ep_rocm: bool,
    #[serde(default)]
    pub ep_directml: bool,
    #[serde(default)]
    pub ep_openvino: bool,
}

pub fn default_encoder_file() -> String {
    "onnx/encoder_model.onnx".to_string()
}

pub fn default_decoder_file() -> String {
    "onnx/decoder_model.onnx".to_string()
}

pub fn default_vocab_file() -> String {
    "vocab.json".to_string()
}

pub fn default_max_steps() -> usize {
    16
}

pub fn default_bos_id() -> i64 {
    50256
}

pub fn default_eos_id() -> i64 {
    50256
}

pub fn default_intra_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
        .clamp(1, 4)
}

pub fn default_sidecar_enabled() -> bool {
    true
}

pub fn default_ep_auto() -> bool {
    true
}

pub fn default_ep_coreml() -> bool {
    cfg!(target_vendor = "apple")
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            model_dir: None,
            encoder_file: default_encoder_file(),
            decoder_file: default_decoder_file(),
            vocab_file: default_vocab_file(),
            max_steps: default_max_steps(),
            bos_id: default_bos_id(),
            eos_id: default_eos_id(),
            intra_threads: default_intra_threads(),
            sidecar_enabled: default_sidecar_enabled(),
            ep_auto: default_ep_auto(),
            ep_coreml: default_ep_coreml(),
            ep_cuda: false,
            ep_rocm: false,
            ep_directml: false,
            ep_openvino: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CaptionStatus {
    Success,
    Partial,
    Error,
}

/// Per-image result row persisted in the batch report.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptionDetail {
    pub file_name: String,
    pub path: String,
    pub caption: Option<String>,
    pub token_count: usize,
    pub status: CaptionStatus,
    pub error_message: Option<String>,
    pub analysis_log: Option<String>,
    pub duration_ms: Option<i64>,
    pub model: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSummary {
    pub total: usize,
    pub processed: usize,
    pub errors: usize,
    pub partial: usize,
    pub elapsed_secs: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_defaults_survive_empty_json() {
        let s: Settings = serde_json::from_str("{}").unwrap();
        assert_eq!(s.max_steps, 16);
        assert_eq!(s.bos_id, 50256);
        assert_eq!(s.eos_id, 50256);
        assert_eq!(s.encoder_file, "onnx/encoder_model.onnx");
        assert!(s.sidecar_enabled);
    }

    #[test]
    fn settings_round_trip_uses_camel_case() {
        let s = Settings::default();
        let json = serde_json::to_string(&s).unwrap();
        assert!(json.contains("\"maxSteps\""));
        assert!(json.contains("\"bosId\""));
        let back: Settings = serde_json::from_str(&json).unwrap();
        assert_eq!(back.max_steps, s.max_steps);
    }
}
