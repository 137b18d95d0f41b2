use crate::core::caption::math::argmax;
use crate::core::caption::preprocess::{preprocess_image, SIZE};
use crate::core::caption::vocab::Vocabulary;
use crate::core::caption::CaptionError;
use ndarray::{Array2, Array4};
use ort::execution_providers::coreml::CoreMLModelFormat;
use ort::execution_providers::{
    CPUExecutionProvider, CUDAExecutionProvider, CoreMLExecutionProvider,
    DirectMLExecutionProvider, ExecutionProvider, ExecutionProviderDispatch,
    OpenVINOExecutionProvider, ROCmExecutionProvider,
};
use ort::session::builder::GraphOptimizationLevel;
use ort::session::run_options::{OutputSelector, RunOptions};
use ort::session::{Session, SessionInputValue};
use ort::value::Tensor;
use parking_lot::Mutex;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub const MODEL_NAME: &str = "vit-gpt2-caption-onnx";

#[derive(Debug, Clone)]
pub struct CaptionEngineOptions {
    pub model_dir: Option<String>,
    pub encoder_file: String,
    pub decoder_file: String,
    pub vocab_file: String,
    pub intra_threads: usize,
    pub max_steps: usize,
    pub bos_id: i64,
    pub eos_id: i64,
    pub allow_ep_fallback: bool,
    pub ep_auto: bool,
    pub ep_coreml: bool,
    pub ep_cuda: bool,
    pub ep_rocm: bool,
    pub ep_directml: bool,
    pub ep_openvino: bool,
}

impl Default for CaptionEngineOptions {
    fn default() -> Self {
        Self {
            model_dir: None,
            encoder_file: "onnx/encoder_model.onnx".to_string(),
            decoder_file: "onnx/decoder_model.onnx".to_string(),
            vocab_file: "vocab.json".to_string(),
            intra_threads: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
                .max(1)
                .min(4),
            max_steps: 16,
            // The reference export uses one id for both markers.
            bos_id: 50256,
            eos_id: 50256,
            allow_ep_fallback: true,
            ep_auto: true,
            ep_coreml: cfg!(target_vendor = "apple"),
            ep_cuda: false,
            ep_rocm: false,
            ep_directml: false,
            ep_openvino: false,
        }
    }
}

/// Session input/output names discovered at load time. Exports do not order
/// their graph I/O consistently, so every run binds tensors by these names
/// instead of by position.
#[derive(Debug, Default, Clone)]
struct IoBindings {
    pixel_values: String,
    encoder_output: String,
    input_ids: String,
    logits: String,
    encoder_hidden_states: Option<String>,
    attention_mask: Option<String>,
    encoder_attention_mask: Option<String>,
}

pub struct CaptionEngine {
    encoder_path: PathBuf,
    decoder_path: PathBuf,
    vocab_path: PathBuf,
    encoder: Option<Mutex<Session>>,
    decoder: Option<Mutex<Session>>,
    io: IoBindings,
    vocab: Vocabulary,
    bos_id: i64,
    eos_id: i64,
    max_steps: usize,
    model_load_ms: u128,
    eps_log: String,
    load_log: String,
}

pub struct CaptionOutcome {
    pub caption: String,
    /// Generated ids, BOS excluded and any trailing EOS trimmed.
    pub token_ids: Vec<i64>,
    /// True when a step failure cut generation short of EOS/budget.
    pub truncated: bool,
    pub ready: bool,
    pub log: String,
    pub inference_ms: u128,
}

impl CaptionEngine {
    pub fn resolve_model_dir(override_dir: Option<&str>, encoder_file: &str) -> Result<PathBuf, CaptionError> {
        if let Some(raw) = override_dir {
            let p = PathBuf::from(raw);
            if p.join(encoder_file).exists() {
                return Ok(p);
            }
        }

        let cwd = std::env::current_dir().map_err(|e| CaptionError::Init(e.to_string()))?;
        let candidates = [
            cwd.join("models/vit-gpt2-caption-onnx"),
            cwd.join("../models/vit-gpt2-caption-onnx"),
            cwd.join("../../models/vit-gpt2-caption-onnx"),
        ];
        for c in candidates {
            if c.join(encoder_file).exists() {
                return Ok(c);
            }
        }

        Err(CaptionError::ModelDirNotFound)
    }

    pub fn new(opts: CaptionEngineOptions) -> Result<Self, CaptionError> {
        let dir = Self::resolve_model_dir(opts.model_dir.as_deref(), &opts.encoder_file)?;
        let encoder_path = dir.join(Path::new(&opts.encoder_file));
        let decoder_path = dir.join(Path::new(&opts.decoder_file));
        let vocab_path = dir.join(Path::new(&opts.vocab_file));

        // A builder that cannot even be constructed means the runtime itself
        // is unusable; nothing downstream can recover from that.
        let _ = Session::builder().map_err(|e| CaptionError::Init(e.to_string()))?;

        let mut opts_try = opts.clone();
        let intra_threads = opts_try.intra_threads.max(1);
        let mut load_log = String::new();

        let started = std::time::Instant::now();
        let encoder = match build_session_with_retry(&encoder_path, &mut opts_try, intra_threads) {
            Ok(s) => Some(s),
            Err(e) => {
                let err = CaptionError::ModelLoad {
                    which: "encoder",
                    message: e.to_string(),
                };
                warn!("caption: {err}");
                let _ = writeln!(load_log, "{err}");
                None
            }
        };
        let decoder = match build_session_with_retry(&decoder_path, &mut opts_try, intra_threads) {
            Ok(s) => Some(s),
            Err(e) => {
                let err = CaptionError::ModelLoad {
                    which: "decoder",
                    message: e.to_string(),
                };
                warn!("caption: {err}");
                let _ = writeln!(load_log, "{err}");
                None
            }
        };
        let model_load_ms = started.elapsed().as_millis();
        let (_, eps_log) = build_execution_providers(&opts_try);

        let mut io = IoBindings::default();
        if let Some(session) = &encoder {
            resolve_encoder_io(session, &mut io, &mut load_log);
        }
        if let Some(session) = &decoder {
            resolve_decoder_io(session, &mut io, &mut load_log);
        }

        let vocab = Vocabulary::load(&vocab_path);
        if vocab.is_empty() {
            let _ = writeln!(
                load_log,
                "vocabulary empty or missing at {}; ids will render as placeholders",
                vocab_path.display()
            );
        }

        debug!(
            "caption: loaded models in {}ms (encoder={} decoder={} vocab={} tokens) eps={}",
            model_load_ms,
            encoder.is_some(),
            decoder.is_some(),
            vocab.len(),
            eps_log
        );

        Ok(Self {
            encoder_path,
            decoder_path,
            vocab_path,
            encoder: encoder.map(Mutex::new),
            decoder: decoder.map(Mutex::new),
            io,
            vocab,
            bos_id: opts.bos_id,
            eos_id: opts.eos_id,
            max_steps: opts.max_steps,
            model_load_ms,
            eps_log,
            load_log,
        })
    }

    pub fn is_ready(&self) -> bool {
        self.encoder.is_some() && self.decoder.is_some()
    }

    /// Captions an image file. Only an unreadable image is a hard error;
    /// every model-side failure is reported through the outcome log instead.
    pub fn caption_file(&self, path: &Path) -> Result<CaptionOutcome, CaptionError> {
        let pre = preprocess_image(path)?;
        let mut outcome = self.caption_tensor(&pre.nchw);
        outcome.log.insert_str(
            0,
            &format!(
                "source_size: {}x{}\n",
                pre.source_width, pre.source_height
            ),
        );
        Ok(outcome)
    }

    /// Runs the encoder pass and the greedy decode loop over a preprocessed
    /// `[1, 3, 224, 224]` tensor. Never fails outright: each stage checks its
    /// predecessor and records failures in the returned log, and a partial
    /// token sequence still yields a best-effort caption.
    pub fn caption_tensor(&self, nchw: &[f32]) -> CaptionOutcome {
        let started = std::time::Instant::now();
        let mut log = String::new();
        let mut ready = self.is_ready();
        let _ = writeln!(log, "engine: {MODEL_NAME}");
        let _ = writeln!(log, "encoder_model: {}", self.encoder_path.display());
        let _ = writeln!(log, "decoder_model: {}", self.decoder_path.display());
        let _ = writeln!(
            log,
            "vocab_path: {} ({} tokens)",
            self.vocab_path.display(),
            self.vocab.len()
        );
        let _ = writeln!(log, "execution_providers: {}", self.eps_log);
        let _ = writeln!(log, "model_load_ms: {}", self.model_load_ms);
        log.push_str(&self.load_log);

        let mut sequence = vec![self.bos_id];
        let mut truncated = false;

        'infer: {
            let Some(encoder) = &self.encoder else {
                let _ = writeln!(log, "encoder unavailable, inference skipped");
                ready = false;
                break 'infer;
            };

            let (feat_shape, features) = {
                let mut session = encoder.lock();
                match run_encoder(&mut session, &self.io, nchw) {
                    Ok(v) => v,
                    Err(e) => {
                        let _ = writeln!(log, "encoder failed: {e}");
                        ready = false;
                        break 'infer;
                    }
                }
            };
            let _ = writeln!(log, "Encoder OK (features {:?})", feat_shape);

            let Some(decoder) = &self.decoder else {
                let _ = writeln!(log, "decoder unavailable, generation skipped");
                ready = false;
                break 'infer;
            };

            let feat_dims: Vec<usize> = feat_shape.iter().map(|d| *d as usize).collect();
            let features_tensor = match Tensor::from_array((feat_dims, features)) {
                Ok(t) => t,
                Err(e) => {
                    let _ = writeln!(log, "failed to build encoder_hidden_states tensor: {e}");
                    ready = false;
                    break 'infer;
                }
            };

            // All-ones mask over the encoder sequence, reused every step.
            // Optional: a failure here only drops the mask from the run.
            let enc_seq = if feat_shape.len() >= 2 {
                feat_shape[1].max(1) as usize
            } else {
                1
            };
            let enc_mask_tensor = if self.io.encoder_attention_mask.is_some() {
                match ones_tensor(enc_seq) {
                    Ok(t) => Some(t),
                    Err(e) => {
                        let _ = writeln!(log, "encoder_attention_mask skipped: {e}");
                        None
                    }
                }
            } else {
                None
            };

            let mut session = decoder.lock();
            let mut step_notes: Vec<String> = Vec::new();
            let (seq, trunc) = greedy_decode(
                self.bos_id,
                self.eos_id,
                self.max_steps,
                |seq| {
                    decoder_step(
                        &mut session,
                        &self.io,
                        seq,
                        &features_tensor,
                        enc_mask_tensor.as_ref(),
                        &mut step_notes,
                    )
                },
                &mut log,
            );
            drop(session);
            for note in step_notes {
                let _ = writeln!(log, "{note}");
            }
            sequence = seq;
            truncated = trunc;
            let _ = writeln!(log, "generated {} token(s)", sequence.len() - 1);
        }

        let caption = self.vocab.detokenize(&sequence[1..], self.eos_id);
        let _ = writeln!(log, "{}", caption_line(&caption));
        let inference_ms = started.elapsed().as_millis();
        let _ = writeln!(log, "caption_infer_ms: {inference_ms}");

        let mut token_ids: Vec<i64> = sequence[1..].to_vec();
        if token_ids.last() == Some(&self.eos_id) {
            token_ids.pop();
        }

        CaptionOutcome {
            caption,
            token_ids,
            truncated,
            ready,
            log,
            inference_ms,
        }
    }
}

/// One greedy step per iteration until EOS or the step budget: the next token
/// is the argmax of the step's logits row (ties toward the lowest id). A step
/// failure keeps the partial sequence and marks the run truncated.
fn greedy_decode<F>(
    bos_id: i64,
    eos_id: i64,
    max_steps: usize,
    mut step: F,
    log: &mut String,
) -> (Vec<i64>, bool)
where
    F: FnMut(&[i64]) -> Result<(Vec<i64>, Vec<f32>), CaptionError>,
{
    let mut sequence = vec![bos_id];
    let mut truncated = false;
    for step_idx in 0..max_steps {
        let (shape, data) = match step(&sequence) {
            Ok(v) => v,
            Err(e) => {
                let _ = writeln!(log, "decode step {step_idx} failed: {e}; keeping partial sequence");
                truncated = true;
                break;
            }
        };
        let row = match select_logits_row(&shape, &data) {
            Ok(r) => r,
            Err(e) => {
                let _ = writeln!(log, "decode step {step_idx} halted: {e}");
                truncated = true;
                break;
            }
        };
        let Some(next) = argmax(row) else {
            let _ = writeln!(log, "decode step {step_idx} halted: empty logits row");
            truncated = true;
            break;
        };
        let next = next as i64;
        sequence.push(next);
        if next == eos_id {
            debug!("caption: eos at step {step_idx}");
            break;
        }
    }
    (sequence, truncated)
}

/// Accepts rank 3 `[1, seq, vocab]` (row at seq-1) and rank 2 `[1, vocab]`
/// logits; anything else is a shape mismatch.
fn select_logits_row<'a>(shape: &[i64], data: &'a [f32]) -> Result<&'a [f32], CaptionError> {
    match shape.len() {
        3 => {
            let seq = shape[1] as usize;
            let vocab = shape[2] as usize;
            if seq == 0 || vocab == 0 || data.len() < seq * vocab {
                return Err(CaptionError::ShapeMismatch {
                    shape: shape.to_vec(),
                });
            }
            Ok(&data[(seq - 1) * vocab..seq * vocab])
        }
        2 => {
            let vocab = shape[1] as usize;
            if vocab == 0 || data.len() < vocab {
                return Err(CaptionError::ShapeMismatch {
                    shape: shape.to_vec(),
                });
            }
            Ok(&data[..vocab])
        }
        _ => Err(CaptionError::ShapeMismatch {
            shape: shape.to_vec(),
        }),
    }
}

fn caption_line(caption: &str) -> String {
    if caption.is_empty() {
        "Caption: <empty>".to_string()
    } else {
        format!("Caption: {caption}")
    }
}

fn run_encoder(
    session: &mut Session,
    io: &IoBindings,
    nchw: &[f32],
) -> Result<(Vec<i64>, Vec<f32>), CaptionError> {
    let size = SIZE as usize;
    let pixel = Array4::<f32>::from_shape_vec((1, 3, size, size), nchw.to_vec()).map_err(|e| {
        CaptionError::Tensor {
            name: "pixel_values",
            message: e.to_string(),
        }
    })?;
    let pixel_tensor = Tensor::from_array(pixel).map_err(|e| CaptionError::Tensor {
        name: "pixel_values",
        message: e.to_string(),
    })?;

    let run_opts = RunOptions::new()?
        .with_outputs(OutputSelector::no_default().with(io.encoder_output.as_str()));
    let outputs = session.run_with_options(
        ort::inputs![io.pixel_values.as_str() => &pixel_tensor],
        &run_opts,
    )?;
    let out = outputs
        .iter()
        .next()
        .map(|(_, v)| v)
        .ok_or_else(|| CaptionError::Inference {
            stage: "encoder",
            message: "missing feature output".to_string(),
        })?;
    let (shape, data) = out.try_extract_tensor::<f32>()?;
    if data.is_empty() {
        return Err(CaptionError::Inference {
            stage: "encoder",
            message: "empty feature tensor".to_string(),
        });
    }
    Ok((shape.to_vec(), data.to_vec()))
}

fn decoder_step(
    session: &mut Session,
    io: &IoBindings,
    sequence: &[i64],
    features: &Tensor<f32>,
    enc_mask: Option<&Tensor<i64>>,
    notes: &mut Vec<String>,
) -> Result<(Vec<i64>, Vec<f32>), CaptionError> {
    let len = sequence.len();
    let ids = Array2::<i64>::from_shape_vec((1, len), sequence.to_vec()).map_err(|e| {
        CaptionError::Tensor {
            name: "input_ids",
            message: e.to_string(),
        }
    })?;
    let ids_tensor = Tensor::from_array(ids).map_err(|e| CaptionError::Tensor {
        name: "input_ids",
        message: e.to_string(),
    })?;

    let mask_tensor = if io.attention_mask.is_some() {
        match ones_tensor(len) {
            Ok(t) => Some(t),
            Err(e) => {
                notes.push(format!("attention_mask skipped: {e}"));
                None
            }
        }
    } else {
        None
    };

    let mut inputs: Vec<(&str, SessionInputValue)> =
        vec![(io.input_ids.as_str(), (&ids_tensor).into())];
    if let Some(name) = &io.encoder_hidden_states {
        inputs.push((name.as_str(), features.into()));
    }
    if let (Some(name), Some(t)) = (&io.attention_mask, &mask_tensor) {
        inputs.push((name.as_str(), t.into()));
    }
    if let (Some(name), Some(t)) = (&io.encoder_attention_mask, enc_mask) {
        inputs.push((name.as_str(), t.into()));
    }

    let run_opts =
        RunOptions::new()?.with_outputs(OutputSelector::no_default().with(io.logits.as_str()));
    let outputs = session.run_with_options(inputs, &run_opts)?;
    let out = outputs
        .iter()
        .next()
        .map(|(_, v)| v)
        .ok_or_else(|| CaptionError::Inference {
            stage: "decoder",
            message: "missing logits output".to_string(),
        })?;
    let (shape, data) = out.try_extract_tensor::<f32>()?;
    Ok((shape.to_vec(), data.to_vec()))
}

fn ones_tensor(len: usize) -> Result<Tensor<i64>, CaptionError> {
    let ones = Array2::<i64>::from_shape_vec((1, len), vec![1i64; len]).map_err(|e| {
        CaptionError::Tensor {
            name: "attention_mask",
            message: e.to_string(),
        }
    })?;
    Tensor::from_array(ones).map_err(|e| CaptionError::Tensor {
        name: "attention_mask",
        message: e.to_string(),
    })
}

fn resolve_encoder_io(session: &Session, io: &mut IoBindings, log: &mut String) {
    let mut pixel = None::<String>;
    for input in &session.inputs {
        let lower = input.name.to_lowercase();
        if pixel.is_none() && (lower.contains("pixel_values") || lower.contains("pixel")) {
            pixel = Some(input.name.clone());
        }
    }
    io.pixel_values = match pixel {
        Some(name) => name,
        None => {
            let first = session
                .inputs
                .first()
                .map(|i| i.name.clone())
                .unwrap_or_default();
            let _ = writeln!(
                log,
                "encoder does not declare pixel_values; falling back to first input \"{first}\""
            );
            first
        }
    };
    io.encoder_output = pick_output_name(
        session,
        &["last_hidden_state", "encoder_hidden_states", "hidden_states"],
    );
}

fn resolve_decoder_io(session: &Session, io: &mut IoBindings, log: &mut String) {
    let mut input_ids = None::<String>;
    let mut hidden = None::<String>;
    let mut mask = None::<String>;
    let mut enc_mask = None::<String>;
    for input in &session.inputs {
        let name = input.name.as_str();
        let lower = name.to_lowercase();
        if input_ids.is_none() && (lower.contains("input_ids") || lower == "input") {
            input_ids = Some(name.to_string());
        } else if enc_mask.is_none() && lower.contains("encoder_attention_mask") {
            enc_mask = Some(name.to_string());
        } else if hidden.is_none() && lower.contains("encoder_hidden") {
            hidden = Some(name.to_string());
        } else if mask.is_none() && lower.contains("attention_mask") {
            mask = Some(name.to_string());
        }
    }
    io.input_ids = match input_ids {
        Some(name) => name,
        None => {
            let first = session
                .inputs
                .first()
                .map(|i| i.name.clone())
                .unwrap_or_default();
            let _ = writeln!(
                log,
                "decoder does not declare input_ids; falling back to first input \"{first}\""
            );
            first
        }
    };
    if hidden.is_none() {
        let _ = writeln!(log, "decoder does not declare encoder_hidden_states; omitting");
    }
    io.encoder_hidden_states = hidden;
    io.attention_mask = mask;
    io.encoder_attention_mask = enc_mask;
    io.logits = pick_output_name(session, &["logits"]);
}

fn pick_output_name(session: &Session, priorities: &[&str]) -> String {
    for p in priorities {
        if let Some(o) = session.outputs.iter().find(|o| {
            o.name.eq_ignore_ascii_case(p) || o.name.to_lowercase().contains(&p.to_lowercase())
        }) {
            return o.name.clone();
        }
    }
    session
        .outputs
        .first()
        .map(|o| o.name.clone())
        .unwrap_or_default()
}

fn build_session(
    path: &Path,
    opts: &CaptionEngineOptions,
    intra_threads: usize,
) -> Result<Session, ort::Error> {
    let builder = Session::builder()?
        .with_optimization_level(GraphOptimizationLevel::Level3)?
        .with_intra_threads(intra_threads)?;

    let (eps, _) = build_execution_providers(opts);
    let builder = match builder.with_execution_providers(eps) {
        Ok(b) => b,
        Err(e) => {
            warn!("caption: failed to apply execution providers (fallback to CPU). err={e}");
            Session::builder()?
                .with_optimization_level(GraphOptimizationLevel::Level3)?
                .with_intra_threads(intra_threads)?
        }
    };

    builder.commit_from_file(path)
}

fn build_session_with_retry(
    path: &Path,
    opts_try: &mut CaptionEngineOptions,
    intra_threads: usize,
) -> Result<Session, ort::Error> {
    loop {
        match build_session(path, opts_try, intra_threads) {
            Ok(s) => return Ok(s),
            Err(e) => {
                if opts_try.allow_ep_fallback && opts_try.ep_auto && opts_try.ep_coreml {
                    warn!(
                        "caption: session build failed with CoreML enabled, retrying without CoreML. err={e}"
                    );
                    opts_try.ep_coreml = false;
                    continue;
                }
                return Err(e);
            }
        }
    }
}

fn provider_cap(ep: &impl ExecutionProvider) -> (bool, bool) {
    let supported = ep.supported_by_platform();
    let available = if supported {
        ep.is_available().unwrap_or(false)
    } else {
        false
    };
    (supported, available)
}

fn build_execution_providers(
    opts: &CaptionEngineOptions,
) -> (Vec<ExecutionProviderDispatch>, String) {
    let mut eps: Vec<ExecutionProviderDispatch> = Vec::new();
    let mut enabled: Vec<&'static str> = Vec::new();

    if opts.ep_auto {
        if opts.ep_coreml {
            // MLProgram covers more operators than NeuralNetwork for
            // transformer-style graphs on modern macOS.
            let ep = CoreMLExecutionProvider::default()
                .with_model_format(CoreMLModelFormat::MLProgram)
                .with_static_input_shapes(false);
            let (supported, available) = provider_cap(&ep);
            if supported && available {
                eps.push(ep.build());
                enabled.push("coreml");
            }
        }
        if opts.ep_cuda {
            let ep = CUDAExecutionProvider::default();
            let (supported, available) = provider_cap(&ep);
            if supported && available {
                eps.push(ep.build());
                enabled.push("cuda");
            }
        }
        if opts.ep_rocm {
            let ep = ROCmExecutionProvider::default();
            let (supported, available) = provider_cap(&ep);
            if supported && available {
                eps.push(ep.build());
                enabled.push("rocm");
            }
        }
        if opts.ep_directml {
            let ep = DirectMLExecutionProvider::default();
            let (supported, available) = provider_cap(&ep);
            if supported && available {
                eps.push(ep.build());
                enabled.push("directml");
            }
        }
        if opts.ep_openvino {
            let ep = OpenVINOExecutionProvider::default();
            let (supported, available) = provider_cap(&ep);
            if supported && available {
                eps.push(ep.build());
                enabled.push("openvino");
            }
        }
    }

    // Always include CPU as last fallback.
    eps.push(CPUExecutionProvider::default().build());
    if enabled.is_empty() {
        (eps, "cpu".to_string())
    } else {
        (eps, format!("{}+cpu", enabled.join("+")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logits_row_rank3_takes_last_position() {
        let shape = vec![1i64, 3, 5];
        let data: Vec<f32> = (0..15).map(|v| v as f32).collect();
        let row = select_logits_row(&shape, &data).unwrap();
        assert_eq!(row, &[10.0, 11.0, 12.0, 13.0, 14.0]);
    }

    #[test]
    fn logits_row_rank2_is_the_row() {
        let shape = vec![1i64, 4];
        let data = vec![0.5f32, 1.5, -1.0, 0.0];
        let row = select_logits_row(&shape, &data).unwrap();
        assert_eq!(row, &data[..]);
    }

    #[test]
    fn logits_row_other_ranks_are_mismatches() {
        let data = vec![0.0f32; 8];
        assert!(matches!(
            select_logits_row(&[8], &data),
            Err(CaptionError::ShapeMismatch { .. })
        ));
        assert!(matches!(
            select_logits_row(&[1, 2, 2, 2], &data),
            Err(CaptionError::ShapeMismatch { .. })
        ));
        // Declared shape larger than the buffer.
        assert!(matches!(
            select_logits_row(&[1, 3, 5], &data),
            Err(CaptionError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn greedy_stops_within_step_budget() {
        // Argmax is always token 2, EOS is 0: only the budget can stop it.
        let mut calls = 0usize;
        let mut log = String::new();
        let (seq, truncated) = greedy_decode(
            1,
            0,
            16,
            |_| {
                calls += 1;
                Ok((vec![1, 4], vec![0.0, 0.1, 0.9, 0.2]))
            },
            &mut log,
        );
        assert_eq!(calls, 16);
        assert_eq!(seq.len(), 17);
        assert!(seq[1..].iter().all(|&t| t == 2));
        assert!(!truncated);
    }

    #[test]
    fn greedy_terminates_on_eos_as_first_prediction() {
        // BOS == EOS == 0: the loop compares the appended token, so an
        // immediate 0 ends generation with an empty sequence body.
        let mut log = String::new();
        let (seq, truncated) = greedy_decode(
            0,
            0,
            3,
            |_| Ok((vec![1, 1, 4], vec![0.9, 0.1, 0.0, 0.2])),
            &mut log,
        );
        assert_eq!(seq, vec![0, 0]);
        assert!(!truncated);
    }

    #[test]
    fn greedy_keeps_partial_sequence_on_step_failure() {
        let mut calls = 0usize;
        let mut log = String::new();
        let (seq, truncated) = greedy_decode(
            1,
            0,
            16,
            |_| {
                calls += 1;
                if calls == 3 {
                    Err(CaptionError::Inference {
                        stage: "decoder",
                        message: "boom".to_string(),
                    })
                } else {
                    Ok((vec![1, 4], vec![0.0, 0.1, 0.9, 0.2]))
                }
            },
            &mut log,
        );
        assert_eq!(seq, vec![1, 2, 2]);
        assert!(truncated);
        assert!(log.contains("decode step 2 failed"));
    }

    #[test]
    fn greedy_halts_on_shape_mismatch() {
        let mut log = String::new();
        let (seq, truncated) = greedy_decode(
            1,
            0,
            16,
            |_| Ok((vec![4], vec![0.0, 0.1, 0.9, 0.2])),
            &mut log,
        );
        assert_eq!(seq, vec![1]);
        assert!(truncated);
        assert!(log.contains("halted"));
    }

    #[test]
    fn greedy_ties_break_toward_lowest_id() {
        let mut log = String::new();
        let (seq, _) = greedy_decode(
            1,
            0,
            1,
            |_| Ok((vec![1, 3, 5], vec![
                0.0, 0.0, 0.0, 0.0, 0.0, //
                0.0, 0.0, 0.0, 0.0, 0.0, //
                0.1, 0.9, 0.2, 0.9, 0.05,
            ])),
            &mut log,
        );
        assert_eq!(seq, vec![1, 1]);
    }

    #[test]
    fn caption_line_marks_empty_output() {
        assert_eq!(caption_line(""), "Caption: <empty>");
        assert_eq!(caption_line("a dog"), "Caption: a dog");
    }
}
