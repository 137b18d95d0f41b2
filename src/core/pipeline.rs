use crate::core::caption::engine::MODEL_NAME;
use crate::core::caption::{CaptionEngine, CaptionEngineOptions, CaptionError, CaptionOutcome};
use crate::core::export::{write_report, write_sidecar};
use crate::core::model::{CaptionDetail, CaptionStatus, JobSummary, Settings};
use crate::core::scan::scan_sources;
use anyhow::{anyhow, Result};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

pub struct StartJobInput {
    pub source_root: PathBuf,
    pub export_root: PathBuf,
}

/// One engine is kept alive across requests and rebuilt only when the
/// settings that shape it change.
static CAPTION_ENGINE: Lazy<Mutex<Option<(String, Arc<CaptionEngine>)>>> =
    Lazy::new(|| Mutex::new(None));

fn engine_options(settings: &Settings) -> CaptionEngineOptions {
    CaptionEngineOptions {
        model_dir: settings.model_dir.clone(),
        encoder_file: settings.encoder_file.clone(),
        decoder_file: settings.decoder_file.clone(),
        vocab_file: settings.vocab_file.clone(),
        intra_threads: settings.intra_threads.max(1),
        max_steps: settings.max_steps.max(1),
        bos_id: settings.bos_id,
        eos_id: settings.eos_id,
        ep_auto: settings.ep_auto,
        ep_coreml: settings.ep_coreml,
        ep_cuda: settings.ep_cuda,
        ep_rocm: settings.ep_rocm,
        ep_directml: settings.ep_directml,
        ep_openvino: settings.ep_openvino,
        ..CaptionEngineOptions::default()
    }
}

pub fn get_caption_engine(settings: &Settings) -> Result<Arc<CaptionEngine>, CaptionError> {
    let opts = engine_options(settings);
    let key = format!(
        "dir={:?};enc={};dec={};vocab={};steps={};bos={};eos={};intra={};auto={};coreml={};cuda={};rocm={};directml={};openvino={}",
        opts.model_dir.as_deref().unwrap_or("<auto>"),
        opts.encoder_file,
        opts.decoder_file,
        opts.vocab_file,
        opts.max_steps,
        opts.bos_id,
        opts.eos_id,
        opts.intra_threads,
        opts.ep_auto,
        opts.ep_coreml,
        opts.ep_cuda,
        opts.ep_rocm,
        opts.ep_directml,
        opts.ep_openvino
    );
    let mut guard = CAPTION_ENGINE.lock();
    if let Some((k, eng)) = guard.as_ref() {
        if k == &key {
            return Ok(Arc::clone(eng));
        }
    }
    let eng = Arc::new(CaptionEngine::new(opts)?);
    *guard = Some((key, Arc::clone(&eng)));
    Ok(eng)
}

/// Captions one file with the shared engine. Used by the CLI single-file
/// mode; batch jobs go through [`run_job`].
pub fn caption_single(settings: &Settings, path: &Path) -> Result<CaptionOutcome> {
    let engine =
        get_caption_engine(settings).map_err(|e| anyhow!("caption engine init failed: {e}"))?;
    engine.caption_file(path).map_err(|e| anyhow!(e))
}

/// Sequential batch job: scan the source tree, caption each image in turn,
/// persist sidecars and the JSON report. Per-image failures become error
/// rows; only engine initialization failures abort the whole job.
pub fn run_job(settings: &Settings, input: &StartJobInput) -> Result<JobSummary> {
    if !input.source_root.exists() {
        return Err(anyhow!("source path not found"));
    }
    std::fs::create_dir_all(&input.export_root)?;
    let files = scan_sources(&input.source_root)?;
    let total = files.len();
    let job_started = std::time::Instant::now();

    let mut engine: Option<Arc<CaptionEngine>> = None;
    let mut results: Vec<CaptionDetail> = Vec::with_capacity(total);
    let mut errors = 0usize;
    let mut partial = 0usize;
    let mut infer_ms_total: u128 = 0;
    let mut infer_count: u64 = 0;

    for (idx, path) in files.iter().enumerate() {
        let file_name = path
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or("image")
            .to_string();
        info!("({}/{}) {}", idx + 1, total, file_name);

        // Models load on the first request, not at job start.
        let eng = match &engine {
            Some(e) => Arc::clone(e),
            None => {
                let e = get_caption_engine(settings)
                    .map_err(|e| anyhow!("caption engine init failed: {e}"))?;
                engine = Some(Arc::clone(&e));
                e
            }
        };

        let started = std::time::Instant::now();
        let mut detail = match process_one(&eng, path, &file_name) {
            Ok((detail, infer_ms)) => {
                infer_ms_total += infer_ms;
                infer_count += 1;
                detail
            }
            Err(e) => {
                warn!("caption failed for {}: {}", file_name, e);
                CaptionDetail {
                    file_name: file_name.clone(),
                    path: path.to_string_lossy().to_string(),
                    caption: None,
                    token_count: 0,
                    status: CaptionStatus::Error,
                    error_message: Some(e.to_string()),
                    analysis_log: None,
                    duration_ms: None,
                    model: MODEL_NAME.to_string(),
                }
            }
        };
        detail.duration_ms = Some(started.elapsed().as_millis() as i64);

        match detail.status {
            CaptionStatus::Error => errors += 1,
            CaptionStatus::Partial => partial += 1,
            CaptionStatus::Success => {}
        }

        if settings.sidecar_enabled {
            if let Some(caption) = detail.caption.as_deref() {
                if let Err(e) = write_sidecar(&input.export_root, &file_name, caption) {
                    warn!("sidecar write failed for {}: {}", file_name, e);
                }
            }
        }

        results.push(detail);
    }

    let elapsed = job_started.elapsed().as_secs_f64().max(0.001);
    let summary = JobSummary {
        total,
        processed: results.len(),
        errors,
        partial,
        elapsed_secs: elapsed,
    };
    let report_path = write_report(&input.export_root, &summary, &results)?;

    let ips = (total as f64) / elapsed;
    if infer_count > 0 {
        let avg = (infer_ms_total as f64) / (infer_count as f64);
        info!(
            "caption perf: images={} elapsed={:.2}s throughput={:.2} img/s avg_caption_infer_ms={:.1}",
            total, elapsed, ips, avg
        );
    } else {
        info!(
            "perf: images={} elapsed={:.2}s throughput={:.2} img/s",
            total, elapsed, ips
        );
    }
    info!("report: {}", report_path.display());

    Ok(summary)
}

fn process_one(
    engine: &CaptionEngine,
    path: &Path,
    file_name: &str,
) -> Result<(CaptionDetail, u128)> {
    let outcome = engine.caption_file(path)?;
    let status = if !outcome.ready {
        CaptionStatus::Error
    } else if outcome.truncated {
        CaptionStatus::Partial
    } else {
        CaptionStatus::Success
    };
    let error_message = if outcome.ready {
        None
    } else {
        Some("captioning pipeline not ready; see analysis log".to_string())
    };
    let infer_ms = outcome.inference_ms;
    let detail = CaptionDetail {
        file_name: file_name.to_string(),
        path: path.to_string_lossy().to_string(),
        caption: Some(outcome.caption),
        token_count: outcome.token_ids.len(),
        status,
        error_message,
        analysis_log: Some(outcome.log),
        duration_ms: None,
        model: MODEL_NAME.to_string(),
    };
    Ok((detail, infer_ms))
}
