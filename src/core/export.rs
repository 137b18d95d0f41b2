use crate::core::model::{CaptionDetail, JobSummary};
use anyhow::{anyhow, Result};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};

const REPORT_FILE: &str = "captions.json";

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Report<'a> {
    summary: &'a JobSummary,
    results: &'a [CaptionDetail],
}

/// Writes the batch report as pretty-printed JSON under `export_root`.
pub fn write_report(
    export_root: &Path,
    summary: &JobSummary,
    results: &[CaptionDetail],
) -> Result<PathBuf> {
    fs::create_dir_all(export_root)?;
    let path = export_root.join(REPORT_FILE);
    let report = Report { summary, results };
    fs::write(&path, serde_json::to_string_pretty(&report)?)?;
    Ok(path)
}

/// Writes a caption next to its image name as `<stem>.txt` under
/// `export_root`, appending a counter when the name is taken.
pub fn write_sidecar(export_root: &Path, image_name: &str, caption: &str) -> Result<PathBuf> {
    fs::create_dir_all(export_root)?;
    let stem = Path::new(image_name)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("image");
    let mut target = export_root.join(format!("{stem}.txt"));
    if target.exists() {
        let mut counter = 1;
        loop {
            let candidate = export_root.join(format!("{stem}_{counter}.txt"));
            if !candidate.exists() {
                target = candidate;
                break;
            }
            counter += 1;
            if counter > 9999 {
                return Err(anyhow!("too many duplicate sidecars for {}", image_name));
            }
        }
    }
    fs::write(&target, caption)?;
    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::CaptionStatus;

    fn detail(name: &str, caption: &str) -> CaptionDetail {
        CaptionDetail {
            file_name: name.to_string(),
            path: format!("/photos/{name}"),
            caption: Some(caption.to_string()),
            token_count: 2,
            status: CaptionStatus::Success,
            error_message: None,
            analysis_log: None,
            duration_ms: Some(5),
            model: "vit-gpt2-caption-onnx".to_string(),
        }
    }

    #[test]
    fn report_contains_summary_and_rows() {
        let dir = tempfile::tempdir().unwrap();
        let summary = JobSummary {
            total: 1,
            processed: 1,
            errors: 0,
            partial: 0,
            elapsed_secs: 0.5,
        };
        let results = vec![detail("a.jpg", "a dog")];
        let path = write_report(dir.path(), &summary, &results).unwrap();
        let content = fs::read_to_string(path).unwrap();
        assert!(content.contains("\"a dog\""));
        assert!(content.contains("\"processed\": 1"));
    }

    #[test]
    fn sidecars_avoid_collisions() {
        let dir = tempfile::tempdir().unwrap();
        let first = write_sidecar(dir.path(), "photo.jpg", "one").unwrap();
        let second = write_sidecar(dir.path(), "photo.png", "two").unwrap();
        assert_eq!(first.file_name().unwrap(), "photo.txt");
        assert_eq!(second.file_name().unwrap(), "photo_1.txt");
        assert_eq!(fs::read_to_string(second).unwrap(), "two");
    }
}
