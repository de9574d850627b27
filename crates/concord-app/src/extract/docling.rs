use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Instant;

use tokio::process::Command;

use super::{
    Capabilities, CandidateExtraction, ErrorKind, ExtractionOptions, Extractor, Precision, Speed,
};

const DOCLING_CONFIDENCE: f32 = 0.92;

/// Adapter around the Docling CLI. Availability means the binary resolves on
/// this host; extraction shells out and reads the produced Markdown back.
#[derive(Debug)]
pub struct DoclingExtractor {
    binary: PathBuf,
    version: String,
    available: bool,
}

impl DoclingExtractor {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        let binary = binary.into();
        let version = probe_version(&binary, &["--version"]);
        Self {
            available: version.is_some(),
            version: version.unwrap_or_else(|| "unknown".to_string()),
            binary,
        }
    }

    fn build_args(&self, file_path: &Path, out_dir: &Path, options: &ExtractionOptions) -> Vec<String> {
        let mut args = vec![
            file_path.display().to_string(),
            "--to".to_string(),
            "md".to_string(),
            "--output".to_string(),
            out_dir.display().to_string(),
        ];
        if !options.extract_tables {
            args.push("--no-table-structure".to_string());
        }
        if options.extract_images {
            args.push("--image-export-mode".to_string());
            args.push("referenced".to_string());
        }
        if options.extract_formulas {
            args.push("--enrich-formula".to_string());
        }
        for lang in &options.ocr_languages {
            args.push("--ocr-lang".to_string());
            args.push(lang.clone());
        }
        args
    }
}

#[async_trait::async_trait]
impl Extractor for DoclingExtractor {
    fn name(&self) -> &str {
        "docling"
    }

    fn version(&self) -> &str {
        &self.version
    }

    fn priority(&self) -> u8 {
        1
    }

    fn is_local(&self) -> bool {
        true
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            supports_tables: true,
            supports_formulas: true,
            supports_images: true,
            supports_ocr: true,
            precision: Precision::High,
            speed: Speed::Medium,
        }
    }

    fn is_available(&self) -> bool {
        self.available
    }

    async fn extract(&self, file_path: &Path, options: &ExtractionOptions) -> CandidateExtraction {
        let started = Instant::now();
        let out_dir = scratch_dir("docling");
        if let Err(source) = tokio::fs::create_dir_all(&out_dir).await {
            return CandidateExtraction::failure(
                self.name(),
                self.version(),
                ErrorKind::ExtractorError,
                format!("failed to create scratch dir: {source}"),
            );
        }

        let args = self.build_args(file_path, &out_dir, options);
        let run = Command::new(&self.binary)
            .args(&args)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await;

        let output = match run {
            Ok(output) => output,
            Err(source) => {
                return CandidateExtraction::failure(
                    self.name(),
                    self.version(),
                    ErrorKind::ExtractorError,
                    format!("failed to spawn {}: {source}", self.binary.display()),
                );
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return CandidateExtraction::failure(
                self.name(),
                self.version(),
                ErrorKind::ExtractorError,
                format!("docling exited with {}: {}", output.status, stderr.trim()),
            );
        }

        let markdown = match read_first_markdown(&out_dir).await {
            Some(markdown) => markdown,
            None => {
                return CandidateExtraction::failure(
                    self.name(),
                    self.version(),
                    ErrorKind::ExtractorError,
                    "docling produced no markdown output",
                );
            }
        };

        CandidateExtraction {
            extractor_name: self.name().to_string(),
            extractor_version: self.version().to_string(),
            markdown,
            blocks: Vec::new(),
            tables: Vec::new(),
            images: Vec::new(),
            confidence: DOCLING_CONFIDENCE,
            elapsed_ms: started.elapsed().as_millis() as u64,
            page_count: 0,
            success: true,
            error_kind: None,
            error_message: None,
        }
    }
}

pub(super) fn scratch_dir(prefix: &str) -> PathBuf {
    std::env::temp_dir().join(format!("concord-{prefix}-{}", uuid::Uuid::new_v4()))
}

pub(super) fn probe_version(binary: &Path, args: &[&str]) -> Option<String> {
    let output = std::process::Command::new(binary)
        .args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let line = String::from_utf8_lossy(&output.stdout);
    let trimmed = line.lines().next()?.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Find the first `.md` file under `dir` (depth-first), returning its content.
pub(super) async fn read_first_markdown(dir: &Path) -> Option<String> {
    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        let mut entries = tokio::fs::read_dir(&current).await.ok()?;
        let mut files = Vec::new();
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else {
                files.push(path);
            }
        }
        files.sort();
        for path in files {
            if path.extension().and_then(|e| e.to_str()) == Some("md") {
                return tokio::fs::read_to_string(&path).await.ok();
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_binary_is_unavailable() {
        let extractor = DoclingExtractor::new("/nonexistent/docling");
        assert!(!extractor.is_available());
        assert_eq!(extractor.version(), "unknown");
    }

    #[test]
    fn args_reflect_options() {
        let extractor = DoclingExtractor::new("/nonexistent/docling");
        let options = ExtractionOptions {
            extract_tables: false,
            extract_images: true,
            extract_formulas: true,
            ocr_languages: vec!["pl".to_string()],
        };
        let args = extractor.build_args(Path::new("in.pdf"), Path::new("/tmp/out"), &options);

        assert!(args.contains(&"--no-table-structure".to_string()));
        assert!(args.contains(&"--enrich-formula".to_string()));
        assert!(args.contains(&"--ocr-lang".to_string()));
        assert!(args.contains(&"pl".to_string()));
        assert_eq!(args[1], "--to");
        assert_eq!(args[2], "md");
    }

    #[tokio::test]
    async fn unavailable_binary_yields_failure_candidate() {
        let extractor = DoclingExtractor::new("/nonexistent/docling");
        let candidate = extractor
            .extract(Path::new("in.pdf"), &ExtractionOptions::default())
            .await;
        assert!(!candidate.success);
        assert_eq!(candidate.error_kind, Some(ErrorKind::ExtractorError));
    }

    #[tokio::test]
    async fn read_first_markdown_walks_nested_dirs() {
        let temp = tempfile::TempDir::new().expect("temp dir");
        let nested = temp.path().join("doc").join("auto");
        tokio::fs::create_dir_all(&nested).await.expect("mkdir");
        tokio::fs::write(nested.join("doc.md"), "# Title\n")
            .await
            .expect("write");

        let found = read_first_markdown(temp.path()).await.expect("markdown");
        assert_eq!(found, "# Title\n");
    }
}
