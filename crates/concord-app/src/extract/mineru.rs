use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Instant;

use tokio::process::Command;

use super::docling::{probe_version, read_first_markdown, scratch_dir};
use super::{
    Capabilities, CandidateExtraction, ErrorKind, ExtractionOptions, Extractor, Precision, Speed,
};

const MINERU_CONFIDENCE: f32 = 0.88;

/// Adapter around the MinerU CLI (`mineru -p <input> -o <dir>`).
#[derive(Debug)]
pub struct MinerUExtractor {
    binary: PathBuf,
    version: String,
    available: bool,
}

impl MinerUExtractor {
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
            "-p".to_string(),
            file_path.display().to_string(),
            "-o".to_string(),
            out_dir.display().to_string(),
        ];
        if options.extract_formulas {
            args.push("--formula".to_string());
            args.push("true".to_string());
        }
        if options.extract_tables {
            args.push("--table".to_string());
            args.push("true".to_string());
        }
        if let Some(lang) = options.ocr_languages.first() {
            args.push("--lang".to_string());
            args.push(lang.clone());
        }
        args
    }
}

#[async_trait::async_trait]
impl Extractor for MinerUExtractor {
    fn name(&self) -> &str {
        "mineru"
    }

    fn version(&self) -> &str {
        &self.version
    }

    fn priority(&self) -> u8 {
        2
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
            precision: Precision::Medium,
            speed: Speed::Slow,
        }
    }

    fn is_available(&self) -> bool {
        self.available
    }

    async fn extract(&self, file_path: &Path, options: &ExtractionOptions) -> CandidateExtraction {
        let started = Instant::now();
        let out_dir = scratch_dir("mineru");
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
                format!("mineru exited with {}: {}", output.status, stderr.trim()),
            );
        }

        // MinerU writes `<out>/<stem>/auto/<stem>.md`; walk rather than guess.
        let markdown = match read_first_markdown(&out_dir).await {
            Some(markdown) => markdown,
            None => {
                return CandidateExtraction::failure(
                    self.name(),
                    self.version(),
                    ErrorKind::ExtractorError,
                    "mineru produced no markdown output",
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
            confidence: MINERU_CONFIDENCE,
            elapsed_ms: started.elapsed().as_millis() as u64,
            page_count: 0,
            success: true,
            error_kind: None,
            error_message: None,
        }
    }
}
