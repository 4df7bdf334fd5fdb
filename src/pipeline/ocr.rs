use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};

use super::PipelineError;

/// OCR engine abstraction (allows mocking for tests).
///
/// Implementations must be callable concurrently from several runs.
pub trait OcrEngine: Send + Sync {
    /// Recognize text in an encoded image. Returns the raw, untrimmed text.
    fn ocr_image(&self, image_bytes: &[u8]) -> Result<String, PipelineError>;
}

/// Tesseract driven through its command-line executable.
///
/// The image is piped on stdin and text read from stdout, so no temp files
/// are involved and nothing is shared between concurrent calls.
pub struct TesseractCli {
    binary: PathBuf,
    lang: String,
}

impl TesseractCli {
    pub fn new(binary: &Path) -> Self {
        Self {
            binary: binary.to_path_buf(),
            lang: "eng".to_string(),
        }
    }

    /// Set language(s) for OCR (e.g., "eng", "eng+fra")
    pub fn with_languages(mut self, langs: &str) -> Self {
        self.lang = langs.to_string();
        self
    }

    /// Check the executable answers `--version`. Used at start-up.
    pub fn probe(&self) -> Result<String, PipelineError> {
        let output = Command::new(&self.binary)
            .arg("--version")
            .output()
            .map_err(|e| {
                PipelineError::OcrFailure(format!(
                    "Cannot run {}: {e}",
                    self.binary.display()
                ))
            })?;
        let text = String::from_utf8_lossy(&output.stdout);
        let banner = if text.trim().is_empty() {
            String::from_utf8_lossy(&output.stderr).into_owned()
        } else {
            text.into_owned()
        };
        Ok(banner.lines().next().unwrap_or_default().trim().to_string())
    }
}

impl OcrEngine for TesseractCli {
    fn ocr_image(&self, image_bytes: &[u8]) -> Result<String, PipelineError> {
        let mut child = Command::new(&self.binary)
            .args(["stdin", "stdout", "-l", self.lang.as_str()])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                PipelineError::OcrFailure(format!(
                    "Cannot start {}: {e}",
                    self.binary.display()
                ))
            })?;

        // Tesseract reads the whole image before writing anything back.
        feed_stdin(&mut child, image_bytes)?;

        let output = child
            .wait_with_output()
            .map_err(|e| PipelineError::OcrFailure(format!("Waiting for OCR: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(PipelineError::OcrFailure(format!(
                "tesseract exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Write the image to the child's stdin. If the pipe breaks the child is
/// killed and reaped before the error is returned.
fn feed_stdin(child: &mut Child, bytes: &[u8]) -> Result<(), PipelineError> {
    let Some(mut stdin) = child.stdin.take() else {
        return Ok(());
    };
    if let Err(e) = stdin.write_all(bytes) {
        drop(stdin);
        let _ = child.kill();
        let _ = child.wait();
        return Err(PipelineError::OcrFailure(format!("Writing image to OCR: {e}")));
    }
    Ok(())
}

/// Mock OCR engine for unit testing without Tesseract.
pub struct MockOcrEngine {
    text: String,
    fail: bool,
}

impl MockOcrEngine {
    pub fn new(text: &str) -> Self {
        Self {
            text: text.to_string(),
            fail: false,
        }
    }

    pub fn failing() -> Self {
        Self {
            text: String::new(),
            fail: true,
        }
    }
}

impl OcrEngine for MockOcrEngine {
    fn ocr_image(&self, _image_bytes: &[u8]) -> Result<String, PipelineError> {
        if self.fail {
            return Err(PipelineError::OcrFailure("Mock OCR failure".into()));
        }
        Ok(self.text.clone())
    }
}
