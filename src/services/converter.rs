use std::io::Write;
use std::path::Path;

use async_trait::async_trait;
use tokio::process::Command;

/// Source formats the conversion engine understands.
pub const SUPPORTED_EXTENSIONS: &[&str] = &[
    // Documents
    ".pdf", ".docx", ".doc", ".pptx", ".ppt", ".xlsx", ".xls",
    // Images
    ".png", ".jpg", ".jpeg", ".gif", ".bmp", ".tiff", ".webp",
    // Audio
    ".mp3", ".wav", ".m4a", ".flac",
    // Other
    ".html", ".htm", ".csv", ".json", ".xml", ".txt", ".zip", ".epub",
];

/// Lower-cased extension of `filename`, including the leading dot.
pub fn file_extension(filename: &str) -> Option<String> {
    Path::new(filename)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| format!(".{}", ext.to_ascii_lowercase()))
}

pub fn is_supported(filename: &str) -> bool {
    file_extension(filename).is_some_and(|ext| SUPPORTED_EXTENSIONS.contains(&ext.as_str()))
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ConvertOptions {
    pub extract_images: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum ConversionError {
    #[error("Unsupported file type: {0}")]
    Unsupported(String),

    #[error("Conversion engine could not be started: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("Conversion engine exited with {status}: {stderr}")]
    Failed { status: String, stderr: String },

    #[error("Conversion produced non UTF-8 output")]
    NotUtf8(#[from] std::string::FromUtf8Error),

    #[error("Conversion produced no content")]
    Empty,

    #[error("Scratch file error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Conversion task aborted: {0}")]
    Aborted(String),
}

/// External file → markdown engine.
///
/// Dropping the returned future must abandon the conversion, including any
/// process it started, so a timed-out attempt leaves nothing behind.
#[async_trait]
pub trait Converter: Send + Sync {
    async fn convert(&self, path: &Path, options: ConvertOptions)
        -> Result<String, ConversionError>;
}

/// Runs a command-line converter (`markitdown <file>` by default) and reads
/// markdown from its stdout. The child is killed if the conversion is dropped
/// before it exits.
pub struct CommandConverter {
    program: String,
    args: Vec<String>,
    image_flag: Option<String>,
}

impl CommandConverter {
    /// `command` is split on whitespace: the first word is the program, the
    /// rest are passed before the input path.
    pub fn new(command: &str) -> Self {
        let mut words = command.split_whitespace().map(str::to_string);
        let program = words.next().unwrap_or_else(|| "markitdown".to_string());
        Self {
            program,
            args: words.collect(),
            image_flag: None,
        }
    }

    /// Extra argument passed when the job asks for embedded images.
    pub fn with_image_flag(mut self, flag: impl Into<String>) -> Self {
        self.image_flag = Some(flag.into());
        self
    }
}

#[async_trait]
impl Converter for CommandConverter {
    async fn convert(
        &self,
        path: &Path,
        options: ConvertOptions,
    ) -> Result<String, ConversionError> {
        let mut command = Command::new(&self.program);
        command.args(&self.args).kill_on_drop(true);
        if options.extract_images {
            if let Some(flag) = &self.image_flag {
                command.arg(flag);
            }
        }
        let output = command
            .arg(path)
            .output()
            .await
            .map_err(ConversionError::Spawn)?;

        if !output.status.success() {
            return Err(ConversionError::Failed {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let markdown = String::from_utf8(output.stdout)?;
        if markdown.trim().is_empty() {
            return Err(ConversionError::Empty);
        }
        Ok(markdown)
    }
}

/// Write `bytes` to a scratch file carrying `extension` and run the converter
/// on it. The file is removed once the conversion finishes or is dropped.
pub async fn convert_bytes(
    converter: &dyn Converter,
    bytes: Vec<u8>,
    extension: String,
    options: ConvertOptions,
) -> Result<String, ConversionError> {
    let scratch = tokio::task::spawn_blocking(move || {
        let mut scratch = tempfile::Builder::new()
            .prefix("mdconv-")
            .suffix(&extension)
            .tempfile()?;
        scratch.write_all(&bytes)?;
        scratch.flush()?;
        Ok::<_, ConversionError>(scratch)
    })
    .await
    .map_err(|e| ConversionError::Aborted(e.to_string()))??;

    converter.convert(scratch.path(), options).await
}
