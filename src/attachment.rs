//! Image and text-file attachments for the next prompt.

use crate::error::ChatError;
use crate::models::chat::InlineImage;
use std::fs;
use std::path::{ Path, PathBuf };

pub const IMAGE_PLACEHOLDER_PREFIX: &str = "[Image attached:";
pub const DEFAULT_IMAGE_PROMPT: &str = "Describe or process the attached image.";
const IMAGE_EXTENSIONS: [&str; 4] = ["png", "jpg", "jpeg", "webp"];

/// An image waiting to be sent with the next prompt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingImage {
    pub path: PathBuf,
    pub image: InlineImage,
}

impl PendingImage {
    pub fn file_name(&self) -> String {
        file_name(&self.path)
    }

    /// Text shown in the input while the image is pending.
    pub fn placeholder(&self) -> String {
        format!("{} {}]", IMAGE_PLACEHOLDER_PREFIX, self.file_name())
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

pub fn image_mime_type(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_lowercase();
    if !IMAGE_EXTENSIONS.contains(&ext.as_str()) {
        return None;
    }
    Some(match ext.as_str() {
        "png" => "image/png",
        "webp" => "image/webp",
        _ => "image/jpeg",
    })
}

pub fn load_image(path: impl AsRef<Path>) -> Result<PendingImage, ChatError> {
    let path = path.as_ref();
    let mime_type = image_mime_type(path).ok_or_else(||
        ChatError::FileIo(
            format!("Unsupported image type: {} (use png, jpg, jpeg or webp)", path.display())
        )
    )?;
    let data = fs
        ::read(path)
        .map_err(|e| ChatError::FileIo(format!("Failed to process image: {}", e)))?;
    Ok(PendingImage {
        path: path.to_path_buf(),
        image: InlineImage { mime_type: mime_type.to_string(), data },
    })
}

/// Appends the content of a text file to the current prompt.
pub fn append_text_file(current_prompt: &str, path: impl AsRef<Path>) -> Result<String, ChatError> {
    let path = path.as_ref();
    let bytes = fs
        ::read(path)
        .map_err(|e| ChatError::FileIo(format!("Failed to read file content: {}", e)))?;
    let content = String::from_utf8_lossy(&bytes);
    let prompt = if current_prompt.starts_with(IMAGE_PLACEHOLDER_PREFIX) { "" } else { current_prompt };
    Ok(
        format!(
            "{}\n\n--- BEGIN CONTENT OF FILE '{}' ---\n{}\n--- END CONTENT OF FILE ---",
            prompt,
            file_name(path),
            content
        )
    )
}

/// Text actually sent for a prompt, given whether an image accompanies it.
pub fn effective_prompt_text(prompt: &str, has_image: bool) -> String {
    let prompt = prompt.trim();
    if has_image && (prompt.is_empty() || prompt.starts_with(IMAGE_PLACEHOLDER_PREFIX)) {
        return DEFAULT_IMAGE_PROMPT.to_string();
    }
    prompt.to_string()
}
