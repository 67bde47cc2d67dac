//! Local delivery targets.
//!
//! A sink is a folder plus a message-type filter and an optional
//! post-delivery hook. Files are written to a temp file inside the target
//! folder and moved into place with a no-clobber rename, so a reader never
//! sees a partial file and an existing delivery is never overwritten.

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::Stdio;

use tempfile::NamedTempFile;
use tokio::process::Command;
use tracing::{debug, info};

use crate::envelope::MessageListEntry;
use crate::error::SyncError;
use crate::ops::GetContent;

/// Fetched message body, ready to be written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub data: Vec<u8>,
    /// File extension without the dot.
    pub extension: String,
}

impl Delivery {
    pub fn from_content(content: GetContent) -> Self {
        match content {
            GetContent::Xml(xml) => Self {
                data: xml.into_bytes(),
                extension: "xml".to_string(),
            },
            GetContent::Binary {
                data, file_name, ..
            } => {
                let extension = Path::new(&file_name)
                    .extension()
                    .map(|e| sanitize(&e.to_string_lossy()))
                    .filter(|e| !e.is_empty())
                    .unwrap_or_else(|| "bin".to_string());
                Self { data, extension }
            }
        }
    }
}

/// Replace anything outside `[A-Za-z0-9._-]` with `_`.
fn sanitize(s: &str) -> String {
    s.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Target file stem: `<type>_<messageIdentification>[_v<version>]_<code>`.
pub fn delivery_stem(entry: &MessageListEntry) -> String {
    let version = entry
        .version
        .as_deref()
        .map(|v| format!("_v{v}"))
        .unwrap_or_default();
    sanitize(&format!(
        "{}_{}{}_{}",
        entry.message_type, entry.message_identification, version, entry.code
    ))
}

#[derive(Debug, Clone)]
pub struct Sink {
    folder: PathBuf,
    types: Vec<String>,
    hook: Option<PathBuf>,
}

impl Sink {
    pub fn new(folder: impl Into<PathBuf>) -> Self {
        Self {
            folder: folder.into(),
            types: Vec::new(),
            hook: None,
        }
    }

    /// Restrict to these message types. Empty accepts everything.
    pub fn with_types(mut self, types: Vec<String>) -> Self {
        self.types = types;
        self
    }

    pub fn with_hook(mut self, hook: Option<PathBuf>) -> Self {
        self.hook = hook;
        self
    }

    pub fn folder(&self) -> &Path {
        &self.folder
    }

    pub fn accepts(&self, message_type: &str) -> bool {
        self.types.is_empty() || self.types.iter().any(|t| t == message_type)
    }

    /// A file already delivered under `stem`, whatever its extension.
    pub fn existing_delivery(&self, stem: &str) -> Option<PathBuf> {
        let pattern = format!(
            "{}/{}.*",
            glob::Pattern::escape(&self.folder.to_string_lossy()),
            glob::Pattern::escape(stem)
        );
        glob::glob(&pattern)
            .ok()?
            .filter_map(|entry| entry.ok())
            .find(|path| path.is_file())
    }

    /// Write `delivery` as `<stem>.<extension>`.
    ///
    /// Returns `Ok(None)` when the target appeared in the meantime.
    pub async fn deliver(&self, stem: &str, delivery: &Delivery) -> Result<Option<PathBuf>, SyncError> {
        let target = self.folder.join(format!("{stem}.{}", delivery.extension));
        let folder = self.folder.clone();
        let data = delivery.data.clone();
        let path = target.clone();

        let written = tokio::task::spawn_blocking(move || write_new(&folder, &path, &data))
            .await
            .map_err(|e| SyncError::Deliver {
                path: target.clone(),
                source: io::Error::other(e),
            })?;

        match written {
            Ok(()) => {
                info!(path = %target.display(), bytes = delivery.data.len(), "Delivered");
                Ok(Some(target))
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                debug!(path = %target.display(), "Target already exists");
                Ok(None)
            }
            Err(source) => Err(SyncError::Deliver {
                path: target,
                source,
            }),
        }
    }

    /// Run the post-delivery hook, if any, with the file and its type.
    pub async fn run_hook(&self, path: &Path, message_type: &str) -> Result<(), SyncError> {
        let Some(hook) = &self.hook else {
            return Ok(());
        };

        let hook_error = |reason: String| SyncError::Hook {
            command: hook.clone(),
            reason,
        };

        let output = Command::new(hook)
            .arg(path)
            .arg(message_type)
            .env("MEXSYNC_FILE", path)
            .env("MEXSYNC_TYPE", message_type)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| hook_error(format!("failed to spawn: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(hook_error(format!("{}: {}", output.status, stderr.trim())));
        }
        debug!(hook = %hook.display(), path = %path.display(), "Hook finished");
        Ok(())
    }
}

/// Atomic create-new: temp file in the target folder, then a rename that
/// fails if the target exists.
fn write_new(folder: &Path, target: &Path, data: &[u8]) -> io::Result<()> {
    std::fs::create_dir_all(folder)?;
    let mut temp = NamedTempFile::new_in(folder)?;
    temp.write_all(data)?;
    temp.as_file().sync_all()?;
    temp.persist_noclobber(target).map_err(|e| e.error)?;
    Ok(())
}
