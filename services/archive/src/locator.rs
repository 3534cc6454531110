use crate::error::{ArchiveError, Result};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies one channel's recording stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordingLocator {
    root: String,
    device_id: String,
    channel_id: String,
}

impl RecordingLocator {
    /// Create a locator, rejecting empty or path-like identifiers.
    pub fn new(
        root: impl Into<String>,
        device_id: impl Into<String>,
        channel_id: impl Into<String>,
    ) -> Result<Self> {
        let root = root.into().trim_matches('/').to_string();
        let device_id = device_id.into();
        let channel_id = channel_id.into();

        if root.is_empty() {
            return Err(ArchiveError::InvalidLocator("archive root is empty".to_string()));
        }
        validate_component("device id", &device_id)?;
        validate_component("channel id", &channel_id)?;

        Ok(Self {
            root,
            device_id,
            channel_id,
        })
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    /// `root/device/channel`, no trailing slash.
    pub fn channel_prefix(&self) -> String {
        format!("{}/{}/{}", self.root, self.device_id, self.channel_id)
    }

    /// `root/device/channel/yyyyMMdd/`.
    pub fn day_prefix(&self, day: NaiveDate) -> String {
        format!("{}/{}/", self.channel_prefix(), day.format("%Y%m%d"))
    }

    /// Prefix matching every day of a month: `root/device/channel/yyyyMM`.
    pub fn month_prefix(&self, year: i32, month: u32) -> String {
        format!("{}/{:04}{:02}", self.channel_prefix(), year, month)
    }

    /// The same stream under a different archive root.
    pub fn with_root(&self, root: impl Into<String>) -> Result<Self> {
        Self::new(root, self.device_id.clone(), self.channel_id.clone())
    }
}

impl fmt::Display for RecordingLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.channel_prefix())
    }
}

fn validate_component(what: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(ArchiveError::InvalidLocator(format!("{what} is empty")));
    }
    if value.contains('/') || value == "." || value == ".." {
        return Err(ArchiveError::InvalidLocator(format!(
            "{what} '{value}' is not a single path component"
        )));
    }
    Ok(())
}
