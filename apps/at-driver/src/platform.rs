use std::fmt;

use thiserror::Error;

/// Host platforms with a command module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    MacOs,
    Windows,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("No \"{module}\" module for platform \"{platform}\"")]
pub struct UnsupportedPlatform {
    pub module: &'static str,
    pub platform: String,
}

impl Platform {
    /// Resolve a platform name. Accepts both Rust (`macos`, `windows`) and
    /// Node-style (`darwin`, `win32`) spellings.
    pub fn from_name(name: &str) -> Result<Self, UnsupportedPlatform> {
        match name {
            "macos" | "darwin" => Ok(Platform::MacOs),
            "windows" | "win32" => Ok(Platform::Windows),
            other => Err(UnsupportedPlatform {
                module: "interaction",
                platform: other.to_string(),
            }),
        }
    }

    pub fn host() -> Result<Self, UnsupportedPlatform> {
        Self::from_name(std::env::consts::OS)
    }

    /// Name reported to clients as `platformName`.
    pub fn wire_name(self) -> &'static str {
        match self {
            Platform::MacOs => "macos",
            Platform::Windows => "win32",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wire_name())
    }
}
