//! Target platform type.

use crate::error::{KoError, Result};

/// An image target platform: `(os, architecture, variant?)` plus an
/// optional OS version.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Platform {
    pub os: String,
    pub architecture: String,
    pub variant: Option<String>,
    pub os_version: Option<String>,
}

impl Platform {
    pub fn new(os: &str, architecture: &str) -> Self {
        Platform {
            os: os.to_string(),
            architecture: architecture.to_string(),
            variant: None,
            os_version: None,
        }
    }

    pub fn with_variant(mut self, variant: &str) -> Self {
        self.variant = Some(variant.to_string());
        self
    }

    /// Parse `os/arch` or `os/arch/variant`.
    pub fn parse(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split('/').collect();
        match parts.as_slice() {
            [os, arch] => Ok(Platform::new(os, arch)),
            [os, arch, variant] => Ok(Platform::new(os, arch).with_variant(variant)),
            _ => Err(KoError::Platform(format!(
                "expected os/arch[/variant], got {:?}",
                s
            ))),
        }
    }

    /// The `GOARM` value for this platform's ARM variant, if any.
    ///
    /// Variants are `v<N>` strings; `N >= 5` selects that ARM version,
    /// clamped to the toolchain's maximum of 7. Versions below 5 have no
    /// selector. Malformed variants are an error.
    pub fn goarm(&self) -> Result<Option<String>> {
        let variant = match &self.variant {
            Some(v) => v,
            None => return Ok(None),
        };

        let digits = variant.strip_prefix('v').ok_or_else(|| {
            KoError::Platform(format!("strange arm variant: {}", variant))
        })?;
        let version: u32 = digits.parse().map_err(|e| {
            KoError::Platform(format!("cannot parse arm variant {:?}: {}", variant, e))
        })?;

        if version >= 5 {
            return Ok(Some(version.min(7).to_string()));
        }
        Ok(None)
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.variant {
            Some(variant) => write!(f, "{}/{}/{}", self.os, self.architecture, variant),
            None => write!(f, "{}/{}", self.os, self.architecture),
        }
    }
}
