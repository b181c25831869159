use crate::frame::Capture;
use crate::game::{ExportFormat, Variant};
use crate::session::RenderSize;
use derive_more::{Display, Error, From};
use serde::{Deserialize, Serialize};
use std::{str::FromStr, time::Duration};

/// The reason why parsing [`Config`] failed.
#[derive(Debug, Display, Eq, PartialEq, Error, From)]
#[display(fmt = "failed to parse configuration")]
pub struct ParseConfigError(ron::de::SpannedError);

/// Runtime configuration.
#[derive(Debug, Display, Clone, PartialEq, Deserialize, Serialize)]
#[display(fmt = "{}", "ron::ser::to_string(self).unwrap_or_default()")]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// The document that hosts the rules engine and the renderer.
    pub bootstrap: String,

    /// The size new pages are rendered at.
    pub render_size: RenderSize,

    /// The largest size a full board is rendered at.
    pub max_render_size: RenderSize,

    /// How frames are captured.
    pub capture: Capture,

    /// Bound on every remote call into the render host.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,

    /// The variant played when none is requested.
    pub variant: Variant,

    /// The format exported when none is requested.
    pub format: ExportFormat,

    /// Whether the rules engine skips its automatic detection of checks and mates.
    pub skip_detection: bool,

    /// Magnification used when framing the present.
    pub zoom: f64,

    /// The authority required for privileged commands.
    pub admin: u8,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            bootstrap: concat!("file://", env!("CARGO_MANIFEST_DIR"), "/assets/index.html").into(),
            render_size: RenderSize::default(),
            max_render_size: RenderSize::new(4000, 3000),
            capture: Capture::default(),
            timeout: Duration::from_secs(30),
            variant: Variant::default(),
            format: ExportFormat::default(),
            skip_detection: true,
            zoom: 1.5,
            admin: 3,
        }
    }
}

impl FromStr for Config {
    type Err = ParseConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(ron::de::from_str(s)?)
    }
}
