use clap::ValueEnum;
use derive_more::{Display, Error};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// The reason why parsing a [`Variant`] failed.
#[derive(Debug, Display, Clone, Eq, PartialEq, Error)]
#[display(fmt = "unknown variant '{}'", _0)]
pub struct ParseVariantError(#[error(not(source))] pub String);

/// A ruleset known to the rules engine.
#[derive(Debug, Display, Default, Copy, Clone, Eq, PartialEq, Hash, Deserialize, Serialize)]
#[cfg_attr(test, derive(test_strategy::Arbitrary))]
#[serde(rename_all = "snake_case")]
pub enum Variant {
    #[default]
    #[display(fmt = "standard")]
    Standard,
    #[display(fmt = "defended_pawn")]
    DefendedPawn,
    #[display(fmt = "half_reflected")]
    HalfReflected,
    #[display(fmt = "princess")]
    Princess,
    #[display(fmt = "turn_zero")]
    TurnZero,
    #[display(fmt = "two_timelines")]
    TwoTimelines,
    #[display(fmt = "reversed_royalty")]
    ReversedRoyalty,
}

impl Variant {
    /// Every variant in the engine's table.
    pub const ALL: [Variant; 7] = [
        Variant::Standard,
        Variant::DefendedPawn,
        Variant::HalfReflected,
        Variant::Princess,
        Variant::TurnZero,
        Variant::TwoTimelines,
        Variant::ReversedRoyalty,
    ];
}

impl FromStr for Variant {
    type Err = ParseVariantError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim().to_ascii_lowercase().replace('-', "_");
        Variant::ALL
            .into_iter()
            .find(|v| v.to_string() == name)
            .ok_or_else(|| ParseVariantError(s.to_string()))
    }
}

/// The formats the rules engine can export a game to.
#[derive(
    Debug, Display, Default, Copy, Clone, Eq, PartialEq, Hash, Deserialize, Serialize, ValueEnum,
)]
#[cfg_attr(test, derive(test_strategy::Arbitrary))]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    /// The engine's structured representation.
    #[display(fmt = "raw")]
    Raw,

    #[display(fmt = "json")]
    Json,

    /// Portable multi-timeline notation.
    #[default]
    #[display(fmt = "5dpgn")]
    #[serde(rename = "5dpgn", alias = "pgn")]
    #[value(name = "5dpgn")]
    Pgn,
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_strategy::proptest;

    #[proptest]
    fn parsing_printed_variant_is_an_identity(v: Variant) {
        assert_eq!(v.to_string().parse(), Ok(v));
    }

    #[proptest]
    fn variant_names_are_case_insensitive(v: Variant) {
        assert_eq!(v.to_string().to_uppercase().parse(), Ok(v));
    }

    #[test]
    fn variant_names_accept_dashes() {
        assert_eq!("two-timelines".parse(), Ok(Variant::TwoTimelines));
    }

    #[proptest]
    fn unknown_variant_is_reported_verbatim(#[filter(#s.parse::<Variant>().is_err())] s: String) {
        assert_eq!(s.parse::<Variant>(), Err(ParseVariantError(s.clone())));
    }

    #[proptest]
    fn variant_serializes_to_engine_name(v: Variant) {
        assert_eq!(serde_json::to_value(v)?, serde_json::json!(v.to_string()));
    }

    #[proptest]
    fn export_format_serializes_to_engine_name(f: ExportFormat) {
        assert_eq!(serde_json::to_value(f)?, serde_json::json!(f.to_string()));
    }

    #[test]
    fn default_export_format_is_portable_text() {
        assert_eq!(ExportFormat::default(), ExportFormat::Pgn);
        assert_eq!(ExportFormat::from_str("5dpgn", true), Ok(ExportFormat::Pgn));
    }
}
