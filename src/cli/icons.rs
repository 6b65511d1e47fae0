//! Status markers for command output.

use console::{style, StyledObject};

pub fn success() -> StyledObject<&'static str> {
    style("✓").green()
}

pub fn error() -> StyledObject<&'static str> {
    style("✗").red()
}

/// Prefix for indented detail lines.
pub fn dim_arrow() -> StyledObject<&'static str> {
    style("→").dim()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn markers_keep_their_glyphs() {
        assert!(success().to_string().contains('✓'));
        assert!(error().to_string().contains('✗'));
        assert!(dim_arrow().to_string().contains('→'));
    }
}
