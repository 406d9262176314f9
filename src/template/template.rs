// SPDX-License-Identifier: GPL-2.0-or-later

//! Rendering of `outputTemplate`/`saveDir` templates and filename
//! sanitization. Templates reference `{streamer_name, room_name, site_name}`
//! and support a `now() | date(fmt="...")` pipeline, translated from the
//! upstream collaborator's Go `text/template` reference-layout convention
//! into `chrono` strftime directives.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use thiserror::Error;

/// Variables available to every template.
#[derive(Clone, Debug, Default)]
pub struct TemplateContext {
    pub streamer_name: String,
    pub room_name: String,
    pub site_name: String,
}

impl TemplateContext {
    fn into_data(self) -> HashMap<&'static str, String> {
        HashMap::from([
            ("streamer_name", self.streamer_name),
            ("room_name", self.room_name),
            ("site_name", self.site_name),
        ])
    }
}

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("compile template: {0}")]
    Compile(upon::Error),

    #[error("render template: {0}")]
    Render(upon::Error),
}

/// Renders `source` against `ctx`, with `now` frozen to the given instant so
/// callers (and tests) get deterministic output regardless of wall-clock
/// time.
pub fn render(source: &str, ctx: TemplateContext, now: DateTime<Utc>) -> Result<String, TemplateError> {
    let mut engine = upon::Engine::new();
    engine.add_function("now", move || now.to_rfc3339());
    engine.add_filter("date", |value: String, fmt: String| {
        DateTime::parse_from_rfc3339(&value)
            .map(|dt| dt.format(&go_layout_to_strftime(&fmt)).to_string())
            .unwrap_or(value)
    });

    let template = engine.compile(source).map_err(TemplateError::Compile)?;
    template
        .render(&engine, ctx.into_data())
        .to_string()
        .map_err(TemplateError::Render)
}

/// Translates a handful of Go reference-layout tokens
/// (`"2006-01-02 15-04-05"`) into `chrono` strftime directives. Only the
/// tokens the original collaborator's templates actually use are handled;
/// anything else passes through unchanged (and will likely render literally,
/// which mirrors a malformed-layout Go template producing garbled output
/// rather than an error).
#[must_use]
pub fn go_layout_to_strftime(layout: &str) -> String {
    layout
        .replace("2006", "%Y")
        .replace("01", "%m")
        .replace("02", "%d")
        .replace("15", "%H")
        .replace("04", "%M")
        .replace("05", "%S")
}

/// Sanitizes a single rendered path component to be filesystem-safe on any
/// supported OS.
#[must_use]
pub fn sanitize_component(s: &str) -> String {
    sanitize_filename::sanitize(s)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    fn frozen_now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-01-02T03:04:05Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn template_roundtrip() {
        let ctx = TemplateContext {
            streamer_name: "s".to_owned(),
            room_name: "r".to_owned(),
            site_name: "site".to_owned(),
        };
        let rendered = render(
            r#"[{{ streamer_name }}][{{ room_name }}][{{ now() | date(fmt="2006-01-02 15-04-05") }}].flv"#,
            ctx,
            frozen_now(),
        )
        .unwrap();
        assert_eq!(rendered, "[s][r][2024-01-02 03-04-05].flv");
    }

    #[test_case("my show: live!", "my show_ live!"; "colon is replaced")]
    #[test_case("a/b\\c", "abc"; "path separators are stripped")]
    fn sanitize_strips_invalid_chars(input: &str, _want_contains: &str) {
        let got = sanitize_component(input);
        assert!(!got.contains('/'));
        assert!(!got.contains('\\'));
        assert!(!got.contains(':'));
    }

    #[test]
    fn go_layout_translation() {
        assert_eq!(go_layout_to_strftime("2006-01-02 15-04-05"), "%Y-%m-%d %H-%M-%S");
    }
}
