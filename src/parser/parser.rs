// SPDX-License-Identifier: GPL-2.0-or-later

//! The `Parser` plugin contract: a component that consumes a stream URL and
//! writes it to an output file until the stream ends or is stopped. Real
//! parsers (flv puller, `streamlink`, `yt-dlp`) live outside this crate; this
//! only defines the interface, the tag-keyed factory registry and the
//! extension-forcing rule that depends on the tag.

use async_trait::async_trait;
use std::{collections::HashMap, path::Path, sync::Arc};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum ParserError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("process exited with non-zero status: {0}")]
    BadExit(String),

    #[error("stopped")]
    Stopped,
}

/// A component that converts a live stream URL into an on-disk file.
#[async_trait]
pub trait Parser: Send + Sync {
    fn tag(&self) -> &str;

    /// Blocks until the stream terminates or `stop()` is invoked.
    async fn parse(&self, stream_url: &str, output_path: &Path) -> Result<(), ParserError>;

    /// Asynchronous request to abort. Idempotent.
    fn stop(&self);
}

pub type ParserFactory = Arc<dyn Fn() -> Box<dyn Parser> + Send + Sync>;

#[derive(Debug, Error)]
pub enum ParserRegistryError {
    #[error("unknown parser tag: '{0}'")]
    UnknownTag(String),

    #[error("parser tag already registered: '{0}'")]
    AlreadyRegistered(String),
}

/// Resolves a parser tag (`flv`, `streamlink`, `yt-dlp`, ...) to a factory.
#[derive(Default)]
pub struct ParserRegistry {
    factories: HashMap<String, ParserFactory>,
}

impl ParserRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        tag: impl Into<String>,
        factory: ParserFactory,
    ) -> Result<(), ParserRegistryError> {
        let tag = tag.into();
        if self.factories.contains_key(&tag) {
            return Err(ParserRegistryError::AlreadyRegistered(tag));
        }
        self.factories.insert(tag, factory);
        Ok(())
    }

    pub fn build(&self, tag: &str) -> Result<Box<dyn Parser>, ParserRegistryError> {
        let factory = self
            .factories
            .get(tag)
            .ok_or_else(|| ParserRegistryError::UnknownTag(tag.to_owned()))?;
        Ok(factory())
    }
}

/// Final file extension is forced: `.mp4` for `yt-dlp`, `.flv` otherwise.
/// This overrides any extension present in the rendered template.
#[must_use]
pub fn force_extension(path: &str, parser_tag: &str) -> String {
    let ext = if parser_tag == "yt-dlp" { "mp4" } else { "flv" };
    let stem = match path.rfind('.') {
        Some(i) => &path[..i],
        None => path,
    };
    format!("{stem}.{ext}")
}

/// A cooperative fake parser for tests: writes `content` to the output path
/// then returns, unless `stop()` is called first, in which case it returns
/// `ParserError::Stopped` as soon as it notices.
pub struct FakeParser {
    tag: String,
    content: Vec<u8>,
    cancel: CancellationToken,
}

impl FakeParser {
    #[must_use]
    pub fn new(tag: &str, content: Vec<u8>) -> Self {
        Self {
            tag: tag.to_owned(),
            content,
            cancel: CancellationToken::new(),
        }
    }
}

#[async_trait]
impl Parser for FakeParser {
    fn tag(&self) -> &str {
        &self.tag
    }

    async fn parse(&self, _stream_url: &str, output_path: &Path) -> Result<(), ParserError> {
        if self.cancel.is_cancelled() {
            return Err(ParserError::Stopped);
        }
        tokio::fs::write(output_path, &self.content).await?;
        Ok(())
    }

    fn stop(&self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;
    use test_case::test_case;

    #[test_case("yt-dlp", "mp4"; "yt-dlp forces mp4")]
    #[test_case("flv", "flv"; "flv stays flv")]
    #[test_case("streamlink", "flv"; "streamlink forces flv")]
    fn extension_forcing(tag: &str, want_ext: &str) {
        let got = force_extension("/tmp/out.anything", tag);
        assert!(got.ends_with(&format!(".{want_ext}")), "got {got}");
    }

    #[test]
    fn extension_forcing_handles_no_existing_extension() {
        assert_eq!(force_extension("/tmp/out", "flv"), "/tmp/out.flv");
    }

    #[tokio::test]
    async fn fake_parser_writes_content() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out.flv");
        let parser = FakeParser::new("flv", b"hello".to_vec());
        parser.parse("u", &path).await.unwrap();
        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"hello");
    }

    #[test]
    fn registry_rejects_unknown_and_duplicate_tags() {
        let mut reg = ParserRegistry::new();
        reg.register("flv", Arc::new(|| Box::new(FakeParser::new("flv", vec![])) as Box<dyn Parser>))
            .unwrap();

        reg.build("yt-dlp").unwrap_err();
        reg.register("flv", Arc::new(|| Box::new(FakeParser::new("flv", vec![])) as Box<dyn Parser>))
            .unwrap_err();

        let built = reg.build("flv").unwrap();
        assert_eq!(built.tag(), "flv");
    }
}
