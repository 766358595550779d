//! Static file helpers and the in-memory file cache.
//!
//! [`Context::file`](crate::Context::file) serves straight from disk. For
//! small assets that never change while the process runs, [`MemoryFiles`]
//! loads them once, precomputes an ETag, and optionally stores a gzip copy so
//! requests cost one map lookup and one copy.

use std::io::Write;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, NaiveDateTime, Utc};
use dashmap::DashMap;
use flate2::Compression;
use flate2::write::GzEncoder;
use md5::{Digest, Md5};

use crate::error::Error;

/// Image formats are already compressed; gzip only costs CPU on them.
pub const GZIP_EXCLUDED_EXTENSIONS: &[&str] = &["png", "gif", "jpeg", "jpg"];

const HTTP_DATE: &str = "%a, %d %b %Y %H:%M:%S GMT";

/// Formats a timestamp as an IMF-fixdate (`Sun, 06 Nov 1994 08:49:37 GMT`).
pub(crate) fn http_date(t: DateTime<Utc>) -> String {
    t.format(HTTP_DATE).to_string()
}

pub(crate) fn parse_http_date(s: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(s.trim(), HTTP_DATE).ok().map(|t| t.and_utc())
}

/// Lexically normalizes a path: drops `.` and folds `..` into its parent.
pub(crate) fn clean_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for comp in path.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Maps a URL path below `base` without letting it escape: any `..`, root or
/// prefix component rejects the whole path.
pub(crate) fn map_path(base: &Path, url_path: &str) -> Option<PathBuf> {
    let mut pb = base.to_path_buf();
    for comp in Path::new(url_path.trim_start_matches('/')).components() {
        match comp {
            Component::Normal(s) => pb.push(s),
            Component::CurDir => {}
            _ => return None,
        }
    }
    Some(pb)
}

pub(crate) fn content_type(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    Some(match ext.as_str() {
        "html" | "htm" => "text/html; charset=utf-8",
        "css" => "text/css; charset=utf-8",
        "js" | "mjs" => "text/javascript; charset=utf-8",
        "json" => "application/json",
        "txt" => "text/plain; charset=utf-8",
        "xml" => "application/xml",
        "svg" => "image/svg+xml",
        "png" => "image/png",
        "gif" => "image/gif",
        "jpg" | "jpeg" => "image/jpeg",
        "webp" => "image/webp",
        "ico" => "image/x-icon",
        "wasm" => "application/wasm",
        "pdf" => "application/pdf",
        _ => return None,
    })
}

/// Hex MD5 of `data`, quoted for use as a strong ETag.
pub(crate) fn etag_of(data: &[u8]) -> String {
    format!("\"{}\"", hex::encode(Md5::digest(data)))
}

pub(crate) fn gzip(level: u32, data: &[u8]) -> Result<Vec<u8>, Error> {
    let mut enc = GzEncoder::new(Vec::with_capacity(data.len() / 2), Compression::new(level));
    enc.write_all(data)?;
    Ok(enc.finish()?)
}

/// One cached asset.
#[derive(Clone)]
pub struct MemoryFile {
    pub etag: String,
    pub content_type: Option<&'static str>,
    /// `true` when `data` holds the gzip encoding of the file.
    pub gzipped: bool,
    pub data: Arc<[u8]>,
    pub loaded_at: DateTime<Utc>,
}

/// In-memory asset store keyed by URL path.
///
/// Entries are loaded once; changing the file on disk does not refresh them.
/// Call [`MemoryFiles::load`] again (or [`remove`](MemoryFiles::remove)) to
/// pick up a new version.
#[derive(Default)]
pub struct MemoryFiles {
    entries: DashMap<String, MemoryFile>,
}

impl MemoryFiles {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads `file` from disk and stores it under `key`. With `gzip_level`
    /// set, the stored bytes are gzip-encoded, except for
    /// [`GZIP_EXCLUDED_EXTENSIONS`].
    pub fn load(&self, key: impl Into<String>, file: &Path, gzip_level: Option<u32>) -> Result<MemoryFile, Error> {
        let raw = std::fs::read(file)?;
        let excluded = file
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| GZIP_EXCLUDED_EXTENSIONS.iter().any(|x| x.eq_ignore_ascii_case(e)));
        let (data, gzipped) = match gzip_level {
            Some(level) if !excluded => (gzip(level, &raw)?, true),
            _ => (raw, false),
        };
        let entry = MemoryFile {
            etag: etag_of(&data),
            content_type: content_type(file),
            gzipped,
            data: data.into(),
            loaded_at: Utc::now(),
        };
        self.entries.insert(key.into(), entry.clone());
        Ok(entry)
    }

    pub fn get(&self, key: &str) -> Option<MemoryFile> {
        self.entries.get(key).map(|e| e.value().clone())
    }

    pub fn etag(&self, key: &str) -> Option<String> {
        self.entries.get(key).map(|e| e.etag.clone())
    }

    pub fn remove(&self, key: &str) {
        self.entries.remove(key);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use flate2::read::GzDecoder;

    use super::*;

    #[test]
    fn http_date_round_trips() {
        let t = parse_http_date("Sun, 06 Nov 1994 08:49:37 GMT").unwrap();
        assert_eq!(t.timestamp(), 784_111_777);
        assert_eq!(http_date(t), "Sun, 06 Nov 1994 08:49:37 GMT");
        assert!(parse_http_date("yesterday").is_none());
    }

    #[test]
    fn clean_path_folds_parents() {
        assert_eq!(clean_path(Path::new("a/./b/../c.txt")), PathBuf::from("a/c.txt"));
        assert_eq!(clean_path(Path::new("../x")), PathBuf::from("../x"));
    }

    #[test]
    fn map_path_prevents_traversal() {
        let base = Path::new("public");
        assert!(map_path(base, "../Cargo.toml").is_none());
        assert!(map_path(base, "css/../../secret").is_none());
        assert_eq!(map_path(base, "/css/site.css"), Some(PathBuf::from("public/css/site.css")));
    }

    #[test]
    fn etag_is_quoted_md5_hex() {
        assert_eq!(etag_of(b"Hi"), "\"c1a5298f939e87e8f962a5edfc206918\"");
    }

    #[test]
    fn memory_files_gzip_text_but_not_images() {
        let dir = tempfile::tempdir().unwrap();
        let txt = dir.path().join("a.txt");
        let png = dir.path().join("b.png");
        std::fs::write(&txt, "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaa").unwrap();
        std::fs::write(&png, [0x89, b'P', b'N', b'G']).unwrap();

        let files = MemoryFiles::new();
        let a = files.load("/a.txt", &txt, Some(6)).unwrap();
        let b = files.load("/b.png", &png, Some(6)).unwrap();

        assert!(a.gzipped);
        let mut plain = String::new();
        GzDecoder::new(&a.data[..]).read_to_string(&mut plain).unwrap();
        assert_eq!(plain, "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaa");

        assert!(!b.gzipped);
        assert_eq!(&b.data[..], &[0x89, b'P', b'N', b'G']);
        assert_eq!(files.etag("/b.png"), Some(b.etag));
        assert_eq!(files.len(), 2);
    }
}
