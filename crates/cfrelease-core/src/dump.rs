//! Edits to the dumped configuration XML files.
//!
//! A configuration dump contains two files that carry the version:
//!
//! - `Configuration.xml` holds the human-readable version at
//!   `Configuration/Properties/Version` (MDClasses namespace).
//! - `ConfigDumpInfo.xml` holds an opaque `configVersion` hash on the
//!   `ConfigVersions/Metadata` entry of the configuration object (dumpinfo
//!   namespace). Reversing its first 32 characters makes the platform treat
//!   the root object as changed when the files are loaded back.
//!
//! Both edits stream the document event by event and pass everything they
//! do not touch through unchanged, so the dumped layout survives a rewrite.
//! The output always starts with a UTF-8 XML declaration. Files are replaced
//! atomically through a temporary file in the same directory.

use std::io::Write as _;

use camino::{Utf8Path, Utf8PathBuf};
use quick_xml::events::{BytesDecl, BytesStart, BytesText, Event};
use quick_xml::name::{Namespace, ResolveResult};
use quick_xml::{NsReader, Writer};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, instrument};

use crate::version::{BumpLevel, next_version};

/// Namespace of `Configuration.xml`.
pub const MD_CLASSES_NS: &str = "http://v8.1c.ru/8.3/MDClasses";

/// Namespace of `ConfigDumpInfo.xml`.
pub const DUMP_INFO_NS: &str = "http://v8.1c.ru/8.3/xcf/dumpinfo";

/// How many leading characters of `configVersion` are reversed.
pub const CONFIG_VERSION_PREFIX: usize = 32;

const VERSION_PATH: &[&str] = &["Configuration", "Properties", "Version"];
const METADATA_PATH: &[&str] = &["ConfigVersions", "Metadata"];

/// Errors from editing dump files.
#[derive(Error, Debug)]
pub enum XmlError {
    /// Reading or replacing the file failed.
    #[error("I/O error on {path}: {source}")]
    Io {
        /// File being edited.
        path: Utf8PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The document is not well-formed.
    #[error("malformed XML in {path}: {source}")]
    Parse {
        /// File being edited.
        path: Utf8PathBuf,
        /// Parser error.
        source: quick_xml::Error,
    },

    /// No element matched the lookup.
    #[error("{path}: no element matches {element}")]
    ElementNotFound {
        /// File being edited.
        path: Utf8PathBuf,
        /// Human-readable lookup that failed.
        element: String,
    },

    /// The matched element lacks the attribute to edit.
    #[error("{path}: {element} has no {attribute} attribute")]
    AttributeMissing {
        /// File being edited.
        path: Utf8PathBuf,
        /// Human-readable lookup that matched.
        element: String,
        /// Attribute that was expected.
        attribute: &'static str,
    },
}

/// Result alias for dump edits.
pub type XmlResult<T> = Result<T, XmlError>;

/// Version before and after a root version edit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VersionChange {
    /// Version found in the file.
    pub previous: String,
    /// Version written back.
    pub current: String,
}

/// Bump the version in `Configuration.xml`.
///
/// Only the first matching element is edited. When nothing matches the
/// file is left untouched.
#[instrument(skip_all, fields(path = %path, level = %level))]
pub fn update_root_version(path: &Utf8Path, level: BumpLevel) -> XmlResult<VersionChange> {
    let content = read_document(path)?;
    let (output, change) = rewrite_version(&content, level).map_err(|source| XmlError::Parse {
        path: path.to_path_buf(),
        source,
    })?;

    let Some(change) = change else {
        return Err(XmlError::ElementNotFound {
            path: path.to_path_buf(),
            element: VERSION_PATH.join("/"),
        });
    };

    write_atomic(path, &output)?;
    info!(previous = %change.previous, current = %change.current, "configuration version updated");
    Ok(change)
}

/// Reverse the `configVersion` prefix of the configuration object in
/// `ConfigDumpInfo.xml`.
#[instrument(skip_all, fields(path = %path, config_name = %config_name))]
pub fn flip_config_version(path: &Utf8Path, config_name: &str) -> XmlResult<()> {
    let content = read_document(path)?;
    let object = format!("Configuration.{config_name}");
    let element = format!("{}[@name=\"{object}\"]", METADATA_PATH.join("/"));

    let (output, flipped) = rewrite_config_version(&content, &object).map_err(|source| XmlError::Parse {
        path: path.to_path_buf(),
        source,
    })?;

    match flipped {
        Flip::Done => {}
        Flip::NotFound => {
            return Err(XmlError::ElementNotFound {
                path: path.to_path_buf(),
                element,
            });
        }
        Flip::NoAttribute => {
            return Err(XmlError::AttributeMissing {
                path: path.to_path_buf(),
                element,
                attribute: "configVersion",
            });
        }
    }

    write_atomic(path, &output)?;
    debug!(object = %object, "config version hash flipped");
    Ok(())
}

/// Reverse the first `len` characters of `value`, keeping the rest.
///
/// Values shorter than `len` are reversed whole.
pub fn reverse_prefix(value: &str, len: usize) -> String {
    let split = value.char_indices().nth(len).map_or(value.len(), |(i, _)| i);
    let (head, tail) = value.split_at(split);
    head.chars().rev().chain(tail.chars()).collect()
}

/// Tracks whether the current element lies on a namespaced path below the
/// document root.
struct PathTracker<'p> {
    namespace: &'p [u8],
    path: &'p [&'p str],
    stack: Vec<bool>,
}

impl<'p> PathTracker<'p> {
    fn new(namespace: &'p str, path: &'p [&'p str]) -> Self {
        Self {
            namespace: namespace.as_bytes(),
            path,
            stack: Vec::new(),
        }
    }

    /// Whether an element opened at the current depth would be on the path.
    fn on_path(&self, resolved: &ResolveResult<'_>, local: &[u8]) -> bool {
        let depth = self.stack.len();
        let Some(&parent) = self.stack.last() else {
            return true;
        };
        parent
            && depth <= self.path.len()
            && matches!(resolved, ResolveResult::Bound(Namespace(ns)) if *ns == self.namespace)
            && local == self.path[depth - 1].as_bytes()
    }

    /// Whether an element opened at the current depth would be the target.
    fn is_target(&self, resolved: &ResolveResult<'_>, local: &[u8]) -> bool {
        self.stack.len() == self.path.len() && self.on_path(resolved, local)
    }

    fn enter(&mut self, resolved: &ResolveResult<'_>, local: &[u8]) -> bool {
        let target = self.is_target(resolved, local);
        let on_path = self.on_path(resolved, local);
        self.stack.push(on_path);
        target
    }

    /// Close the current element, returning whether it was the target.
    fn leave(&mut self) -> bool {
        let target = self.stack.len() == self.path.len() + 1 && self.stack.last().copied().unwrap_or(false);
        self.stack.pop();
        target
    }
}

fn rewrite_version(content: &str, level: BumpLevel) -> quick_xml::Result<(Vec<u8>, Option<VersionChange>)> {
    let mut reader = NsReader::from_str(strip_bom(content));
    let mut writer = start_document()?;
    let mut tracker = PathTracker::new(MD_CLASSES_NS, VERSION_PATH);
    let mut change: Option<VersionChange> = None;
    let mut capture: Option<String> = None;

    loop {
        let (resolved, event) = reader.read_resolved_event()?;
        match event {
            Event::Eof => break,
            Event::Decl(_) => {}
            Event::Start(start) => {
                let target = tracker.enter(&resolved, start.local_name().as_ref());
                if target && change.is_none() && capture.is_none() {
                    capture = Some(String::new());
                }
                write(&mut writer, Event::Start(start))?;
            }
            Event::Empty(start) => {
                if change.is_none() && tracker.is_target(&resolved, start.local_name().as_ref()) {
                    change = Some(VersionChange {
                        previous: String::new(),
                        current: next_version("", level),
                    });
                }
                write(&mut writer, Event::Empty(start))?;
            }
            Event::Text(text) if capture.is_some() => {
                if let Some(buf) = capture.as_mut() {
                    buf.push_str(&text.unescape()?);
                }
            }
            Event::CData(data) if capture.is_some() => {
                if let Some(buf) = capture.as_mut() {
                    buf.push_str(&String::from_utf8_lossy(&data));
                }
            }
            Event::End(end) => {
                if tracker.leave()
                    && let Some(previous) = capture.take()
                {
                    let previous = previous.trim().to_string();
                    let current = next_version(&previous, level);
                    debug!(%previous, %current, "version element found");
                    write(&mut writer, Event::Text(BytesText::new(&current)))?;
                    change = Some(VersionChange { previous, current });
                }
                write(&mut writer, Event::End(end))?;
            }
            other => write(&mut writer, other)?,
        }
    }

    Ok((writer.into_inner(), change))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flip {
    Done,
    NotFound,
    NoAttribute,
}

fn rewrite_config_version(content: &str, object: &str) -> quick_xml::Result<(Vec<u8>, Flip)> {
    let mut reader = NsReader::from_str(strip_bom(content));
    let mut writer = start_document()?;
    let mut tracker = PathTracker::new(DUMP_INFO_NS, METADATA_PATH);
    let mut flip = Flip::NotFound;

    loop {
        let (resolved, event) = reader.read_resolved_event()?;
        match event {
            Event::Eof => break,
            Event::Decl(_) => {}
            Event::Start(start) => {
                let target = tracker.enter(&resolved, start.local_name().as_ref());
                if target && flip == Flip::NotFound && names_object(&start, object)? {
                    let (rebuilt, outcome) = flip_start(&start)?;
                    flip = outcome;
                    write(&mut writer, Event::Start(rebuilt))?;
                } else {
                    write(&mut writer, Event::Start(start))?;
                }
            }
            Event::Empty(start) => {
                let target = tracker.is_target(&resolved, start.local_name().as_ref());
                if target && flip == Flip::NotFound && names_object(&start, object)? {
                    let (rebuilt, outcome) = flip_start(&start)?;
                    flip = outcome;
                    write(&mut writer, Event::Empty(rebuilt))?;
                } else {
                    write(&mut writer, Event::Empty(start))?;
                }
            }
            Event::End(end) => {
                tracker.leave();
                write(&mut writer, Event::End(end))?;
            }
            other => write(&mut writer, other)?,
        }
    }

    Ok((writer.into_inner(), flip))
}

fn names_object(start: &BytesStart<'_>, object: &str) -> quick_xml::Result<bool> {
    match start.try_get_attribute("name")? {
        Some(name) => Ok(name.unescape_value()? == object),
        None => Ok(false),
    }
}

/// Copy `start` with its `configVersion` prefix reversed. Other attributes
/// keep their raw values.
fn flip_start(start: &BytesStart<'_>) -> quick_xml::Result<(BytesStart<'static>, Flip)> {
    let name = String::from_utf8_lossy(start.name().as_ref()).into_owned();
    let mut rebuilt = BytesStart::new(name);
    let mut outcome = Flip::NoAttribute;

    for attr in start.attributes() {
        let attr = attr?;
        if attr.key.as_ref() == b"configVersion" {
            let value = attr.unescape_value()?;
            let flipped = reverse_prefix(&value, CONFIG_VERSION_PREFIX);
            rebuilt.push_attribute(("configVersion", flipped.as_str()));
            outcome = Flip::Done;
        } else {
            rebuilt.push_attribute(attr);
        }
    }

    Ok((rebuilt, outcome))
}

fn strip_bom(content: &str) -> &str {
    content.strip_prefix('\u{feff}').unwrap_or(content)
}

fn start_document() -> quick_xml::Result<Writer<Vec<u8>>> {
    let mut writer = Writer::new(Vec::new());
    write(
        &mut writer,
        Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)),
    )?;
    Ok(writer)
}

fn write(writer: &mut Writer<Vec<u8>>, event: Event<'_>) -> quick_xml::Result<()> {
    writer.write_event(event).map_err(quick_xml::Error::from)
}

fn read_document(path: &Utf8Path) -> XmlResult<String> {
    std::fs::read_to_string(path).map_err(|source| XmlError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Replace `path` with `bytes` via a temporary file in the same directory.
fn write_atomic(path: &Utf8Path, bytes: &[u8]) -> XmlResult<()> {
    let io_err = |source| XmlError::Io {
        path: path.to_path_buf(),
        source,
    };
    let dir = path
        .parent()
        .filter(|p| !p.as_str().is_empty())
        .unwrap_or_else(|| Utf8Path::new("."));

    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(io_err)?;
    tmp.write_all(bytes).map_err(io_err)?;
    if let Ok(meta) = std::fs::metadata(path) {
        tmp.as_file().set_permissions(meta.permissions()).map_err(io_err)?;
    }
    tmp.as_file().sync_all().map_err(io_err)?;
    tmp.persist(path).map_err(|e| io_err(e.error))?;
    Ok(())
}
