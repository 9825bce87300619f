//! Wire format for change notifications.
//!
//! One message per line, server -> client only:
//!
//! ```text
//! EVENTTYPE|ENCODEDPATH\n
//! RENAME|ENCODEDOLDPATH|ENCODEDNEWPATH\n
//! ```
//!
//! Paths are percent-encoded so the `|` separator and the `\n` terminator
//! never appear raw inside a field. No length prefix, no sequence numbers,
//! no acknowledgments - liveness is detected by socket-level read failure.

use percent_encoding::{percent_decode_str, percent_encode, AsciiSet, NON_ALPHANUMERIC};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Everything except `A-Za-z0-9`, `_`, `.`, `-` and `~` is escaped.
/// Keeps the encoded form free of `|`, `%` and control characters.
const PATH_ESCAPE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'_')
    .remove(b'.')
    .remove(b'-')
    .remove(b'~');

/// Kind of filesystem change carried by a [`ChangeEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Create,
    Modify,
    Delete,
    Rename,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "CREATE",
            Self::Modify => "MODIFY",
            Self::Delete => "DELETE",
            Self::Rename => "RENAME",
        }
    }

    fn from_wire(s: &str) -> Option<Self> {
        match s {
            "CREATE" => Some(Self::Create),
            "MODIFY" => Some(Self::Modify),
            "DELETE" => Some(Self::Delete),
            "RENAME" => Some(Self::Rename),
            _ => None,
        }
    }
}

/// A single debounced filesystem change. Immutable once created.
///
/// For [`EventKind::Rename`], `path` is the old location and `new_path`
/// the destination; both ends of the wire use that ordering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub kind: EventKind,
    pub path: PathBuf,
    pub new_path: Option<PathBuf>,
}

/// Errors produced while parsing a wire line.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("empty message")]
    Empty,
    #[error("unknown event type: {0}")]
    UnknownKind(String),
    #[error("missing path field in {0} message")]
    MissingField(&'static str),
    #[error("invalid percent-encoding in path: {0}")]
    BadEncoding(String),
}

impl ChangeEvent {
    pub fn created(path: impl Into<PathBuf>) -> Self {
        Self {
            kind: EventKind::Create,
            path: path.into(),
            new_path: None,
        }
    }

    pub fn modified(path: impl Into<PathBuf>) -> Self {
        Self {
            kind: EventKind::Modify,
            path: path.into(),
            new_path: None,
        }
    }

    pub fn deleted(path: impl Into<PathBuf>) -> Self {
        Self {
            kind: EventKind::Delete,
            path: path.into(),
            new_path: None,
        }
    }

    pub fn renamed(old: impl Into<PathBuf>, new: impl Into<PathBuf>) -> Self {
        Self {
            kind: EventKind::Rename,
            path: old.into(),
            new_path: Some(new.into()),
        }
    }

    /// Serialize to one wire line, without the trailing `\n`.
    pub fn encode_line(&self) -> String {
        match (&self.kind, &self.new_path) {
            (EventKind::Rename, Some(new)) => format!(
                "{}|{}|{}",
                self.kind.as_str(),
                encode_path(&self.path),
                encode_path(new)
            ),
            _ => format!("{}|{}", self.kind.as_str(), encode_path(&self.path)),
        }
    }

    /// Parse one complete line (terminator already stripped).
    pub fn parse_line(line: &str) -> Result<Self, ProtocolError> {
        let line = line.trim_end_matches('\r');
        if line.is_empty() {
            return Err(ProtocolError::Empty);
        }

        let mut fields = line.split('|');
        let kind_str = fields.next().unwrap_or_default();
        let kind = EventKind::from_wire(kind_str)
            .ok_or_else(|| ProtocolError::UnknownKind(kind_str.to_string()))?;

        let path = decode_path(fields.next().ok_or(ProtocolError::MissingField("event"))?)?;

        if kind == EventKind::Rename {
            let new_path =
                decode_path(fields.next().ok_or(ProtocolError::MissingField("RENAME"))?)?;
            Ok(Self {
                kind,
                path,
                new_path: Some(new_path),
            })
        } else {
            Ok(Self {
                kind,
                path,
                new_path: None,
            })
        }
    }
}

// On Unix a path is an arbitrary byte string, so the raw OS bytes go on
// the wire; lossy UTF-8 conversion would silently rewrite non-UTF-8 names.
#[cfg(unix)]
fn encode_path(path: &Path) -> String {
    use std::os::unix::ffi::OsStrExt;
    percent_encode(path.as_os_str().as_bytes(), PATH_ESCAPE).to_string()
}

#[cfg(not(unix))]
fn encode_path(path: &Path) -> String {
    percent_encode(path.to_string_lossy().as_bytes(), PATH_ESCAPE).to_string()
}

#[cfg(unix)]
fn decode_path(field: &str) -> Result<PathBuf, ProtocolError> {
    use std::os::unix::ffi::OsStringExt;
    let bytes: Vec<u8> = percent_decode_str(field).collect();
    Ok(PathBuf::from(std::ffi::OsString::from_vec(bytes)))
}

#[cfg(not(unix))]
fn decode_path(field: &str) -> Result<PathBuf, ProtocolError> {
    let decoded = percent_decode_str(field)
        .decode_utf8()
        .map_err(|_| ProtocolError::BadEncoding(field.to_string()))?;
    Ok(PathBuf::from(decoded.into_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_simple_create() {
        let event = ChangeEvent::created("/src/a.txt");
        assert_eq!(event.encode_line(), "CREATE|%2Fsrc%2Fa.txt");
    }

    #[test]
    fn decode_simple_create() {
        let event = ChangeEvent::parse_line("CREATE|%2Fsrc%2Fa.txt").unwrap();
        assert_eq!(event.kind, EventKind::Create);
        assert_eq!(event.path, PathBuf::from("/src/a.txt"));
        assert_eq!(event.new_path, None);
    }

    #[test]
    fn rename_carries_old_then_new() {
        let event = ChangeEvent::renamed("/src/old.txt", "/src/new.txt");
        let line = event.encode_line();
        assert!(line.starts_with("RENAME|"));

        let parsed = ChangeEvent::parse_line(&line).unwrap();
        assert_eq!(parsed.path, PathBuf::from("/src/old.txt"));
        assert_eq!(parsed.new_path, Some(PathBuf::from("/src/new.txt")));
    }

    #[test]
    fn round_trip_reserved_characters() {
        let nasty = "/src/a|b\nc%d e.txt";
        let event = ChangeEvent::modified(nasty);
        let line = event.encode_line();

        assert!(!line[7..].contains('|'), "raw separator in encoded path");
        assert!(!line.contains('\n'), "raw terminator in encoded path");

        let parsed = ChangeEvent::parse_line(&line).unwrap();
        assert_eq!(parsed.path, PathBuf::from(nasty));
    }

    #[test]
    fn round_trip_control_characters() {
        let path = "/src/\u{1}\u{7f}tab\there";
        let event = ChangeEvent::deleted(path);
        let parsed = ChangeEvent::parse_line(&event.encode_line()).unwrap();
        assert_eq!(parsed.path, PathBuf::from(path));
    }

    #[cfg(unix)]
    #[test]
    fn round_trip_non_utf8_path_bytes() {
        use std::os::unix::ffi::OsStringExt;

        let raw = std::ffi::OsString::from_vec(vec![b'/', b's', b'r', b'c', b'/', 0x80, 0xff]);
        let path = PathBuf::from(raw);
        let event = ChangeEvent::created(path.clone());

        let line = event.encode_line();
        assert!(line.is_ascii(), "encoded line must stay ASCII-clean");

        let parsed = ChangeEvent::parse_line(&line).unwrap();
        assert_eq!(parsed.path, path);
    }

    #[test]
    fn rejects_malformed_lines() {
        assert!(matches!(
            ChangeEvent::parse_line(""),
            Err(ProtocolError::Empty)
        ));
        assert!(matches!(
            ChangeEvent::parse_line("FROB|%2Fa"),
            Err(ProtocolError::UnknownKind(_))
        ));
        assert!(matches!(
            ChangeEvent::parse_line("CREATE"),
            Err(ProtocolError::MissingField(_))
        ));
        assert!(matches!(
            ChangeEvent::parse_line("RENAME|%2Fold"),
            Err(ProtocolError::MissingField(_))
        ));
    }

    #[test]
    fn tolerates_crlf_terminated_lines() {
        let event = ChangeEvent::parse_line("DELETE|%2Fsrc%2Fgone.txt\r").unwrap();
        assert_eq!(event.kind, EventKind::Delete);
        assert_eq!(event.path, PathBuf::from("/src/gone.txt"));
    }
}
