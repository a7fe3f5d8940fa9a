//! File handler.
//!
//! ```text
//! Request:  TOKEN:<secret> WRITE notes.txt hello there
//! Response: SUCCESS: File written successfully
//!
//! Request:  TOKEN:<secret> READ notes.txt
//! Response: FILE_CONTENT: hello there
//! ```
//!
//! Names are resolved under a root directory; absolute paths and `..`
//! components are refused.

use crate::error::HandlerError;
use crate::pipeline::{Handler, Request};
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info};

pub struct FileHandler {
    root: PathBuf,
}

impl FileHandler {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, name: &str) -> Result<PathBuf, HandlerError> {
        let relative = Path::new(name);
        let safe = !name.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !safe {
            return Err(HandlerError::InvalidFileName(name.to_string()));
        }
        Ok(self.root.join(relative))
    }

    fn read(&self, name: &str) -> Result<String, HandlerError> {
        let path = self.resolve(name)?;
        match fs::read(&path) {
            Ok(content) => {
                debug!(path = %path.display(), bytes = content.len(), "File read");
                Ok(format!("FILE_CONTENT: {}", String::from_utf8_lossy(&content)))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(HandlerError::FileNotFound(PathBuf::from(name)))
            }
            Err(e) => Err(HandlerError::Io(e)),
        }
    }

    fn write(&self, arguments: &str) -> Result<String, HandlerError> {
        let (name, content) = arguments
            .split_once(' ')
            .filter(|(name, _)| !name.is_empty())
            .ok_or(HandlerError::InvalidFormat("WRITE"))?;
        let path = self.resolve(name)?;
        fs::write(&path, content).map_err(HandlerError::FileWrite)?;
        debug!(path = %path.display(), bytes = content.len(), "File written");
        Ok("SUCCESS: File written successfully".to_string())
    }
}

impl Handler for FileHandler {
    fn name(&self) -> &str {
        "file"
    }

    fn initialize(&mut self) -> Result<(), HandlerError> {
        fs::create_dir_all(&self.root)?;
        info!(root = %self.root.display(), "File handler ready");
        Ok(())
    }

    fn handle(&self, request: &Request) -> Option<Result<String, HandlerError>> {
        if request.is_command("READ") {
            Some(self.read(request.arguments.trim()))
        } else if request.is_command("WRITE") {
            Some(self.write(&request.arguments))
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handler() -> (tempfile::TempDir, FileHandler) {
        let dir = tempfile::tempdir().unwrap();
        let mut handler = FileHandler::new(dir.path());
        handler.initialize().unwrap();
        (dir, handler)
    }

    fn respond(handler: &FileHandler, line: &str) -> Option<String> {
        handler
            .handle(&Request::from_line(line))
            .map(|r| r.unwrap_or_else(|e| e.to_response()))
    }

    #[test]
    fn test_write_then_read() {
        let (_dir, handler) = handler();
        assert_eq!(
            respond(&handler, "TOKEN:t WRITE f.txt hello").as_deref(),
            Some("SUCCESS: File written successfully")
        );
        assert_eq!(
            respond(&handler, "TOKEN:t READ f.txt").as_deref(),
            Some("FILE_CONTENT: hello")
        );
    }

    #[test]
    fn test_read_non_utf8_file() {
        let (dir, handler) = handler();
        fs::write(dir.path().join("raw.bin"), b"ab\xffcd").unwrap();
        assert_eq!(
            respond(&handler, "TOKEN:t READ raw.bin").as_deref(),
            Some("FILE_CONTENT: ab\u{FFFD}cd")
        );
    }

    #[test]
    fn test_write_keeps_content_spacing() {
        let (dir, handler) = handler();
        respond(&handler, "TOKEN:t WRITE g.txt Hello from  client!").unwrap();
        let content = fs::read_to_string(dir.path().join("g.txt")).unwrap();
        assert_eq!(content, "Hello from  client!");
    }

    #[test]
    fn test_read_missing_file() {
        let (_dir, handler) = handler();
        assert_eq!(
            respond(&handler, "TOKEN:t READ nope.txt").as_deref(),
            Some("ERROR: Could not open file nope.txt")
        );
    }

    #[test]
    fn test_write_without_content() {
        let (_dir, handler) = handler();
        assert_eq!(
            respond(&handler, "TOKEN:t WRITE lonely.txt").as_deref(),
            Some("ERROR: Invalid WRITE command format")
        );
    }

    #[test]
    fn test_rejects_escaping_paths() {
        let (_dir, handler) = handler();
        for name in ["../etc/passwd", "/etc/passwd", "a/../../b", ""] {
            assert!(matches!(
                handler.resolve(name),
                Err(HandlerError::InvalidFileName(_))
            ));
        }
        assert!(handler.resolve("sub/dir.txt").is_ok());
    }

    #[test]
    fn test_initialize_creates_root() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("nested").join("files");
        let mut handler = FileHandler::new(&root);
        handler.initialize().unwrap();
        assert!(root.is_dir());
    }

    #[test]
    fn test_ignores_other_commands() {
        let (_dir, handler) = handler();
        assert!(respond(&handler, "TOKEN:t ECHO hi").is_none());
    }
}
