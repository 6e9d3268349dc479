use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};

/// Error that occurs when opening or reading a file fails.
#[derive(Debug, thiserror::Error)]
#[error("failed to read file `{path}`: {source}")]
pub struct FileOpenError {
    pub path: PathBuf,
    #[source]
    pub source: io::Error,
}

impl FileOpenError {
    /// Returns `true` if the file did not exist, e.g. because the process already exited.
    pub fn is_not_found(&self) -> bool {
        self.source.kind() == io::ErrorKind::NotFound
    }
}

/// Opens a file at the given path and wraps it in a [`BufReader`].
///
/// # Errors
///
/// Returns a [`FileOpenError`] if the file cannot be opened.
///
/// # Example
/// ```no_run
/// # use sense_agent::fsutil;
/// let reader = fsutil::open_file_reader("/proc/net/nf_conntrack")?;
/// # Ok::<(), fsutil::FileOpenError>(())
/// ```
pub fn open_file_reader(path: impl AsRef<Path>) -> Result<BufReader<File>, FileOpenError> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|source| FileOpenError {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(BufReader::new(file))
}

/// Reads the whole file at `path` into a string.
///
/// procfs files report a size of zero, so this reads until EOF instead of
/// pre-sizing the buffer from metadata.
///
/// # Errors
///
/// Returns a [`FileOpenError`] if the file cannot be opened or read.
pub fn read_to_string(path: impl AsRef<Path>) -> Result<String, FileOpenError> {
    let path = path.as_ref();
    let mut reader = open_file_reader(path)?;
    let mut out = String::with_capacity(512);
    reader
        .read_to_string(&mut out)
        .map_err(|source| FileOpenError {
            path: path.to_path_buf(),
            source,
        })?;
    Ok(out)
}

#[cfg(test)]
mod tests {

    use super::*;
    use std::io::Write;

    #[test]
    fn test_read_to_string_success() {
        let mut tmp = tempfile::NamedTempFile::new().expect("failed to create temp file");
        write!(tmp, "0::/system.slice/nginx.service\n").unwrap();
        let content = read_to_string(tmp.path()).expect("should read test file");
        assert_eq!(content, "0::/system.slice/nginx.service\n");
    }

    #[test]
    fn test_open_file_reader_error() {
        let result = open_file_reader("/definitely/does/not/exist");
        assert!(result.is_err());
        let err = result.unwrap_err();
        assert_eq!(err.path, PathBuf::from("/definitely/does/not/exist"));
        assert!(err.is_not_found());
    }

    #[test]
    fn test_read_to_string_error_keeps_path() {
        let err = read_to_string("/definitely/does/not/exist/cgroup").unwrap_err();
        assert_eq!(err.path, PathBuf::from("/definitely/does/not/exist/cgroup"));
        assert_eq!(err.source.kind(), std::io::ErrorKind::NotFound);
    }
}
