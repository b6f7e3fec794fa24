//! Corpus files: one JSON document per line.

use std::fs::File;
use std::io::{self, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::generator::{Emitted, Generator};

const CORPUS_PREFIX: &str = "corpus-";

/// Creates an empty, persisted temporary file in `dir`.
pub(crate) fn create_temp_file(dir: &Path, prefix: &str, suffix: &str) -> Result<(File, PathBuf)> {
    let file = tempfile::Builder::new()
        .prefix(prefix)
        .suffix(suffix)
        .tempfile_in(dir)
        .map_err(|cause| {
            Error::io(
                format!("cannot create {prefix}* file in {}", dir.display()),
                cause,
            )
        })?;

    file.keep()
        .map_err(|error| Error::io("cannot persist temporary file", error.error))
}

/// Writes every document of `generator` into a new corpus file in `dir`.
///
/// Newlines inside documents are dropped so that each document takes exactly one line. Returns
/// the corpus path and the number of documents written.
pub fn write_corpus(mut generator: Box<dyn Generator>, dir: &Path) -> Result<(PathBuf, u64)> {
    let (file, path) = create_temp_file(dir, CORPUS_PREFIX, "")?;
    let mut writer = BufWriter::new(file);
    let write_error = |cause| {
        Error::io(
            format!("error while saving corpus file {}", path.display()),
            cause,
        )
    };

    let mut buf = Vec::new();
    let mut count = 0;
    loop {
        buf.clear();
        if generator.emit(&mut buf)? == Emitted::EndOfStream {
            break;
        }

        buf.retain(|&byte| byte != b'\n');
        buf.push(b'\n');
        writer.write_all(&buf).map_err(write_error)?;
        count += 1;
    }

    writer.flush().map_err(write_error)?;
    generator.close()?;

    tracing::debug!(path = %path.display(), documents = count, "corpus generated");
    Ok((path, count))
}

/// Copies the corpus at `source` into a new corpus file in `dir`.
///
/// Returns the new path and the number of documents, one per line.
pub fn copy_corpus(source: &Path, dir: &Path) -> Result<(PathBuf, u64)> {
    let mut existing = File::open(source).map_err(|cause| {
        Error::io(format!("error while reading existing corpus file {}", source.display()), cause)
    })?;

    let count = count_lines(&mut existing).map_err(|cause| {
        Error::io("error while counting docs of the existing corpus file", cause)
    })?;

    let offset = existing
        .seek(SeekFrom::Start(0))
        .map_err(|cause| Error::io("error while resetting the existing corpus file", cause))?;
    if offset != 0 {
        return Err(Error::Data(
            "error while resetting the existing corpus file".to_owned(),
        ));
    }

    let (mut file, path) = create_temp_file(dir, CORPUS_PREFIX, "")?;
    io::copy(&mut existing, &mut file)
        .map_err(|cause| Error::io("error while copying the existing corpus file", cause))?;

    tracing::debug!(
        source = %source.display(),
        path = %path.display(),
        documents = count,
        "corpus copied"
    );
    Ok((path, count))
}

/// Counts the newline-terminated lines in `reader` from its current position.
///
/// The read position is restored afterwards.
pub fn count_lines<R: Read + Seek>(reader: &mut R) -> io::Result<u64> {
    let position = reader.stream_position()?;

    let mut buf = vec![0; 64 * 1024];
    let mut count = 0;
    loop {
        let read = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(read) => read,
            Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
            Err(error) => return Err(error),
        };
        count += buf[..read].iter().filter(|&&byte| byte == b'\n').count() as u64;
    }

    reader.seek(SeekFrom::Start(position))?;
    Ok(count)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::generator::GeneratorError;

    #[derive(Debug)]
    struct Fixed {
        documents: Vec<&'static str>,
    }

    impl Generator for Fixed {
        fn emit(&mut self, buf: &mut Vec<u8>) -> Result<Emitted, GeneratorError> {
            if self.documents.is_empty() {
                return Ok(Emitted::EndOfStream);
            }
            buf.extend_from_slice(self.documents.remove(0).as_bytes());
            Ok(Emitted::Document)
        }

        fn close(self: Box<Self>) -> Result<(), GeneratorError> {
            Ok(())
        }
    }

    #[test]
    fn counts_lines_and_restores_position() {
        let mut cursor = Cursor::new(b"{\"a\":1}\n{\"a\":2}\n{\"a\":3}\n".to_vec());
        cursor.set_position(8);

        assert_eq!(count_lines(&mut cursor).unwrap(), 2);
        assert_eq!(cursor.position(), 8);

        cursor.set_position(0);
        assert_eq!(count_lines(&mut cursor).unwrap(), 3);
        assert_eq!(cursor.position(), 0);
    }

    #[test]
    fn writes_one_document_per_line() {
        let dir = tempfile::tempdir().unwrap();
        let generator = Box::new(Fixed {
            documents: vec!["{\n  \"a\": 1\n}", "{\"a\":2}"],
        });

        let (path, count) = write_corpus(generator, dir.path()).unwrap();

        assert_eq!(count, 2);
        assert!(path.file_name().unwrap().to_str().unwrap().starts_with("corpus-"));
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "{  \"a\": 1}\n{\"a\":2}\n");
    }

    #[test]
    fn copies_existing_corpus() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("existing.ndjson");
        std::fs::write(&source, "{}\n{}\n{}\n{}\n").unwrap();

        let (path, count) = copy_corpus(&source, dir.path()).unwrap();

        assert_eq!(count, 4);
        assert_ne!(path, source);
        assert_eq!(std::fs::read(&path).unwrap(), std::fs::read(&source).unwrap());
    }

    #[test]
    fn missing_corpus_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let error = copy_corpus(&dir.path().join("missing"), dir.path()).unwrap_err();
        assert!(matches!(error, Error::Io { .. }));
    }
}
