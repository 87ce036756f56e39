use std::{
    fs::File,
    io::{BufRead, BufReader},
    path::Path,
    time::UNIX_EPOCH,
};

use flate2::read::MultiGzDecoder;

use crate::{
    error::{Error, Result},
    progress::CorpusFingerprint,
};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// One non-empty corpus line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawLine {
    /// Zero-based index among non-empty lines.
    pub index: u64,
    /// Line content without the trailing newline.
    pub bytes: Vec<u8>,
}

impl RawLine {
    /// The line as UTF-8, or `None` if it is not valid UTF-8.
    pub fn text(&self) -> Option<&str> {
        std::str::from_utf8(&self.bytes).ok()
    }
}

/// Iterator over the non-empty lines of a plain or gzipped corpus file.
/// Blank lines do not count toward line indexes.
pub struct CorpusLines {
    reader: Box<dyn BufRead + Send>,
    buf: Vec<u8>,
    next_index: u64,
}

impl CorpusLines {
    /// Open a corpus for a full pass from its first line.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| open_error(path, e))?;
        let mut reader = BufReader::new(file);
        let gzipped = is_gz_path(path)
            || reader.fill_buf()?.starts_with(&GZIP_MAGIC);

        let reader: Box<dyn BufRead + Send> = if gzipped {
            Box::new(BufReader::new(MultiGzDecoder::new(reader)))
        } else {
            Box::new(reader)
        };

        Ok(Self {
            reader,
            buf: Vec::new(),
            next_index: 0,
        })
    }
}

impl Iterator for CorpusLines {
    type Item = Result<RawLine>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            self.buf.clear();
            match self.reader.read_until(b'\n', &mut self.buf) {
                Ok(0) => return None,
                Ok(_) => {
                    if self.buf.iter().all(u8::is_ascii_whitespace) {
                        continue;
                    }
                    let mut bytes = std::mem::take(&mut self.buf);
                    while bytes.last().is_some_and(|b| *b == b'\n' || *b == b'\r')
                    {
                        bytes.pop();
                    }
                    let index = self.next_index;
                    self.next_index += 1;
                    return Some(Ok(RawLine { index, bytes }));
                }
                Err(e) => return Some(Err(e.into())),
            }
        }
    }
}

/// Count the non-empty lines of a corpus in one streaming pass.
pub fn count_lines(path: &Path) -> Result<u64> {
    let mut count = 0;
    for line in CorpusLines::open(path)? {
        line?;
        count += 1;
    }
    Ok(count)
}

/// Size and modification time of the corpus file.
pub fn fingerprint(path: &Path) -> Result<CorpusFingerprint> {
    let meta = std::fs::metadata(path).map_err(|e| open_error(path, e))?;
    let mtime = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0);
    Ok(CorpusFingerprint {
        size: meta.len(),
        mtime,
    })
}

fn is_gz_path(path: &Path) -> bool {
    path.extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("gz"))
}

fn open_error(path: &Path, e: std::io::Error) -> Error {
    if e.kind() == std::io::ErrorKind::NotFound {
        Error::NotFound {
            kind: "corpus",
            name: path.display().to_string(),
        }
    } else {
        Error::Io(e)
    }
}
