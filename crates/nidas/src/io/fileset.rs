// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Rolling file sets keyed by a strftime template.
//!
//! A writing FileSet expands its filename template against sample time and
//! opens a new file whenever sample time crosses the next integral boundary
//! of the configured file length. The previous file is flushed, fsynced and
//! closed before the new one opens. Templates ending in `.gz` produce a
//! gzip stream.
//!
//! A reading FileSet walks an explicit list of files, moving to the next on
//! end-of-file and surfacing `Io(Eof)` only when the list is exhausted.

use crate::error::{Error, Result};
use crate::time::{format_filename, next_file_boundary, DsmTime};
use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

enum FileWriter {
    Plain(File),
    Gzip(GzEncoder<File>),
}

impl FileWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            FileWriter::Plain(f) => f.write(buf),
            FileWriter::Gzip(g) => g.write(buf),
        }
    }

    /// Flush, fsync and close.
    fn finish(self) -> std::io::Result<()> {
        match self {
            FileWriter::Plain(mut f) => {
                f.flush()?;
                f.sync_all()
            }
            FileWriter::Gzip(g) => {
                let f = g.finish()?;
                f.sync_all()
            }
        }
    }
}

enum FileReader {
    Plain(File),
    Gzip(MultiGzDecoder<File>),
}

impl FileReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            FileReader::Plain(f) => f.read(buf),
            FileReader::Gzip(g) => g.read(buf),
        }
    }
}

/// Time-rolling file channel.
pub struct FileSet {
    /// Directory joined ahead of the expanded template.
    dir: PathBuf,
    /// strftime filename template, e.g. `data_%Y%m%d_%H%M%S.dat`.
    template: String,
    file_length_secs: u32,

    writer: Option<FileWriter>,
    next_file_time: DsmTime,
    current_path: Option<PathBuf>,
    /// Paths created so far, oldest first.
    created: Vec<PathBuf>,
    bytes_this_file: u64,

    read_queue: Vec<PathBuf>,
    read_index: usize,
    reader: Option<FileReader>,
}

impl FileSet {
    /// A writing FileSet. `file_length_secs == 0` means a single file that
    /// never rolls.
    pub fn new(
        dir: impl Into<PathBuf>,
        template: impl Into<String>,
        file_length_secs: u32,
    ) -> FileSet {
        FileSet {
            dir: dir.into(),
            template: template.into(),
            file_length_secs,
            writer: None,
            next_file_time: DsmTime::MIN,
            current_path: None,
            created: Vec::new(),
            bytes_this_file: 0,
            read_queue: Vec::new(),
            read_index: 0,
            reader: None,
        }
    }

    /// A reading FileSet over an explicit file list.
    pub fn for_reading(paths: Vec<PathBuf>) -> FileSet {
        FileSet {
            dir: PathBuf::new(),
            template: String::new(),
            file_length_secs: 0,
            writer: None,
            next_file_time: DsmTime::MAX,
            current_path: None,
            created: Vec::new(),
            bytes_this_file: 0,
            read_queue: paths,
            read_index: 0,
            reader: None,
        }
    }

    pub fn name(&self) -> String {
        if self.template.is_empty() {
            format!("fileset[{} files]", self.read_queue.len())
        } else {
            self.dir.join(&self.template).display().to_string()
        }
    }

    fn gzipped(path: &Path) -> bool {
        path.extension().and_then(|e| e.to_str()) == Some("gz")
    }

    /// Time at which the current file must be closed and the next opened.
    pub fn next_file_time(&self) -> DsmTime {
        self.next_file_time
    }

    pub fn current_file(&self) -> Option<String> {
        self.current_path.as_ref().map(|p| p.display().to_string())
    }

    pub fn created_files(&self) -> &[PathBuf] {
        &self.created
    }

    pub fn bytes_this_file(&self) -> u64 {
        self.bytes_this_file
    }

    /// Close the current file and open the file covering `tt`.
    ///
    /// The new file is named by `tt` rounded down to a file-length boundary,
    /// so restarts mid-period land in the same file name.
    pub fn create_file(&mut self, tt: DsmTime) -> Result<()> {
        if let Some(w) = self.writer.take() {
            let name = self.name();
            w.finish().map_err(|e| Error::io(name, e))?;
        }

        let (file_tt, next) = if self.file_length_secs == 0 {
            (tt, DsmTime::MAX)
        } else {
            let flen = i64::from(self.file_length_secs) * 1_000_000;
            let start = tt - tt.rem_euclid(flen);
            (start, next_file_boundary(tt, self.file_length_secs))
        };

        let path = self.dir.join(format_filename(&self.template, file_tt));
        log::info!("[FileSet] creating {}", path.display());
        let file =
            File::create(&path).map_err(|e| Error::io(path.display().to_string(), e))?;
        self.writer = Some(if Self::gzipped(&path) {
            FileWriter::Gzip(GzEncoder::new(file, Compression::default()))
        } else {
            FileWriter::Plain(file)
        });
        self.next_file_time = next;
        self.created.push(path.clone());
        self.current_path = Some(path);
        self.bytes_this_file = 0;
        Ok(())
    }

    pub fn write(&mut self, buf: &[u8]) -> Result<usize> {
        let name = self.name();
        match self.writer.as_mut() {
            Some(w) => {
                let n = w.write(buf).map_err(|e| Error::io(name, e))?;
                self.bytes_this_file += n as u64;
                Ok(n)
            }
            None => Err(Error::InvalidState(format!(
                "{name}: write before create_file"
            ))),
        }
    }

    fn open_next_read(&mut self) -> Result<bool> {
        if self.read_index >= self.read_queue.len() {
            return Ok(false);
        }
        let path = self.read_queue[self.read_index].clone();
        self.read_index += 1;
        log::info!("[FileSet] opening {}", path.display());
        let file = File::open(&path).map_err(|e| Error::io(path.display().to_string(), e))?;
        self.reader = Some(if Self::gzipped(&path) {
            FileReader::Gzip(MultiGzDecoder::new(file))
        } else {
            FileReader::Plain(file)
        });
        self.current_path = Some(path);
        Ok(true)
    }

    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        loop {
            if self.reader.is_none() && !self.open_next_read()? {
                return Err(Error::eof(self.name()));
            }
            let name = self.name();
            let r = self.reader.as_mut().map(|r| r.read(buf));
            match r {
                Some(Ok(0)) => {
                    // this file is done; move to the next
                    self.reader = None;
                }
                Some(Ok(n)) => return Ok(n),
                Some(Err(e)) => return Err(Error::io(name, e)),
                None => unreachable!(),
            }
        }
    }

    pub fn close(&mut self) -> Result<()> {
        if let Some(w) = self.writer.take() {
            let name = self.name();
            w.finish().map_err(|e| Error::io(name, e))?;
        }
        self.reader = None;
        Ok(())
    }
}

impl Drop for FileSet {
    fn drop(&mut self) {
        if let Some(w) = self.writer.take() {
            let _ = w.finish();
        }
    }
}
