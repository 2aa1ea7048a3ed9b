//! Gzip compression of finished artifacts.

use std::io::{self, BufReader};
use std::path::{Path, PathBuf};

use derive_more::{Display, Error};
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::artifact::BackupArtifact;
use crate::fs::Filesystem;

const COMPRESSED_SUFFIX: &str = "gz";

/// Path of the compressed variant of `path`, e.g. `dump.sql` -> `dump.sql.gz`.
pub fn compressed_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".");
    name.push(COMPRESSED_SUFFIX);
    PathBuf::from(name)
}

/// Compression failed, the uncompressed artifact is still in place.
#[derive(Debug, Display, Error)]
#[display("Compressing {} failed: {source}", path.display())]
pub struct CompressError {
    pub path: PathBuf,
    pub source: io::Error,
}

/// Streams artifacts through gzip.
#[derive(Copy, Clone, Debug)]
pub struct Compressor {
    enabled: bool,
    level: Compression,
}

impl Default for Compressor {
    fn default() -> Self {
        Self::new(true)
    }
}

impl Compressor {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            level: Compression::default(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Replaces the artifact by its compressed version.
    ///
    /// When disabled, the artifact is returned as is. On error the compressed file is
    /// removed again and `artifact` stays valid, pointing to the uncompressed dump.
    pub fn compress(
        &self,
        fs: &impl Filesystem,
        artifact: &BackupArtifact,
    ) -> Result<BackupArtifact, CompressError> {
        if !self.enabled || artifact.compressed {
            return Ok(artifact.clone());
        }

        let source = artifact.path.as_path();
        let target = compressed_path(source);
        log::debug!(target: "artifact::compress", "Compressing {} to {}", source.display(), target.display());

        let size = match self.stream(fs, source, &target) {
            Ok(size) => size,
            Err(e) => {
                if let Err(remove_err) = fs.remove_file(&target) {
                    if remove_err.kind() != io::ErrorKind::NotFound {
                        log::warn!(target: "artifact::compress", "Removing partial {} failed: {remove_err}", target.display());
                    }
                }
                return Err(CompressError {
                    path: source.to_path_buf(),
                    source: e,
                });
            }
        };

        // the compressed file is complete, a leftover source only costs space
        if let Err(e) = fs.remove_file(source) {
            log::warn!(target: "artifact::compress", "Removing uncompressed {} failed: {e}", source.display());
        }
        log::trace!(target: "artifact::compress", "Compressed {} bytes to {size}", artifact.size);

        Ok(BackupArtifact {
            path: target,
            compressed: true,
            size,
            ..artifact.clone()
        })
    }

    fn stream(&self, fs: &impl Filesystem, source: &Path, target: &Path) -> io::Result<u64> {
        let mut reader = BufReader::new(fs.open(source)?);
        let writer = fs.create_new(target)?;
        let mut counter = CountingWriter::new(writer);
        let mut encoder = GzEncoder::new(&mut counter, self.level);

        io::copy(&mut reader, &mut encoder)?;
        encoder.finish()?;

        let size = counter.count;
        counter.inner.commit()?;
        Ok(size)
    }
}

struct CountingWriter<W> {
    inner: W,
    count: u64,
}

impl<W> CountingWriter<W> {
    fn new(inner: W) -> Self {
        Self { inner, count: 0 }
    }
}

impl<W: io::Write> io::Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.inner.write(buf)?;
        self.count += written as u64;
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Read;
    use std::time::SystemTime;

    use chrono::Utc;
    use flate2::read::GzDecoder;

    use crate::artifact::BackupKind;
    use crate::fs::MemoryFs;

    fn artifact(fs: &MemoryFs, content: &[u8]) -> BackupArtifact {
        let path = PathBuf::from("/backup/full/2026-10-18T02-00-00Z.sql");
        fs.put(&path, content, SystemTime::now());
        BackupArtifact {
            kind: BackupKind::Full,
            created: Utc::now(),
            path,
            compressed: false,
            size: content.len() as u64,
        }
    }

    #[test]
    fn compressed_artifact_decompresses_to_the_dump() {
        let fs = MemoryFs::default();
        let dump: Vec<u8> = (0..200_000u32)
            .flat_map(|i| format!("INSERT INTO t VALUES ({i});\n").into_bytes())
            .collect();
        let original = artifact(&fs, &dump);

        let compressed = Compressor::new(true).compress(&fs, &original).unwrap();

        assert!(compressed.compressed);
        assert_eq!(
            compressed.path,
            PathBuf::from("/backup/full/2026-10-18T02-00-00Z.sql.gz")
        );
        assert!(fs.content(&original.path).is_none(), "source is removed");

        let gz = fs.content(&compressed.path).unwrap();
        assert_eq!(compressed.size, gz.len() as u64);
        let mut decoded = Vec::new();
        GzDecoder::new(gz.as_slice())
            .read_to_end(&mut decoded)
            .unwrap();
        assert_eq!(decoded, dump);
    }

    #[test]
    fn disabled_compression_passes_through() {
        let fs = MemoryFs::default();
        let original = artifact(&fs, b"SELECT 1;\n");

        let result = Compressor::new(false).compress(&fs, &original).unwrap();

        assert_eq!(result, original);
        assert_eq!(fs.files(), vec![original.path]);
    }

    #[test]
    fn failed_compression_keeps_the_source() {
        let fs = MemoryFs::default();
        let original = artifact(&fs, b"SELECT 1;\n");
        fs.fail_writes_to(compressed_path(&original.path));

        let err = Compressor::new(true).compress(&fs, &original).unwrap_err();

        assert_eq!(err.path, original.path);
        assert_eq!(fs.files(), vec![original.path.clone()]);
        assert_eq!(fs.content(&original.path).unwrap(), b"SELECT 1;\n");
    }
}
