use std::fs;
use std::io::{self, BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

use flate2::Compression;
use flate2::GzBuilder;

use crate::error::SubmitError;

/// All regular files below `root`, sorted so searches are reproducible.
pub fn walk_files(root: &Path) -> Result<Vec<PathBuf>, SubmitError> {
    let mut items = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(path) = stack.pop() {
        let entries = fs::read_dir(&path)
            .map_err(|err| SubmitError::Filesystem(format!("read {}: {err}", path.display())))?;
        for entry in entries {
            let entry = entry.map_err(|err| SubmitError::Filesystem(err.to_string()))?;
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else {
                items.push(path);
            }
        }
    }
    items.sort();
    Ok(items)
}

pub fn is_gzip(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("gz"))
        .unwrap_or(false)
}

/// Gzip `source` into `dest`. The header carries no file name or mtime, so
/// the same input always produces the same bytes.
pub fn gzip_file(source: &Path, dest: &Path) -> Result<(), SubmitError> {
    let input = fs::File::open(source)
        .map_err(|err| SubmitError::Filesystem(format!("open {}: {err}", source.display())))?;
    let output = fs::File::create(dest)
        .map_err(|err| SubmitError::Filesystem(format!("create {}: {err}", dest.display())))?;
    let mut encoder = GzBuilder::new()
        .mtime(0)
        .write(BufWriter::new(output), Compression::default());
    io::copy(&mut BufReader::new(input), &mut encoder)
        .map_err(|err| SubmitError::Filesystem(err.to_string()))?;
    let mut writer = encoder
        .finish()
        .map_err(|err| SubmitError::Filesystem(err.to_string()))?;
    writer
        .flush()
        .map_err(|err| SubmitError::Filesystem(err.to_string()))?;
    Ok(())
}

/// True when `existing` is present and holds exactly the bytes of `candidate`.
pub fn same_contents(candidate: &Path, existing: &Path) -> Result<bool, SubmitError> {
    let to_fs = |path: &Path, err: io::Error| {
        SubmitError::Filesystem(format!("read {}: {err}", path.display()))
    };
    let existing_meta = match fs::metadata(existing) {
        Ok(meta) => meta,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(false),
        Err(err) => return Err(to_fs(existing, err)),
    };
    let candidate_meta = fs::metadata(candidate).map_err(|err| to_fs(candidate, err))?;
    if candidate_meta.len() != existing_meta.len() {
        return Ok(false);
    }

    let mut left = BufReader::new(fs::File::open(candidate).map_err(|err| to_fs(candidate, err))?);
    let mut right = BufReader::new(fs::File::open(existing).map_err(|err| to_fs(existing, err))?);
    let mut left_buf = [0u8; 8192];
    let mut right_buf = [0u8; 8192];
    loop {
        let read = left.read(&mut left_buf).map_err(|err| to_fs(candidate, err))?;
        if read == 0 {
            return Ok(true);
        }
        right
            .read_exact(&mut right_buf[..read])
            .map_err(|err| to_fs(existing, err))?;
        if left_buf[..read] != right_buf[..read] {
            return Ok(false);
        }
    }
}

#[cfg(test)]
mod tests {
    use flate2::read::GzDecoder;

    use super::*;

    #[test]
    fn gzip_is_deterministic_and_readable() {
        let temp = tempfile::tempdir().unwrap();
        let source = temp.path().join("a.fasta");
        fs::write(&source, b">contig_1\nACGT\n").unwrap();

        let first = temp.path().join("first.gz");
        let second = temp.path().join("second.gz");
        gzip_file(&source, &first).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(1100));
        gzip_file(&source, &second).unwrap();

        let first_bytes = fs::read(&first).unwrap();
        assert_eq!(first_bytes, fs::read(&second).unwrap());

        let mut decoded = String::new();
        GzDecoder::new(first_bytes.as_slice())
            .read_to_string(&mut decoded)
            .unwrap();
        assert_eq!(decoded, ">contig_1\nACGT\n");
    }

    #[test]
    fn same_contents_compares_bytes_not_timestamps() {
        let temp = tempfile::tempdir().unwrap();
        let a = temp.path().join("a");
        let b = temp.path().join("b");
        fs::write(&a, b"ACGT").unwrap();
        assert!(!same_contents(&a, &b).unwrap());

        fs::write(&b, b"ACGT").unwrap();
        assert!(same_contents(&a, &b).unwrap());

        fs::write(&b, b"ACGA").unwrap();
        assert!(!same_contents(&a, &b).unwrap());
    }

    #[test]
    fn gzip_extension_detection() {
        assert!(is_gzip(Path::new("x.fasta.gz")));
        assert!(!is_gzip(Path::new("x.fasta")));
    }
}
