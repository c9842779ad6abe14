/// Scratch tier: an append-only CSV staging file per product.
use std::fs::OpenOptions;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::candle::Candle;
use crate::error::StoreError;

use super::io_err;

pub fn scratch_path(root: &Path, product: &str) -> PathBuf {
    root.join("temp").join(format!("{product}.csv"))
}

/// Appends `candles` to `product`'s scratch file, flushing immediately.
/// Writes a header row only when the file is being created or is empty.
pub fn append(root: &Path, product: &str, candles: &[Candle]) -> Result<(), StoreError> {
    if candles.is_empty() {
        return Ok(());
    }

    let path = scratch_path(root, product);
    let needs_header = !path.exists() || std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0) == 0;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
    }

    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(|e| io_err(&path, e))?;

    let mut writer = csv::WriterBuilder::new()
        .has_headers(needs_header)
        .from_writer(file);

    for candle in candles {
        writer.serialize(candle)?;
    }
    writer
        .flush()
        .map_err(|e| io_err(&path, e))?;

    Ok(())
}

pub fn size_bytes(root: &Path, product: &str) -> Result<u64, StoreError> {
    let path = scratch_path(root, product);
    match std::fs::metadata(&path) {
        Ok(meta) => Ok(meta.len()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(0),
        Err(e) => Err(io_err(&path, e)),
    }
}

/// Truncates the scratch file to zero length without deleting it, keeping
/// file-handle semantics stable across compactions.
pub fn truncate(root: &Path, product: &str) -> Result<(), StoreError> {
    let path = scratch_path(root, product);
    if !path.exists() {
        return Ok(());
    }
    let file = OpenOptions::new()
        .write(true)
        .open(&path)
        .map_err(|e| io_err(&path, e))?;
    file.set_len(0).map_err(|e| io_err(&path, e))?;
    Ok(())
}

pub fn read_all(root: &Path, product: &str) -> Result<Vec<Candle>, StoreError> {
    let path = scratch_path(root, product);
    if !path.exists() {
        return Ok(Vec::new());
    }
    let mut reader = csv::Reader::from_path(&path).map_err(StoreError::from)?;
    let mut rows = Vec::new();
    for result in reader.deserialize() {
        let candle: Candle = result?;
        rows.push(candle);
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candle(t: i64) -> Candle {
        Candle::new(t, 1.0, 2.0, 1.5, 1.8, 10.0)
    }

    #[test]
    fn append_then_read_all_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        append(dir.path(), "BTC-USD", &[candle(100), candle(200)]).unwrap();
        append(dir.path(), "BTC-USD", &[candle(300)]).unwrap();

        let rows = read_all(dir.path(), "BTC-USD").unwrap();
        let timestamps: Vec<i64> = rows.iter().map(|c| c.t).collect();
        assert_eq!(timestamps, vec![100, 200, 300]);
    }

    #[test]
    fn truncate_empties_file_without_deleting_it() {
        let dir = tempfile::tempdir().unwrap();
        append(dir.path(), "BTC-USD", &[candle(100)]).unwrap();
        truncate(dir.path(), "BTC-USD").unwrap();

        assert!(scratch_path(dir.path(), "BTC-USD").exists());
        assert_eq!(size_bytes(dir.path(), "BTC-USD").unwrap(), 0);
        assert!(read_all(dir.path(), "BTC-USD").unwrap().is_empty());
    }

    #[test]
    fn size_bytes_is_zero_for_nonexistent_file() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(size_bytes(dir.path(), "NOPE-USD").unwrap(), 0);
    }
}
