/// Merged tier: per-product compressed columnar file, written
/// write-then-rename so a reader never observes a partial file.
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow::array::{Array, Float64Array, Int64Array};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;

use crate::candle::Candle;
use crate::error::StoreError;

use super::{io_err, scratch};

pub fn merged_path(root: &Path, product: &str) -> PathBuf {
    root.join(format!("{product}.parquet"))
}

fn schema() -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        Field::new("t", DataType::Int64, false),
        Field::new("low", DataType::Float64, false),
        Field::new("high", DataType::Float64, false),
        Field::new("open", DataType::Float64, false),
        Field::new("close", DataType::Float64, false),
        Field::new("volume", DataType::Float64, false),
    ]))
}

fn to_record_batch(rows: &[Candle]) -> Result<RecordBatch, StoreError> {
    let t: Int64Array = rows.iter().map(|c| c.t).collect();
    let low: Float64Array = rows.iter().map(|c| c.low).collect();
    let high: Float64Array = rows.iter().map(|c| c.high).collect();
    let open: Float64Array = rows.iter().map(|c| c.open).collect();
    let close: Float64Array = rows.iter().map(|c| c.close).collect();
    let volume: Float64Array = rows.iter().map(|c| c.volume).collect();

    RecordBatch::try_new(
        schema(),
        vec![
            Arc::new(t),
            Arc::new(low),
            Arc::new(high),
            Arc::new(open),
            Arc::new(close),
            Arc::new(volume),
        ],
    )
    .map_err(StoreError::from)
}

fn from_record_batch(batch: &RecordBatch) -> Vec<Candle> {
    let t = batch.column(0).as_any().downcast_ref::<Int64Array>().unwrap();
    let low = batch.column(1).as_any().downcast_ref::<Float64Array>().unwrap();
    let high = batch.column(2).as_any().downcast_ref::<Float64Array>().unwrap();
    let open = batch.column(3).as_any().downcast_ref::<Float64Array>().unwrap();
    let close = batch.column(4).as_any().downcast_ref::<Float64Array>().unwrap();
    let volume = batch.column(5).as_any().downcast_ref::<Float64Array>().unwrap();

    (0..batch.num_rows())
        .map(|i| {
            Candle::new(
                t.value(i),
                low.value(i),
                high.value(i),
                open.value(i),
                close.value(i),
                volume.value(i),
            )
        })
        .collect()
}

fn write_parquet(path: &Path, rows: &[Candle]) -> Result<(), StoreError> {
    let batch = to_record_batch(rows)?;
    let file = File::create(path).map_err(|e| io_err(path, e))?;
    let props = WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .build();
    let mut writer = ArrowWriter::try_new(file, batch.schema(), Some(props))?;
    writer.write(&batch)?;
    writer.close()?;
    Ok(())
}

pub(super) fn read_parquet(path: &Path) -> Result<Vec<Candle>, StoreError> {
    let file = File::open(path).map_err(|e| io_err(path, e))?;
    let builder = ParquetRecordBatchReaderBuilder::try_new(file)?;
    let reader = builder.build()?;

    let mut rows = Vec::new();
    for batch in reader {
        let batch = batch?;
        rows.extend(from_record_batch(&batch));
    }
    Ok(rows)
}

/// Runs the full compaction procedure for `product`: read scratch, sort
/// and dedupe by timestamp, merge with any existing merged partition,
/// atomically replace it, then truncate scratch to zero length. A no-op if
/// the scratch tier is empty — there is nothing to flush.
pub fn compact(root: &Path, product: &str) -> Result<(), StoreError> {
    let mut rows = scratch::read_all(root, product)?;
    if rows.is_empty() {
        return Ok(());
    }
    rows.sort_by_key(|c| c.t);
    rows.dedup_by_key(|c| c.t);

    let merged = merged_path(root, product);
    if merged.exists() {
        let mut existing = read_parquet(&merged)?;
        existing.append(&mut rows);
        existing.sort_by_key(|c| c.t);
        existing.dedup_by_key(|c| c.t);
        rows = existing;
    }

    let tmp_path = merged.with_extension("parquet.tmp");
    write_parquet(&tmp_path, &rows)?;
    std::fs::rename(&tmp_path, &merged).map_err(|e| io_err(&merged, e))?;

    scratch::truncate(root, product)?;
    Ok(())
}
