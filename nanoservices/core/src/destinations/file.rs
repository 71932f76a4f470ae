use std::io::Cursor;
use std::path::{Path, PathBuf};

use arrow::datatypes::Schema;
use arrow::ipc::reader::FileReader;
use arrow::ipc::writer::FileWriter;
use async_trait::async_trait;
use eltflow_utils::error::Error;
use eltflow_utils::{EltResult, RecordSet};
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use super::traits::{LoadSink, TableHandle};

/// Writes each destination as an Arrow IPC file under a directory.
///
/// Files are written next to their target and renamed into place, so a
/// reader sees either the old file or the new one.
#[derive(Debug, Clone)]
pub struct FileSink {
    name: String,
    dir: PathBuf,
}

impl FileSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            name: "file".to_string(),
            dir: dir.into(),
        }
    }

    pub fn path_for(&self, destination: &str) -> PathBuf {
        self.dir.join(format!("{destination}.arrow"))
    }

    pub async fn read(&self, destination: &str) -> EltResult<RecordSet> {
        let bytes = fs::read(self.path_for(destination)).await?;
        let reader = FileReader::try_new(Cursor::new(bytes), None)?;
        let batches = reader.collect::<Result<Vec<_>, _>>()?;
        Ok(RecordSet::new(batches))
    }
}

fn encode(records: &RecordSet) -> EltResult<Vec<u8>> {
    let schema = records.schema().unwrap_or_else(|| Schema::empty().into());
    let mut writer = FileWriter::try_new(Vec::new(), &schema)?;
    for batch in records.batches() {
        writer.write(batch)?;
    }
    writer.finish()?;
    Ok(writer.into_inner()?)
}

async fn write_atomically(tmp: &Path, target: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = File::create(tmp).await?;
    file.write_all(bytes).await?;
    file.flush().await?;
    file.sync_all().await?;
    drop(file);
    fs::rename(tmp, target).await
}

#[async_trait]
impl LoadSink for FileSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn load(&self, records: &RecordSet, destination: &str) -> EltResult<TableHandle> {
        let bytes = encode(records).map_err(|e| Error::load(destination, e))?;
        fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| Error::load(destination, e))?;

        let target = self.path_for(destination);
        let tmp = self.dir.join(format!(".{destination}.{}.tmp", Uuid::new_v4()));
        if let Err(e) = write_atomically(&tmp, &target, &bytes).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(Error::load(destination, e));
        }

        tracing::info!(destination, rows = records.num_rows(), path = %target.display(), "file load complete");
        Ok(TableHandle {
            table_id: target.display().to_string(),
            rows: records.num_rows(),
        })
    }
}
