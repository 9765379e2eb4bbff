use std::sync::Arc;

use adash_core::{IngestionBatch, TableSchema};
use adash_storage::{SinkError, WarehouseSink};
use thiserror::Error;
use tracing::{error, info};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IngestError {
    #[error("row {row_index} has column `{column}` not declared by {table}")]
    UndeclaredColumn {
        row_index: usize,
        column: String,
        table: String,
    },
    #[error("{rejected} of {submitted} rows rejected by the warehouse")]
    Partial { rejected: usize, submitted: usize },
    #[error("warehouse insert failed: {0}")]
    Hard(String),
}

/// Submits one batch per request. Never retries; the caller's task queue does.
#[derive(Clone)]
pub struct IngestionClient {
    sink: Arc<dyn WarehouseSink>,
}

impl IngestionClient {
    pub fn new(sink: Arc<dyn WarehouseSink>) -> Self {
        Self { sink }
    }

    pub async fn ingest(
        &self,
        request_id: Uuid,
        table: &TableSchema,
        batch: IngestionBatch,
    ) -> Result<usize, IngestError> {
        let table_name = table.qualified_name();
        if batch.is_empty() {
            info!(%request_id, table = %table_name, "empty batch, warehouse not called");
            return Ok(0);
        }

        for (row_index, row) in batch.iter().enumerate() {
            if let Some(column) = table.undeclared_column(row) {
                return Err(IngestError::UndeclaredColumn {
                    row_index,
                    column: column.to_string(),
                    table: table_name,
                });
            }
        }

        match self.sink.insert_rows(request_id, table, &batch).await {
            Ok(inserted) => {
                info!(%request_id, table = %table_name, inserted, "batch inserted");
                Ok(inserted)
            }
            Err(SinkError::RowErrors(rejected)) => {
                for row in &rejected {
                    error!(
                        %request_id,
                        table = %table_name,
                        row_index = row.index,
                        detail = %row.messages.join("; "),
                        "row rejected by warehouse"
                    );
                }
                Err(IngestError::Partial {
                    rejected: rejected.len(),
                    submitted: batch.len(),
                })
            }
            Err(SinkError::Request(message)) => {
                error!(
                    %request_id,
                    table = %table_name,
                    error = %message,
                    "warehouse insert failed"
                );
                Err(IngestError::Hard(message))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use adash_core::{CellValue, WarehouseRow};
    use adash_storage::{MemorySink, RowInsertError};
    use std::io;
    use std::sync::Mutex;
    use tracing_subscriber::fmt::MakeWriter;

    /// Collects formatted log output so tests can count emitted lines.
    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

    impl CapturedLogs {
        fn lines_containing(&self, needle: &str) -> usize {
            let buf = self.0.lock().unwrap();
            String::from_utf8_lossy(&buf)
                .lines()
                .filter(|line| line.contains(needle))
                .count()
        }
    }

    impl io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl<'a> MakeWriter<'a> for CapturedLogs {
        type Writer = CapturedLogs;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    fn table() -> TableSchema {
        TableSchema::new("ds", "lh_data", ["url", "dom_size"])
    }

    fn row(url: &str) -> WarehouseRow {
        let mut row = WarehouseRow::new();
        row.insert("url".into(), CellValue::Text(url.into()));
        row
    }

    #[tokio::test]
    async fn empty_batch_skips_the_sink() {
        let sink = Arc::new(MemorySink::new());
        let client = IngestionClient::new(sink.clone());
        assert_eq!(client.ingest(Uuid::new_v4(), &table(), vec![]).await, Ok(0));
        assert_eq!(sink.calls().await, 0);
    }

    #[tokio::test]
    async fn undeclared_column_fails_before_insert() {
        let sink = Arc::new(MemorySink::new());
        let client = IngestionClient::new(sink.clone());
        let mut bad = row("https://a.com");
        bad.insert("surprise".into(), CellValue::Int(1));

        let err = client
            .ingest(Uuid::new_v4(), &table(), vec![row("https://b.com"), bad])
            .await
            .unwrap_err();
        assert_eq!(
            err,
            IngestError::UndeclaredColumn {
                row_index: 1,
                column: "surprise".into(),
                table: "ds.lh_data".into()
            }
        );
        assert_eq!(sink.calls().await, 0);
    }

    #[tokio::test]
    async fn every_rejected_row_is_logged_once() {
        let logs = CapturedLogs::default();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(logs.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::ERROR)
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let rejected = vec![
            RowInsertError {
                index: 0,
                messages: vec!["invalid: bad value".into()],
            },
            RowInsertError {
                index: 2,
                messages: vec!["invalid: too long".into(), "stopped: ".into()],
            },
            RowInsertError {
                index: 3,
                messages: vec![],
            },
        ];
        let sink = MemorySink::rejecting(SinkError::RowErrors(rejected));
        let client = IngestionClient::new(Arc::new(sink));
        let batch = (0..5).map(|i| row(&format!("https://{i}.example.com"))).collect();

        let err = client.ingest(Uuid::new_v4(), &table(), batch).await.unwrap_err();
        assert_eq!(err, IngestError::Partial { rejected: 3, submitted: 5 });
        assert_eq!(logs.lines_containing("row rejected by warehouse"), 3);
        assert_eq!(logs.lines_containing("row_index=2"), 1);
    }

    #[tokio::test]
    async fn request_failure_is_hard() {
        let client = IngestionClient::new(Arc::new(MemorySink::rejecting(SinkError::Request(
            "403: Access Denied".into(),
        ))));
        let err = client
            .ingest(Uuid::new_v4(), &table(), vec![row("https://a.com")])
            .await
            .unwrap_err();
        assert_eq!(err, IngestError::Hard("403: Access Denied".into()));
    }

    #[tokio::test]
    async fn clean_insert_reports_count() {
        let sink = Arc::new(MemorySink::new());
        let client = IngestionClient::new(sink.clone());
        let inserted = client
            .ingest(Uuid::new_v4(), &table(), vec![row("https://a.com"), row("https://b.com")])
            .await
            .unwrap();
        assert_eq!(inserted, 2);
        assert_eq!(sink.rows().await.len(), 2);
    }
}
