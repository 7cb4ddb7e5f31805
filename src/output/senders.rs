use async_trait::async_trait;
use log::{debug, error};
use std::path::{Path, PathBuf};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;

use crate::utils::error::ModbusError;

#[async_trait]
pub trait DataSender: Send + Sync {
    async fn send(&self, data: &str) -> Result<(), ModbusError>;
    fn sender_type(&self) -> &str;
    fn destination(&self) -> &str;
}

pub struct ConsoleSender;

#[async_trait]
impl DataSender for ConsoleSender {
    async fn send(&self, data: &str) -> Result<(), ModbusError> {
        println!("{}", data);
        Ok(())
    }

    fn sender_type(&self) -> &str {
        "console"
    }

    fn destination(&self) -> &str {
        "stdout"
    }
}

pub struct FileSender {
    path: PathBuf,
    display: String,
    append: bool,
}

impl FileSender {
    pub fn new<P: AsRef<Path>>(path: P, append: bool) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            display: path.as_ref().to_string_lossy().to_string(),
            append,
        }
    }
}

#[async_trait]
impl DataSender for FileSender {
    async fn send(&self, data: &str) -> Result<(), ModbusError> {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .append(self.append)
            .truncate(!self.append)
            .open(&self.path)
            .await
            .map_err(|e| {
                error!("❌ Failed to open file {}: {}", self.display, e);
                ModbusError::from(e)
            })?;

        file.write_all(format!("{}\n", data).as_bytes()).await?;
        file.flush().await?;

        debug!("📝 Wrote {} bytes to {}", data.len() + 1, self.display);
        Ok(())
    }

    fn sender_type(&self) -> &str {
        "file"
    }

    fn destination(&self) -> &str {
        &self.display
    }
}
