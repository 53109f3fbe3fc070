//! Tee logging for proxied connections.
//!
//! Every leg of a proxied session is split into a read half and a write half;
//! each half duplicates its traffic into a shared per-leg log file, framed as
//! `<timestamp><direction prefix><payload><suffix>`. The log mutex is held
//! for the whole framed sequence so concurrent reads and writes on the same
//! leg cannot interleave their framing.

use std::io;
use std::sync::Arc;

use chrono::Local;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex;
use tracing::debug;

/// Transport object both proxy legs are built over: a plain TCP stream before
/// STARTTLS, a TLS stream after.
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Transport for T {}

pub type BoxedTransport = Box<dyn Transport>;

/// Per-leg framing configuration, shared by both halves.
#[derive(Debug)]
pub struct TeeConfig {
    /// chrono format string stamped before every logged read and write.
    pub time_format: String,
    pub read_prefix: Vec<u8>,
    pub read_suffix: Vec<u8>,
    pub write_prefix: Vec<u8>,
    pub write_suffix: Vec<u8>,
}

/// Splits a transport into tee-logging halves over a shared log sink.
pub fn tee(
    transport: BoxedTransport,
    sink: Arc<Mutex<File>>,
    config: Arc<TeeConfig>,
) -> (TeeReader, TeeWriter) {
    let (src, dst) = tokio::io::split(transport);
    (
        TeeReader {
            src,
            sink: sink.clone(),
            config: config.clone(),
        },
        TeeWriter { dst, sink, config },
    )
}

/// Read half of a leg. Bytes read from the transport are appended to the log
/// sink with the read framing.
pub struct TeeReader {
    src: ReadHalf<BoxedTransport>,
    sink: Arc<Mutex<File>>,
    config: Arc<TeeConfig>,
}

impl TeeReader {
    /// Reads from the transport and logs whatever arrived. A failure to
    /// write the log entry never fails the read: traffic is not dropped
    /// because the log sink is unhealthy.
    pub async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.src.read(buf).await?;
        if n > 0 {
            let stamp = Local::now().format(&self.config.time_format).to_string();
            let mut sink = self.sink.lock().await;
            let logged: io::Result<()> = async {
                sink.write_all(stamp.as_bytes()).await?;
                sink.write_all(&self.config.read_prefix).await?;
                sink.write_all(&buf[..n]).await?;
                sink.write_all(&self.config.read_suffix).await?;
                Ok(())
            }
            .await;
            if let Err(err) = logged {
                debug!(error = %err, "log sink write failed, forwarding payload anyway");
            }
        }
        Ok(n)
    }

    /// Tears the half back down for a TLS upgrade of the transport.
    pub fn into_parts(self) -> (ReadHalf<BoxedTransport>, Arc<Mutex<File>>, Arc<TeeConfig>) {
        (self.src, self.sink, self.config)
    }
}

/// Write half of a leg. Payloads are written to the transport and mirrored
/// into the log sink with the write framing; unlike the read side, log sink
/// failures surface to the caller.
pub struct TeeWriter {
    dst: WriteHalf<BoxedTransport>,
    sink: Arc<Mutex<File>>,
    config: Arc<TeeConfig>,
}

impl TeeWriter {
    pub async fn write(&mut self, payload: &[u8]) -> io::Result<usize> {
        if payload.is_empty() {
            return Ok(0);
        }
        let stamp = Local::now().format(&self.config.time_format).to_string();
        let mut sink = self.sink.lock().await;
        sink.write_all(stamp.as_bytes()).await?;
        sink.write_all(&self.config.write_prefix).await?;
        self.dst.write_all(payload).await?;
        self.dst.flush().await?;
        sink.write_all(payload).await?;
        sink.write_all(&self.config.write_suffix).await?;
        Ok(payload.len())
    }

    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.dst.shutdown().await
    }

    pub fn into_parts(self) -> (WriteHalf<BoxedTransport>, Arc<Mutex<File>>, Arc<TeeConfig>) {
        (self.dst, self.sink, self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::fs::OpenOptions;

    fn test_config() -> Arc<TeeConfig> {
        // A format string without specifiers renders literally, which keeps
        // the logged framing deterministic.
        Arc::new(TeeConfig {
            time_format: "TS".to_string(),
            read_prefix: b" C->P ".to_vec(),
            read_suffix: b"\n".to_vec(),
            write_prefix: b" P->C ".to_vec(),
            write_suffix: b"\n".to_vec(),
        })
    }

    async fn log_sink(dir: &std::path::Path) -> (Arc<Mutex<File>>, std::path::PathBuf) {
        let path = dir.join("leg.log");
        let file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&path)
            .await
            .unwrap();
        (Arc::new(Mutex::new(file)), path)
    }

    async fn flush_sink(sink: &Arc<Mutex<File>>) {
        sink.lock().await.flush().await.unwrap();
    }

    #[tokio::test]
    async fn write_mirrors_payload_and_frames_log() {
        let dir = tempfile::tempdir().unwrap();
        let (sink, path) = log_sink(dir.path()).await;
        let (local, mut remote) = tokio::io::duplex(1024);
        let (_reader, mut writer) = tee(Box::new(local), sink.clone(), test_config());

        let n = writer.write(b"<presence/>").await.unwrap();
        assert_eq!(n, 11);

        let mut received = vec![0u8; 11];
        remote.read_exact(&mut received).await.unwrap();
        assert_eq!(&received, b"<presence/>");

        flush_sink(&sink).await;
        let logged = std::fs::read_to_string(&path).unwrap();
        assert_eq!(logged, "TS P->C <presence/>\n");
    }

    #[tokio::test]
    async fn empty_write_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let (sink, path) = log_sink(dir.path()).await;
        let (local, _remote) = tokio::io::duplex(64);
        let (_reader, mut writer) = tee(Box::new(local), sink.clone(), test_config());

        assert_eq!(writer.write(b"").await.unwrap(), 0);

        flush_sink(&sink).await;
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "");
    }

    #[tokio::test]
    async fn read_tees_incoming_bytes_with_read_framing() {
        let dir = tempfile::tempdir().unwrap();
        let (sink, path) = log_sink(dir.path()).await;
        let (local, mut remote) = tokio::io::duplex(1024);
        let (mut reader, _writer) = tee(Box::new(local), sink.clone(), test_config());

        remote.write_all(b"<iq/>").await.unwrap();
        let mut buf = [0u8; 64];
        let n = reader.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"<iq/>");

        flush_sink(&sink).await;
        let logged = std::fs::read_to_string(&path).unwrap();
        assert_eq!(logged, "TS C->P <iq/>\n");
    }

    #[tokio::test]
    async fn consecutive_writes_keep_framing_sequential() {
        let dir = tempfile::tempdir().unwrap();
        let (sink, path) = log_sink(dir.path()).await;
        let (local, mut remote) = tokio::io::duplex(1024);
        let (_reader, mut writer) = tee(Box::new(local), sink.clone(), test_config());

        writer.write(b"one").await.unwrap();
        writer.write(b"two").await.unwrap();

        let mut received = vec![0u8; 6];
        remote.read_exact(&mut received).await.unwrap();
        assert_eq!(&received, b"onetwo");

        flush_sink(&sink).await;
        let logged = std::fs::read_to_string(&path).unwrap();
        assert_eq!(logged, "TS P->C one\nTS P->C two\n");
    }

    #[tokio::test]
    async fn unsplit_after_tee_returns_the_transport() {
        let dir = tempfile::tempdir().unwrap();
        let (sink, _path) = log_sink(dir.path()).await;
        let (local, mut remote) = tokio::io::duplex(64);
        let (reader, writer) = tee(Box::new(local), sink, test_config());

        let (read_half, _, _) = reader.into_parts();
        let (write_half, _, _) = writer.into_parts();
        let mut transport = read_half.unsplit(write_half);

        transport.write_all(b"direct").await.unwrap();
        let mut buf = [0u8; 6];
        remote.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"direct");
    }
}
