use std::path::{Path, PathBuf};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{error, info, instrument};
use crate::config::dead_letter::FLUSH_INTERVAL;
use super::domain::{DeadLetter, DeadLetterBuffer};


/// Acumula dead-letters y los vuelca al archivo configurado.
///
/// Termina cuando todos los emisores se cierran, no sin antes volcar lo pendiente.
#[instrument(name = "dead_letter_task", skip(rx))]
pub async fn dead_letter_task(mut rx: mpsc::Receiver<DeadLetter>, path: Option<PathBuf>) {

    let mut buffer = DeadLetterBuffer::new();
    let mut ticker = interval(FLUSH_INTERVAL);

    loop {
        tokio::select! {
            msg = rx.recv() => {
                match msg {
                    Some(entry) => {
                        error!("Error: mensaje a dead-letter (device {}, entity {}, sequence {}): {}",
                               entry.message.device_id, entry.message.entity_id,
                               entry.message.sequence, entry.reason);
                        buffer.push(entry);
                        if buffer.is_full() {
                            flush(&mut buffer, path.as_deref()).await;
                        }
                    }
                    None => break,
                }
            }
            _ = ticker.tick() => {
                flush(&mut buffer, path.as_deref()).await;
            }
        }
    }

    flush(&mut buffer, path.as_deref()).await;
    info!("Info: dead-letter task finalizada");
}


async fn flush(buffer: &mut DeadLetterBuffer, path: Option<&Path>) {
    if buffer.is_empty() {
        return;
    }
    let lines = buffer.drain_lines();

    let Some(path) = path else {
        return;
    };

    let file = OpenOptions::new().create(true).append(true).open(path).await;
    match file {
        Ok(mut file) => {
            if let Err(e) = file.write_all(lines.as_bytes()).await {
                error!("Error: no se pudo escribir dead-letters en {}: {}", path.display(), e);
            } else if let Err(e) = file.flush().await {
                error!("Error: no se pudo volcar dead-letters en {}: {}", path.display(), e);
            }
        }
        Err(e) => error!("Error: no se pudo abrir {}: {}", path.display(), e),
    }
}


pub fn start_dead_letter(rx_from_workers: mpsc::Receiver<DeadLetter>,
                         path: Option<PathBuf>) -> JoinHandle<()> {

    tokio::spawn(async move {
        dead_letter_task(rx_from_workers,
                         path
        ).await;
    })
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::domain::{EntityKind, Fields, TelemetryMessage};

    #[tokio::test]
    async fn test_pending_entries_are_flushed_on_close() {
        let path = std::env::temp_dir().join(format!("dead-letter-{}.jsonl", std::process::id()));
        let _ = tokio::fs::remove_file(&path).await;

        let (tx, rx) = mpsc::channel(8);
        let handle = start_dead_letter(rx, Some(path.clone()));

        let msg = TelemetryMessage::new("d1", "m", EntityKind::Machine, 4, Fields::new());
        tx.send(DeadLetter::new(msg, "store unavailable", 5)).await.unwrap();
        drop(tx);
        handle.await.unwrap();

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(contents.lines().count(), 1);
        assert!(contents.contains("store unavailable"));
        let _ = tokio::fs::remove_file(&path).await;
    }
}
