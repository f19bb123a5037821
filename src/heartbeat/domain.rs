use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};


pub enum Event {
    /// El temporizador de vigilancia (Watchdog) expiró.
    Timeout,
    /// Comando interno para iniciar el temporizador.
    InitTimer(Duration),
}


/// Intervalos con los que trabaja el supervisor de shards.
#[derive(Debug, Clone, Copy)]
pub struct SupervisorSettings {
    /// Cada cuánto se revisan los workers.
    pub check_interval: Duration,
    /// Cada cuánto se publica el snapshot de métricas en el log.
    pub metrics_interval: Duration,
}


pub async fn watchdog_timer(tx_to_supervisor: mpsc::Sender<Event>,
                            mut cmd_rx: mpsc::Receiver<Event>) {
    loop {
        let duration = match cmd_rx.recv().await {
            Some(Event::InitTimer(d)) => d,
            None => break, // Canal cerrado, terminar tarea
            _ => continue,
        };

        sleep(duration).await;
        if tx_to_supervisor.send(Event::Timeout).await.is_err() {
            break;
        }
    }
}


pub fn start_watchdog(tx_to_supervisor: mpsc::Sender<Event>,
                      rx_from_supervisor: mpsc::Receiver<Event>) -> JoinHandle<()> {

    tokio::spawn(async move {
        watchdog_timer(
            tx_to_supervisor,
            rx_from_supervisor
        ).await;
    })
}


#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_timer_fires_once_per_request() {
        let (tx_cmd, rx_cmd) = mpsc::channel(4);
        let (tx_timeout, mut rx_timeout) = mpsc::channel(4);
        let handle = start_watchdog(tx_timeout, rx_cmd);

        tx_cmd.send(Event::InitTimer(Duration::from_secs(1))).await.unwrap();
        assert!(matches!(rx_timeout.recv().await, Some(Event::Timeout)));
        assert!(rx_timeout.try_recv().is_err());

        drop(tx_cmd);
        handle.await.unwrap();
    }
}
