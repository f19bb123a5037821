use std::sync::Arc;
use std::time::Duration;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use crate::config::simulator::EXCURSION_PROBABILITY;
use crate::queue::domain::QueueError;
use crate::queue::logic::IngestionQueue;
use super::domain::{factory_fleet, SimulatedDevice};


/// Publica una lectura por dispositivo en cada tick.
///
/// El simulador se comporta como un productor real: si el shard está lleno la
/// lectura se descarta y se sigue con la próxima.
#[instrument(name = "simulator", skip(queue, cancel))]
pub async fn run_simulator(queue: Arc<IngestionQueue>,
                           every: Duration,
                           cancel: CancellationToken) {

    let mut devices: Vec<SimulatedDevice> = factory_fleet().into_iter().map(SimulatedDevice::new).collect();
    let mut rng = StdRng::from_os_rng();
    let mut ticker = interval(every);

    info!("Info: simulador iniciado con {} dispositivos", devices.len());

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        for device in devices.iter_mut() {
            let excursion = rng.random_bool(EXCURSION_PROBABILITY);
            let reading = device.next_reading(&mut rng, excursion);
            if excursion {
                debug!("Debug: excursión térmica simulada en {}", reading.entity_id);
            }

            match queue.enqueue(reading, None).await {
                Ok(()) => {}
                Err(QueueError::Closed) => {
                    info!("Info: cola cerrada, simulador detenido");
                    return;
                }
                Err(e) => warn!("Warning: lectura {} de {} descartada: {}",
                                device.sequence(), device.device_id(), e),
            }
        }
    }

    info!("Info: simulador finalizado");
}


pub fn start_simulator(queue: Arc<IngestionQueue>,
                       every: Duration,
                       cancel: CancellationToken) -> JoinHandle<()> {

    info!("Info: iniciando simulador de dispositivos");
    tokio::spawn(async move {
        run_simulator(queue, every, cancel).await;
    })
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::domain::{Counter, PipelineMetrics};
    use crate::queue::domain::{QueueSettings, ShardKey};

    #[tokio::test(start_paused = true)]
    async fn test_simulator_feeds_every_device() {
        let metrics = Arc::new(PipelineMetrics::new());
        let queue = Arc::new(IngestionQueue::new(QueueSettings {
            shard_count: 2,
            shard_capacity: 64,
            shard_key: ShardKey::Device,
            message_ttl: Duration::from_secs(300),
        }, metrics.clone()));

        let cancel = CancellationToken::new();
        let handle = start_simulator(queue.clone(), Duration::from_secs(1), cancel.clone());

        tokio::time::sleep(Duration::from_millis(2500)).await;
        cancel.cancel();
        handle.await.unwrap();

        let fleet = factory_fleet().len() as u64;
        assert_eq!(metrics.get(Counter::MessagesEnqueued), 3 * fleet);
    }
}
