pub mod postgres {
    use tokio::time::{Duration};

    pub const WAIT_FOR: Duration = Duration::from_secs(5);
    pub const CONNECT_ATTEMPTS: u32 = 5;
}


pub mod channels {
    pub const PATCH_CAPACITY: usize = 1024;
    pub const ALERT_CAPACITY: usize = 256;
    pub const DEAD_LETTER_CAPACITY: usize = 256;
    pub const WATCHDOG_CAPACITY: usize = 10;
}


pub mod projection {
    use tokio::time::{Duration};

    /// Esperas entre reintentos de escritura en el store.
    pub const STORE_BACKOFF: [Duration; 3] = [
        Duration::from_millis(50),
        Duration::from_millis(200),
        Duration::from_millis(800),
    ];
    pub const ALERT_HANDOFF_TIMEOUT: Duration = Duration::from_millis(100);
    /// Pausa del worker tras devolver un lote a la cola.
    pub const REQUEUE_PAUSE: Duration = Duration::from_millis(250);
}


pub mod alert {
    use tokio::time::{Duration};

    pub const PUBLISH_ATTEMPTS: u32 = 3;
    pub const PUBLISH_BACKOFF: Duration = Duration::from_millis(100);
}


pub mod dead_letter {
    use tokio::time::{Duration};

    pub const BATCH_SIZE: usize = 100;
    pub const FLUSH_INTERVAL: Duration = Duration::from_secs(5);
}


pub mod supervisor {
    use tokio::time::{Duration};

    /// Latidos perdidos antes de advertir que un shard está detenido.
    pub const STALL_BEATS: i64 = 10;
    pub const DRAIN_POLL: Duration = Duration::from_millis(50);
    /// Espera máxima por un worker ya cancelado antes de abortarlo.
    pub const JOIN_TIMEOUT: Duration = Duration::from_secs(5);
}


pub mod simulator {
    /// Probabilidad de una excursión térmica en cada lectura de máquina.
    pub const EXCURSION_PROBABILITY: f64 = 0.02;
}
