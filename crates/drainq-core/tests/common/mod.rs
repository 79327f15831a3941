use drainq::memory::{MemoryBroker, MemoryClient};
use drainq::{Engine, EngineConfig};
use std::time::Duration;

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn config(batch_size: u32) -> EngineConfig {
    EngineConfig {
        batch_size,
        max_wait: Duration::from_millis(10),
    }
}

pub async fn engine(broker: &MemoryBroker, batch_size: u32) -> Engine<MemoryClient> {
    init_logger();
    let client = broker.connect().await.unwrap();
    Engine::new(client, config(batch_size)).unwrap()
}

/// Fills the main sub-queue of `queue` with `count` messages named `m0..`.
pub fn seed(broker: &MemoryBroker, queue: &str, count: usize) {
    broker.create_queue(queue);
    for i in 0..count {
        broker.send_text(queue, &format!("m{i}"), &format!("message {i}"));
    }
}
