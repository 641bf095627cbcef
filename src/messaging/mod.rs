pub mod bus;
pub mod memory;
pub mod redpanda;

pub use bus::{BusMessage, MessageBus, PublishError};
pub use memory::InMemoryBus;
pub use redpanda::RedpandaClient;
