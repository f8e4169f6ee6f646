pub mod address;
pub mod promise;
pub mod retry;
pub mod scheduler;

pub use address::EndpointAddress;
pub use promise::Promise;
pub use retry::{RetryNTimes, RetryPolicy};
pub use scheduler::Scheduler;
