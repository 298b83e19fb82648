//! Lottery slots, ticket sales and the draw scheduler

pub mod draw;
pub mod scheduler;
pub mod service;
pub mod store;
pub mod types;

pub use draw::{draw_winners, DrawResult};
pub use scheduler::{DrawScheduler, SchedulerCommand, SchedulerHandle};
pub use service::{LotteryService, TickReport, LOTTERY_SCOPE};
pub use store::{LotteryStore, PurchaseRejection};
pub use types::*;
