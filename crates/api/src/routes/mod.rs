mod conditions;
mod health;
mod subscriptions;

pub use conditions::condition_router;
pub use health::health_router;
pub use subscriptions::subscription_router;
