pub mod health_route;
pub mod reviews;
pub mod webhooks;
