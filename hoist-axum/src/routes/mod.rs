pub mod audit;
pub mod dlq;
pub mod jobs;
pub mod queues;
pub mod rules;
pub mod schedules;
pub mod tenants;
pub mod workers;
