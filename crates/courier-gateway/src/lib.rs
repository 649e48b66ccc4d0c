pub mod app;
pub mod http;
pub mod ingest;
pub mod keyboards;
pub mod poller;
pub mod router;
pub mod workers;
