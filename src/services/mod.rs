//! Service layer: lifecycle-managed services and the scan engine's collaborators

pub mod database;
pub mod downloader;
pub mod fetcher;
pub mod http_server;
pub mod logging;
pub mod manager;
pub mod notifications;
pub mod rate_limiter;
pub mod scan;

pub use database::{DatabaseService, DatabaseServiceConfig};
pub use downloader::{CommandDownloader, DownloadOutcome, Downloader};
pub use fetcher::{HttpItemFetcher, ItemFetcher};
pub use http_server::HttpServerService;
pub use logging::{LogFormat, init_tracing};
pub use manager::{HealthStatus, Service, ServiceHealth, ServicesManager};
pub use notifications::{LogNotifier, NotificationSettings, NotificationSink};
pub use scan::ScanService;
