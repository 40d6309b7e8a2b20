pub mod agent_log_repository;
pub mod agent_repository;
pub mod analysis_run_repository;
pub mod indicator_repository;
pub mod ohlcv_repository;
pub mod position_repository;
pub mod signal_repository;
pub mod watchlist_repository;
pub mod zone_repository;

pub use agent_log_repository::SqliteAgentLogRepository;
pub use agent_repository::SqliteAgentRepository;
pub use analysis_run_repository::SqliteAnalysisRunRepository;
pub use indicator_repository::SqliteIndicatorRepository;
pub use ohlcv_repository::SqliteOhlcvRepository;
pub use position_repository::SqlitePositionRepository;
pub use signal_repository::SqliteSignalRepository;
pub use watchlist_repository::SqliteWatchlistRepository;
pub use zone_repository::SqliteZoneRepository;
