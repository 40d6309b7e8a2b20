// Engine entities and configuration
pub mod analysis;

// Domain-specific error types
pub mod errors;

// Market data domain (bars, timeframes)
pub mod market;

// Port interfaces
pub mod ports;

// Repository traits
pub mod repositories;

// Core trading domain (agents, positions, orders)
pub mod trading;
