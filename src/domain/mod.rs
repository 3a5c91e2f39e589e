// Domain-specific error types
pub mod errors;

// Broadcast event set
pub mod events;

// Port interfaces
pub mod ports;

// Persistent position lifecycle models
pub mod position;

// Venue-facing market and trading types
pub mod types;
