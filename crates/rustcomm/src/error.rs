//! Error types for the rustcomm library
//!
//! This module defines the error types used throughout the library.

use thiserror::Error;

/// Errors that can occur when working with the RFCOMM engine
#[derive(Error, Debug, PartialEq)]
pub enum RfcommError {
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("No resources available")]
    NoResources,

    #[error("Already exists")]
    AlreadyExists,

    #[error("Connection not established")]
    NotConnected,

    #[error("Queue full")]
    QueueFull,

    #[error("No data available")]
    NoData,

    #[error("Packet exceeds negotiated MTU")]
    Overrun,

    #[error("Invalid state for operation")]
    InvalidState,

    #[error("Channel not found")]
    ChannelNotFound,

    #[error("Server channel not registered")]
    ServerNotRegistered,

    #[error("Operation failed")]
    Failed,
}

/// Result type for RFCOMM operations
pub type RfcommResult<T> = std::result::Result<T, RfcommError>;
