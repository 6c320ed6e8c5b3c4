// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

/// Errors that stop the server binary before or while it starts
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to load TLS material: {0}")]
    Tls(String),

    #[error("Failed to start lumberjack server: {0}")]
    Start(#[from] lumberjack::Error),

    #[error("Failed to install logger: {0}")]
    Logger(String),
}
