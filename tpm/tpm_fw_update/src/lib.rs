// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Firmware update orchestration for Infineon TPM 1.2 and TPM 2.0 parts.
//!
//! An [`UpdateSession`] owns a connected [`tpm_tis::TpmTransport`] and exposes
//! the operations hosting glue needs: read the TPM state, check an image,
//! install or abandon an image, configure authorization and logging, and read
//! loader diagnostics.
//!
//! Nothing is cached between operations. Each one derives the TPM state from
//! live capability queries first, then decides which command sequence applies.

#![forbid(unsafe_code)]

mod config;
mod dispatch;
mod error;
mod image;
mod logging;
mod policy;
mod session;
mod state;
mod tpm12auth;
mod update;

#[cfg(test)]
mod sim;

pub use config::AbandonUpdateMode;
pub use config::Configuration;
pub use config::UpdateConfig;
pub use dispatch::CommandDebugInfo;
pub use dispatch::Dispatcher;
pub use dispatch::TpmCommandError;
pub use error::UpdateError;
pub use image::Blocks;
pub use image::FirmwareImage;
pub use image::IMAGE_MAGIC;
pub use image::ImageClassification;
pub use image::ImageError;
pub use image::InvalidReason;
pub use image::SUPPORTED_FORMAT_VERSION;
pub use image::ValidFlags;
pub use image::classify;
pub use image::classify_image;
pub use logging::LogSink;
pub use logging::Logger;
pub use session::FirmwareDetails;
pub use session::OperationModeDetails;
pub use session::UpdateSession;
pub use state::TpmFamily;
pub use state::TpmMode;
pub use state::TpmState;
pub use state::UpdateAvailability;
pub use state::UpdateCounters;
