//! Device manager: exclusive ownership of the microphone capture handle.

use crate::audio::capture::{CaptureHandle, CaptureProvider};
use crate::config::VoiceConfig;
use crate::error::Result;
use cpal::traits::{DeviceTrait, HostTrait};
use std::sync::Arc;
use tracing::{debug, info};

/// Owns the capture handle for the lifetime of a voice session.
///
/// At most one handle is held; acquiring releases any prior handle first,
/// and release is idempotent from every state.
pub struct DeviceManager {
    provider: Arc<dyn CaptureProvider>,
    handle: Option<Box<dyn CaptureHandle>>,
}

impl DeviceManager {
    pub fn new(provider: Arc<dyn CaptureProvider>) -> Self {
        Self {
            provider,
            handle: None,
        }
    }

    /// Request microphone access, replacing any previously held handle.
    ///
    /// # Errors
    ///
    /// Propagates the provider's acquisition failure; on failure no handle
    /// is held.
    pub async fn acquire(&mut self, config: &VoiceConfig) -> Result<()> {
        // Stop the previous stream before re-acquiring.
        self.release();
        let handle = self.provider.acquire(config).await?;
        info!("capture handle acquired");
        self.handle = Some(handle);
        Ok(())
    }

    /// Release the held handle, stopping the underlying stream. No-op when
    /// nothing is held.
    pub fn release(&mut self) {
        if let Some(mut handle) = self.handle.take() {
            handle.release();
        } else {
            debug!("device release with no held handle");
        }
    }

    pub fn handle(&self) -> Option<&dyn CaptureHandle> {
        self.handle.as_deref()
    }

    pub fn handle_mut(&mut self) -> Option<&mut (dyn CaptureHandle + 'static)> {
        self.handle.as_deref_mut()
    }
}

/// List available input devices by name.
///
/// # Errors
///
/// Returns an error if devices cannot be enumerated.
pub fn list_input_devices() -> Result<Vec<String>> {
    let host = cpal::default_host();
    let devices = host.input_devices().map_err(|e| {
        crate::error::VoiceError::DeviceUnavailable(format!("cannot enumerate devices: {e}"))
    })?;

    let mut names = Vec::new();
    for device in devices {
        if let Ok(desc) = device.description() {
            names.push(desc.name().to_owned());
        }
    }
    Ok(names)
}

/// List available output devices by name.
///
/// # Errors
///
/// Returns an error if devices cannot be enumerated.
pub fn list_output_devices() -> Result<Vec<String>> {
    let host = cpal::default_host();
    let devices = host.output_devices().map_err(|e| {
        crate::error::VoiceError::DeviceUnavailable(format!("cannot enumerate devices: {e}"))
    })?;

    let mut names = Vec::new();
    for device in devices {
        if let Ok(desc) = device.description() {
            names.push(desc.name().to_owned());
        }
    }
    Ok(names)
}
